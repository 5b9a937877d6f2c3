//! Process syscalls: exec and wait. `halt` and `exit` are handled in the
//! dispatcher itself, since neither returns.

use super::{kstr, Kill, SysResult};
use crate::kernel::{Kernel, KernelCtx};

impl Kernel {
    pub(super) fn sys_exec(&self, ctx: &KernelCtx, esp: usize) -> SysResult {
        let proc = ctx.proc();
        let ucmd = self.arg(proc, esp, 0)? as usize;

        let ks = self.copy_in_string(proc, ucmd).map_err(|()| Kill)?;
        // Resolve from the kernel copy, never the raw user pointer.
        let cmdline = kstr(&ks);

        let _file_lock = self.fs.file_lock.lock();
        match ctx.kernel().process_execute(Some(proc), cmdline) {
            Ok(pid) => Ok(pid as u32),
            Err(()) => Ok(-1i32 as u32),
        }
    }

    pub(super) fn sys_wait(&self, ctx: &KernelCtx, esp: usize) -> SysResult {
        let proc = ctx.proc();
        let pid = self.arg(proc, esp, 0)? as i32;
        Ok(self.process_wait(proc, pid) as u32)
    }
}
