//! The syscall gateway.
//!
//! A trap arrives with the user stack pointer and leaves through `eax`.
//! The syscall number sits at `esp[0]` and up to three 32-bit
//! little-endian arguments above it. Every user pointer is validated at
//! the moment of use: checked against `PHYS_BASE`, then dereferenced
//! through the pager, which pins the containing page for the transfer. A
//! bad byte terminates the process with exit code -1 — after any valid
//! prefix has already been copied.

use core::sync::atomic::Ordering;

use crate::addr::is_user_vaddr;
use crate::kernel::{Kernel, KernelCtx};
use crate::proc::Process;

mod file;
mod proc;

/// The register state a trap carries across the boundary.
#[derive(Clone, Copy, Debug)]
pub struct TrapFrame {
    pub eip: u32,
    pub esp: u32,
    pub eax: u32,
}

/// What the trap path should do after a syscall.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Control {
    /// Resume the process; `eax` holds the return value.
    Return,
    /// The process is gone; do not resume it.
    Exit(i32),
    /// The machine is powering off.
    Halt,
}

/// A policy violation: the process is terminated with exit code -1.
pub(crate) struct Kill;

pub(crate) type SysResult = Result<u32, Kill>;

pub const SYS_HALT: u32 = 0;
pub const SYS_EXIT: u32 = 1;
pub const SYS_EXEC: u32 = 2;
pub const SYS_WAIT: u32 = 3;
pub const SYS_CREATE: u32 = 4;
pub const SYS_REMOVE: u32 = 5;
pub const SYS_OPEN: u32 = 6;
pub const SYS_FILESIZE: u32 = 7;
pub const SYS_READ: u32 = 8;
pub const SYS_WRITE: u32 = 9;
pub const SYS_SEEK: u32 = 10;
pub const SYS_TELL: u32 = 11;
pub const SYS_CLOSE: u32 = 12;
pub const SYS_CHDIR: u32 = 13;
pub const SYS_MKDIR: u32 = 14;
pub const SYS_READDIR: u32 = 15;
pub const SYS_ISDIR: u32 = 16;
pub const SYS_INUMBER: u32 = 17;

impl Kernel {
    /// Dispatches one syscall trap.
    pub fn syscall(&self, ctx: &KernelCtx, frame: &mut TrapFrame) -> Control {
        let proc = ctx.proc();
        proc.user_esp.store(frame.esp as usize, Ordering::Release);

        let esp = frame.esp as usize;
        if !is_user_vaddr(esp) {
            return self.kill(proc);
        }
        let num = match self.fetch_word(proc, esp) {
            Ok(num) => num,
            Err(Kill) => return self.kill(proc),
        };

        let result = match num {
            SYS_HALT => {
                self.scheduler.power_off();
                return Control::Halt;
            }
            SYS_EXIT => match self.arg(proc, esp, 0) {
                Ok(status) => {
                    let status = status as i32;
                    self.process_exit(proc, status);
                    return Control::Exit(status);
                }
                Err(Kill) => return self.kill(proc),
            },
            SYS_EXEC => self.sys_exec(ctx, esp),
            SYS_WAIT => self.sys_wait(ctx, esp),
            SYS_CREATE => self.sys_create(ctx, esp),
            SYS_REMOVE => self.sys_remove(ctx, esp),
            SYS_OPEN => self.sys_open(ctx, esp),
            SYS_FILESIZE => self.sys_filesize(ctx, esp),
            SYS_READ => self.sys_read(ctx, esp),
            SYS_WRITE => self.sys_write(ctx, esp),
            SYS_SEEK => self.sys_seek(ctx, esp),
            SYS_TELL => self.sys_tell(ctx, esp),
            SYS_CLOSE => self.sys_close(ctx, esp),
            SYS_CHDIR => self.sys_chdir(ctx, esp),
            SYS_MKDIR => self.sys_mkdir(ctx, esp),
            SYS_READDIR => self.sys_readdir(ctx, esp),
            SYS_ISDIR => self.sys_isdir(ctx, esp),
            SYS_INUMBER => self.sys_inumber(ctx, esp),
            _ => {
                log::debug!("{} {}: unknown sys call {}", proc.pid, proc.name(), num);
                Err(Kill)
            }
        };

        match result {
            Ok(value) => {
                frame.eax = value;
                Control::Return
            }
            Err(Kill) => self.kill(proc),
        }
    }

    /// Terminates the offending process.
    pub(crate) fn kill(&self, proc: &Process) -> Control {
        self.process_exit(proc, -1);
        Control::Exit(-1)
    }

    /// Fetches a 32-bit little-endian word at user address `addr`.
    fn fetch_word(&self, proc: &Process, addr: usize) -> Result<u32, Kill> {
        let mut word = [0u8; 4];
        self.copy_in_user(proc, &mut word, addr).map_err(|()| Kill)?;
        Ok(u32::from_le_bytes(word))
    }

    /// Fetches the `n`th syscall argument from the user stack.
    pub(crate) fn arg(&self, proc: &Process, esp: usize, n: usize) -> Result<u32, Kill> {
        self.fetch_word(proc, esp + 4 * (n + 1))
    }
}

/// The kernel copy of a user string, up to its NUL terminator.
pub(crate) fn kstr(ks: &[u8]) -> &[u8] {
    let len = ks.iter().position(|b| *b == 0).unwrap_or(ks.len());
    &ks[..len]
}
