//! File and directory syscalls.
//!
//! Descriptor 0 reads from the console and descriptor 1 writes to it.
//! `read` and `write` move data in page-sized chunks through a kernel
//! bounce buffer, holding the filesystem lock only around the file
//! operation itself; the user side of each chunk goes through the pinned
//! copy primitives and a fault there kills the process.

use alloc::sync::Arc;
use alloc::vec;
use core::cmp;

use super::{kstr, Kill, SysResult};
use crate::file::{FdEntry, File};
use crate::fs::{Dir, InodeType, Path};
use crate::kernel::{Kernel, KernelCtx};
use crate::param::{NAME_MAX, PGSIZE};
use crate::proc::Process;

impl Kernel {
    /// A private reference to the process's current directory, so no lock
    /// is held across filesystem I/O.
    fn open_cwd(&self, proc: &Process) -> Option<Dir> {
        let cwd = proc.cwd.lock();
        cwd.as_ref().map(|dir| dir.reopen(&self.fs))
    }

    fn close_cwd(&self, cwd: Option<Dir>) {
        if let Some(dir) = cwd {
            dir.close(&self.fs);
        }
    }

    pub(super) fn sys_create(&self, ctx: &KernelCtx, esp: usize) -> SysResult {
        let proc = ctx.proc();
        let upath = self.arg(proc, esp, 0)? as usize;
        let size = self.arg(proc, esp, 1)? as usize;

        let ks = self.copy_in_string(proc, upath).map_err(|()| Kill)?;
        let name = kstr(&ks);
        if name.is_empty() {
            return Ok(0);
        }

        let _file_lock = self.fs.file_lock.lock();
        let cwd = self.open_cwd(proc);
        let ok = self
            .fs
            .create(cwd.as_ref(), Path::new(name), size, InodeType::File);
        self.close_cwd(cwd);
        Ok(ok as u32)
    }

    pub(super) fn sys_remove(&self, ctx: &KernelCtx, esp: usize) -> SysResult {
        let proc = ctx.proc();
        let upath = self.arg(proc, esp, 0)? as usize;

        let ks = self.copy_in_string(proc, upath).map_err(|()| Kill)?;
        let name = kstr(&ks);

        let _file_lock = self.fs.file_lock.lock();
        let cwd = self.open_cwd(proc);
        let ok = self.fs.remove(cwd.as_ref(), Path::new(name));
        self.close_cwd(cwd);
        Ok(ok as u32)
    }

    pub(super) fn sys_open(&self, ctx: &KernelCtx, esp: usize) -> SysResult {
        let proc = ctx.proc();
        let upath = self.arg(proc, esp, 0)? as usize;

        let ks = self.copy_in_string(proc, upath).map_err(|()| Kill)?;
        let name = kstr(&ks);
        if name.is_empty() {
            return Ok(-1i32 as u32);
        }

        let _file_lock = self.fs.file_lock.lock();
        let cwd = self.open_cwd(proc);
        let inode = self.fs.open(cwd.as_ref(), Path::new(name));
        self.close_cwd(cwd);
        let inode = match inode {
            Ok(inode) => inode,
            Err(()) => return Ok(-1i32 as u32),
        };

        let entry = if inode.get_type(&self.fs) == InodeType::Dir {
            match Dir::open(&self.fs, inode) {
                Some(dir) => FdEntry::Dir(Arc::new(dir)),
                None => return Ok(-1i32 as u32),
            }
        } else {
            FdEntry::File(Arc::new(File::open(inode)))
        };

        match proc.fds.lock().alloc(entry.clone()) {
            Some(fd) => Ok(fd as u32),
            None => {
                entry.close(&self.fs);
                Ok(-1i32 as u32)
            }
        }
    }

    pub(super) fn sys_filesize(&self, ctx: &KernelCtx, esp: usize) -> SysResult {
        let proc = ctx.proc();
        let fd = self.arg(proc, esp, 0)? as i32;
        let entry = proc.fds.lock().get(fd);
        match entry {
            Some(FdEntry::File(file)) => {
                let _file_lock = self.fs.file_lock.lock();
                Ok(file.length(&self.fs) as u32)
            }
            _ => Ok(-1i32 as u32),
        }
    }

    pub(super) fn sys_read(&self, ctx: &KernelCtx, esp: usize) -> SysResult {
        let proc = ctx.proc();
        let fd = self.arg(proc, esp, 0)? as i32;
        let ubuf = self.arg(proc, esp, 1)? as usize;
        let size = self.arg(proc, esp, 2)? as usize;
        if size == 0 {
            return Ok(0);
        }

        // Descriptor 0 is console input; a directory is not readable.
        let file = if fd == 0 {
            None
        } else {
            match proc.fds.lock().get(fd) {
                Some(FdEntry::File(file)) => Some(file),
                Some(FdEntry::Dir(_)) => return Ok(-1i32 as u32),
                None => return Err(Kill),
            }
        };

        let mut kbuf = vec![0u8; cmp::min(size, PGSIZE)];
        let mut done = 0;
        while done < size {
            let chunk = cmp::min(size - done, PGSIZE);
            let got = match &file {
                None => {
                    for byte in kbuf[..chunk].iter_mut() {
                        *byte = self.console.getc();
                    }
                    chunk
                }
                Some(file) => {
                    let _file_lock = self.fs.file_lock.lock();
                    file.read(&self.fs, &mut kbuf[..chunk])
                }
            };
            self.copy_out_user(proc, ubuf + done, &kbuf[..got])
                .map_err(|()| Kill)?;
            done += got;
            if got < chunk {
                break;
            }
        }
        Ok(done as u32)
    }

    pub(super) fn sys_write(&self, ctx: &KernelCtx, esp: usize) -> SysResult {
        let proc = ctx.proc();
        let fd = self.arg(proc, esp, 0)? as i32;
        let ubuf = self.arg(proc, esp, 1)? as usize;
        let size = self.arg(proc, esp, 2)? as usize;
        if size == 0 {
            return Ok(0);
        }

        // Descriptor 1 is console output; a directory is not writable.
        let file = if fd == 1 {
            None
        } else {
            match proc.fds.lock().get(fd) {
                Some(FdEntry::File(file)) => Some(file),
                Some(FdEntry::Dir(_)) => return Ok(-1i32 as u32),
                None => return Err(Kill),
            }
        };

        let mut kbuf = vec![0u8; cmp::min(size, PGSIZE)];
        let mut done = 0;
        while done < size {
            let chunk = cmp::min(size - done, PGSIZE);
            self.copy_in_user(proc, &mut kbuf[..chunk], ubuf + done)
                .map_err(|()| Kill)?;
            let wrote = match &file {
                None => {
                    self.console.putbuf(&kbuf[..chunk]);
                    chunk
                }
                Some(file) => {
                    let _file_lock = self.fs.file_lock.lock();
                    file.write(&self.fs, &kbuf[..chunk])
                }
            };
            done += wrote;
            if wrote < chunk {
                break;
            }
        }
        Ok(done as u32)
    }

    pub(super) fn sys_seek(&self, ctx: &KernelCtx, esp: usize) -> SysResult {
        let proc = ctx.proc();
        let fd = self.arg(proc, esp, 0)? as i32;
        let pos = self.arg(proc, esp, 1)?;
        if let Some(FdEntry::File(file)) = proc.fds.lock().get(fd) {
            file.seek(pos);
        }
        Ok(0)
    }

    pub(super) fn sys_tell(&self, ctx: &KernelCtx, esp: usize) -> SysResult {
        let proc = ctx.proc();
        let fd = self.arg(proc, esp, 0)? as i32;
        match proc.fds.lock().get(fd) {
            Some(FdEntry::File(file)) => Ok(file.tell()),
            _ => Ok(-1i32 as u32),
        }
    }

    pub(super) fn sys_close(&self, ctx: &KernelCtx, esp: usize) -> SysResult {
        let proc = ctx.proc();
        let fd = self.arg(proc, esp, 0)? as i32;
        let entry = proc.fds.lock().remove(fd);
        if let Some(entry) = entry {
            entry.close(&self.fs);
        }
        Ok(0)
    }

    pub(super) fn sys_chdir(&self, ctx: &KernelCtx, esp: usize) -> SysResult {
        let proc = ctx.proc();
        let upath = self.arg(proc, esp, 0)? as usize;

        let ks = self.copy_in_string(proc, upath).map_err(|()| Kill)?;
        let name = kstr(&ks);

        let _file_lock = self.fs.file_lock.lock();
        let cwd = self.open_cwd(proc);
        let inode = self.fs.resolve_name_to_inode(cwd.as_ref(), Path::new(name));
        self.close_cwd(cwd);

        match inode.ok().and_then(|inode| Dir::open(&self.fs, inode)) {
            Some(dir) => {
                let prev = proc.cwd.lock().replace(dir);
                if let Some(prev) = prev {
                    prev.close(&self.fs);
                }
                Ok(1)
            }
            None => Ok(0),
        }
    }

    pub(super) fn sys_mkdir(&self, ctx: &KernelCtx, esp: usize) -> SysResult {
        let proc = ctx.proc();
        let upath = self.arg(proc, esp, 0)? as usize;

        let ks = self.copy_in_string(proc, upath).map_err(|()| Kill)?;
        let name = kstr(&ks);
        if name.is_empty() {
            return Ok(0);
        }

        let _file_lock = self.fs.file_lock.lock();
        let cwd = self.open_cwd(proc);
        let ok = self
            .fs
            .create(cwd.as_ref(), Path::new(name), 0, InodeType::Dir);
        self.close_cwd(cwd);
        Ok(ok as u32)
    }

    pub(super) fn sys_readdir(&self, ctx: &KernelCtx, esp: usize) -> SysResult {
        let proc = ctx.proc();
        let fd = self.arg(proc, esp, 0)? as i32;
        let uname = self.arg(proc, esp, 1)? as usize;

        let dir = match proc.fds.lock().get(fd) {
            Some(FdEntry::Dir(dir)) => dir,
            _ => return Ok(0),
        };

        let mut name = [0u8; NAME_MAX + 1];
        let found = {
            let _file_lock = self.fs.file_lock.lock();
            dir.readdir(&self.fs, &mut name)
        };
        if !found {
            return Ok(0);
        }

        let len = name.iter().position(|b| *b == 0).unwrap_or(NAME_MAX) + 1;
        match self.copy_out_user(proc, uname, &name[..len]) {
            Ok(()) => Ok(1),
            Err(()) => Ok(0),
        }
    }

    pub(super) fn sys_isdir(&self, ctx: &KernelCtx, esp: usize) -> SysResult {
        let proc = ctx.proc();
        let fd = self.arg(proc, esp, 0)? as i32;
        match proc.fds.lock().get(fd) {
            Some(FdEntry::Dir(_)) => Ok(1),
            _ => Ok(0),
        }
    }

    pub(super) fn sys_inumber(&self, ctx: &KernelCtx, esp: usize) -> SysResult {
        let proc = ctx.proc();
        let fd = self.arg(proc, esp, 0)? as i32;
        match proc.fds.lock().get(fd) {
            Some(entry) => Ok(entry.inumber()),
            None => Err(Kill),
        }
    }
}
