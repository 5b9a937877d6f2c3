//! File handles and the per-process descriptor table.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::fs::{Dir, FileSys, Inode};
use crate::param::FD_BASE;

/// An open file: an inode plus a position. Handles are per-`open`; two
/// opens of the same file advance independent positions.
pub struct File {
    inode: Arc<Inode>,
    pos: AtomicU32,
    /// Has this handle denied writes to its inode?
    denied_write: AtomicBool,
}

impl File {
    /// Takes ownership of one inode reference.
    pub fn open(inode: Arc<Inode>) -> File {
        File {
            inode,
            pos: AtomicU32::new(0),
            denied_write: AtomicBool::new(false),
        }
    }

    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    /// Reads at the current position, advancing it by the bytes read.
    pub fn read(&self, fs: &FileSys, buf: &mut [u8]) -> usize {
        let pos = self.pos.load(Ordering::Relaxed);
        let n = self.inode.read_at(fs, buf, pos as usize);
        self.pos.store(pos + n as u32, Ordering::Relaxed);
        n
    }

    /// Reads at `offset` without touching the position.
    pub fn read_at(&self, fs: &FileSys, buf: &mut [u8], offset: usize) -> usize {
        self.inode.read_at(fs, buf, offset)
    }

    /// Writes at the current position, advancing it by the bytes written.
    pub fn write(&self, fs: &FileSys, buf: &[u8]) -> usize {
        let pos = self.pos.load(Ordering::Relaxed);
        let n = self.inode.write_at(fs, buf, pos as usize);
        self.pos.store(pos + n as u32, Ordering::Relaxed);
        n
    }

    /// Writes at `offset` without touching the position.
    pub fn write_at(&self, fs: &FileSys, buf: &[u8], offset: usize) -> usize {
        self.inode.write_at(fs, buf, offset)
    }

    pub fn seek(&self, pos: u32) {
        self.pos.store(pos, Ordering::Relaxed);
    }

    pub fn tell(&self) -> u32 {
        self.pos.load(Ordering::Relaxed)
    }

    pub fn length(&self, fs: &FileSys) -> usize {
        self.inode.length(fs)
    }

    /// Denies writes to the underlying inode, at most once per handle.
    pub fn deny_write(&self) {
        if !self.denied_write.swap(true, Ordering::AcqRel) {
            self.inode.deny_write();
        }
    }

    /// Undoes this handle's `deny_write`, if any.
    pub fn allow_write(&self) {
        if self.denied_write.swap(false, Ordering::AcqRel) {
            self.inode.allow_write();
        }
    }

    /// Closes the handle, re-allowing writes it denied.
    pub fn close(&self, fs: &FileSys) {
        self.allow_write();
        fs.inode_close(Arc::clone(&self.inode));
    }
}

/// What a descriptor refers to.
#[derive(Clone)]
pub enum FdEntry {
    File(Arc<File>),
    Dir(Arc<Dir>),
}

impl FdEntry {
    pub fn close(&self, fs: &FileSys) {
        match self {
            FdEntry::File(file) => file.close(fs),
            FdEntry::Dir(dir) => dir.close(fs),
        }
    }

    pub fn inumber(&self) -> u32 {
        match self {
            FdEntry::File(file) => file.inode().inumber(),
            FdEntry::Dir(dir) => dir.inumber(),
        }
    }
}

/// Per-process descriptor table. Descriptors 0 and 1 are the console and
/// never appear here; handles start at `FD_BASE` and the counter is never
/// recycled. When the counter would overflow, allocation fails.
pub struct FdTable {
    next_fd: i32,
    entries: BTreeMap<i32, FdEntry>,
}

impl FdTable {
    pub fn new() -> Self {
        Self {
            next_fd: FD_BASE,
            entries: BTreeMap::new(),
        }
    }

    pub fn alloc(&mut self, entry: FdEntry) -> Option<i32> {
        if self.next_fd == i32::MAX {
            return None;
        }
        let fd = self.next_fd;
        self.next_fd += 1;
        self.entries.insert(fd, entry);
        Some(fd)
    }

    pub fn get(&self, fd: i32) -> Option<FdEntry> {
        self.entries.get(&fd).cloned()
    }

    pub fn remove(&mut self, fd: i32) -> Option<FdEntry> {
        self.entries.remove(&fd)
    }

    /// Empties the table, yielding entries in descriptor order.
    pub fn take_all(&mut self) -> alloc::vec::Vec<FdEntry> {
        let entries = core::mem::take(&mut self.entries);
        entries.into_iter().map(|(_, entry)| entry).collect()
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}
