//! Directories.
//!
//! A directory is an ordinary file whose content is an array of
//! `DirEntry`. Entries with `in_use == 0` are tombstones, reusable by a
//! later `add`. Every directory carries `.` and `..` as its first two
//! entries, written at creation.

use alloc::sync::Arc;
use core::mem;
use core::sync::atomic::{AtomicU32, Ordering};

use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use super::path::FileName;
use super::{FileSys, Inode, InodeType};
use crate::param::{NAME_MAX, ROOT_DIR_SECTOR};

pub(crate) const DIR_ENTRY_SIZE: usize = mem::size_of::<DirEntry>();

/// A single on-disk directory entry.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
struct DirEntry {
    /// Sector of the entry's inode.
    inode_sector: u32,
    /// NUL-padded name.
    name: [u8; NAME_MAX + 1],
    /// Nonzero for a live entry, zero for a tombstone.
    in_use: u8,
}

const_assert!(mem::size_of::<DirEntry>() == 20);

impl DirEntry {
    fn set_name(&mut self, name: &[u8]) {
        debug_assert!(name.len() <= NAME_MAX);
        self.name = [0; NAME_MAX + 1];
        self.name[..name.len()].copy_from_slice(name);
    }

    /// The name up to its NUL terminator.
    fn name(&self) -> &[u8] {
        let len = self
            .name
            .iter()
            .position(|ch| *ch == 0)
            .unwrap_or(self.name.len());
        &self.name[..len]
    }

    fn live(&self) -> bool {
        self.in_use != 0
    }
}

/// An open directory: an inode plus a `readdir` cursor.
pub struct Dir {
    inode: Arc<Inode>,
    pos: AtomicU32,
}

impl Dir {
    /// Creates a directory in `sector`, seeding `.` to itself and `..` to
    /// `parent_sector`, and returns its opened inode. On failure the
    /// sector ends up released back to the free map.
    pub fn create(fs: &FileSys, sector: u32, parent_sector: u32) -> Option<Arc<Inode>> {
        let inode = fs.inode_create(sector, InodeType::Dir);

        let mut dot = DirEntry::new_zeroed();
        dot.set_name(b".");
        dot.inode_sector = sector;
        dot.in_use = 1;
        let mut dotdot = DirEntry::new_zeroed();
        dotdot.set_name(b"..");
        dotdot.inode_sector = parent_sector;
        dotdot.in_use = 1;

        let mut buf = [0u8; 2 * DIR_ENTRY_SIZE];
        buf[..DIR_ENTRY_SIZE].copy_from_slice(dot.as_bytes());
        buf[DIR_ENTRY_SIZE..].copy_from_slice(dotdot.as_bytes());

        if inode.write_at(fs, &buf, 0) != buf.len() {
            inode.remove();
            fs.inode_close(inode);
            return None;
        }
        Some(inode)
    }

    /// Opens a directory for `inode`, of which it takes ownership. Fails
    /// (closing the inode) if it is not a directory.
    pub fn open(fs: &FileSys, inode: Arc<Inode>) -> Option<Dir> {
        if inode.get_type(fs) == InodeType::Dir {
            Some(Dir {
                inode,
                pos: AtomicU32::new(0),
            })
        } else {
            fs.inode_close(inode);
            None
        }
    }

    /// Opens the root directory.
    pub fn open_root(fs: &FileSys) -> Dir {
        Dir::open(fs, fs.inode_open(ROOT_DIR_SECTOR)).expect("root is a directory")
    }

    /// Opens a new handle (with its own cursor) for the same inode.
    pub fn reopen(&self, fs: &FileSys) -> Dir {
        Dir {
            inode: fs.inode_reopen(&self.inode),
            pos: AtomicU32::new(0),
        }
    }

    /// Closes the handle's inode reference.
    pub fn close(&self, fs: &FileSys) {
        fs.inode_close(Arc::clone(&self.inode));
    }

    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    pub fn inumber(&self) -> u32 {
        self.inode.inumber()
    }

    /// Scans for `name`. Caller holds the inode lock.
    fn lookup_entry(&self, fs: &FileSys, name: &FileName) -> Option<(DirEntry, usize)> {
        let mut entry = DirEntry::new_zeroed();
        let mut ofs = 0;
        while self.inode.read_at(fs, entry.as_bytes_mut(), ofs) == DIR_ENTRY_SIZE {
            if entry.live() && entry.name() == name.as_bytes() {
                return Some((entry, ofs));
            }
            ofs += DIR_ENTRY_SIZE;
        }
        None
    }

    /// Looks `name` up and opens its inode.
    pub fn lookup(&self, fs: &FileSys, name: &FileName) -> Option<Arc<Inode>> {
        let guard = self.inode.lock.lock();
        let found = self.lookup_entry(fs, name);
        drop(guard);
        found.map(|(entry, _)| fs.inode_open(entry.inode_sector))
    }

    /// Adds an entry mapping `name` to `inode_sector`, reusing a tombstone
    /// if one exists. Fails on a duplicate name.
    pub fn add(&self, fs: &FileSys, name: &FileName, inode_sector: u32) -> bool {
        let _guard = self.inode.lock.lock();
        if self.lookup_entry(fs, name).is_some() {
            return false;
        }

        // Offset of the first free slot, or end of file.
        let mut entry = DirEntry::new_zeroed();
        let mut ofs = 0;
        while self.inode.read_at(fs, entry.as_bytes_mut(), ofs) == DIR_ENTRY_SIZE {
            if !entry.live() {
                break;
            }
            ofs += DIR_ENTRY_SIZE;
        }

        let mut entry = DirEntry::new_zeroed();
        entry.set_name(name.as_bytes());
        entry.inode_sector = inode_sector;
        entry.in_use = 1;
        self.inode.write_at(fs, entry.as_bytes(), ofs) == DIR_ENTRY_SIZE
    }

    /// A directory may be removed only when this handle's reference is the
    /// sole opener and nothing but `.` and `..` is live in it.
    fn removable(&self, fs: &FileSys, inode: &Arc<Inode>) -> bool {
        if fs.inode_open_cnt(inode) > 1 {
            return false;
        }
        let mut entry = DirEntry::new_zeroed();
        let mut ofs = 0;
        let mut live = 0;
        while inode.read_at(fs, entry.as_bytes_mut(), ofs) == DIR_ENTRY_SIZE {
            if entry.live() {
                live += 1;
            }
            ofs += DIR_ENTRY_SIZE;
        }
        live <= 2
    }

    /// Removes the entry for `name`, tombstoning its slot and marking the
    /// target inode for deletion. `.` and `..` are never removable.
    pub fn remove(&self, fs: &FileSys, name: &FileName) -> bool {
        if name.is_dot_or_dotdot() {
            return false;
        }

        let guard = self.inode.lock.lock();
        let (mut entry, ofs) = match self.lookup_entry(fs, name) {
            Some(found) => found,
            None => return false,
        };

        let inode = fs.inode_open(entry.inode_sector);
        if inode.get_type(fs) == InodeType::Dir && !self.removable(fs, &inode) {
            drop(guard);
            fs.inode_close(inode);
            return false;
        }

        entry.in_use = 0;
        let ok = self.inode.write_at(fs, entry.as_bytes(), ofs) == DIR_ENTRY_SIZE;
        if ok {
            inode.remove();
        }
        drop(guard);
        fs.inode_close(inode);
        ok
    }

    /// Stores the next live entry name (other than `.` and `..`) into
    /// `name_out` and advances the cursor. Returns false at the end.
    pub fn readdir(&self, fs: &FileSys, name_out: &mut [u8; NAME_MAX + 1]) -> bool {
        let _guard = self.inode.lock.lock();
        let mut entry = DirEntry::new_zeroed();
        loop {
            let ofs = self.pos.load(Ordering::Relaxed) as usize;
            if self.inode.read_at(fs, entry.as_bytes_mut(), ofs) != DIR_ENTRY_SIZE {
                return false;
            }
            self.pos
                .store((ofs + DIR_ENTRY_SIZE) as u32, Ordering::Relaxed);
            if entry.live() && entry.name() != b"." && entry.name() != b".." {
                name_out.fill(0);
                name_out[..entry.name().len()].copy_from_slice(entry.name());
                return true;
            }
        }
    }
}
