//! The file system: the open-inodes table, directories over inodes, and
//! `/`-separated path resolution rooted at `ROOT_DIR_SECTOR` or at a
//! process's current directory.
//!
//! There is no buffer cache: every transfer reads or writes whole sectors
//! through a private buffer, straight to the device.

use alloc::boxed::Box;
use alloc::sync::Arc;

use crate::hal::{BlockDevice, FreeMap};
use crate::lock::SleepLock;
use crate::param::{ROOT_DIR_SECTOR, SECTOR_SIZE};

pub mod directory;
pub mod inode;
pub mod path;

pub use directory::Dir;
pub use inode::{Inode, InodeType, Itable};
pub use path::{FileName, Path};

pub type SectorBuf = [u8; SECTOR_SIZE];

pub struct FileSys {
    pub(crate) device: Arc<dyn BlockDevice>,
    pub(crate) free_map: Arc<dyn FreeMap>,
    pub(crate) itable: Itable,
    /// Global filesystem lock; the syscall layer wraps filesystem work in
    /// it.
    pub file_lock: SleepLock<()>,
}

impl FileSys {
    /// Brings up the file system on `device`. With `format`, writes a
    /// fresh root directory first.
    pub(crate) fn new(
        device: Arc<dyn BlockDevice>,
        free_map: Arc<dyn FreeMap>,
        format: bool,
    ) -> Result<Self, ()> {
        let fs = Self {
            device,
            free_map,
            itable: Itable::new(),
            file_lock: SleepLock::new("filesys", ()),
        };
        if format {
            log::debug!("formatting file system");
            let root = Dir::create(&fs, ROOT_DIR_SECTOR, ROOT_DIR_SECTOR).ok_or(())?;
            fs.inode_close(root);
        }
        Ok(fs)
    }

    pub(crate) fn read_sector(&self, sector: u32) -> Box<SectorBuf> {
        let mut buf = Box::new([0u8; SECTOR_SIZE]);
        self.device.read(sector, &mut buf);
        buf
    }

    pub(crate) fn write_sector(&self, sector: u32, buf: &[u8]) {
        debug_assert_eq!(buf.len(), SECTOR_SIZE);
        let mut sec = [0u8; SECTOR_SIZE];
        sec.copy_from_slice(buf);
        self.device.write(sector, &sec);
    }

    pub(crate) fn zero_sector(&self, sector: u32) {
        self.device.write(sector, &[0u8; SECTOR_SIZE]);
    }

    /// Resolves `name` down to its parent directory, returning the opened
    /// directory and the final component. The walk starts at the root for
    /// absolute names or when the process has no current directory.
    pub fn resolve_name_to_entry<'p>(
        &self,
        cwd: Option<&Dir>,
        name: &'p Path,
    ) -> Result<(Dir, &'p FileName), ()> {
        let dir = match cwd {
            Some(cwd) if !name.is_absolute() => cwd.reopen(self),
            _ => Dir::open_root(self),
        };
        let mut dir = scopeguard::guard(dir, |dir| dir.close(self));

        let (mut rest, mut part) = match name.skipelem()? {
            Some(first) => first,
            None => return Err(()),
        };

        loop {
            match rest.skipelem()? {
                None => {
                    let dir = scopeguard::ScopeGuard::into_inner(dir);
                    return Ok((dir, part));
                }
                Some((next_rest, next_part)) => {
                    let inode = dir.lookup(self, part).ok_or(())?;
                    let next = Dir::open(self, inode).ok_or(())?;
                    let prev = core::mem::replace(&mut *dir, next);
                    prev.close(self);
                    rest = next_rest;
                    part = next_part;
                }
            }
        }
    }

    /// Resolves `name` to an opened inode. `"/"` (and any all-slash name)
    /// resolves to the root inode directly.
    pub fn resolve_name_to_inode(&self, cwd: Option<&Dir>, name: &Path) -> Result<Arc<Inode>, ()> {
        if name.is_root() {
            return Ok(self.inode_open(ROOT_DIR_SECTOR));
        }
        let (dir, base) = self.resolve_name_to_entry(cwd, name)?;
        let inode = dir.lookup(self, base);
        dir.close(self);
        inode.ok_or(())
    }

    /// Creates a file or directory at `name` and links it into its parent.
    /// Every partial step is undone on failure.
    pub fn create(
        &self,
        cwd: Option<&Dir>,
        name: &Path,
        initial_size: usize,
        typ: InodeType,
    ) -> bool {
        let (dir, base) = match self.resolve_name_to_entry(cwd, name) {
            Ok(found) => found,
            Err(()) => return false,
        };

        let sector = match self.free_map.allocate() {
            Some(sector) => sector,
            None => {
                dir.close(self);
                return false;
            }
        };

        let inode = match typ {
            InodeType::File => {
                let inode = self.inode_create(sector, InodeType::File);
                if initial_size > 0 {
                    inode.grow(self, initial_size);
                }
                Some(inode)
            }
            InodeType::Dir => Dir::create(self, sector, dir.inumber()),
        };

        let ok = match inode {
            Some(inode) => {
                let ok = dir.add(self, base, sector);
                if !ok {
                    inode.remove();
                }
                self.inode_close(inode);
                ok
            }
            None => {
                // Dir::create already released the sector.
                false
            }
        };
        dir.close(self);
        ok
    }

    /// Opens `name`, returning its inode.
    pub fn open(&self, cwd: Option<&Dir>, name: &Path) -> Result<Arc<Inode>, ()> {
        if name.is_empty() {
            return Err(());
        }
        self.resolve_name_to_inode(cwd, name)
    }

    /// Deletes the entry at `name`.
    pub fn remove(&self, cwd: Option<&Dir>, name: &Path) -> bool {
        let (dir, base) = match self.resolve_name_to_entry(cwd, name) {
            Ok(found) => found,
            Err(()) => return false,
        };
        let ok = dir.remove(self, base);
        dir.close(self);
        ok
    }
}
