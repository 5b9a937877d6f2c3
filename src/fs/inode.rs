//! Inodes.
//!
//! An inode describes a single unnamed file. Its on-disk form occupies
//! exactly one sector and holds the file's type, its length, and the
//! sector pointers to its content: 123 direct pointers, one indirect
//! pointer, and one doubly-indirect pointer. A pointer of 0 means "not
//! allocated"; reading through one yields zeros.
//!
//! The kernel keeps a table of in-use inodes in memory so that opening a
//! single sector twice returns the same object. An entry stays in the
//! table while its open count is positive; the last close of a `removed`
//! inode frees its whole sector tree.
//!
//! `Inode::lock` serializes structural mutation (directory entries). Raw
//! byte reads and writes do not take it; each transfer goes through a
//! private sector buffer, so readers never observe torn sector data.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::cmp;
use core::mem;
use core::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use super::{FileSys, SectorBuf};
use crate::lock::{SleepLock, SleepableLock, SpinLock};
use crate::param::{
    DIRECT_CNT, INODE_MAGIC, INODE_SPAN, PTRS_PER_SECTOR, SECTOR_CNT, SECTOR_SIZE,
};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum InodeType {
    File,
    Dir,
}

impl InodeType {
    fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::File),
            1 => Some(Self::Dir),
            _ => None,
        }
    }

    fn to_raw(self) -> u32 {
        match self {
            Self::File => 0,
            Self::Dir => 1,
        }
    }
}

/// On-disk inode. Must be exactly `SECTOR_SIZE` bytes long.
#[repr(C)]
#[derive(AsBytes, FromBytes)]
pub(crate) struct DiskInode {
    /// Sector pointers: direct, then indirect, then doubly indirect.
    pub sectors: [u32; SECTOR_CNT],
    /// `InodeType`, as a raw tag.
    pub typ: u32,
    /// File size in bytes.
    pub length: u32,
    /// Must be `INODE_MAGIC`.
    pub magic: u32,
}

const_assert!(mem::size_of::<DiskInode>() == SECTOR_SIZE);

/// A sector's worth of sector pointers. Also used as a raw view of an
/// inode sector, whose pointer array occupies the leading entries.
#[repr(C)]
#[derive(AsBytes, FromBytes)]
struct PtrBlock {
    sectors: [u32; PTRS_PER_SECTOR],
}

const_assert!(mem::size_of::<PtrBlock>() == SECTOR_SIZE);

struct WriteState {
    /// 0: writes ok, >0: deny writes.
    deny_write_cnt: i32,
    /// Writers currently inside `write_at`.
    writer_cnt: i32,
}

/// In-memory inode.
pub struct Inode {
    /// Sector number of its on-disk location.
    sector: u32,
    /// Number of openers; guarded by the open-inodes lock.
    open_cnt: AtomicI32,
    /// Deleted at last close?
    removed: AtomicBool,
    /// Serializes structural mutation of the inode's content.
    pub lock: SleepLock<()>,
    /// Deny-write bookkeeping, with its no-writers condition.
    write_state: SleepableLock<WriteState>,
}

impl Inode {
    fn new(sector: u32) -> Self {
        Self {
            sector,
            open_cnt: AtomicI32::new(1),
            removed: AtomicBool::new(false),
            lock: SleepLock::new("inode", ()),
            write_state: SleepableLock::new(
                "deny_write",
                WriteState {
                    deny_write_cnt: 0,
                    writer_cnt: 0,
                },
            ),
        }
    }

    pub fn inumber(&self) -> u32 {
        self.sector
    }

    /// Marks the inode to be deleted when the last opener closes it.
    pub fn remove(&self) {
        self.removed.store(true, Ordering::Release);
    }
}

/// Table of in-use inodes, one per live sector.
pub struct Itable {
    inodes: SpinLock<BTreeMap<u32, Arc<Inode>>>,
}

impl Itable {
    pub(crate) fn new() -> Self {
        Self {
            inodes: SpinLock::new("itable", BTreeMap::new()),
        }
    }
}

impl FileSys {
    pub(crate) fn read_disk_inode(&self, sector: u32) -> DiskInode {
        let buf = self.read_sector(sector);
        DiskInode::read_from(&buf[..]).expect("inode sector size")
    }

    /// Initializes an on-disk inode of the given type at `sector`, with
    /// length 0 and all pointers unallocated, and returns it opened.
    pub fn inode_create(&self, sector: u32, typ: InodeType) -> Arc<Inode> {
        let mut disk = DiskInode::new_zeroed();
        disk.typ = typ.to_raw();
        disk.magic = INODE_MAGIC;
        self.write_sector(sector, disk.as_bytes());
        self.inode_open(sector)
    }

    /// Opens the inode at `sector`. Idempotent: a second open of the same
    /// live sector returns the same object.
    pub fn inode_open(&self, sector: u32) -> Arc<Inode> {
        let mut itable = self.itable.inodes.lock();
        if let Some(inode) = itable.get(&sector) {
            inode.open_cnt.fetch_add(1, Ordering::Relaxed);
            return Arc::clone(inode);
        }
        let inode = Arc::new(Inode::new(sector));
        itable.insert(sector, Arc::clone(&inode));
        inode
    }

    /// Re-references an already-open inode.
    pub fn inode_reopen(&self, inode: &Arc<Inode>) -> Arc<Inode> {
        let _itable = self.itable.inodes.lock();
        inode.open_cnt.fetch_add(1, Ordering::Relaxed);
        Arc::clone(inode)
    }

    /// Drops one reference to `inode`. The last close unlinks it from the
    /// open-inodes table and, if it was removed, frees its sector tree.
    pub fn inode_close(&self, inode: Arc<Inode>) {
        let mut itable = self.itable.inodes.lock();
        if inode.open_cnt.fetch_sub(1, Ordering::Relaxed) > 1 {
            return;
        }
        itable.remove(&inode.sector);
        // Nobody can reach the inode once it is out of the table, so the
        // deallocation I/O can proceed without the table lock.
        drop(itable);
        if inode.removed.load(Ordering::Acquire) {
            self.deallocate_inode(&inode);
        }
    }

    /// Open-count snapshot, taken under the open-inodes lock.
    pub fn inode_open_cnt(&self, inode: &Inode) -> i32 {
        let _itable = self.itable.inodes.lock();
        inode.open_cnt.load(Ordering::Relaxed)
    }

    /// Deallocates `sector` and anything it points to. `level` is 2 for a
    /// doubly-indirect sector, 1 for indirect, 0 for data.
    fn deallocate_recursive(&self, sector: u32, level: u32) {
        if level > 0 {
            let buf = self.read_sector(sector);
            let table = PtrBlock::read_from(&buf[..]).expect("pointer sector size");
            for &ptr in table.sectors.iter() {
                if ptr != 0 {
                    self.deallocate_recursive(ptr, level - 1);
                }
            }
        }
        self.free_map.release(sector);
    }

    /// Frees every block of `inode`, then its own sector. All three
    /// pointer classes are walked unconditionally; a hole in the direct
    /// range does not hide the indirect trees.
    fn deallocate_inode(&self, inode: &Inode) {
        let disk = self.read_disk_inode(inode.sector);
        for i in 0..DIRECT_CNT {
            if disk.sectors[i] != 0 {
                self.deallocate_recursive(disk.sectors[i], 0);
            }
        }
        if disk.sectors[DIRECT_CNT] != 0 {
            self.deallocate_recursive(disk.sectors[DIRECT_CNT], 1);
        }
        if disk.sectors[DIRECT_CNT + 1] != 0 {
            self.deallocate_recursive(disk.sectors[DIRECT_CNT + 1], 2);
        }
        self.free_map.release(inode.sector);
    }
}

/// Translates `sector_idx` into a sequence of per-level table indexes:
/// one for a direct block, two through the indirect sector, three through
/// the doubly-indirect tree.
fn calculate_indices(sector_idx: usize) -> Result<([usize; 3], usize), ()> {
    if sector_idx < DIRECT_CNT {
        return Ok(([sector_idx, 0, 0], 1));
    }
    let sector_idx = sector_idx - DIRECT_CNT;

    if sector_idx < PTRS_PER_SECTOR {
        return Ok(([DIRECT_CNT, sector_idx, 0], 2));
    }
    let sector_idx = sector_idx - PTRS_PER_SECTOR;

    if sector_idx < PTRS_PER_SECTOR * PTRS_PER_SECTOR {
        return Ok((
            [
                DIRECT_CNT + 1,
                sector_idx / PTRS_PER_SECTOR,
                sector_idx % PTRS_PER_SECTOR,
            ],
            3,
        ));
    }
    Err(())
}

impl Inode {
    /// Returns the type tag stored on disk.
    pub fn get_type(&self, fs: &FileSys) -> InodeType {
        InodeType::from_raw(fs.read_disk_inode(self.sector).typ).expect("inode type tag")
    }

    /// Returns the length, in bytes, of the inode's data.
    pub fn length(&self, fs: &FileSys) -> usize {
        fs.read_disk_inode(self.sector).length as usize
    }

    /// Retrieves the data block containing byte `offset`.
    ///
    /// Returns the block and its sector number. Without `allocate`, a
    /// missing block along the way reports a hole as `(None, 0)`; with
    /// `allocate`, every missing sector on the way down is allocated,
    /// zeroed, and published into its containing table sector.
    fn get_data_block(
        &self,
        fs: &FileSys,
        offset: usize,
        allocate: bool,
    ) -> Result<(Option<Box<SectorBuf>>, u32), ()> {
        let (offsets, cnt) = calculate_indices(offset / SECTOR_SIZE)?;

        // The inode sector itself serves as the level-0 table: its pointer
        // array occupies the leading entries, and the indexes above never
        // reach the trailing metadata fields.
        let mut table_sector = self.sector;
        for &index in offsets[..cnt].iter() {
            let buf = fs.read_sector(table_sector);
            let mut table = PtrBlock::read_from(&buf[..]).expect("pointer sector size");
            let mut next = table.sectors[index];
            if next == 0 {
                if !allocate {
                    return Ok((None, 0));
                }
                next = fs.free_map.allocate().ok_or(())?;
                fs.zero_sector(next);
                table.sectors[index] = next;
                fs.write_sector(table_sector, table.as_bytes());
            }
            table_sector = next;
        }

        let block = fs.read_sector(table_sector);
        Ok((Some(block), table_sector))
    }

    /// Reads up to `buf.len()` bytes starting at `offset`, truncating at
    /// end of file. A hole inside the file reads as zeros.
    pub fn read_at(&self, fs: &FileSys, buf: &mut [u8], mut offset: usize) -> usize {
        let length = self.length(fs);
        let mut bytes_read = 0;

        while bytes_read < buf.len() {
            let sector_ofs = offset % SECTOR_SIZE;
            let inode_left = length.saturating_sub(offset);
            let sector_left = SECTOR_SIZE - sector_ofs;
            let chunk = cmp::min(buf.len() - bytes_read, cmp::min(inode_left, sector_left));
            if chunk == 0 {
                break;
            }

            match self.get_data_block(fs, offset, false) {
                Ok((Some(block), _)) => buf[bytes_read..bytes_read + chunk]
                    .copy_from_slice(&block[sector_ofs..sector_ofs + chunk]),
                Ok((None, _)) => {
                    for byte in buf[bytes_read..bytes_read + chunk].iter_mut() {
                        *byte = 0;
                    }
                }
                Err(()) => break,
            }

            offset += chunk;
            bytes_read += chunk;
        }
        bytes_read
    }

    /// Writes `buf` at `offset`, allocating blocks and extending the file
    /// as needed. Returns the number of bytes written, which is 0 while
    /// writes are denied and may be short if the device fills up.
    pub fn write_at(&self, fs: &FileSys, buf: &[u8], mut offset: usize) -> usize {
        {
            let mut state = self.write_state.lock();
            if state.deny_write_cnt > 0 {
                return 0;
            }
            state.writer_cnt += 1;
        }

        let mut bytes_written = 0;
        while bytes_written < buf.len() {
            let sector_ofs = offset % SECTOR_SIZE;
            let inode_left = INODE_SPAN.saturating_sub(offset);
            let sector_left = SECTOR_SIZE - sector_ofs;
            let chunk = cmp::min(buf.len() - bytes_written, cmp::min(inode_left, sector_left));
            if chunk == 0 {
                break;
            }

            match self.get_data_block(fs, offset, true) {
                Ok((Some(mut block), sector)) => {
                    block[sector_ofs..sector_ofs + chunk]
                        .copy_from_slice(&buf[bytes_written..bytes_written + chunk]);
                    fs.write_sector(sector, &block[..]);
                }
                _ => break,
            }

            offset += chunk;
            bytes_written += chunk;
        }

        self.extend_file(fs, offset);

        let mut state = self.write_state.lock();
        state.writer_cnt -= 1;
        if state.writer_cnt == 0 {
            state.wakeup();
        }
        bytes_written
    }

    /// Extends the inode to at least `length` bytes, allocating any
    /// missing blocks up to that offset.
    fn extend_file(&self, fs: &FileSys, length: usize) {
        let mut current = self.length(fs);
        if current >= length {
            return;
        }
        while current < length {
            let sector_idx = (current + SECTOR_SIZE - 1) / SECTOR_SIZE;
            if self
                .get_data_block(fs, sector_idx * SECTOR_SIZE, true)
                .is_err()
            {
                break;
            }
            current = cmp::min((sector_idx + 1) * SECTOR_SIZE, length);
        }
        self.update_length(fs, current);
    }

    /// Grows the file to `length` without writing data (`create` with a
    /// nonzero initial size).
    pub(crate) fn grow(&self, fs: &FileSys, length: usize) {
        self.extend_file(fs, cmp::min(length, INODE_SPAN));
    }

    /// Publishes a new length via read-modify-write of the on-disk inode.
    fn update_length(&self, fs: &FileSys, new_length: usize) {
        let mut disk = fs.read_disk_inode(self.sector);
        if new_length > disk.length as usize {
            disk.length = new_length as u32;
            fs.write_sector(self.sector, disk.as_bytes());
        }
    }

    /// Disables writes to the inode, draining any in-progress writers
    /// first.
    pub fn deny_write(&self) {
        let mut state = self.write_state.lock();
        state.deny_write_cnt += 1;
        while state.writer_cnt > 0 {
            state.sleep();
        }
    }

    /// Re-enables writes. Must pair with a prior `deny_write`.
    pub fn allow_write(&self) {
        let mut state = self.write_state.lock();
        debug_assert!(state.deny_write_cnt > 0);
        state.deny_write_cnt -= 1;
    }
}
