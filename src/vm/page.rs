//! Page descriptors and the per-process page table.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::AtomicBool;

use crate::addr::pg_ofs;
use crate::fs::Inode;
use crate::lock::SpinLock;

/// Where a page's contents live while no frame backs it.
#[derive(Clone)]
pub enum PageSource {
    /// Zero-filled on first touch.
    Zero,
    /// Contents live in the given swap slot. The slot is consumed by
    /// swap-in, so a resident page never carries this tag.
    Swap(usize),
    /// `bytes` bytes at `offset` of `inode`; the rest of the page is zero.
    File {
        inode: Arc<Inode>,
        offset: usize,
        bytes: usize,
    },
}

pub struct PageInner {
    pub source: PageSource,
    /// Index of the backing frame, while resident.
    pub frame: Option<usize>,
}

/// The kernel's record of one mapped user virtual page, independent of
/// whether a frame currently backs it.
pub struct Page {
    /// Page-aligned user virtual address.
    addr: usize,
    read_only: bool,
    /// Dirty contents go to swap, never back to a file. Set for every
    /// writable page at creation.
    private: bool,
    /// Reference and dirty bits, maintained by the user-access paths and
    /// consumed by the clock evictor.
    pub accessed: AtomicBool,
    pub dirty: AtomicBool,
    pub inner: SpinLock<PageInner>,
}

impl Page {
    pub fn new(addr: usize, read_only: bool, source: PageSource) -> Arc<Page> {
        debug_assert_eq!(pg_ofs(addr), 0);
        Arc::new(Page {
            addr,
            read_only,
            private: !read_only,
            accessed: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            inner: SpinLock::new(
                "page",
                PageInner {
                    source,
                    frame: None,
                },
            ),
        })
    }

    pub fn addr(&self) -> usize {
        self.addr
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn private(&self) -> bool {
        self.private
    }
}

/// Per-process mapping from page-aligned user virtual address to page
/// descriptor.
pub struct PageTable {
    pages: SpinLock<BTreeMap<usize, Arc<Page>>>,
}

impl PageTable {
    pub fn new() -> Self {
        Self {
            pages: SpinLock::new("pages", BTreeMap::new()),
        }
    }

    pub fn get(&self, page_addr: usize) -> Option<Arc<Page>> {
        debug_assert_eq!(pg_ofs(page_addr), 0);
        self.pages.lock().get(&page_addr).cloned()
    }

    /// Fails if the address is already mapped.
    pub fn insert(&self, page: Arc<Page>) -> Result<(), ()> {
        let mut pages = self.pages.lock();
        if pages.contains_key(&page.addr()) {
            return Err(());
        }
        pages.insert(page.addr(), page);
        Ok(())
    }

    /// Empties the table, returning every descriptor.
    pub fn take_all(&self) -> Vec<Arc<Page>> {
        let mut pages = self.pages.lock();
        let map = core::mem::take(&mut *pages);
        map.into_iter().map(|(_, page)| page).collect()
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}
