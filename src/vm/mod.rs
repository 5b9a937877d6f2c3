//! Demand paging.
//!
//! The pager resolves faults by consulting the faulting process's page
//! table, allocating (and if necessary evicting) a frame, and filling it
//! from swap, from the backing file, or with zeros. Kernel accesses to
//! user memory go through the copy primitives at the bottom, which pin
//! each touched page for the duration of the transfer.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use core::cmp;
use core::sync::atomic::Ordering;

use crate::addr::{is_user_vaddr, pg_ofs, pg_round_down};
use crate::kernel::Kernel;
use crate::param::{PGSIZE, PHYS_BASE, STACK_MAX, STACK_SLOP};
use crate::proc::Process;

pub mod frame;
pub mod page;
pub mod swap;

pub use frame::{Frame, FrameGuard, FrameInner, FrameTable, PageBuf};
pub use page::{Page, PageInner, PageSource, PageTable};
pub use swap::Swap;

impl Kernel {
    /// Finds the page containing `addr`, allocating a fresh stack page
    /// when the access looks like stack growth: at most `STACK_SLOP`
    /// bytes below the saved user stack pointer and within the stack
    /// region.
    fn page_for_addr(&self, proc: &Process, addr: usize) -> Option<Arc<Page>> {
        if !is_user_vaddr(addr) {
            return None;
        }
        let page_addr = pg_round_down(addr);
        if let Some(page) = proc.pages.get(page_addr) {
            return Some(page);
        }

        let esp = proc.user_esp.load(Ordering::Acquire);
        if esp <= addr + STACK_SLOP && page_addr >= PHYS_BASE - STACK_MAX {
            let page = Page::new(page_addr, false, PageSource::Zero);
            if proc.pages.insert(Arc::clone(&page)).is_ok() {
                return Some(page);
            }
        }
        None
    }

    /// Pins `page`'s frame, if it has one right now.
    pub(crate) fn frame_lock(&self, page: &Arc<Page>) -> Option<FrameGuard<'_>> {
        loop {
            let idx = page.inner.lock().frame?;
            let inner = self.frames.frames[idx].inner.lock();
            let still_owner = inner
                .page
                .as_ref()
                .map_or(false, |owner| Arc::ptr_eq(owner, page));
            if still_owner {
                return Some(FrameGuard { idx, inner });
            }
            // Lost a race with the evictor; look the frame up again.
        }
    }

    /// Allocates a frame for `page` and returns it locked: one pass over
    /// the table looking for a free frame, then a clock sweep of up to
    /// twice the pool evicting the first frame whose page has not been
    /// referenced since the hand last passed.
    pub(crate) fn frame_alloc_and_lock(&self, page: &Arc<Page>) -> Result<FrameGuard<'_>, ()> {
        let frames = &self.frames.frames;
        let mut hand = self.frames.scan.lock();

        for (idx, frame) in frames.iter().enumerate() {
            if let Some(mut inner) = frame.inner.try_lock() {
                if inner.page.is_none() {
                    inner.page = Some(Arc::clone(page));
                    return Ok(FrameGuard { idx, inner });
                }
            }
        }

        let n = frames.len();
        for step in 0..2 * n {
            let idx = (*hand + step) % n;
            let mut inner = match frames[idx].inner.try_lock() {
                Some(inner) => inner,
                None => continue,
            };
            let victim = match inner.page.clone() {
                Some(victim) => victim,
                None => {
                    inner.page = Some(Arc::clone(page));
                    *hand = (idx + 1) % n;
                    return Ok(FrameGuard { idx, inner });
                }
            };
            // Second chance.
            if victim.accessed.swap(false, Ordering::AcqRel) {
                continue;
            }
            if self.page_out(&victim, &mut inner).is_err() {
                // Swap full; the frame keeps its page and the clock moves
                // on.
                continue;
            }
            inner.page = Some(Arc::clone(page));
            *hand = (idx + 1) % n;
            return Ok(FrameGuard { idx, inner });
        }

        log::warn!("frame allocation failed: no evictable frame");
        Err(())
    }

    /// Writes `victim` out of its pinned frame according to its source
    /// tag. On success the page's frame pointer is cleared and its source
    /// updated; on failure the frame is left intact.
    fn page_out(&self, victim: &Arc<Page>, inner: &mut FrameInner) -> Result<(), ()> {
        let dirty = victim.dirty.load(Ordering::Acquire);
        let source = victim.inner.lock().source.clone();

        let new_source = match source {
            PageSource::File {
                inode,
                offset,
                bytes,
            } => {
                if !dirty {
                    // Clean file-backed contents can be re-read; discard.
                    None
                } else if victim.private() {
                    // First dirty write-out promotes the page to
                    // swap-backed.
                    Some(PageSource::Swap(self.swap.swap_out(&inner.data)?))
                } else {
                    inode.write_at(&self.fs, &inner.data[..bytes], offset);
                    None
                }
            }
            // Anonymous contents have no backing store; they go to swap
            // whether dirty or not.
            PageSource::Zero => Some(PageSource::Swap(self.swap.swap_out(&inner.data)?)),
            PageSource::Swap(_) => panic!("resident page with a swap source"),
        };

        let mut page_inner = victim.inner.lock();
        if let Some(source) = new_source {
            page_inner.source = source;
        }
        page_inner.frame = None;
        drop(page_inner);
        victim.dirty.store(false, Ordering::Release);
        inner.page = None;
        Ok(())
    }

    /// Fills `guard`'s frame for `page` and installs the mapping. The
    /// caller keeps the frame pinned until it is done with the contents.
    pub(crate) fn page_in(&self, page: &Arc<Page>, guard: &mut FrameGuard<'_>) {
        let source = page.inner.lock().source.clone();
        match source {
            PageSource::Swap(slot) => {
                self.swap.swap_in(slot, &mut guard.inner.data);
                // The slot is gone; the page is anonymous from here on.
                page.inner.lock().source = PageSource::Zero;
            }
            PageSource::File {
                inode,
                offset,
                bytes,
            } => {
                let n = inode.read_at(&self.fs, &mut guard.inner.data[..bytes], offset);
                guard.inner.data[n..].fill(0);
            }
            PageSource::Zero => guard.inner.data.fill(0),
        }
        page.dirty.store(false, Ordering::Release);
        page.accessed.store(false, Ordering::Release);
        page.inner.lock().frame = Some(guard.idx);
    }

    /// Resolves a fault at `addr`. Returns false if the address maps to
    /// nothing (the caller kills the process) or a frame cannot be had.
    pub fn page_fault(&self, proc: &Process, addr: usize) -> bool {
        let page = match self.page_for_addr(proc, addr) {
            Some(page) => page,
            None => return false,
        };
        if self.frame_lock(&page).is_some() {
            return true;
        }
        match self.frame_alloc_and_lock(&page) {
            Ok(mut guard) => {
                self.page_in(&page, &mut guard);
                true
            }
            Err(()) => false,
        }
    }

    /// Pins the page containing `addr` for a kernel access, faulting it
    /// in if needed. Fails if no page maps `addr` or `will_write` was
    /// requested on a read-only page. Dropping the guard unpins.
    pub(crate) fn page_lock(
        &self,
        proc: &Process,
        addr: usize,
        will_write: bool,
    ) -> Option<(Arc<Page>, FrameGuard<'_>)> {
        let page = self.page_for_addr(proc, addr)?;
        if page.read_only() && will_write {
            return None;
        }
        if let Some(guard) = self.frame_lock(&page) {
            return Some((page, guard));
        }
        let mut guard = self.frame_alloc_and_lock(&page).ok()?;
        self.page_in(&page, &mut guard);
        Some((page, guard))
    }

    /// Copies `dst.len()` bytes from user address `usrc`. Any byte outside
    /// user space or on an unmapped page fails the copy; everything before
    /// the bad byte has already been transferred.
    pub fn copy_in_user(&self, proc: &Process, dst: &mut [u8], usrc: usize) -> Result<(), ()> {
        let mut copied = 0;
        while copied < dst.len() {
            let addr = usrc.checked_add(copied).ok_or(())?;
            if !is_user_vaddr(addr) {
                return Err(());
            }
            let (page, guard) = self.page_lock(proc, addr, false).ok_or(())?;
            let ofs = pg_ofs(addr);
            let chunk = cmp::min(dst.len() - copied, PGSIZE - ofs);
            dst[copied..copied + chunk].copy_from_slice(&guard.inner.data[ofs..ofs + chunk]);
            page.accessed.store(true, Ordering::Release);
            copied += chunk;
        }
        Ok(())
    }

    /// Copies `src` to user address `udst`, with the same prefix behavior
    /// as `copy_in_user`. Fails on read-only destination pages.
    pub fn copy_out_user(&self, proc: &Process, udst: usize, src: &[u8]) -> Result<(), ()> {
        let mut copied = 0;
        while copied < src.len() {
            let addr = udst.checked_add(copied).ok_or(())?;
            if !is_user_vaddr(addr) {
                return Err(());
            }
            let (page, mut guard) = self.page_lock(proc, addr, true).ok_or(())?;
            let ofs = pg_ofs(addr);
            let chunk = cmp::min(src.len() - copied, PGSIZE - ofs);
            guard.inner.data[ofs..ofs + chunk].copy_from_slice(&src[copied..copied + chunk]);
            page.accessed.store(true, Ordering::Release);
            page.dirty.store(true, Ordering::Release);
            copied += chunk;
        }
        Ok(())
    }

    /// Copies a NUL-terminated string from user space into a one-page
    /// kernel buffer. Stops at the NUL or after a full page, whichever
    /// comes first; truncation is silent but the buffer stays
    /// NUL-terminated. Any fault fails the copy.
    pub fn copy_in_string(&self, proc: &Process, usrc: usize) -> Result<Box<[u8]>, ()> {
        let mut ks = vec![0u8; PGSIZE].into_boxed_slice();
        let mut i = 0;
        'copy: while i < PGSIZE {
            let addr = usrc.checked_add(i).ok_or(())?;
            if !is_user_vaddr(addr) {
                return Err(());
            }
            let (page, guard) = self.page_lock(proc, addr, false).ok_or(())?;
            page.accessed.store(true, Ordering::Release);
            let ofs = pg_ofs(addr);
            let chunk = cmp::min(PGSIZE - i, PGSIZE - ofs);
            for k in 0..chunk {
                let byte = guard.inner.data[ofs + k];
                ks[i] = byte;
                if byte == 0 {
                    break 'copy;
                }
                i += 1;
            }
        }
        if i == PGSIZE {
            ks[PGSIZE - 1] = 0;
        }
        Ok(ks)
    }

    /// Tears down every page of a process: resident frames are released
    /// (their contents discarded) and swapped-out contents freed.
    pub(crate) fn free_user_memory(&self, proc: &Process) {
        for page in proc.pages.take_all() {
            if let Some(mut guard) = self.frame_lock(&page) {
                guard.inner.page = None;
            }
            let mut inner = page.inner.lock();
            inner.frame = None;
            if let PageSource::Swap(slot) = &inner.source {
                self.swap.free_slot(*slot);
            }
        }
    }
}
