//! The frame table: every physical frame of the user pool, each one page
//! of kernel-mapped memory plus its owning-page back pointer.
//!
//! Holding a frame's lock pins the frame: the evictor cannot take it and
//! the owning page's `frame` field cannot change underneath the holder.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use super::page::Page;
use crate::lock::{SleepLock, SleepLockGuard, SpinLock};
use crate::param::PGSIZE;

pub type PageBuf = [u8; PGSIZE];

pub struct FrameInner {
    /// Owning page, or None while the frame is free.
    pub page: Option<Arc<Page>>,
    pub data: Box<PageBuf>,
}

pub struct Frame {
    /// Held across the I/O of eviction and page-in, so a sleeping lock.
    pub(crate) inner: SleepLock<FrameInner>,
}

/// A pinned frame.
pub struct FrameGuard<'a> {
    pub idx: usize,
    pub inner: SleepLockGuard<'a, FrameInner>,
}

pub struct FrameTable {
    pub(crate) frames: Vec<Frame>,
    /// Clock hand. Taking it also serializes the eviction scan.
    pub(crate) scan: SpinLock<usize>,
}

impl FrameTable {
    pub(crate) fn new(count: usize) -> Self {
        let mut frames = Vec::with_capacity(count);
        for _ in 0..count {
            frames.push(Frame {
                inner: SleepLock::new(
                    "frame",
                    FrameInner {
                        page: None,
                        data: Box::new([0; PGSIZE]),
                    },
                ),
            });
        }
        Self {
            frames,
            scan: SpinLock::new("scan", 0),
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}
