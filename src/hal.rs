//! Seams to the machine.
//!
//! Everything the kernel needs from below — sector I/O, free-sector
//! accounting, the console, kernel threads, and the drop to user mode —
//! comes in through these traits, bundled into a [`Machine`] at kernel
//! construction. The kernel itself stays free of architecture code.

use alloc::boxed::Box;
use alloc::sync::Arc;

use crate::kernel::KernelCtx;
use crate::param::SECTOR_SIZE;
use crate::syscall::TrapFrame;

/// Fixed-size sector I/O.
pub trait BlockDevice: Send + Sync {
    /// Device capacity in sectors.
    fn size(&self) -> u32;

    /// Reads sector `sector` into `buf`.
    fn read(&self, sector: u32, buf: &mut [u8; SECTOR_SIZE]);

    /// Writes `buf` to sector `sector`.
    fn write(&self, sector: u32, buf: &[u8; SECTOR_SIZE]);
}

/// Allocates and releases sectors of the file-system device.
///
/// Implementations must never hand out sector 0 (the boot block), the
/// free-map inode sector, or the root-directory inode sector.
pub trait FreeMap: Send + Sync {
    /// Picks a free sector, marks it used, and returns it.
    fn allocate(&self) -> Option<u32>;

    /// Returns `sector` to the free pool.
    fn release(&self, sector: u32);
}

/// Console input and output.
pub trait Console: Send + Sync {
    /// Blocks until a byte of input is available and returns it.
    fn getc(&self) -> u8;

    /// Writes `buf` to the console.
    fn putbuf(&self, buf: &[u8]);
}

/// Kernel-thread creation and machine shutdown.
pub trait Scheduler: Send + Sync {
    /// Runs `body` on a new kernel thread named `name`.
    fn spawn(&self, name: &str, body: Box<dyn FnOnce() + Send>);

    /// Powers the machine off. Pending output should already be flushed.
    fn power_off(&self);
}

/// The return path from kernel to user mode.
///
/// After a successful load, the kernel hands the freshly built trap frame
/// (program counter, stack pointer) to this trait; the implementation runs
/// the user program, re-entering the kernel through
/// [`crate::syscall::syscall`] for each trap, until the process exits.
pub trait UserMode: Send + Sync {
    fn enter(&self, ctx: KernelCtx, frame: TrapFrame);
}

/// The trait objects a kernel is assembled from.
pub struct Machine {
    pub fs_disk: Arc<dyn BlockDevice>,
    pub swap_disk: Option<Arc<dyn BlockDevice>>,
    pub free_map: Arc<dyn FreeMap>,
    pub console: Arc<dyn Console>,
    pub scheduler: Arc<dyn Scheduler>,
    pub user_mode: Arc<dyn UserMode>,
}
