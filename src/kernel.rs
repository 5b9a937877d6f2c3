//! The kernel object: the file system, the frame and swap tables, and
//! the machine seams, assembled once and shared as `Arc<Kernel>`.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicI32, Ordering};

use crate::fs::FileSys;
use crate::hal::{Console, Machine, Scheduler, UserMode};
use crate::proc::{Pid, Process};
use crate::syscall::{Control, TrapFrame};
use crate::vm::{FrameTable, Swap};

pub struct Kernel {
    pub fs: FileSys,
    pub frames: FrameTable,
    pub swap: Swap,
    pub(crate) console: Arc<dyn Console>,
    pub(crate) scheduler: Arc<dyn Scheduler>,
    pub(crate) user_mode: Arc<dyn UserMode>,
    nextpid: AtomicI32,
}

impl Kernel {
    /// Assembles a kernel over `machine`, with `user_frames` frames in
    /// the user pool. With `format`, a fresh file system is written
    /// first.
    pub fn new(machine: Machine, format: bool, user_frames: usize) -> Result<Arc<Kernel>, ()> {
        let Machine {
            fs_disk,
            swap_disk,
            free_map,
            console,
            scheduler,
            user_mode,
        } = machine;
        let fs = FileSys::new(fs_disk, free_map, format)?;
        Ok(Arc::new(Kernel {
            fs,
            frames: FrameTable::new(user_frames),
            swap: Swap::new(swap_disk),
            console,
            scheduler,
            user_mode,
            nextpid: AtomicI32::new(1),
        }))
    }

    pub(crate) fn allocpid(&self) -> Pid {
        self.nextpid.fetch_add(1, Ordering::Relaxed)
    }

    /// Runs `cmdline` from the boot thread and waits for the process to
    /// exit, returning its exit code. Fails if the executable cannot be
    /// loaded.
    pub fn run_program(self: &Arc<Self>, cmdline: &[u8]) -> Result<i32, ()> {
        let (_pid, slot) = self.execute_with_slot(None, cmdline)?;
        Ok(slot.join())
    }
}

/// The pair every kernel path travels with: the kernel and the current
/// process.
#[derive(Clone)]
pub struct KernelCtx {
    pub kernel: Arc<Kernel>,
    pub proc: Arc<Process>,
}

impl KernelCtx {
    pub fn new(kernel: Arc<Kernel>, proc: Arc<Process>) -> Self {
        Self { kernel, proc }
    }

    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    pub fn proc(&self) -> &Arc<Process> {
        &self.proc
    }

    /// One trap round-trip for the current process.
    pub fn syscall(&self, frame: &mut TrapFrame) -> Control {
        self.kernel.syscall(self, frame)
    }
}
