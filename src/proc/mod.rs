//! Processes: identity, per-process tables, and the parent/child
//! exit/wait protocol.
//!
//! Each process owns a page table, a descriptor table, a current
//! directory, and its executable (held open and write-denied). A child
//! writes its exit code into the `ChildSlot` shared with its parent and
//! signals the slot's semaphore exactly once; the parent may consume the
//! slot at most once.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::str;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::file::{FdTable, File};
use crate::fs::Dir;
use crate::kernel::{Kernel, KernelCtx};
use crate::lock::{Semaphore, SpinLock};
use crate::param::{MAXPROCNAME, PHYS_BASE};
use crate::vm::PageTable;

mod exec;

pub type Pid = i32;

/// One child's exit bookkeeping, shared between parent and child.
///
/// The semaphore is downed by the parent once for the load handshake and
/// once more to collect the exit code.
pub struct ChildSlot {
    /// Written exactly once, by the exiting child.
    exit_code: SpinLock<Option<i32>>,
    /// Has the parent already waited?
    waited: AtomicBool,
    /// Set before the load handshake when the executable failed to load.
    load_failed: AtomicBool,
    sema: Semaphore,
}

impl ChildSlot {
    fn new() -> Self {
        Self {
            exit_code: SpinLock::new("exit_code", None),
            waited: AtomicBool::new(false),
            load_failed: AtomicBool::new(false),
            sema: Semaphore::new("child_slot", 0),
        }
    }

    fn record_exit(&self, code: i32) {
        let mut exit_code = self.exit_code.lock();
        debug_assert!(exit_code.is_none(), "child exited twice");
        *exit_code = Some(code);
        drop(exit_code);
        self.sema.up();
    }

    /// Blocks until the child has exited and returns its code.
    pub(crate) fn join(&self) -> i32 {
        self.sema.down();
        self.exit_code.lock().unwrap_or(-1)
    }
}

/// Per-process state.
pub struct Process {
    pub pid: Pid,
    /// First command-line token, NUL-padded.
    name: [u8; MAXPROCNAME],
    /// User virtual memory.
    pub pages: PageTable,
    /// Stack pointer saved on trap entry, consulted by the stack-growth
    /// heuristic.
    pub user_esp: AtomicUsize,
    /// Set once, at exit.
    pub exit_code: SpinLock<Option<i32>>,
    /// The executable, held open and write-denied while the process runs.
    pub executable: SpinLock<Option<Arc<File>>>,
    /// Current directory; None means the root.
    pub cwd: SpinLock<Option<Dir>>,
    pub fds: SpinLock<FdTable>,
    /// Exit slots of children, keyed by child pid. Inserted at exec,
    /// removed at wait and abandoned at parent exit.
    pub children: SpinLock<BTreeMap<Pid, Arc<ChildSlot>>>,
    /// This process's own slot in its parent.
    slot: Arc<ChildSlot>,
}

impl Process {
    fn new(pid: Pid, cmdline: &[u8], slot: Arc<ChildSlot>) -> Self {
        let mut name = [0u8; MAXPROCNAME];
        if let Some(token) = first_token(cmdline) {
            let len = token.len().min(MAXPROCNAME - 1);
            name[..len].copy_from_slice(&token[..len]);
        }
        Self {
            pid,
            name,
            pages: PageTable::new(),
            user_esp: AtomicUsize::new(PHYS_BASE),
            exit_code: SpinLock::new("exit_code", None),
            executable: SpinLock::new("executable", None),
            cwd: SpinLock::new("cwd", None),
            fds: SpinLock::new("fds", FdTable::new()),
            children: SpinLock::new("children", BTreeMap::new()),
            slot,
        }
    }

    /// The process name, for diagnostics and the exit line.
    pub fn name(&self) -> &str {
        let len = self
            .name
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(self.name.len());
        str::from_utf8(&self.name[..len]).unwrap_or("?")
    }
}

/// The first whitespace-delimited token of `cmdline`.
pub(crate) fn first_token(cmdline: &[u8]) -> Option<&[u8]> {
    cmdline.split(|b| *b == b' ').find(|tok| !tok.is_empty())
}

impl Kernel {
    /// Starts a child process running the executable named by the first
    /// token of `cmdline`. Blocks until the child has attempted the load;
    /// returns its pid on a successful load.
    pub fn process_execute(
        self: &Arc<Self>,
        parent: Option<&Process>,
        cmdline: &[u8],
    ) -> Result<Pid, ()> {
        self.execute_with_slot(parent, cmdline).map(|(pid, _)| pid)
    }

    pub(crate) fn execute_with_slot(
        self: &Arc<Self>,
        parent: Option<&Process>,
        cmdline: &[u8],
    ) -> Result<(Pid, Arc<ChildSlot>), ()> {
        let token = first_token(cmdline).ok_or(())?;
        let thread_name = String::from_utf8_lossy(token).into_owned();

        let pid = self.allocpid();
        let slot = Arc::new(ChildSlot::new());
        if let Some(parent) = parent {
            parent.children.lock().insert(pid, Arc::clone(&slot));
        }

        let kernel = Arc::clone(self);
        let child_slot = Arc::clone(&slot);
        let cmd: Vec<u8> = cmdline.to_vec();
        self.scheduler.spawn(
            &thread_name,
            Box::new(move || start_process(kernel, pid, cmd, child_slot)),
        );

        // Wake up once the child has attempted to load.
        slot.sema.down();
        if slot.load_failed.load(Ordering::Acquire) {
            if let Some(parent) = parent {
                parent.children.lock().remove(&pid);
            }
            return Err(());
        }
        Ok((pid, slot))
    }

    /// Waits for child `child` to die and returns its exit status.
    /// Returns -1 if `child` is not an unwaited child of `parent`.
    pub fn process_wait(&self, parent: &Process, child: Pid) -> i32 {
        let slot = {
            let children = parent.children.lock();
            match children.get(&child) {
                Some(slot) => Arc::clone(slot),
                None => return -1,
            }
        };
        if slot.waited.swap(true, Ordering::AcqRel) {
            return -1;
        }
        slot.sema.down();
        let code = slot.exit_code.lock().unwrap_or(-1);
        // Retire the slot; a later wait for the same pid fails.
        parent.children.lock().remove(&child);
        code
    }

    /// Terminates `proc` with `status`: prints the exit line, closes every
    /// descriptor and the current directory, releases user memory, closes
    /// the executable, and hands the status to the parent.
    pub fn process_exit(&self, proc: &Process, status: i32) {
        {
            let mut exit_code = proc.exit_code.lock();
            if exit_code.is_some() {
                return;
            }
            *exit_code = Some(status);
        }

        for entry in proc.fds.lock().take_all() {
            entry.close(&self.fs);
        }
        if let Some(cwd) = proc.cwd.lock().take() {
            cwd.close(&self.fs);
        }

        let line = alloc::format!("{}: exit({})\n", proc.name(), status);
        self.console.putbuf(line.as_bytes());

        self.free_user_memory(proc);
        if let Some(executable) = proc.executable.lock().take() {
            executable.close(&self.fs);
        }

        // Abandon any un-waited children, then let the parent collect us.
        proc.children.lock().clear();
        proc.slot.record_exit(status);
    }
}

/// Thread body of a new process: load the executable, report the outcome
/// to the parent, and drop into user mode.
fn start_process(kernel: Arc<Kernel>, pid: Pid, cmdline: Vec<u8>, slot: Arc<ChildSlot>) {
    let proc = Arc::new(Process::new(pid, &cmdline, slot));

    match kernel.load(&proc, &cmdline) {
        Err(()) => {
            log::debug!("load failed for pid {}", pid);
            proc.slot.load_failed.store(true, Ordering::Release);
            proc.slot.sema.up();
            kernel.process_exit(&proc, -1);
        }
        Ok(frame) => {
            proc.slot.sema.up();
            let ctx = KernelCtx {
                kernel: Arc::clone(&kernel),
                proc: Arc::clone(&proc),
            };
            kernel.user_mode.enter(ctx, frame);
            // Falling off user code without exiting counts as a failure.
            kernel.process_exit(&proc, -1);
        }
    }
}
