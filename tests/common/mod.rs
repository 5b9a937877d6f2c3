//! Shared harness for the integration suites: in-memory devices, a
//! thread-backed scheduler, and a user-mode shim that runs registered
//! Rust closures as "user programs", entering the kernel through the
//! syscall gateway exactly the way user code would.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::convert::TryInto;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use pintos_kernel::hal::{BlockDevice, Console, FreeMap, Machine, Scheduler, UserMode};
use pintos_kernel::kernel::{Kernel, KernelCtx};
use pintos_kernel::param::{PGSIZE, SECTOR_SIZE};
use pintos_kernel::syscall::{
    Control, TrapFrame, SYS_CHDIR, SYS_CLOSE, SYS_CREATE, SYS_EXEC, SYS_EXIT, SYS_FILESIZE,
    SYS_INUMBER, SYS_ISDIR, SYS_MKDIR, SYS_OPEN, SYS_READ, SYS_READDIR, SYS_REMOVE, SYS_SEEK,
    SYS_TELL, SYS_WAIT, SYS_WRITE,
};

// ---------------------------------------------------------------------
// Devices

pub struct MemDisk {
    sectors: Mutex<Vec<[u8; SECTOR_SIZE]>>,
}

impl MemDisk {
    pub fn new(count: usize) -> Arc<MemDisk> {
        Arc::new(MemDisk {
            sectors: Mutex::new(vec![[0u8; SECTOR_SIZE]; count]),
        })
    }

    /// Raw snapshot for bit-identity checks.
    pub fn snapshot(&self) -> Vec<[u8; SECTOR_SIZE]> {
        self.sectors.lock().unwrap().clone()
    }
}

impl BlockDevice for MemDisk {
    fn size(&self) -> u32 {
        self.sectors.lock().unwrap().len() as u32
    }

    fn read(&self, sector: u32, buf: &mut [u8; SECTOR_SIZE]) {
        *buf = self.sectors.lock().unwrap()[sector as usize];
    }

    fn write(&self, sector: u32, buf: &[u8; SECTOR_SIZE]) {
        self.sectors.lock().unwrap()[sector as usize] = *buf;
    }
}

/// First-fit free map over the filesystem device, with the boot,
/// free-map, and root sectors permanently reserved.
pub struct BitmapFreeMap {
    used: Mutex<Vec<bool>>,
}

const RESERVED_SECTORS: usize = 3;

impl BitmapFreeMap {
    pub fn new(sectors: usize) -> Arc<BitmapFreeMap> {
        let mut used = vec![false; sectors];
        for slot in used.iter_mut().take(RESERVED_SECTORS) {
            *slot = true;
        }
        Arc::new(BitmapFreeMap {
            used: Mutex::new(used),
        })
    }

    pub fn used_count(&self) -> usize {
        self.used.lock().unwrap().iter().filter(|u| **u).count()
    }
}

impl FreeMap for BitmapFreeMap {
    fn allocate(&self) -> Option<u32> {
        let mut used = self.used.lock().unwrap();
        let free = used.iter().position(|u| !*u)?;
        used[free] = true;
        Some(free as u32)
    }

    fn release(&self, sector: u32) {
        let mut used = self.used.lock().unwrap();
        assert!(used[sector as usize], "double release of sector {}", sector);
        used[sector as usize] = false;
    }
}

pub struct TestConsole {
    input: Mutex<VecDeque<u8>>,
    output: Mutex<Vec<u8>>,
}

impl TestConsole {
    pub fn new() -> Arc<TestConsole> {
        Arc::new(TestConsole {
            input: Mutex::new(VecDeque::new()),
            output: Mutex::new(Vec::new()),
        })
    }

    pub fn feed(&self, bytes: &[u8]) {
        self.input.lock().unwrap().extend(bytes.iter().copied());
    }

    pub fn output(&self) -> String {
        String::from_utf8_lossy(&self.output.lock().unwrap()).into_owned()
    }
}

impl Console for TestConsole {
    fn getc(&self) -> u8 {
        self.input.lock().unwrap().pop_front().unwrap_or(0)
    }

    fn putbuf(&self, buf: &[u8]) {
        self.output.lock().unwrap().extend_from_slice(buf);
    }
}

pub struct StdScheduler {
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
    powered_off: AtomicBool,
}

impl StdScheduler {
    pub fn new() -> Arc<StdScheduler> {
        Arc::new(StdScheduler {
            handles: Mutex::new(Vec::new()),
            powered_off: AtomicBool::new(false),
        })
    }

    pub fn powered_off(&self) -> bool {
        self.powered_off.load(Ordering::Acquire)
    }

    /// Joins every kernel thread spawned so far.
    pub fn join_all(&self) {
        loop {
            let handle = self.handles.lock().unwrap().pop();
            match handle {
                Some(handle) => handle.join().unwrap(),
                None => break,
            }
        }
    }
}

impl Scheduler for StdScheduler {
    fn spawn(&self, name: &str, body: Box<dyn FnOnce() + Send>) {
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(body)
            .unwrap();
        self.handles.lock().unwrap().push(handle);
    }

    fn power_off(&self) {
        self.powered_off.store(true, Ordering::Release);
    }
}

// ---------------------------------------------------------------------
// User programs

/// A simulated user program: a closure driven instead of machine code.
pub type UserProgram = Arc<dyn Fn(&mut UserCtx) + Send + Sync>;

pub struct Programs {
    map: Mutex<HashMap<String, UserProgram>>,
}

impl Programs {
    pub fn new() -> Arc<Programs> {
        Arc::new(Programs {
            map: Mutex::new(HashMap::new()),
        })
    }

    pub fn register<F>(&self, name: &str, program: F)
    where
        F: Fn(&mut UserCtx) + Send + Sync + 'static,
    {
        self.map
            .lock()
            .unwrap()
            .insert(name.to_string(), Arc::new(program));
    }
}

impl UserMode for Programs {
    fn enter(&self, ctx: KernelCtx, frame: TrapFrame) {
        let program = self.map.lock().unwrap().get(ctx.proc().name()).cloned();
        if let Some(program) = program {
            let mut user = UserCtx { ctx, frame };
            program(&mut user);
        }
        // Falling off the end leaves the kernel to exit(-1) for us,
        // unless the program already exited.
    }
}

/// The "CPU state" of a running user program: its kernel context and
/// trap frame, plus helpers that behave like user instructions.
pub struct UserCtx {
    pub ctx: KernelCtx,
    pub frame: TrapFrame,
}

impl UserCtx {
    pub fn kernel(&self) -> &Arc<Kernel> {
        self.ctx.kernel()
    }

    /// A user load: goes through the pager like a real memory access.
    /// Panics if the access would have faulted fatally.
    pub fn peek(&self, addr: usize, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.ctx
            .kernel()
            .copy_in_user(self.ctx.proc(), &mut buf, addr)
            .expect("user load faulted");
        buf
    }

    pub fn peek_word(&self, addr: usize) -> u32 {
        let bytes = self.peek(addr, 4);
        u32::from_le_bytes(bytes.try_into().unwrap())
    }

    /// A user store. Returns whether the access succeeded, like the
    /// hardware either performing or faulting it.
    pub fn try_poke(&self, addr: usize, bytes: &[u8]) -> bool {
        self.ctx
            .kernel()
            .copy_out_user(self.ctx.proc(), addr, bytes)
            .is_ok()
    }

    pub fn poke(&self, addr: usize, bytes: &[u8]) {
        assert!(self.try_poke(addr, bytes), "user store faulted");
    }

    /// Moves the stack pointer down and returns the new top-of-stack
    /// address, `align`ed. The kernel sees the new esp on the next trap;
    /// stack growth on intermediate stores uses it too.
    pub fn stack_alloc(&mut self, len: usize, align: usize) -> usize {
        let esp = (self.frame.esp as usize - len) & !(align - 1);
        self.frame.esp = esp as u32;
        self.ctx
            .proc()
            .user_esp
            .store(esp, std::sync::atomic::Ordering::Release);
        esp
    }

    /// Pushes a NUL-terminated string and returns its address.
    pub fn push_str(&mut self, s: &str) -> usize {
        let addr = self.stack_alloc(s.len() + 1, 1);
        self.poke(addr, s.as_bytes());
        self.poke(addr + s.len(), &[0]);
        addr
    }

    /// Issues a syscall exactly the way user code does: the number and
    /// arguments as 32-bit words on the stack, the result in `eax`.
    /// Returns `Err` when the process did not come back (exit or kill).
    pub fn syscall(&mut self, num: u32, args: &[u32]) -> Result<u32, Control> {
        let saved = self.frame.esp;
        let esp = self.stack_alloc(4 * (1 + args.len()), 4);
        self.poke(esp, &num.to_le_bytes());
        for (i, arg) in args.iter().enumerate() {
            self.poke(esp + 4 * (i + 1), &arg.to_le_bytes());
        }
        let control = self.ctx.syscall(&mut self.frame);
        self.frame.esp = saved;
        self.ctx
            .proc()
            .user_esp
            .store(saved as usize, std::sync::atomic::Ordering::Release);
        match control {
            Control::Return => Ok(self.frame.eax),
            other => Err(other),
        }
    }

    // Typed wrappers.

    pub fn exit(&mut self, status: i32) -> Control {
        self.syscall(SYS_EXIT, &[status as u32]).unwrap_err()
    }

    pub fn exec(&mut self, cmdline: &str) -> i32 {
        let addr = self.push_str(cmdline);
        self.syscall(SYS_EXEC, &[addr as u32]).unwrap() as i32
    }

    pub fn wait(&mut self, pid: i32) -> i32 {
        self.syscall(SYS_WAIT, &[pid as u32]).unwrap() as i32
    }

    pub fn create(&mut self, path: &str, size: u32) -> bool {
        let addr = self.push_str(path);
        self.syscall(SYS_CREATE, &[addr as u32, size]).unwrap() != 0
    }

    pub fn remove(&mut self, path: &str) -> bool {
        let addr = self.push_str(path);
        self.syscall(SYS_REMOVE, &[addr as u32]).unwrap() != 0
    }

    pub fn open(&mut self, path: &str) -> i32 {
        let addr = self.push_str(path);
        self.syscall(SYS_OPEN, &[addr as u32]).unwrap() as i32
    }

    pub fn filesize(&mut self, fd: i32) -> i32 {
        self.syscall(SYS_FILESIZE, &[fd as u32]).unwrap() as i32
    }

    pub fn read(&mut self, fd: i32, buf: usize, n: u32) -> i32 {
        self.syscall(SYS_READ, &[fd as u32, buf as u32, n]).unwrap() as i32
    }

    pub fn write(&mut self, fd: i32, buf: usize, n: u32) -> i32 {
        self.syscall(SYS_WRITE, &[fd as u32, buf as u32, n])
            .unwrap() as i32
    }

    pub fn seek(&mut self, fd: i32, pos: u32) {
        self.syscall(SYS_SEEK, &[fd as u32, pos]).unwrap();
    }

    pub fn tell(&mut self, fd: i32) -> u32 {
        self.syscall(SYS_TELL, &[fd as u32]).unwrap()
    }

    pub fn close(&mut self, fd: i32) {
        self.syscall(SYS_CLOSE, &[fd as u32]).unwrap();
    }

    pub fn chdir(&mut self, path: &str) -> bool {
        let addr = self.push_str(path);
        self.syscall(SYS_CHDIR, &[addr as u32]).unwrap() != 0
    }

    pub fn mkdir(&mut self, path: &str) -> bool {
        let addr = self.push_str(path);
        self.syscall(SYS_MKDIR, &[addr as u32]).unwrap() != 0
    }

    pub fn readdir(&mut self, fd: i32, namebuf: usize) -> bool {
        self.syscall(SYS_READDIR, &[fd as u32, namebuf as u32])
            .unwrap()
            != 0
    }

    pub fn isdir(&mut self, fd: i32) -> bool {
        self.syscall(SYS_ISDIR, &[fd as u32]).unwrap() != 0
    }

    pub fn inumber(&mut self, fd: i32) -> u32 {
        self.syscall(SYS_INUMBER, &[fd as u32]).unwrap()
    }
}

// ---------------------------------------------------------------------
// Executable images

pub const CODE_BASE: u32 = 0x0804_8000;

pub struct Segment {
    pub vaddr: u32,
    pub data: Vec<u8>,
    pub memsz: u32,
    pub writable: bool,
}

/// Builds an executable image: 52-byte header, program headers, then each
/// segment's data placed so that its file offset and virtual address
/// share a page offset.
pub fn build_elf(entry: u32, segments: &[Segment]) -> Vec<u8> {
    let phoff = 52u32;
    let mut image = vec![0u8; 52 + 32 * segments.len()];

    // Header.
    image[..7].copy_from_slice(b"\x7fELF\x01\x01\x01");
    put16(&mut image, 16, 2); // type
    put16(&mut image, 18, 3); // machine
    put32(&mut image, 20, 1); // version
    put32(&mut image, 24, entry);
    put32(&mut image, 28, phoff);
    put16(&mut image, 42, 32); // phentsize
    put16(&mut image, 44, segments.len() as u16); // phnum

    for (i, seg) in segments.iter().enumerate() {
        // Pad so the data shares the vaddr's page offset.
        let cur = image.len();
        let want = seg.vaddr as usize % PGSIZE;
        let off = if cur % PGSIZE <= want {
            cur - cur % PGSIZE + want
        } else {
            cur - cur % PGSIZE + PGSIZE + want
        };
        image.resize(off, 0);
        image.extend_from_slice(&seg.data);

        let ph = phoff as usize + 32 * i;
        put32(&mut image, ph, 1); // PT_LOAD
        put32(&mut image, ph + 4, off as u32);
        put32(&mut image, ph + 8, seg.vaddr);
        put32(&mut image, ph + 12, seg.vaddr);
        put32(&mut image, ph + 16, seg.data.len() as u32);
        put32(&mut image, ph + 20, seg.memsz.max(seg.data.len() as u32));
        put32(&mut image, ph + 24, if seg.writable { 6 } else { 5 });
        put32(&mut image, ph + 28, PGSIZE as u32);
    }
    image
}

fn put16(image: &mut [u8], at: usize, v: u16) {
    image[at..at + 2].copy_from_slice(&v.to_le_bytes());
}

fn put32(image: &mut [u8], at: usize, v: u32) {
    image[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

/// A minimal valid executable: one read-only code page at `CODE_BASE`.
pub fn simple_exe() -> Vec<u8> {
    build_elf(
        CODE_BASE,
        &[Segment {
            vaddr: CODE_BASE,
            data: vec![0x90; 64],
            memsz: 64,
            writable: false,
        }],
    )
}

// ---------------------------------------------------------------------
// Boot

pub struct TestMachine {
    pub kernel: Arc<Kernel>,
    pub disk: Arc<MemDisk>,
    pub free_map: Arc<BitmapFreeMap>,
    pub console: Arc<TestConsole>,
    pub sched: Arc<StdScheduler>,
    pub programs: Arc<Programs>,
}

/// Brings up a kernel over fresh in-memory devices.
pub fn boot(fs_sectors: usize, swap_sectors: usize, user_frames: usize) -> TestMachine {
    let disk = MemDisk::new(fs_sectors);
    let swap_disk = if swap_sectors > 0 {
        Some(MemDisk::new(swap_sectors))
    } else {
        None
    };
    let free_map = BitmapFreeMap::new(fs_sectors);
    let console = TestConsole::new();
    let sched = StdScheduler::new();
    let programs = Programs::new();

    let machine = Machine {
        fs_disk: Arc::clone(&disk) as Arc<dyn BlockDevice>,
        swap_disk: swap_disk.map(|d| d as Arc<dyn BlockDevice>),
        free_map: Arc::clone(&free_map) as Arc<dyn FreeMap>,
        console: Arc::clone(&console) as Arc<dyn Console>,
        scheduler: Arc::clone(&sched) as Arc<dyn Scheduler>,
        user_mode: Arc::clone(&programs) as Arc<dyn UserMode>,
    };
    let kernel = Kernel::new(machine, true, user_frames).expect("kernel boot");

    TestMachine {
        kernel,
        disk,
        free_map,
        console,
        sched,
        programs,
    }
}

impl TestMachine {
    /// Writes an executable image into the file system under `path`.
    pub fn install_program(&self, path: &str, image: &[u8]) {
        use pintos_kernel::fs::{InodeType, Path};
        assert!(self.kernel.fs.create(
            None,
            Path::new(path.as_bytes()),
            0,
            InodeType::File
        ));
        let inode = self
            .kernel
            .fs
            .open(None, Path::new(path.as_bytes()))
            .expect("open fresh executable");
        assert_eq!(inode.write_at(&self.kernel.fs, image, 0), image.len());
        self.kernel.fs.inode_close(inode);
    }

    /// Registers a user program body and installs a matching executable.
    pub fn add_program<F>(&self, name: &str, body: F)
    where
        F: Fn(&mut UserCtx) + Send + Sync + 'static,
    {
        self.install_program(name, &simple_exe());
        self.programs.register(name, body);
    }

    /// Runs `cmdline` to completion and returns the exit code, or Err if
    /// the program could not load.
    pub fn run(&self, cmdline: &str) -> Result<i32, ()> {
        let code = self.kernel.run_program(cmdline.as_bytes());
        self.sched.join_all();
        code
    }

    pub fn output(&self) -> String {
        self.console.output()
    }
}
