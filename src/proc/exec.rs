//! Loading executables and building the initial user stack.

use alloc::sync::Arc;
use core::cmp;
use core::mem;

use arrayvec::ArrayVec;
use itertools::izip;
use zerocopy::{AsBytes, FromBytes};

use super::{first_token, Process};
use crate::addr::{is_user_vaddr, pg_ofs, pg_round_down, pg_round_up};
use crate::elf::{ElfHdr, ProgHdr, PT_DYNAMIC, PT_INTERP, PT_LOAD, PT_SHLIB};
use crate::file::File;
use crate::fs::Path;
use crate::kernel::Kernel;
use crate::param::{MAXARG, PGSIZE, PHYS_BASE};
use crate::syscall::TrapFrame;
use crate::vm::{Page, PageSource};

impl Kernel {
    /// Loads the executable named by the first token of `cmdline` into
    /// `proc`, leaving page descriptors behind for every segment page and
    /// the stack, and returns the initial trap frame.
    ///
    /// The executable stays open and write-denied in `proc` for the
    /// process's whole lifetime.
    pub(crate) fn load(&self, proc: &Arc<Process>, cmdline: &[u8]) -> Result<TrapFrame, ()> {
        let name = first_token(cmdline).ok_or(())?;

        let inode = self.fs.open(None, Path::new(name)).map_err(|()| {
            log::debug!("load: open failed");
        })?;
        let file = Arc::new(File::open(inode));
        file.deny_write();
        *proc.executable.lock() = Some(Arc::clone(&file));

        // Read and verify the executable header.
        let mut hdr = ElfHdr::new_zeroed();
        if file.read_at(&self.fs, hdr.as_bytes_mut(), 0) != mem::size_of::<ElfHdr>()
            || !hdr.is_valid()
        {
            log::debug!("load: bad executable header");
            return Err(());
        }

        // Program headers.
        for i in 0..hdr.phnum as usize {
            let off = hdr.phoff as usize + i * mem::size_of::<ProgHdr>();
            let mut ph = ProgHdr::new_zeroed();
            if file.read_at(&self.fs, ph.as_bytes_mut(), off) != mem::size_of::<ProgHdr>() {
                return Err(());
            }
            match ph.typ {
                PT_LOAD => self.load_segment(proc, &file, &ph)?,
                PT_DYNAMIC | PT_INTERP | PT_SHLIB => return Err(()),
                // Everything else is ignored.
                _ => {}
            }
        }

        let esp = self.setup_stack(proc, cmdline)?;
        Ok(TrapFrame {
            eip: hdr.entry,
            esp: esp as u32,
            eax: 0,
        })
    }

    /// Checks that `ph` describes a loadable segment of `file`.
    fn validate_segment(&self, ph: &ProgHdr, file: &File) -> bool {
        let vaddr = ph.vaddr as usize;
        let memsz = ph.memsz as usize;

        // The file offset and the virtual address must share a page
        // offset.
        if pg_ofs(ph.off as usize) != pg_ofs(vaddr) {
            return false;
        }
        if ph.off as usize > file.length(&self.fs) {
            return false;
        }
        if memsz < ph.filesz as usize || memsz == 0 {
            return false;
        }
        // The region must lie in user space and must not wrap around.
        if !is_user_vaddr(vaddr) || !is_user_vaddr(vaddr.wrapping_add(memsz)) {
            return false;
        }
        if vaddr.wrapping_add(memsz) < vaddr {
            return false;
        }
        // Mapping page 0 would let user code hand the kernel null
        // pointers.
        if vaddr < PGSIZE {
            return false;
        }
        true
    }

    /// Records page descriptors for one LOAD segment: a file-backed
    /// prefix and a zero-filled tail, writable iff the segment is.
    fn load_segment(&self, proc: &Arc<Process>, file: &Arc<File>, ph: &ProgHdr) -> Result<(), ()> {
        if !self.validate_segment(ph, file) {
            return Err(());
        }

        let writable = ph.is_writable();
        let page_offset = pg_ofs(ph.vaddr as usize);
        let mut upage = pg_round_down(ph.vaddr as usize);
        let mut file_ofs = pg_round_down(ph.off as usize);

        let (mut read_bytes, mut zero_bytes) = if ph.filesz > 0 {
            let read = page_offset + ph.filesz as usize;
            (read, pg_round_up(page_offset + ph.memsz as usize) - read)
        } else {
            (0, pg_round_up(page_offset + ph.memsz as usize))
        };

        while read_bytes > 0 || zero_bytes > 0 {
            let page_read = cmp::min(read_bytes, PGSIZE);
            let page_zero = PGSIZE - page_read;

            let source = if page_read > 0 {
                PageSource::File {
                    inode: Arc::clone(file.inode()),
                    offset: file_ofs,
                    bytes: page_read,
                }
            } else {
                PageSource::Zero
            };
            proc.pages.insert(Page::new(upage, !writable, source))?;

            read_bytes -= page_read;
            zero_bytes -= page_zero;
            upage += PGSIZE;
            file_ofs += PGSIZE;
        }
        Ok(())
    }

    /// Builds the initial user stack in the page below `PHYS_BASE`:
    /// argument strings pushed right to left, zero padding to a word
    /// boundary plus a null `argv[argc]`, the argument pointers right to
    /// left, `argv`, `argc`, and a zero fake return address.
    fn setup_stack(&self, proc: &Arc<Process>, cmdline: &[u8]) -> Result<usize, ()> {
        if cmdline.len() + 1 > PGSIZE {
            return Err(());
        }

        // Tokenize on runs of spaces; arguments beyond MAXARG are
        // dropped.
        let mut args: ArrayVec<&[u8], MAXARG> = ArrayVec::new();
        for token in cmdline.split(|b| *b == b' ').filter(|tok| !tok.is_empty()) {
            if args.try_push(token).is_err() {
                break;
            }
        }

        proc.pages
            .insert(Page::new(PHYS_BASE - PGSIZE, false, PageSource::Zero))?;

        let mut esp = PHYS_BASE;

        // Argument strings, argv[argc-1] first, each NUL-terminated.
        let mut slots = [0u32; MAXARG];
        for (arg, slot) in izip!(&args, &mut slots[..args.len()]).rev() {
            esp -= arg.len() + 1;
            self.copy_out_user(proc, esp, arg)?;
            self.copy_out_user(proc, esp + arg.len(), &[0])?;
            *slot = esp as u32;
        }

        // Pad to a word boundary with zeros.
        while esp % 4 != 0 {
            esp -= 1;
            self.copy_out_user(proc, esp, &[0])?;
        }

        // argv[argc] = NULL.
        esp -= 4;
        self.copy_out_user(proc, esp, &0u32.to_le_bytes())?;

        // The argument pointers, right to left.
        for slot in slots[..args.len()].iter().rev() {
            esp -= 4;
            self.copy_out_user(proc, esp, &slot.to_le_bytes())?;
        }

        // argv, argc, and a fake return address.
        let argv = esp as u32;
        esp -= 4;
        self.copy_out_user(proc, esp, &argv.to_le_bytes())?;
        esp -= 4;
        self.copy_out_user(proc, esp, &(args.len() as u32).to_le_bytes())?;
        esp -= 4;
        self.copy_out_user(proc, esp, &0u32.to_le_bytes())?;

        proc.user_esp
            .store(esp, core::sync::atomic::Ordering::Release);
        Ok(esp)
    }
}
