//! Executable format.
//!
//! A 52-byte header followed by 32-byte program header entries, both read
//! straight off the file through `zerocopy`.

use core::mem;

use bitflags::bitflags;
use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

/// Leading bytes of a valid identity field.
pub const ELF_IDENT: [u8; 7] = *b"\x7fELF\x01\x01\x01";

/// Executable file.
pub const ELF_TYPE_EXEC: u16 = 2;

/// i386.
pub const ELF_MACHINE_386: u16 = 3;

pub const ELF_VERSION: u32 = 1;

/// At most this many program headers are honored.
pub const ELF_PHNUM_MAX: u16 = 1024;

/// Segment types.
pub const PT_LOAD: u32 = 1;
pub const PT_DYNAMIC: u32 = 2;
pub const PT_INTERP: u32 = 3;
pub const PT_SHLIB: u32 = 5;

/// Executable header, at the very beginning of the file.
#[repr(C)]
#[derive(Clone, AsBytes, FromBytes)]
pub struct ElfHdr {
    pub ident: [u8; 16],
    pub typ: u16,
    pub machine: u16,
    pub version: u32,
    pub entry: u32,
    pub phoff: u32,
    pub shoff: u32,
    pub flags: u32,
    pub ehsize: u16,
    pub phentsize: u16,
    pub phnum: u16,
    pub shentsize: u16,
    pub shnum: u16,
    pub shstrndx: u16,
}

const_assert!(mem::size_of::<ElfHdr>() == 52);

bitflags! {
    /// Flag bits for `ProgHdr::flags`.
    #[repr(C)]
    #[derive(AsBytes, FromBytes)]
    pub struct ProgFlags: u32 {
        const EXEC = 1;
        const WRITE = 2;
        const READ = 4;
    }
}

/// Program header. There are `phnum` of these at file offset `phoff`.
#[repr(C)]
#[derive(Clone, AsBytes, FromBytes)]
pub struct ProgHdr {
    pub typ: u32,
    pub off: u32,
    pub vaddr: u32,
    pub paddr: u32,
    pub filesz: u32,
    pub memsz: u32,
    pub flags: ProgFlags,
    pub align: u32,
}

const_assert!(mem::size_of::<ProgHdr>() == 32);

impl ElfHdr {
    /// Magic, machine type, version, and program-header sanity checks.
    pub fn is_valid(&self) -> bool {
        self.ident[..ELF_IDENT.len()] == ELF_IDENT
            && self.typ == ELF_TYPE_EXEC
            && self.machine == ELF_MACHINE_386
            && self.version == ELF_VERSION
            && self.phentsize as usize == mem::size_of::<ProgHdr>()
            && self.phnum <= ELF_PHNUM_MAX
    }
}

impl ProgHdr {
    pub fn is_writable(&self) -> bool {
        self.flags.contains(ProgFlags::WRITE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_header() -> ElfHdr {
        let mut hdr = ElfHdr::new_zeroed();
        hdr.ident[..7].copy_from_slice(&ELF_IDENT);
        hdr.typ = ELF_TYPE_EXEC;
        hdr.machine = ELF_MACHINE_386;
        hdr.version = ELF_VERSION;
        hdr.phentsize = 32;
        hdr.phnum = 1;
        hdr
    }

    #[test]
    fn accepts_valid_header() {
        assert!(valid_header().is_valid());
    }

    #[test]
    fn rejects_bad_fields() {
        let mut hdr = valid_header();
        hdr.ident[0] = 0;
        assert!(!hdr.is_valid());

        let mut hdr = valid_header();
        hdr.machine = 62;
        assert!(!hdr.is_valid());

        let mut hdr = valid_header();
        hdr.typ = 1;
        assert!(!hdr.is_valid());

        let mut hdr = valid_header();
        hdr.phnum = 2000;
        assert!(!hdr.is_valid());

        let mut hdr = valid_header();
        hdr.phentsize = 56;
        assert!(!hdr.is_valid());
    }
}
