//! A teaching kernel's user-process support stack: process lifecycle and
//! argument marshalling, syscall dispatch with safe user-memory access,
//! demand-paged virtual memory with a clock evictor and swap, and a
//! hierarchical file system with extensible inodes.
//!
//! The machine underneath (block devices, the free-sector map, the console,
//! the thread scheduler, and the return-to-user-mode path) is reached
//! through the traits in [`hal`], so the whole kernel can be assembled
//! against real hardware glue or against in-memory devices on a host.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod addr;
pub mod elf;
pub mod file;
pub mod fs;
pub mod hal;
pub mod kernel;
pub mod lock;
pub mod param;
pub mod proc;
pub mod syscall;
pub mod vm;

pub use kernel::{Kernel, KernelCtx};
pub use hal::Machine;
