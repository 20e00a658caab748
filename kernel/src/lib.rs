//! Helios kernel library.
//!
//! The kernel core of a small x86_64 research operating system: a
//! per-zone buddy allocator, slab and fixed-class kernel allocators, a
//! block/entry/object virtual memory manager with copy-on-write fork
//! bookkeeping, a cooperative round-robin scheduler with a jiffy timer
//! list, a VFS with devfs and initramfs modules, and the syscall
//! surface. The architecture-specific page-table walk, tick source, and
//! console live behind small interfaces in [`arch`].
//!
//! On bare metal the crate is `no_std` with a `linked_list_allocator`
//! heap; on the host it links `std` so the unit tests run under a plain
//! `cargo test`.

#![no_std]

extern crate alloc;

// Host target: use the system allocator so unit tests can allocate
// normally.
#[cfg(not(target_os = "none"))]
extern crate std;

#[cfg(target_os = "none")]
use linked_list_allocator::LockedHeap;

#[cfg(target_os = "none")]
#[global_allocator]
pub static ALLOCATOR: LockedHeap = LockedHeap::empty();

#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

#[macro_use]
pub mod print;

pub mod arch;
pub mod drivers;
pub mod error;
pub mod fs;
pub mod ipc;
pub mod mm;
pub mod process;
pub mod sched;
pub mod state;
pub mod sync;
pub mod syscall;
pub mod timer;

#[cfg(test)]
mod integration_tests;

pub use error::{KernelError, KernelResult};
