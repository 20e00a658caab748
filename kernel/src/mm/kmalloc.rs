//! Fixed-size-class general allocator.
//!
//! Rounds a request up to the first of thirteen size classes and serves
//! it from the matching `kmalloc-<size>` slab cache. Free does not know
//! the size, so it probes each class cache until one accepts the
//! pointer.

extern crate alloc;

use alloc::format;
use alloc::string::String;

use crate::error::{KernelError, KernelResult};
use crate::mm::slab::{SlabAllocator, SlabPageSource};

/// The size classes, smallest first.
pub const KMALLOC_SIZES: [usize; 13] = [
    8, 16, 32, 64, 96, 128, 192, 256, 512, 1024, 2048, 4096, 8192,
];

fn cache_name(size: usize) -> String {
    format!("kmalloc-{}", size)
}

/// Create the `kmalloc-<size>` caches.
pub fn init(slabs: &mut SlabAllocator) -> KernelResult<()> {
    for size in KMALLOC_SIZES {
        slabs.create_cache(&cache_name(size), size)?;
    }
    Ok(())
}

/// Allocate `size` bytes from the smallest sufficient class.
pub fn kmalloc(
    slabs: &mut SlabAllocator,
    src: &mut dyn SlabPageSource,
    size: usize,
) -> KernelResult<u64> {
    let class = KMALLOC_SIZES
        .iter()
        .find(|&&c| size <= c)
        .ok_or(KernelError::Invalid)?;
    slabs.alloc(src, &cache_name(*class))
}

/// Free a pointer previously returned by [`kmalloc`].
///
/// Walks the size classes and hands the pointer to each cache until one
/// reports ownership.
pub fn kfree(slabs: &mut SlabAllocator, ptr: u64) -> KernelResult<()> {
    for size in KMALLOC_SIZES {
        match slabs.free(&cache_name(size), ptr) {
            Err(KernelError::NotFound) => continue,
            other => return other,
        }
    }
    Err(KernelError::NotFound)
}
