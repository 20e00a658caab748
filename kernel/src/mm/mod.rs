//! Memory management.
//!
//! Three allocators stack on top of each other: the physical buddy
//! allocator ([`frame_allocator`]), the slab allocator ([`slab`]) carved
//! from buddy-backed page runs, and the fixed-size-class general allocator
//! ([`kmalloc`]) dispatching to slab caches. The virtual memory manager
//! ([`vas`], [`vmm`]) sits beside them and owns every address space.

pub mod frame_allocator;
pub mod heap;
pub mod kmalloc;
pub mod slab;
pub mod tree;
pub mod vas;
pub mod vmm;

use bitflags::bitflags;

/// Base page size shift (4 KiB pages)
pub const PAGE_SHIFT: u32 = 12;
/// Size of a base page
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;
/// Superpage shift (2 MiB pages)
pub const SUPERPAGE_SHIFT: u32 = 21;
/// Size of a superpage
pub const SUPERPAGE_SIZE: u64 = 1 << SUPERPAGE_SHIFT;
/// A superpage as a buddy order (2 MiB / 4 KiB = 2^9 pages)
pub const SUPERPAGE_ORDER: u8 = (SUPERPAGE_SHIFT - PAGE_SHIFT) as u8;

/// Highest order tracked by the physical buddy allocator
pub const PHYS_BUDDY_MAX_ORDER: usize = 18;

/// Physical addresses below this belong to the DMA zone
pub const ZONE_KERNEL_LB: u64 = 0x0100_0000;
/// Physical addresses at or above this are NUMA-aware; the kernel zone
/// sits in between
pub const ZONE_NUMA_AWARE_LB: u64 = 0x0400_0000;

/// Physical memory address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysicalAddress(pub u64);

impl PhysicalAddress {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Virtual memory address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtualAddress(pub u64);

impl VirtualAddress {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Round `addr` up to the next multiple of `align` (a power of two).
pub const fn align_up(addr: u64, align: u64) -> u64 {
    (addr + align - 1) & !(align - 1)
}

/// Round `addr` down to a multiple of `align` (a power of two).
pub const fn align_down(addr: u64, align: u64) -> u64 {
    addr & !(align - 1)
}

/// Is `addr` page aligned?
pub const fn page_aligned(addr: u64) -> bool {
    addr & (PAGE_SIZE - 1) == 0
}

/// Physical memory zone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Zone {
    /// Legacy DMA region below 16 MiB
    Dma,
    /// Kernel zone between 16 MiB and the NUMA-aware watermark
    Kernel,
    /// NUMA-aware zones; the domain is carried separately
    NumaAware,
}

impl Zone {
    /// Pick the zone a physical address belongs to.
    pub fn for_phys(addr: u64) -> Zone {
        if addr < ZONE_KERNEL_LB {
            Zone::Dma
        } else if addr < ZONE_NUMA_AWARE_LB {
            Zone::Kernel
        } else {
            Zone::NumaAware
        }
    }
}

bitflags! {
    /// Per-page flags carried by a page record
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PageFlags: u16 {
        /// Mapping may never be evicted
        const WIRED = 1 << 0;
        /// Page is writable
        const RW = 1 << 1;
        /// Page is executable
        const EXEC = 1 << 2;
    }
}

bitflags! {
    /// Virtual memory entry and address-space flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct VmFlags: u32 {
        /// Writable
        const RW = 1 << 1;
        /// Executable
        const EXEC = 1 << 2;
        /// User-accessible address space
        const USER = 1 << 3;
        /// Global mapping (survives context switch)
        const GLOBAL = 1 << 6;
        /// Copy-on-write after fork
        const COW = 1 << 7;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_up(0x1001, PAGE_SIZE), 0x2000);
        assert_eq!(align_up(0x2000, PAGE_SIZE), 0x2000);
        assert_eq!(align_down(0x2fff, PAGE_SIZE), 0x2000);
        assert!(page_aligned(0x3000));
        assert!(!page_aligned(0x3001));
    }

    #[test]
    fn zone_watermarks() {
        assert_eq!(Zone::for_phys(0), Zone::Dma);
        assert_eq!(Zone::for_phys(ZONE_KERNEL_LB), Zone::Kernel);
        assert_eq!(Zone::for_phys(ZONE_NUMA_AWARE_LB), Zone::NumaAware);
        assert_eq!(Zone::for_phys(u64::MAX >> 1), Zone::NumaAware);
    }
}
