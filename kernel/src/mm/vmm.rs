//! Kernel memory: the physical allocator, the kernel address space, and
//! the architecture interface bound together.
//!
//! [`Memory`] is the record every other allocator hangs off: the slab
//! allocator draws page runs from the kernel address space, and process
//! creation derives fresh user spaces that refer to the kernel blocks.

extern crate alloc;

use crate::arch::{ArchSpace, MemoryArchOps};
use crate::error::KernelResult;
use crate::mm::frame_allocator::PhysMemory;
use crate::mm::slab::SlabPageSource;
use crate::mm::vas::VirtMemory;
use crate::mm::{VmFlags, Zone};

/// Node-pool reservation for the kernel address space: the classic 8 MiB
/// worth of bookkeeping records, fixed before the general allocator is
/// usable.
pub const KMEM_POOL_BYTES: usize = 8 << 20;

/// Node-pool reservation for a user address space.
pub const USER_POOL_SLOTS: usize = 1024;

/// Kernel-wide memory management record.
pub struct Memory {
    /// Physical memory manager
    pub phys: PhysMemory,
    /// The kernel's own address space
    pub kmem: VirtMemory,
    ifs: &'static dyn MemoryArchOps,
}

impl Memory {
    /// Couple the physical allocator with the kernel address space.
    ///
    /// `kernel_space` is the architecture handle for the currently live
    /// kernel page tables.
    pub fn new(
        phys: PhysMemory,
        kernel_space: ArchSpace,
        ifs: &'static dyn MemoryArchOps,
    ) -> Self {
        let slots = KMEM_POOL_BYTES / core::mem::size_of::<crate::mm::vas::VmSlot>();
        let kmem = VirtMemory::new(kernel_space, VmFlags::GLOBAL, slots);
        Self { phys, kmem, ifs }
    }

    /// Same, but with an explicit node-pool size (tests use small pools).
    pub fn with_pool_slots(
        phys: PhysMemory,
        kernel_space: ArchSpace,
        ifs: &'static dyn MemoryArchOps,
        slots: usize,
    ) -> Self {
        let kmem = VirtMemory::new(kernel_space, VmFlags::GLOBAL, slots);
        Self { phys, kmem, ifs }
    }

    pub fn ifs(&self) -> &'static dyn MemoryArchOps {
        self.ifs
    }

    /// Add a kernel block covering `[start, end]`.
    pub fn block_add(&mut self, start: u64, end: u64) -> KernelResult<()> {
        self.kmem.block_add(self.ifs, start, end)
    }

    /// Wire a kernel range to a caller-supplied physical range.
    pub fn wire(&mut self, virt: u64, nr: usize, physical: u64) -> KernelResult<()> {
        self.kmem.wire(self.ifs, virt, nr, physical)
    }

    /// Allocate `nr` kernel pages.
    pub fn alloc_pages(&mut self, nr: usize, zone: Zone, domain: u32) -> KernelResult<u64> {
        self.kmem.alloc_pages(&mut self.phys, self.ifs, nr, zone, domain)
    }

    /// Free kernel pages starting at `ptr`.
    pub fn free_pages(&mut self, ptr: u64) -> KernelResult<()> {
        self.kmem.free_pages(&mut self.phys, self.ifs, ptr)
    }

    /// Prepare a fresh user address space referring to the kernel blocks.
    pub fn new_user_space(&self) -> KernelResult<VirtMemory> {
        VirtMemory::new_user(self.ifs, &self.kmem, USER_POOL_SLOTS)
    }

    /// Switch this CPU onto `vmem`'s page tables.
    pub fn context_switch(&self, vmem: &VirtMemory) {
        self.ifs.ctxsw(vmem.space);
    }
}

impl SlabPageSource for Memory {
    fn alloc_slab_pages(&mut self, nr: usize) -> KernelResult<u64> {
        self.alloc_pages(nr, Zone::NumaAware, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::mock::MockArchOps;

    fn memory() -> Memory {
        let ifs = MockArchOps::leaked();
        let mut phys = PhysMemory::new(0, 1);
        phys.add_region(Zone::Kernel, 0, 0x0100_0000, 0x0400_0000)
            .unwrap();
        phys.add_region(Zone::NumaAware, 0, 0x0400_0000, 0x2000_0000)
            .unwrap();
        let space = ifs.new_space().unwrap();
        let mut mem = Memory::with_pool_slots(phys, space, ifs, 4096);
        mem.block_add(0xC000_0000, 0xFFFF_FFFF).unwrap();
        mem
    }

    #[test]
    fn kernel_alloc_scans_blocks() {
        let mut mem = memory();
        let a = mem.alloc_pages(2, Zone::NumaAware, 0).unwrap();
        let b = mem.alloc_pages(2, Zone::NumaAware, 0).unwrap();
        assert_ne!(a, b);
        mem.free_pages(a).unwrap();
        mem.free_pages(b).unwrap();
    }

    #[test]
    fn user_space_derivation() {
        let mem = memory();
        let user = mem.new_user_space().unwrap();
        assert_ne!(user.space, mem.kmem.space);
        assert!(user.flags.contains(VmFlags::USER));
    }

    #[test]
    fn context_switch_installs_the_space() {
        let ifs = MockArchOps::leaked();
        let phys = PhysMemory::new(0, 1);
        let space = ifs.new_space().unwrap();
        let mem = Memory::with_pool_slots(phys, space, ifs, 64);
        let user = mem.new_user_space().unwrap();

        mem.context_switch(&user);
        assert_eq!(ifs.current_space(), user.space);
        mem.context_switch(&mem.kmem);
        assert_eq!(ifs.current_space(), mem.kmem.space);
    }
}
