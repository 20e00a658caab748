//! x86_64 page-table driver.
//!
//! Implements [`MemoryArchOps`] over the `x86_64` crate. An address
//! space handle is the physical address of its PML4. Intermediate
//! tables come from an internal frame pool donated by the boot path, so
//! `map` never re-enters the physical allocator while the VMM holds it;
//! `prepare` pre-builds the PDPT/PD levels for a block and leaf tables
//! appear lazily during `map`.

extern crate alloc;

use alloc::vec::Vec;

use spin::Mutex;
use x86_64::registers::control::{Cr3, Cr3Flags};
use x86_64::structures::paging::{
    FrameAllocator, Mapper, OffsetPageTable, Page, PageTable, PageTableFlags, PhysFrame,
    Size2MiB, Size4KiB, Translate,
};
use x86_64::{PhysAddr, VirtAddr};

use crate::arch::{ArchSpace, MemoryArchOps};
use crate::error::{KernelError, KernelResult};
use crate::mm::vas::PageRecord;
use crate::mm::{PageFlags, VmFlags, PAGE_SIZE, SUPERPAGE_ORDER, SUPERPAGE_SIZE};

/// The page-table driver.
pub struct X86PageOps {
    /// Offset of the straight physical map set up by the bootloader
    phys_offset: u64,
    /// Physical frames reserved for page tables
    table_frames: Mutex<Vec<u64>>,
}

impl X86PageOps {
    pub const fn new(phys_offset: u64) -> Self {
        Self {
            phys_offset,
            table_frames: Mutex::new(Vec::new()),
        }
    }

    /// Donate physical frames for intermediate tables.
    pub fn donate_table_frames(&self, frames: impl IntoIterator<Item = u64>) {
        self.table_frames.lock().extend(frames);
    }

    /// The currently live address space (CR3).
    pub fn current_space(&self) -> ArchSpace {
        let (frame, _) = Cr3::read();
        ArchSpace(frame.start_address().as_u64() as usize)
    }

    fn virt(&self, phys: u64) -> u64 {
        phys + self.phys_offset
    }

    /// Take one zeroed frame from the table pool.
    fn alloc_table_frame(&self) -> KernelResult<u64> {
        let frame = self
            .table_frames
            .lock()
            .pop()
            .ok_or(KernelError::OutOfMemory)?;
        // SAFETY: The frame was donated for exclusive page-table use and
        // is reachable through the straight map.
        unsafe {
            core::ptr::write_bytes(self.virt(frame) as *mut u8, 0, PAGE_SIZE as usize);
        }
        Ok(frame)
    }

    /// # Safety
    ///
    /// `pml4_phys` must be the physical address of a live PML4 reachable
    /// through the straight map, and the caller must not hold another
    /// reference into the same hierarchy.
    unsafe fn mapper(&self, pml4_phys: u64) -> OffsetPageTable<'static> {
        let table = self.virt(pml4_phys) as *mut PageTable;
        // SAFETY: Caller contract; the straight map covers all physical
        // memory, so `table` is dereferenceable.
        unsafe { OffsetPageTable::new(&mut *table, VirtAddr::new(self.phys_offset)) }
    }

    /// Make sure `table[idx]` points at a subtable, building one from
    /// the pool when absent. Returns the subtable's physical address.
    fn ensure_subtable(&self, table: &mut PageTable, idx: usize) -> KernelResult<u64> {
        let entry = &mut table[idx];
        if entry.is_unused() {
            let frame = self.alloc_table_frame()?;
            entry.set_addr(
                PhysAddr::new(frame),
                PageTableFlags::PRESENT
                    | PageTableFlags::WRITABLE
                    | PageTableFlags::USER_ACCESSIBLE,
            );
        }
        Ok(entry.addr().as_u64())
    }

    fn leaf_flags(page: &PageRecord, vm: VmFlags) -> PageTableFlags {
        let mut flags = PageTableFlags::PRESENT;
        if page.flags.contains(PageFlags::RW) {
            flags |= PageTableFlags::WRITABLE;
        }
        if !page.flags.contains(PageFlags::EXEC) {
            flags |= PageTableFlags::NO_EXECUTE;
        }
        if vm.contains(VmFlags::USER) {
            flags |= PageTableFlags::USER_ACCESSIBLE;
        }
        if vm.contains(VmFlags::GLOBAL) {
            flags |= PageTableFlags::GLOBAL;
        }
        flags
    }
}

/// Pool-backed frame source handed to `map_to` for leaf tables.
struct PoolFrames<'a> {
    ops: &'a X86PageOps,
}

// SAFETY: Frames come from the donated pool, are zeroed before use, and
// are never handed out twice.
unsafe impl FrameAllocator<Size4KiB> for PoolFrames<'_> {
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        let phys = self.ops.alloc_table_frame().ok()?;
        Some(PhysFrame::containing_address(PhysAddr::new(phys)))
    }
}

impl MemoryArchOps for X86PageOps {
    fn map(
        &self,
        space: ArchSpace,
        virt: u64,
        page: &PageRecord,
        vm_flags: VmFlags,
    ) -> KernelResult<()> {
        let flags = Self::leaf_flags(page, vm_flags);
        let mut pool = PoolFrames { ops: self };
        // SAFETY: `space` holds a PML4 this driver created (or the boot
        // tables registered at init); the VMM serializes updates per
        // address space.
        let mut mapper = unsafe { self.mapper(space.0 as u64) };

        if page.order >= SUPERPAGE_ORDER {
            let count = 1u64 << (page.order - SUPERPAGE_ORDER);
            for i in 0..count {
                let page2m = Page::<Size2MiB>::containing_address(VirtAddr::new(
                    virt + i * SUPERPAGE_SIZE,
                ));
                let frame = PhysFrame::<Size2MiB>::containing_address(PhysAddr::new(
                    page.physical + i * SUPERPAGE_SIZE,
                ));
                // SAFETY: The frame is owned by the caller's page record
                // and the virtual range was reserved by the VMM.
                unsafe {
                    mapper
                        .map_to(page2m, frame, flags, &mut pool)
                        .map_err(|_| KernelError::OutOfMemory)?
                        .flush();
                }
            }
        } else {
            let count = 1u64 << page.order;
            for i in 0..count {
                let page4k =
                    Page::<Size4KiB>::containing_address(VirtAddr::new(virt + i * PAGE_SIZE));
                let frame = PhysFrame::<Size4KiB>::containing_address(PhysAddr::new(
                    page.physical + i * PAGE_SIZE,
                ));
                // SAFETY: See above.
                unsafe {
                    mapper
                        .map_to(page4k, frame, flags, &mut pool)
                        .map_err(|_| KernelError::OutOfMemory)?
                        .flush();
                }
            }
        }
        Ok(())
    }

    fn unmap(&self, space: ArchSpace, virt: u64, page: &PageRecord) -> KernelResult<()> {
        // SAFETY: See `map`.
        let mut mapper = unsafe { self.mapper(space.0 as u64) };
        if page.order >= SUPERPAGE_ORDER {
            let count = 1u64 << (page.order - SUPERPAGE_ORDER);
            for i in 0..count {
                let page2m = Page::<Size2MiB>::containing_address(VirtAddr::new(
                    virt + i * SUPERPAGE_SIZE,
                ));
                let (_, flush) = mapper.unmap(page2m).map_err(|_| KernelError::NotFound)?;
                flush.flush();
            }
        } else {
            let count = 1u64 << page.order;
            for i in 0..count {
                let page4k =
                    Page::<Size4KiB>::containing_address(VirtAddr::new(virt + i * PAGE_SIZE));
                let (_, flush) = mapper.unmap(page4k).map_err(|_| KernelError::NotFound)?;
                flush.flush();
            }
        }
        Ok(())
    }

    fn prepare(&self, space: ArchSpace, start: u64, size: u64) -> KernelResult<()> {
        // Build the PDPT and PD levels for every 1 GiB slice of the
        // range; leaf tables appear lazily during map.
        let end = start.checked_add(size).ok_or(KernelError::Invalid)?;
        let mut addr = crate::mm::align_down(start, SUPERPAGE_SIZE);
        while addr < end {
            let l4_idx = ((addr >> 39) & 0x1FF) as usize;
            let l3_idx = ((addr >> 30) & 0x1FF) as usize;
            // SAFETY: `space` is a live PML4 under the straight map.
            let l4 = unsafe { &mut *(self.virt(space.0 as u64) as *mut PageTable) };
            let l3_phys = self.ensure_subtable(l4, l4_idx)?;
            // SAFETY: `l3_phys` was just created or read from a present
            // entry; both are table frames under the straight map.
            let l3 = unsafe { &mut *(self.virt(l3_phys) as *mut PageTable) };
            self.ensure_subtable(l3, l3_idx)?;
            addr = match addr.checked_add(1 << 30) {
                Some(next) => next,
                None => break,
            };
        }
        Ok(())
    }

    fn refer(&self, dst: ArchSpace, src: ArchSpace, start: u64, size: u64) -> KernelResult<()> {
        let end = start
            .checked_add(size.saturating_sub(1))
            .ok_or(KernelError::Invalid)?;
        let first = ((start >> 39) & 0x1FF) as usize;
        let last = ((end >> 39) & 0x1FF) as usize;
        // SAFETY: Both handles are live PML4s under the straight map;
        // sharing top-level entries is the refer contract.
        let (src_table, dst_table) = unsafe {
            (
                &*(self.virt(src.0 as u64) as *const PageTable),
                &mut *(self.virt(dst.0 as u64) as *mut PageTable),
            )
        };
        for idx in first..=last {
            dst_table[idx].set_addr(src_table[idx].addr(), src_table[idx].flags());
        }
        Ok(())
    }

    fn new_space(&self) -> KernelResult<ArchSpace> {
        let frame = self.alloc_table_frame()?;
        let current = self.current_space();
        // SAFETY: `frame` is fresh and zeroed; the current PML4 is live.
        let (src, dst) = unsafe {
            (
                &*(self.virt(current.0 as u64) as *const PageTable),
                &mut *(self.virt(frame) as *mut PageTable),
            )
        };
        // Clone the kernel half so kernel addresses stay mapped.
        for idx in 256..512 {
            if !src[idx].is_unused() {
                dst[idx].set_addr(src[idx].addr(), src[idx].flags());
            }
        }
        Ok(ArchSpace(frame as usize))
    }

    fn ctxsw(&self, space: ArchSpace) {
        let frame = PhysFrame::containing_address(PhysAddr::new(space.0 as u64));
        // SAFETY: The handle is a PML4 built by this driver with the
        // kernel half present, so the kernel keeps running after the
        // switch.
        unsafe {
            Cr3::write(frame, Cr3Flags::empty());
        }
    }

    fn copy(&self, _space: ArchSpace, dst: u64, src: u64, size: u64) -> KernelResult<()> {
        // The caller runs on the target address space's tables, so both
        // ranges are reachable directly.
        // SAFETY: The VMM validated both ranges before asking.
        unsafe {
            core::ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, size as usize);
        }
        Ok(())
    }

    fn v2p(&self, space: ArchSpace, virt: u64) -> KernelResult<u64> {
        // SAFETY: See `map`.
        let mapper = unsafe { self.mapper(space.0 as u64) };
        mapper
            .translate_addr(VirtAddr::new(virt))
            .map(|p| p.as_u64())
            .ok_or(KernelError::NotFound)
    }
}
