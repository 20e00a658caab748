//! Architecture abstraction layer.
//!
//! The virtual memory manager drives the page-table hardware through the
//! [`MemoryArchOps`] vtable; everything the core needs from the CPU is
//! behind it plus a handful of free functions (halt, interrupt control,
//! port IO). Each address space carries an opaque [`ArchSpace`] handle
//! whose meaning belongs entirely to the implementation (on x86_64 it is
//! the PML4 physical address).

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

#[cfg(test)]
pub mod mock;

use crate::error::KernelResult;
use crate::mm::vas::PageRecord;
use crate::mm::VmFlags;

/// Opaque per-address-space handle owned by the architecture driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchSpace(pub usize);

/// Page-table operations consumed by the virtual memory manager.
///
/// `map`/`unmap` cover `2^(order + 12)` bytes per page record and may use
/// a superpage when the record's order is at least 9. `prepare` must make
/// sure intermediate tables exist for a range before any `map` into it;
/// `refer` shares upper-level tables so kernel addresses stay visible in a
/// new space; `new_space` clones the kernel slots into a fresh top level.
pub trait MemoryArchOps: Send + Sync {
    fn map(
        &self,
        space: ArchSpace,
        virt: u64,
        page: &PageRecord,
        flags: VmFlags,
    ) -> KernelResult<()>;

    fn unmap(&self, space: ArchSpace, virt: u64, page: &PageRecord) -> KernelResult<()>;

    fn prepare(&self, space: ArchSpace, start: u64, size: u64) -> KernelResult<()>;

    fn refer(&self, dst: ArchSpace, src: ArchSpace, start: u64, size: u64) -> KernelResult<()>;

    fn new_space(&self) -> KernelResult<ArchSpace>;

    fn ctxsw(&self, space: ArchSpace);

    fn copy(&self, space: ArchSpace, dst: u64, src: u64, size: u64) -> KernelResult<()>;

    fn v2p(&self, space: ArchSpace, virt: u64) -> KernelResult<u64>;
}

/// Read `width` bytes (1, 2, or 4) from an IO port.
///
/// Only meaningful on bare-metal x86_64; elsewhere port IO is reported
/// unsupported.
pub fn port_in(width: u8, port: u16) -> KernelResult<u32> {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        return x86_64::port_in(width, port);
    }
    #[allow(unreachable_code)]
    {
        let _ = (width, port);
        Err(crate::error::KernelError::Unsupported)
    }
}

/// Write `width` bytes (1, 2, or 4) to an IO port.
pub fn port_out(width: u8, port: u16, data: u32) -> KernelResult<()> {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        return x86_64::port_out(width, port, data);
    }
    #[allow(unreachable_code)]
    {
        let _ = (width, port, data);
        Err(crate::error::KernelError::Unsupported)
    }
}

/// Disable interrupts and halt this CPU forever.
pub fn halt() -> ! {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        x86_64::halt_forever();
    }
    #[allow(unreachable_code)]
    loop {
        core::hint::spin_loop();
    }
}

/// Number of CPUs the scheduler plans for.
pub const MAX_CPUS: usize = 16;
