//! Bare-metal kernel heap.
//!
//! Ambient `Box`/`Vec`/`Arc` allocations are served by a
//! `linked_list_allocator` heap over a static region, initialized before
//! the buddy allocator because the buddy's own bookkeeping lives on the
//! heap. Host builds use the system allocator instead (see `lib.rs`).

/// Static heap size: large enough for the kernel address space's 8 MiB
/// node pool plus general bookkeeping.
pub const KERNEL_HEAP_SIZE: usize = 32 << 20;

#[cfg(target_os = "none")]
mod backing {
    use super::KERNEL_HEAP_SIZE;

    #[repr(align(4096))]
    struct HeapRegion([u8; KERNEL_HEAP_SIZE]);

    static mut HEAP_REGION: HeapRegion = HeapRegion([0; KERNEL_HEAP_SIZE]);

    /// Hand the static region to the global allocator. Called exactly
    /// once by the BSP before any allocation.
    pub fn init() {
        // SAFETY: Called once before secondary CPUs start; the region is
        // reserved for the heap and never touched otherwise.
        unsafe {
            let start = core::ptr::addr_of_mut!(HEAP_REGION) as *mut u8;
            crate::ALLOCATOR.lock().init(start, KERNEL_HEAP_SIZE);
        }
    }
}

/// Initialize the kernel heap (no-op on the host).
pub fn init() {
    #[cfg(target_os = "none")]
    backing::init();
}
