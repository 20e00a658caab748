//! Slab allocator.
//!
//! Named fixed-size caches carved from 8-page runs handed out by the
//! kernel address space. Every slab reserves a header area and one free
//! mark byte per object, then aligns its object array to 64 bytes; the
//! object count is maximized under that layout.
//!
//! List discipline (the names follow slot availability, not usage):
//! `partial` slabs have some objects used and some free, `full` slabs
//! have every object free, `empty` slabs have none. Allocation prefers a
//! partial slab and promotes a full one when needed; free demotes.

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use crate::error::{KernelError, KernelResult};
use crate::mm::PAGE_SIZE;

/// Pages per slab
pub const SLAB_NUM_PAGES: usize = 8;
/// Object array alignment (cacheline)
pub const SLAB_ALIGNMENT: u64 = 64;
/// Reserved slab header bytes
pub const SLAB_HDR_SIZE: u64 = 64;
/// Longest cache name accepted
pub const SLAB_CACHE_NAME_MAX: usize = 64;

/// Where slabs get their page runs from.
///
/// The kernel address space implements this; tests substitute host
/// buffers.
pub trait SlabPageSource {
    /// Allocate `nr` contiguous, mapped pages and return their address.
    fn alloc_slab_pages(&mut self, nr: usize) -> KernelResult<u64>;
}

/// One slab: a page run with a free-mark table and an object array.
struct Slab {
    /// Base address of the page run
    base: u64,
    /// First object address (64-byte aligned)
    obj_head: u64,
    /// Objects in this slab
    nobjs: usize,
    /// Objects currently allocated
    nused: usize,
    /// Free marks; `true` means the object is free
    marks: Vec<bool>,
}

impl Slab {
    /// Carve a fresh slab for `obj_size`-byte objects out of `base`.
    fn new(base: u64, obj_size: usize) -> Self {
        let total = SLAB_NUM_PAGES as u64 * PAGE_SIZE;
        // One mark byte per object alongside the object itself.
        let usable = total - SLAB_HDR_SIZE - SLAB_ALIGNMENT;
        let nobjs = (usable / (obj_size as u64 + 1)) as usize;
        let obj_head =
            crate::mm::align_up(base + SLAB_HDR_SIZE + nobjs as u64, SLAB_ALIGNMENT);

        // SAFETY: `base` addresses a freshly allocated, mapped run of
        // SLAB_NUM_PAGES pages owned exclusively by this slab.
        unsafe {
            core::ptr::write_bytes(base as *mut u8, 0, total as usize);
        }

        Self {
            base,
            obj_head,
            nobjs,
            nused: 0,
            marks: alloc::vec![true; nobjs],
        }
    }

    /// Address of object `i`.
    fn object(&self, i: usize, obj_size: usize) -> u64 {
        self.obj_head + (obj_size * i) as u64
    }

    /// Does `ptr` address an object of this slab? Returns its index.
    fn index_of(&self, ptr: u64, obj_size: usize) -> Option<usize> {
        let span = (self.nobjs * obj_size) as u64;
        if ptr < self.obj_head || ptr >= self.obj_head + span {
            return None;
        }
        let off = ptr - self.obj_head;
        if off % obj_size as u64 != 0 {
            return None;
        }
        Some((off / obj_size as u64) as usize)
    }
}

/// A named cache of equally sized objects.
pub struct SlabCache {
    obj_size: usize,
    partial: Vec<Slab>,
    full: Vec<Slab>,
    empty: Vec<Slab>,
}

impl SlabCache {
    fn new(obj_size: usize) -> Self {
        Self {
            obj_size,
            partial: Vec::new(),
            full: Vec::new(),
            empty: Vec::new(),
        }
    }

    pub fn obj_size(&self) -> usize {
        self.obj_size
    }

    fn alloc(&mut self, src: &mut dyn SlabPageSource) -> KernelResult<u64> {
        if self.partial.is_empty() && self.full.is_empty() {
            let base = src.alloc_slab_pages(SLAB_NUM_PAGES)?;
            self.full.push(Slab::new(base, self.obj_size));
        }
        if self.partial.is_empty() {
            let slab = self.full.pop().expect("full list refilled above");
            self.partial.push(slab);
        }

        let obj_size = self.obj_size;
        let slab = self.partial.last_mut().expect("partial slab present");
        let i = slab
            .marks
            .iter()
            .position(|&free| free)
            .expect("partial slab out of free marks");
        slab.marks[i] = false;
        slab.nused += 1;
        let obj = slab.object(i, obj_size);

        if slab.nused == slab.nobjs {
            let slab = self.partial.pop().expect("just borrowed");
            self.empty.push(slab);
        }
        Ok(obj)
    }

    /// Release `ptr` if it belongs to this cache.
    ///
    /// `NotFound` reports a foreign pointer; the fixed-class allocator
    /// uses that to probe caches for the right size class.
    fn free(&mut self, ptr: u64) -> KernelResult<()> {
        let obj_size = self.obj_size;

        for list in [&mut self.partial, &mut self.empty] {
            for idx in 0..list.len() {
                if let Some(i) = list[idx].index_of(ptr, obj_size) {
                    if list[idx].marks[i] {
                        return Err(KernelError::Invalid);
                    }
                    list[idx].marks[i] = true;
                    list[idx].nused -= 1;
                    return Ok(());
                }
            }
        }
        // A slab on the full list has no allocated objects to free.
        for slab in &self.full {
            if slab.index_of(ptr, obj_size).is_some() {
                return Err(KernelError::Invalid);
            }
        }
        Err(KernelError::NotFound)
    }

    /// Move slabs whose usage changed onto the right list.
    fn rebalance(&mut self) {
        let mut i = 0;
        while i < self.empty.len() {
            if self.empty[i].nused < self.empty[i].nobjs {
                let slab = self.empty.swap_remove(i);
                self.partial.push(slab);
            } else {
                i += 1;
            }
        }
        let mut i = 0;
        while i < self.partial.len() {
            if self.partial[i].nused == 0 {
                let slab = self.partial.swap_remove(i);
                self.full.push(slab);
            } else {
                i += 1;
            }
        }
    }

    /// Check the per-cache list discipline.
    #[cfg(test)]
    fn check_invariants(&self) {
        for s in &self.partial {
            assert!(0 < s.nused && s.nused < s.nobjs, "partial list violated");
        }
        for s in &self.full {
            assert_eq!(s.nused, 0, "full list must hold all-free slabs");
        }
        for s in &self.empty {
            assert_eq!(s.nused, s.nobjs, "empty list must hold exhausted slabs");
        }
        for s in self.partial.iter().chain(&self.full).chain(&self.empty) {
            let used = s.marks.iter().filter(|&&free| !free).count();
            assert_eq!(used, s.nused, "marks disagree with nused");
        }
    }
}

/// The slab allocator: caches looked up by name.
pub struct SlabAllocator {
    caches: BTreeMap<String, SlabCache>,
}

impl Default for SlabAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl SlabAllocator {
    pub fn new() -> Self {
        Self {
            caches: BTreeMap::new(),
        }
    }

    /// Create a cache named `name` for `size`-byte objects.
    pub fn create_cache(&mut self, name: &str, size: usize) -> KernelResult<()> {
        if name.is_empty() || name.len() >= SLAB_CACHE_NAME_MAX || size == 0 {
            return Err(KernelError::Invalid);
        }
        if self.caches.contains_key(name) {
            return Err(KernelError::Exists);
        }
        self.caches.insert(String::from(name), SlabCache::new(size));
        Ok(())
    }

    /// Allocate one object from the cache named `name`.
    pub fn alloc(&mut self, src: &mut dyn SlabPageSource, name: &str) -> KernelResult<u64> {
        let cache = self.caches.get_mut(name).ok_or(KernelError::NotFound)?;
        cache.alloc(src)
    }

    /// Free `ptr` back to the cache named `name`.
    ///
    /// `NotFound` means the pointer does not belong to this cache.
    pub fn free(&mut self, name: &str, ptr: u64) -> KernelResult<()> {
        let cache = self.caches.get_mut(name).ok_or(KernelError::NotFound)?;
        cache.free(ptr)?;
        cache.rebalance();
        Ok(())
    }

    pub fn cache(&self, name: &str) -> Option<&SlabCache> {
        self.caches.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Host-memory page source: leaks page-aligned buffers.
    struct HostPages;

    impl SlabPageSource for HostPages {
        fn alloc_slab_pages(&mut self, nr: usize) -> KernelResult<u64> {
            let bytes = nr * PAGE_SIZE as usize;
            let layout =
                core::alloc::Layout::from_size_align(bytes, PAGE_SIZE as usize).unwrap();
            // SAFETY: layout is non-zero; the buffer is leaked on purpose
            // so slab object pointers stay valid for the test lifetime.
            let ptr = unsafe { alloc::alloc::alloc(layout) };
            if ptr.is_null() {
                return Err(KernelError::OutOfMemory);
            }
            Ok(ptr as u64)
        }
    }

    #[test]
    fn geometry_maximizes_object_count() {
        let mut src = HostPages;
        let base = src.alloc_slab_pages(SLAB_NUM_PAGES).unwrap();
        let slab = Slab::new(base, 256);
        // 32 KiB minus header and alignment slack, one mark byte per object
        let expect = ((SLAB_NUM_PAGES as u64 * PAGE_SIZE - SLAB_HDR_SIZE - SLAB_ALIGNMENT)
            / 257) as usize;
        assert_eq!(slab.nobjs, expect);
        assert_eq!(slab.obj_head % SLAB_ALIGNMENT, 0);
        assert!(slab.obj_head >= base + SLAB_HDR_SIZE + slab.nobjs as u64);
        // The object array must fit inside the page run
        assert!(slab.object(slab.nobjs - 1, 256) + 256 <= base + SLAB_NUM_PAGES as u64 * PAGE_SIZE);
    }

    #[test]
    fn alloc_free_moves_between_lists() {
        let mut slabs = SlabAllocator::new();
        let mut src = HostPages;
        slabs.create_cache("objcache", 512).unwrap();

        let a = slabs.alloc(&mut src, "objcache").unwrap();
        let b = slabs.alloc(&mut src, "objcache").unwrap();
        assert_ne!(a, b);
        assert_eq!(a % 512, b % 512);
        slabs.cache("objcache").unwrap().check_invariants();

        slabs.free("objcache", a).unwrap();
        slabs.free("objcache", b).unwrap();
        slabs.cache("objcache").unwrap().check_invariants();

        // All objects free again: the slab must be back on the full list
        let c = slabs.cache("objcache").unwrap();
        assert_eq!(c.partial.len(), 0);
        assert_eq!(c.full.len(), 1);
    }

    #[test]
    fn exhausting_a_slab_grows_a_new_one() {
        let mut slabs = SlabAllocator::new();
        let mut src = HostPages;
        slabs.create_cache("big", 8192).unwrap();
        let nobjs = {
            let mut probe = HostPages;
            let base = probe.alloc_slab_pages(SLAB_NUM_PAGES).unwrap();
            Slab::new(base, 8192).nobjs
        };
        assert!(nobjs >= 1);

        let mut objs = Vec::new();
        for _ in 0..nobjs + 1 {
            objs.push(slabs.alloc(&mut src, "big").unwrap());
        }
        let c = slabs.cache("big").unwrap();
        c.check_invariants();
        assert_eq!(c.empty.len(), 1, "first slab exhausted");

        for o in objs {
            slabs.free("big", o).unwrap();
        }
        slabs.cache("big").unwrap().check_invariants();
    }

    #[test]
    fn foreign_pointer_probes_not_found() {
        let mut slabs = SlabAllocator::new();
        let mut src = HostPages;
        slabs.create_cache("one", 64).unwrap();
        slabs.create_cache("two", 128).unwrap();

        let a = slabs.alloc(&mut src, "one").unwrap();
        assert_eq!(slabs.free("two", a), Err(KernelError::NotFound));
        assert!(slabs.free("one", a).is_ok());
    }

    #[test]
    fn double_free_is_invalid() {
        let mut slabs = SlabAllocator::new();
        let mut src = HostPages;
        slabs.create_cache("dbl", 96).unwrap();
        let a = slabs.alloc(&mut src, "dbl").unwrap();
        slabs.free("dbl", a).unwrap();
        assert_eq!(slabs.free("dbl", a), Err(KernelError::Invalid));
    }

    #[test]
    fn duplicate_cache_rejected() {
        let mut slabs = SlabAllocator::new();
        slabs.create_cache("dup", 32).unwrap();
        assert_eq!(slabs.create_cache("dup", 32), Err(KernelError::Exists));
        assert_eq!(
            slabs.create_cache("", 32),
            Err(KernelError::Invalid),
            "empty names rejected"
        );
    }

    #[test]
    fn objects_are_writable_memory() {
        let mut slabs = SlabAllocator::new();
        let mut src = HostPages;
        slabs.create_cache("bytes", 64).unwrap();
        let a = slabs.alloc(&mut src, "bytes").unwrap();
        // SAFETY: `a` points at 64 exclusive bytes inside a live slab.
        unsafe {
            core::ptr::write_bytes(a as *mut u8, 0xAB, 64);
            assert_eq!(*(a as *const u8), 0xAB);
        }
        slabs.free("bytes", a).unwrap();
    }
}
