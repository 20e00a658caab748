//! Recording page-table driver for host tests.
//!
//! Stands in for the external architecture driver: every map/unmap is
//! recorded per space so tests can assert exactly what the VMM asked the
//! hardware to do, and map failures can be injected to exercise the
//! reverse-unwind paths.

extern crate alloc;

use alloc::collections::BTreeMap;
use core::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};

use spin::Mutex;

use super::{ArchSpace, MemoryArchOps};
use crate::error::{KernelError, KernelResult};
use crate::mm::vas::PageRecord;
use crate::mm::VmFlags;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub physical: u64,
    pub order: u8,
}

#[derive(Default)]
struct SpaceState {
    mappings: BTreeMap<u64, Mapping>,
    prepared: alloc::vec::Vec<(u64, u64)>,
    referred: alloc::vec::Vec<(usize, u64, u64)>,
}

pub struct MockArchOps {
    spaces: Mutex<BTreeMap<usize, SpaceState>>,
    next_space: AtomicUsize,
    current: AtomicUsize,
    /// Number of map calls that still succeed; negative means unlimited.
    maps_before_failure: AtomicIsize,
}

impl Default for MockArchOps {
    fn default() -> Self {
        Self::new()
    }
}

impl MockArchOps {
    pub fn new() -> Self {
        Self {
            spaces: Mutex::new(BTreeMap::new()),
            next_space: AtomicUsize::new(1),
            current: AtomicUsize::new(0),
            maps_before_failure: AtomicIsize::new(-1),
        }
    }

    /// Leak a mock so it satisfies the `&'static dyn MemoryArchOps` the
    /// kernel state expects.
    pub fn leaked() -> &'static MockArchOps {
        alloc::boxed::Box::leak(alloc::boxed::Box::new(Self::new()))
    }

    /// Make the next `n` map calls succeed and every later one fail.
    pub fn fail_maps_after(&self, n: isize) {
        self.maps_before_failure.store(n, Ordering::SeqCst);
    }

    pub fn mapping(&self, space: ArchSpace, virt: u64) -> Option<Mapping> {
        self.spaces
            .lock()
            .get(&space.0)
            .and_then(|s| s.mappings.get(&virt).copied())
    }

    pub fn mapping_count(&self, space: ArchSpace) -> usize {
        self.spaces
            .lock()
            .get(&space.0)
            .map(|s| s.mappings.len())
            .unwrap_or(0)
    }

    pub fn prepared_ranges(&self, space: ArchSpace) -> alloc::vec::Vec<(u64, u64)> {
        self.spaces
            .lock()
            .get(&space.0)
            .map(|s| s.prepared.clone())
            .unwrap_or_default()
    }

    pub fn referred_ranges(&self, space: ArchSpace) -> alloc::vec::Vec<(usize, u64, u64)> {
        self.spaces
            .lock()
            .get(&space.0)
            .map(|s| s.referred.clone())
            .unwrap_or_default()
    }

    pub fn current_space(&self) -> ArchSpace {
        ArchSpace(self.current.load(Ordering::SeqCst))
    }
}

impl MemoryArchOps for MockArchOps {
    fn map(
        &self,
        space: ArchSpace,
        virt: u64,
        page: &PageRecord,
        _flags: VmFlags,
    ) -> KernelResult<()> {
        let left = self.maps_before_failure.load(Ordering::SeqCst);
        if left >= 0 {
            if left == 0 {
                return Err(KernelError::OutOfMemory);
            }
            self.maps_before_failure.fetch_sub(1, Ordering::SeqCst);
        }

        let mut spaces = self.spaces.lock();
        let state = spaces.entry(space.0).or_default();
        if state.mappings.contains_key(&virt) {
            return Err(KernelError::Exists);
        }
        state.mappings.insert(
            virt,
            Mapping {
                physical: page.physical,
                order: page.order,
            },
        );
        Ok(())
    }

    fn unmap(&self, space: ArchSpace, virt: u64, _page: &PageRecord) -> KernelResult<()> {
        let mut spaces = self.spaces.lock();
        let state = spaces.get_mut(&space.0).ok_or(KernelError::NotFound)?;
        state
            .mappings
            .remove(&virt)
            .map(|_| ())
            .ok_or(KernelError::NotFound)
    }

    fn prepare(&self, space: ArchSpace, start: u64, size: u64) -> KernelResult<()> {
        let mut spaces = self.spaces.lock();
        spaces.entry(space.0).or_default().prepared.push((start, size));
        Ok(())
    }

    fn refer(&self, dst: ArchSpace, src: ArchSpace, start: u64, size: u64) -> KernelResult<()> {
        let mut spaces = self.spaces.lock();
        spaces
            .entry(dst.0)
            .or_default()
            .referred
            .push((src.0, start, size));
        Ok(())
    }

    fn new_space(&self) -> KernelResult<ArchSpace> {
        let id = self.next_space.fetch_add(1, Ordering::SeqCst);
        self.spaces.lock().insert(id, SpaceState::default());
        Ok(ArchSpace(id))
    }

    fn ctxsw(&self, space: ArchSpace) {
        self.current.store(space.0, Ordering::SeqCst);
    }

    fn copy(&self, _space: ArchSpace, _dst: u64, _src: u64, _size: u64) -> KernelResult<()> {
        Ok(())
    }

    fn v2p(&self, space: ArchSpace, virt: u64) -> KernelResult<u64> {
        let spaces = self.spaces.lock();
        let state = spaces.get(&space.0).ok_or(KernelError::NotFound)?;
        // Walk down from the page base covering this address.
        for (&base, m) in state.mappings.range(..=virt).rev() {
            let span = crate::mm::PAGE_SIZE << m.order;
            if virt < base + span {
                return Ok(m.physical + (virt - base));
            }
        }
        Err(KernelError::NotFound)
    }
}
