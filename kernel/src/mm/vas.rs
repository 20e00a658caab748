//! Per-address-space virtual memory management.
//!
//! An address space is a list of [`Block`]s. Each block independently
//! indexes its allocated [`EntryRecord`]s by start address and its free
//! regions by both start address and size, so address lookup and
//! best-fit-by-size are both tree searches. Entries reference
//! [`VmObject`]s, logical page sets that can be shared between address
//! spaces; a shadow object materializes only the pages that differ from
//! its parent, which is how fork expresses copy-on-write.
//!
//! Entry and free-region records live in a fixed-capacity node pool that
//! is reserved when the address space is created, so the kernel address
//! space can operate before the general allocator exists.

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cmp::Ordering;

use spin::Mutex;

use crate::arch::{ArchSpace, MemoryArchOps};
use crate::error::{KernelError, KernelResult};
use crate::mm::frame_allocator::PhysMemory;
use crate::mm::tree::{Arena, Links, NodeId, Tree, TreeNode};
use crate::mm::{
    align_down, align_up, page_aligned, PageFlags, VmFlags, Zone, PAGE_SHIFT, PAGE_SIZE,
    SUPERPAGE_ORDER, SUPERPAGE_SIZE,
};

/// Tree axis for address ordering.
pub const AXIS_ADDR: usize = 0;
/// Tree axis for size ordering (free regions only).
pub const AXIS_SIZE: usize = 1;

/// A physical page run belonging to an object.
#[derive(Debug, Clone)]
pub struct PageRecord {
    /// Page index within the owning object
    pub index: u64,
    /// Physical base address
    pub physical: u64,
    /// Page flags
    pub flags: PageFlags,
    /// Buddy zone the run came from
    pub zone: Zone,
    /// NUMA domain the run came from
    pub domain: u32,
    /// Buddy order: the record covers `2^(order+12)` bytes
    pub order: u8,
}

impl PageRecord {
    /// Byte span covered by this record.
    pub fn span(&self) -> u64 {
        PAGE_SIZE << self.order
    }
}

/// Shared handle to a [`VmObject`].
///
/// The strong count doubles as the object's reference count: it equals
/// the number of entries (and shadow children) pointing at the object.
pub type ObjectRef = Arc<Mutex<VmObject>>;

/// Object kind: plain backing store, or a shadow over a parent.
#[derive(Debug, Clone)]
pub enum ObjectKind {
    Backing,
    Shadow { parent: ObjectRef },
}

/// A logical set of pages referenced by one or more entries.
#[derive(Debug)]
pub struct VmObject {
    pub kind: ObjectKind,
    /// Page records sorted by index
    pub pages: Vec<PageRecord>,
    /// Total size in bytes
    pub size: u64,
}

impl VmObject {
    pub fn backing(size: u64, pages: Vec<PageRecord>) -> ObjectRef {
        Arc::new(Mutex::new(Self {
            kind: ObjectKind::Backing,
            pages,
            size,
        }))
    }

    pub fn shadow(parent: ObjectRef) -> ObjectRef {
        let size = parent.lock().size;
        Arc::new(Mutex::new(Self {
            kind: ObjectKind::Shadow { parent },
            pages: Vec::new(),
            size,
        }))
    }

    pub fn is_shadow(&self) -> bool {
        matches!(self.kind, ObjectKind::Shadow { .. })
    }
}

/// An allocated subrange of a block.
#[derive(Debug)]
pub struct EntryRecord {
    pub start: u64,
    pub size: u64,
    pub object: ObjectRef,
    pub offset: u64,
    pub flags: VmFlags,
    links: Links,
}

/// A free subrange of a block, indexed by address and by size.
#[derive(Debug, Default)]
pub struct FreeRecord {
    pub start: u64,
    pub size: u64,
    alinks: Links,
    slinks: Links,
}

/// Node-pool slot: an entry or a free region.
#[derive(Debug)]
pub enum VmSlot {
    Entry(EntryRecord),
    Free(FreeRecord),
}

impl VmSlot {
    fn start(&self) -> u64 {
        match self {
            VmSlot::Entry(e) => e.start,
            VmSlot::Free(f) => f.start,
        }
    }

    fn size(&self) -> u64 {
        match self {
            VmSlot::Entry(e) => e.size,
            VmSlot::Free(f) => f.size,
        }
    }

    fn as_entry(&self) -> &EntryRecord {
        match self {
            VmSlot::Entry(e) => e,
            VmSlot::Free(_) => panic!("slot is not an entry"),
        }
    }

    fn as_entry_mut(&mut self) -> &mut EntryRecord {
        match self {
            VmSlot::Entry(e) => e,
            VmSlot::Free(_) => panic!("slot is not an entry"),
        }
    }

    fn as_free(&self) -> &FreeRecord {
        match self {
            VmSlot::Free(f) => f,
            VmSlot::Entry(_) => panic!("slot is not a free region"),
        }
    }
}

impl TreeNode for VmSlot {
    fn links(&self, axis: usize) -> &Links {
        match self {
            VmSlot::Entry(e) => &e.links,
            VmSlot::Free(f) => {
                if axis == AXIS_SIZE {
                    &f.slinks
                } else {
                    &f.alinks
                }
            }
        }
    }

    fn links_mut(&mut self, axis: usize) -> &mut Links {
        match self {
            VmSlot::Entry(e) => &mut e.links,
            VmSlot::Free(f) => {
                if axis == AXIS_SIZE {
                    &mut f.slinks
                } else {
                    &mut f.alinks
                }
            }
        }
    }
}

fn cmp_addr(a: &VmSlot, b: &VmSlot) -> Ordering {
    a.start().cmp(&b.start())
}

fn cmp_size(a: &VmSlot, b: &VmSlot) -> Ordering {
    a.size().cmp(&b.size())
}

/// A contiguous virtual address range within one address space.
pub struct Block {
    /// First address of the block
    pub start: u64,
    /// Last address of the block (inclusive)
    pub end: u64,
    entries: Tree,
    frees_addr: Tree,
    frees_size: Tree,
}

impl Block {
    fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end,
            entries: Tree::new(AXIS_ADDR),
            frees_addr: Tree::new(AXIS_ADDR),
            frees_size: Tree::new(AXIS_SIZE),
        }
    }

    fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr <= self.end
    }

    /// Insert a free record into both indices; on a size-tree failure the
    /// address tree is rolled back.
    fn free_add(&mut self, pool: &mut Arena<VmSlot>, id: NodeId) -> KernelResult<()> {
        self.frees_addr.insert(pool, id, cmp_addr, false)?;
        if let Err(e) = self.frees_size.insert(pool, id, cmp_size, true) {
            self.frees_addr.remove(pool, id, cmp_addr);
            return Err(e);
        }
        Ok(())
    }

    /// Remove a free record from both indices.
    fn free_delete(&mut self, pool: &mut Arena<VmSlot>, id: NodeId) {
        let a = self.frees_addr.remove(pool, id, cmp_addr);
        let s = self.frees_size.remove(pool, id, cmp_size);
        debug_assert!(a.is_some() && s.is_some(), "free region missing from an index");
    }

    fn entry_add(&mut self, pool: &mut Arena<VmSlot>, id: NodeId) -> KernelResult<()> {
        self.entries.insert(pool, id, cmp_addr, false)
    }

    fn entry_delete(&mut self, pool: &mut Arena<VmSlot>, id: NodeId) -> Option<NodeId> {
        self.entries.remove(pool, id, cmp_addr)
    }

    /// Free region containing `addr`.
    fn find_free(&self, pool: &Arena<VmSlot>, addr: u64) -> Option<NodeId> {
        self.frees_addr.search(pool, |slot| {
            let f = slot.as_free();
            if addr >= f.start && addr < f.start + f.size {
                Ordering::Equal
            } else if addr < f.start {
                Ordering::Less
            } else {
                Ordering::Greater
            }
        })
    }

    /// Free region adjacent to `[start, end)` on either side.
    fn find_neighbor_free(&self, pool: &Arena<VmSlot>, start: u64, end: u64) -> Option<NodeId> {
        self.frees_addr.search(pool, |slot| {
            let f = slot.as_free();
            if end == f.start || start == f.start + f.size {
                Ordering::Equal
            } else if start < f.start {
                Ordering::Less
            } else {
                Ordering::Greater
            }
        })
    }

    /// Least-sufficient free region of at least `size` bytes: walk the
    /// size tree recording the smallest acceptable node while biasing
    /// left.
    fn search_fit_size(&self, pool: &Arena<VmSlot>, size: u64) -> Option<NodeId> {
        let mut best = None;
        let mut cur = self.frees_size.root();
        while let Some(id) = cur {
            let slot = pool.get(id)?;
            let f = slot.as_free();
            if size > f.size {
                cur = slot.links(AXIS_SIZE).right;
            } else {
                best = Some(id);
                cur = slot.links(AXIS_SIZE).left;
            }
        }
        best
    }

    /// Entry whose range contains `addr`.
    fn find_entry(&self, pool: &Arena<VmSlot>, addr: u64) -> Option<NodeId> {
        self.entries.search(pool, |slot| {
            let e = slot.as_entry();
            if addr >= e.start && addr < e.start + e.size {
                Ordering::Equal
            } else if addr < e.start {
                Ordering::Less
            } else {
                Ordering::Greater
            }
        })
    }

    /// Carve `[estart, estart + esize)` out of the free region `free_id`,
    /// re-adding up to two residuals.
    fn carve_free(
        &mut self,
        pool: &mut Arena<VmSlot>,
        free_id: NodeId,
        estart: u64,
        esize: u64,
    ) -> KernelResult<()> {
        let (fstart, fsize) = {
            let f = pool.get(free_id).ok_or(KernelError::Invalid)?.as_free();
            (f.start, f.size)
        };
        debug_assert!(estart >= fstart && estart + esize <= fstart + fsize);

        let lower = estart - fstart;
        let upper = (fstart + fsize) - (estart + esize);

        // Reserve residual slots before touching the trees so a pool
        // shortage leaves the region intact.
        let mut residuals: Vec<NodeId> = Vec::new();
        for (start, size) in [(fstart, lower), (estart + esize, upper)] {
            if size == 0 {
                continue;
            }
            let id = match pool.insert(VmSlot::Free(FreeRecord {
                start,
                size,
                ..FreeRecord::default()
            })) {
                Ok(id) => id,
                Err(e) => {
                    for r in residuals {
                        pool.remove(r);
                    }
                    return Err(e);
                }
            };
            residuals.push(id);
        }

        self.free_delete(pool, free_id);
        pool.remove(free_id);

        for (i, id) in residuals.iter().enumerate() {
            if let Err(e) = self.free_add(pool, *id) {
                // Roll back: pull out what went in, restore the original.
                for done in &residuals[..i] {
                    self.free_delete(pool, *done);
                }
                for r in &residuals {
                    pool.remove(*r);
                }
                if let Ok(orig) = pool.insert(VmSlot::Free(FreeRecord {
                    start: fstart,
                    size: fsize,
                    ..FreeRecord::default()
                })) {
                    let _ = self.free_add(pool, orig);
                }
                return Err(e);
            }
        }
        Ok(())
    }
}

/// Greatest order covering `addr1`/`addr2` with the remaining span, used
/// to wire superpages where alignment allows.
fn page_order(addr1: u64, addr2: u64, size: u64) -> u8 {
    let p1 = addr1 >> PAGE_SHIFT;
    let p2 = addr2 >> PAGE_SHIFT;
    let mut order: u32 = 0;
    loop {
        let mask = (2u64 << order) - 1;
        if p1 & mask != 0 || p2 & mask != 0 {
            break;
        }
        if (2u64 << (PAGE_SHIFT + order)) > size {
            break;
        }
        order += 1;
    }
    order as u8
}

/// Virtual memory manager for one address space.
pub struct VirtMemory {
    blocks: Vec<Block>,
    pool: Arena<VmSlot>,
    /// Address-space flags applied to every mapping (e.g. USER)
    pub flags: VmFlags,
    /// Architecture handle for this space
    pub space: ArchSpace,
}

impl VirtMemory {
    /// Create an address space over an existing architecture handle with
    /// a pre-reserved node pool of `pool_slots` records.
    pub fn new(space: ArchSpace, flags: VmFlags, pool_slots: usize) -> Self {
        Self {
            blocks: Vec::new(),
            pool: Arena::with_capacity(pool_slots),
            flags,
            space,
        }
    }

    /// Create a fresh user address space that refers to the kernel's
    /// blocks, so kernel addresses stay valid after a context switch.
    pub fn new_user(
        ifs: &dyn MemoryArchOps,
        kmem: &VirtMemory,
        pool_slots: usize,
    ) -> KernelResult<VirtMemory> {
        let space = ifs.new_space()?;
        let vm = VirtMemory::new(space, VmFlags::USER, pool_slots);
        for b in &kmem.blocks {
            ifs.refer(space, kmem.space, b.start, b.end - b.start + 1)?;
        }
        Ok(vm)
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    fn find_block(&self, addr: u64) -> Option<usize> {
        self.blocks.iter().position(|b| b.contains(addr))
    }

    /// Add a block covering `[start, end]` (inclusive).
    ///
    /// The range must not overlap an existing block; the architecture is
    /// asked to prepare page-table infrastructure for it, and a single
    /// free region covering the page-aligned subrange is installed.
    pub fn block_add(
        &mut self,
        ifs: &dyn MemoryArchOps,
        start: u64,
        end: u64,
    ) -> KernelResult<()> {
        let limit = end.checked_add(1).ok_or(KernelError::Invalid)?;
        if start >= limit {
            return Err(KernelError::Invalid);
        }
        if self
            .blocks
            .iter()
            .any(|b| start <= b.end && end >= b.start)
        {
            return Err(KernelError::Exists);
        }

        ifs.prepare(self.space, start, limit - start)?;

        let fr_start = align_up(start, PAGE_SIZE);
        let fr_size = align_down(limit, PAGE_SIZE).saturating_sub(fr_start);
        if fr_size == 0 {
            return Err(KernelError::Invalid);
        }

        let fid = self.pool.insert(VmSlot::Free(FreeRecord {
            start: fr_start,
            size: fr_size,
            ..FreeRecord::default()
        }))?;

        let mut block = Block::new(start, end);
        if let Err(e) = block.free_add(&mut self.pool, fid) {
            self.pool.remove(fid);
            return Err(e);
        }

        // Keep blocks in ascending start order.
        let pos = self
            .blocks
            .iter()
            .position(|b| b.start > start)
            .unwrap_or(self.blocks.len());
        self.blocks.insert(pos, block);
        Ok(())
    }

    /// Unmap and discard the page records in `pages`. With a physical
    /// allocator the runs go back to the buddy; wired runs never do.
    fn rollback_pages(
        &mut self,
        phys: Option<&mut PhysMemory>,
        ifs: &dyn MemoryArchOps,
        start: u64,
        pages: &[PageRecord],
    ) {
        let mut phys = phys;
        let mut virt = start;
        for p in pages {
            let _ = ifs.unmap(self.space, virt, p);
            if let Some(phys) = phys.as_deref_mut() {
                if !p.flags.contains(PageFlags::WIRED) {
                    phys.free(
                        phys.phys_to_virt(p.physical),
                        p.order as usize,
                        p.zone,
                        p.domain,
                    );
                }
            }
            virt += p.span();
        }
    }

    /// Install an entry and carve its free region; on failure the entry
    /// is taken back out of the index.
    fn install_entry(
        &mut self,
        block_idx: usize,
        free_id: NodeId,
        entry_id: NodeId,
        estart: u64,
        esize: u64,
    ) -> KernelResult<()> {
        let Self { blocks, pool, .. } = self;
        let block = &mut blocks[block_idx];
        block.entry_add(pool, entry_id)?;
        if let Err(e) = block.carve_free(pool, free_id, estart, esize) {
            block.entry_delete(pool, entry_id);
            return Err(e);
        }
        Ok(())
    }

    /// Reserve `[virt, virt + nr*4K)` backed by the caller-supplied
    /// physical range, using superpages where alignment allows. The
    /// resulting entry's pages are wired.
    pub fn wire(
        &mut self,
        ifs: &dyn MemoryArchOps,
        virt: u64,
        nr: usize,
        physical: u64,
    ) -> KernelResult<()> {
        if !page_aligned(virt) || !page_aligned(physical) {
            return Err(KernelError::Invalid);
        }
        let bidx = self.find_block(virt).ok_or(KernelError::NotFound)?;
        let free_id = self.blocks[bidx]
            .find_free(&self.pool, virt)
            .ok_or(KernelError::NotFound)?;
        let size = nr as u64 * PAGE_SIZE;
        {
            let f = self.pool.get(free_id).ok_or(KernelError::Invalid)?.as_free();
            if virt + size > f.start + f.size {
                return Err(KernelError::Invalid);
            }
        }

        // Build the page records, maximizing the order of each run.
        let mut pages = Vec::new();
        let end = virt + size;
        let (mut v, mut p, mut idx) = (virt, physical, 0u64);
        while v < end {
            let order = page_order(v, p, end - v);
            pages.push(PageRecord {
                index: idx,
                physical: p,
                flags: PageFlags::WIRED | PageFlags::RW,
                zone: Zone::Kernel,
                domain: 0,
                order,
            });
            v += PAGE_SIZE << order;
            p += PAGE_SIZE << order;
            idx += 1 << order;
        }

        // Map every record; unwind on the first failure.
        let flags = self.flags;
        let mut v = virt;
        for (i, page) in pages.iter().enumerate() {
            if ifs.map(self.space, v, page, flags).is_err() {
                let done = pages[..i].to_vec();
                self.rollback_pages(None, ifs, virt, &done);
                return Err(KernelError::OutOfMemory);
            }
            v += page.span();
        }

        let object = VmObject::backing(size, pages);
        let entry_id = match self.pool.insert(VmSlot::Entry(EntryRecord {
            start: virt,
            size,
            object: object.clone(),
            offset: 0,
            flags: VmFlags::RW,
            links: Links::default(),
        })) {
            Ok(id) => id,
            Err(e) => {
                let pages = object.lock().pages.clone();
                self.rollback_pages(None, ifs, virt, &pages);
                return Err(e);
            }
        };

        if let Err(e) = self.install_entry(bidx, free_id, entry_id, virt, size) {
            let pages = object.lock().pages.clone();
            self.rollback_pages(None, ifs, virt, &pages);
            self.pool.remove(entry_id);
            return Err(e);
        }
        Ok(())
    }

    /// Allocate and map `nr` pages somewhere inside one block.
    fn alloc_pages_block(
        &mut self,
        phys: &mut PhysMemory,
        ifs: &dyn MemoryArchOps,
        bidx: usize,
        nr: usize,
        zone: Zone,
        domain: u32,
    ) -> KernelResult<u64> {
        let size = nr as u64 * PAGE_SIZE;
        // Search a larger region when superpages are possible so the
        // start can be aligned up to a superpage boundary.
        let superpage = size >= SUPERPAGE_SIZE;
        let search = if superpage { size + SUPERPAGE_SIZE } else { size };
        let free_id = self.blocks[bidx]
            .search_fit_size(&self.pool, search)
            .ok_or(KernelError::NotFound)?;
        let fstart = self.pool.get(free_id).ok_or(KernelError::Invalid)?.as_free().start;
        let estart = if superpage {
            align_up(fstart, SUPERPAGE_SIZE)
        } else {
            fstart
        };

        // Allocate and map: as many superpages as fit, then 4 KiB pages.
        let flags = self.flags;
        let entry_flags = VmFlags::RW;
        let mut pages: Vec<PageRecord> = Vec::new();
        let mut i: u64 = 0;
        let step = 1u64 << SUPERPAGE_ORDER;
        let mut fail: Option<KernelError> = None;
        while i + step <= nr as u64 {
            match self.map_fresh_page(phys, ifs, estart, i, SUPERPAGE_ORDER, zone, domain, flags) {
                Ok(rec) => pages.push(rec),
                Err(e) => {
                    fail = Some(e);
                    break;
                }
            }
            i += step;
        }
        if fail.is_none() {
            while i < nr as u64 {
                match self.map_fresh_page(phys, ifs, estart, i, 0, zone, domain, flags) {
                    Ok(rec) => pages.push(rec),
                    Err(e) => {
                        fail = Some(e);
                        break;
                    }
                }
                i += 1;
            }
        }
        if let Some(e) = fail {
            self.rollback_pages(Some(phys), ifs, estart, &pages);
            return Err(e);
        }

        let object = VmObject::backing(size, pages);
        let entry_id = match self.pool.insert(VmSlot::Entry(EntryRecord {
            start: estart,
            size,
            object: object.clone(),
            offset: 0,
            flags: entry_flags,
            links: Links::default(),
        })) {
            Ok(id) => id,
            Err(e) => {
                let pages = object.lock().pages.clone();
                self.rollback_pages(Some(phys), ifs, estart, &pages);
                return Err(e);
            }
        };

        if let Err(e) = self.install_entry(bidx, free_id, entry_id, estart, size) {
            let pages = object.lock().pages.clone();
            self.rollback_pages(Some(phys), ifs, estart, &pages);
            self.pool.remove(entry_id);
            return Err(e);
        }
        Ok(estart)
    }

    /// Allocate one physical run of `order` and map it at
    /// `base + index * 4K`.
    #[allow(clippy::too_many_arguments)]
    fn map_fresh_page(
        &mut self,
        phys: &mut PhysMemory,
        ifs: &dyn MemoryArchOps,
        base: u64,
        index: u64,
        order: u8,
        zone: Zone,
        domain: u32,
        flags: VmFlags,
    ) -> KernelResult<PageRecord> {
        let vaddr = phys.alloc(order as usize, zone, domain)?;
        let rec = PageRecord {
            index,
            physical: phys.v2p(vaddr),
            flags: PageFlags::RW,
            zone,
            domain,
            order,
        };
        if ifs
            .map(self.space, base + index * PAGE_SIZE, &rec, flags)
            .is_err()
        {
            phys.free(vaddr, order as usize, zone, domain);
            return Err(KernelError::OutOfMemory);
        }
        Ok(rec)
    }

    /// Allocate `nr` pages, scanning blocks in address order.
    pub fn alloc_pages(
        &mut self,
        phys: &mut PhysMemory,
        ifs: &dyn MemoryArchOps,
        nr: usize,
        zone: Zone,
        domain: u32,
    ) -> KernelResult<u64> {
        if nr == 0 {
            return Err(KernelError::Invalid);
        }
        for bidx in 0..self.blocks.len() {
            match self.alloc_pages_block(phys, ifs, bidx, nr, zone, domain) {
                Ok(addr) => return Ok(addr),
                Err(KernelError::NotFound) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(KernelError::OutOfMemory)
    }

    /// Allocate `nr` pages at exactly `virt`.
    pub fn alloc_pages_at(
        &mut self,
        phys: &mut PhysMemory,
        ifs: &dyn MemoryArchOps,
        virt: u64,
        nr: usize,
        zone: Zone,
        domain: u32,
    ) -> KernelResult<u64> {
        if !page_aligned(virt) || nr == 0 {
            return Err(KernelError::Invalid);
        }
        let bidx = self.find_block(virt).ok_or(KernelError::NotFound)?;
        let free_id = self.blocks[bidx]
            .find_free(&self.pool, virt)
            .ok_or(KernelError::NotFound)?;
        let size = nr as u64 * PAGE_SIZE;
        {
            let f = self.pool.get(free_id).ok_or(KernelError::Invalid)?.as_free();
            if virt + size > f.start + f.size {
                return Err(KernelError::Invalid);
            }
        }

        let flags = self.flags;
        let mut pages: Vec<PageRecord> = Vec::new();
        for i in 0..nr as u64 {
            match self.map_fresh_page(phys, ifs, virt, i, 0, zone, domain, flags) {
                Ok(rec) => pages.push(rec),
                Err(e) => {
                    self.rollback_pages(Some(phys), ifs, virt, &pages);
                    return Err(e);
                }
            }
        }

        let object = VmObject::backing(size, pages);
        let entry_id = match self.pool.insert(VmSlot::Entry(EntryRecord {
            start: virt,
            size,
            object: object.clone(),
            offset: 0,
            flags: VmFlags::RW,
            links: Links::default(),
        })) {
            Ok(id) => id,
            Err(e) => {
                let pages = object.lock().pages.clone();
                self.rollback_pages(Some(phys), ifs, virt, &pages);
                return Err(e);
            }
        };

        if let Err(e) = self.install_entry(bidx, free_id, entry_id, virt, size) {
            let pages = object.lock().pages.clone();
            self.rollback_pages(Some(phys), ifs, virt, &pages);
            self.pool.remove(entry_id);
            return Err(e);
        }
        Ok(virt)
    }

    /// Free the entry starting at exactly `ptr`: unmap it, return its
    /// physical pages when the object is no longer shared, and coalesce
    /// the freed range with any address-adjacent free region.
    pub fn free_pages(
        &mut self,
        phys: &mut PhysMemory,
        ifs: &dyn MemoryArchOps,
        ptr: u64,
    ) -> KernelResult<()> {
        let bidx = self.find_block(ptr).ok_or(KernelError::NotFound)?;
        let entry_id = self.blocks[bidx]
            .find_entry(&self.pool, ptr)
            .ok_or(KernelError::NotFound)?;
        let (start, size, object) = {
            let e = self.pool.get(entry_id).ok_or(KernelError::Invalid)?.as_entry();
            if e.start != ptr {
                return Err(KernelError::Invalid);
            }
            (e.start, e.size, e.object.clone())
        };

        self.blocks[bidx].entry_delete(&mut self.pool, entry_id);

        // The entry's handle plus ours: a count of two means no other
        // entry or shadow still references the object.
        let last_reference = Arc::strong_count(&object) == 2;
        {
            let obj = object.lock();
            let mut virt = start;
            for p in &obj.pages {
                let _ = ifs.unmap(self.space, virt, p);
                if last_reference && !p.flags.contains(PageFlags::WIRED) {
                    phys.free(
                        phys.phys_to_virt(p.physical),
                        p.order as usize,
                        p.zone,
                        p.domain,
                    );
                }
                virt += p.span();
            }
        }
        drop(object);

        // Reuse the entry's slot as the free record.
        self.pool.replace(
            entry_id,
            VmSlot::Free(FreeRecord {
                start,
                size,
                ..FreeRecord::default()
            }),
        );

        // Absorb address-adjacent free regions from either side, then
        // index the merged region.
        let (mut start, mut end) = (start, start + size);
        loop {
            let neighbor = self.blocks[bidx].find_neighbor_free(&self.pool, start, end);
            let nid = match neighbor {
                Some(id) if id != entry_id => id,
                _ => break,
            };
            let (nstart, nsize) = {
                let f = self.pool.get(nid).ok_or(KernelError::Invalid)?.as_free();
                (f.start, f.size)
            };
            self.blocks[bidx].free_delete(&mut self.pool, nid);
            self.pool.remove(nid);
            if nstart == end {
                end = nstart + nsize;
            } else {
                start = nstart;
            }
        }
        if let Some(VmSlot::Free(f)) = self.pool.get_mut(entry_id) {
            f.start = start;
            f.size = end - start;
        }
        let Self { blocks, pool, .. } = self;
        blocks[bidx].free_add(pool, entry_id)
    }

    /// Does `[ptr, ptr + len)` lie wholly inside one entry of this
    /// address space?
    pub fn contains_range(&self, ptr: u64, len: u64) -> bool {
        if len == 0 {
            return false;
        }
        let Some(bidx) = self.find_block(ptr) else {
            return false;
        };
        let Some(eid) = self.blocks[bidx].find_entry(&self.pool, ptr) else {
            return false;
        };
        let Some(slot) = self.pool.get(eid) else {
            return false;
        };
        let e = slot.as_entry();
        ptr >= e.start && ptr + len <= e.start + e.size
    }

    /// Look up the entry covering `addr` and return (start, size, flags,
    /// object).
    pub fn entry_at(&self, addr: u64) -> Option<(u64, u64, VmFlags, ObjectRef)> {
        let bidx = self.find_block(addr)?;
        let eid = self.blocks[bidx].find_entry(&self.pool, addr)?;
        let e = self.pool.get(eid)?.as_entry();
        Some((e.start, e.size, e.flags, e.object.clone()))
    }

    /// Clone `src`'s blocks and entries into `dst` for fork.
    ///
    /// Every entry in `src` gets a fresh shadow object on both sides,
    /// the former object becomes the shadows' shared parent, and both
    /// entries are marked copy-on-write. No pages are copied.
    pub fn fork(dst: &mut VirtMemory, src: &mut VirtMemory) -> KernelResult<()> {
        for sbidx in 0..src.blocks.len() {
            let (bstart, bend) = (src.blocks[sbidx].start, src.blocks[sbidx].end);
            let mut nb = Block::new(bstart, bend);
            let entry_ids = src.blocks[sbidx].entries.ids(&src.pool);
            let mut added: Vec<NodeId> = Vec::new();

            let mut fail = None;
            for eid in entry_ids {
                let (start, size, offset, flags, parent) = {
                    let e = src.pool.get(eid).ok_or(KernelError::Invalid)?.as_entry();
                    (e.start, e.size, e.offset, e.flags, e.object.clone())
                };

                let src_shadow = VmObject::shadow(parent.clone());
                let dst_shadow = VmObject::shadow(parent.clone());

                let nid = match dst.pool.insert(VmSlot::Entry(EntryRecord {
                    start,
                    size,
                    object: dst_shadow,
                    offset,
                    flags: flags | VmFlags::COW,
                    links: Links::default(),
                })) {
                    Ok(id) => id,
                    Err(e) => {
                        fail = Some(e);
                        break;
                    }
                };
                if let Err(e) = nb.entry_add(&mut dst.pool, nid) {
                    dst.pool.remove(nid);
                    fail = Some(e);
                    break;
                }
                added.push(nid);

                // Swap the source entry onto its shadow; the parent keeps
                // one reference per shadow.
                let e = src.pool.get_mut(eid).ok_or(KernelError::Invalid)?.as_entry_mut();
                e.object = src_shadow;
                e.flags |= VmFlags::COW;
            }

            if let Some(e) = fail {
                for nid in added {
                    nb.entry_delete(&mut dst.pool, nid);
                    dst.pool.remove(nid);
                }
                return Err(e);
            }

            let pos = dst
                .blocks
                .iter()
                .position(|b| b.start > bstart)
                .unwrap_or(dst.blocks.len());
            dst.blocks.insert(pos, nb);
        }
        Ok(())
    }

    /// Walk every entry of every block: `(start, size, flags, object)`.
    pub fn entries(&self) -> Vec<(u64, u64, VmFlags, ObjectRef)> {
        let mut out = Vec::new();
        for b in &self.blocks {
            b.entries.walk(&self.pool, |_, slot| {
                let e = slot.as_entry();
                out.push((e.start, e.size, e.flags, e.object.clone()));
            });
        }
        out
    }

    /// Walk every free region of every block: `(start, size)`.
    pub fn free_regions(&self) -> Vec<(u64, u64)> {
        let mut out = Vec::new();
        for b in &self.blocks {
            b.frees_addr.walk(&self.pool, |_, slot| {
                let f = slot.as_free();
                out.push((f.start, f.size));
            });
        }
        out
    }

    /// Check the block coverage invariants: every page-aligned byte of
    /// every block is in exactly one of an entry or a free region, and no
    /// two free regions are address-adjacent.
    #[cfg(test)]
    pub fn check_invariants(&self) {
        for b in &self.blocks {
            let mut spans: Vec<(u64, u64, bool)> = Vec::new();
            b.entries.walk(&self.pool, |_, slot| {
                let e = slot.as_entry();
                spans.push((e.start, e.size, false));
            });
            b.frees_addr.walk(&self.pool, |_, slot| {
                let f = slot.as_free();
                spans.push((f.start, f.size, true));
            });
            spans.sort_unstable_by_key(|(s, _, _)| *s);

            let lo = align_up(b.start, PAGE_SIZE);
            let hi = align_down(b.end + 1, PAGE_SIZE);
            let mut cursor = lo;
            let mut prev_free = false;
            for (start, size, is_free) in spans {
                assert_eq!(start, cursor, "gap or overlap at {:#x}", start);
                assert!(
                    !(prev_free && is_free),
                    "adjacent free regions at {:#x}",
                    start
                );
                cursor = start + size;
                prev_free = is_free;
            }
            assert_eq!(cursor, hi, "coverage stops short of the block end");
        }
    }
}
