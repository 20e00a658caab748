//! Arena-backed unbalanced binary search trees.
//!
//! The free-space and entry indices of the virtual memory manager need a
//! tree whose nodes live inside a pre-reserved pool, because the pool has
//! to work before the general allocator does. Records are stored in an
//! [`Arena`] and addressed by [`NodeId`]; a record that participates in
//! more than one tree carries one [`Links`] pair per tree, selected by an
//! axis index.
//!
//! The shape mirrors the classic unbalanced BST: insert descends by a
//! caller-supplied comparator (duplicates optionally allowed, biased
//! left), delete splices the node out by lifting its left subtree and
//! re-attaching the right subtree at the left subtree's rightmost edge,
//! and search walks by an arbitrary predicate.

extern crate alloc;

use alloc::vec::Vec;
use core::cmp::Ordering;

use crate::error::{KernelError, KernelResult};

/// Handle to a slot in an [`Arena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeId(u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Child links for one tree axis.
#[derive(Debug, Clone, Copy, Default)]
pub struct Links {
    pub left: Option<NodeId>,
    pub right: Option<NodeId>,
}

/// A record that can be indexed by one or more trees.
pub trait TreeNode {
    fn links(&self, axis: usize) -> &Links;
    fn links_mut(&mut self, axis: usize) -> &mut Links;
}

enum Slot<T> {
    Vacant { next: Option<u32> },
    Used(T),
}

/// Fixed-capacity slot arena with an internal freelist.
///
/// The capacity is chosen at construction; exhaustion reports
/// `OutOfMemory` rather than growing, which is what lets an address space
/// pre-reserve its bookkeeping nodes up front.
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free_head: Option<u32>,
    len: usize,
}

impl<T> Arena<T> {
    /// Create an arena with room for `capacity` records.
    pub fn with_capacity(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        for i in 0..capacity {
            let next = if i + 1 < capacity {
                Some(i as u32 + 1)
            } else {
                None
            };
            slots.push(Slot::Vacant { next });
        }
        Self {
            slots,
            free_head: if capacity > 0 { Some(0) } else { None },
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Store a record, returning its handle.
    pub fn insert(&mut self, value: T) -> KernelResult<NodeId> {
        let idx = self.free_head.ok_or(KernelError::OutOfMemory)?;
        match self.slots[idx as usize] {
            Slot::Vacant { next } => self.free_head = next,
            Slot::Used(_) => unreachable!("freelist points at a used slot"),
        }
        self.slots[idx as usize] = Slot::Used(value);
        self.len += 1;
        Ok(NodeId(idx))
    }

    /// Remove a record, returning it.
    pub fn remove(&mut self, id: NodeId) -> Option<T> {
        let slot = self.slots.get_mut(id.index())?;
        if matches!(slot, Slot::Vacant { .. }) {
            return None;
        }
        let old = core::mem::replace(
            slot,
            Slot::Vacant {
                next: self.free_head,
            },
        );
        self.free_head = Some(id.0);
        self.len -= 1;
        match old {
            Slot::Used(v) => Some(v),
            Slot::Vacant { .. } => unreachable!(),
        }
    }

    /// Replace the record in `id` without recycling the slot.
    pub fn replace(&mut self, id: NodeId, value: T) -> Option<T> {
        let slot = self.slots.get_mut(id.index())?;
        match slot {
            Slot::Vacant { .. } => None,
            Slot::Used(_) => match core::mem::replace(slot, Slot::Used(value)) {
                Slot::Used(v) => Some(v),
                Slot::Vacant { .. } => unreachable!(),
            },
        }
    }

    pub fn get(&self, id: NodeId) -> Option<&T> {
        match self.slots.get(id.index())? {
            Slot::Used(v) => Some(v),
            Slot::Vacant { .. } => None,
        }
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut T> {
        match self.slots.get_mut(id.index())? {
            Slot::Used(v) => Some(v),
            Slot::Vacant { .. } => None,
        }
    }
}

/// An unbalanced BST over records held in an [`Arena`].
#[derive(Debug, Clone, Copy)]
pub struct Tree {
    root: Option<NodeId>,
    axis: usize,
}

impl Tree {
    pub const fn new(axis: usize) -> Self {
        Self { root: None, axis }
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Insert `id` using `cmp` for ordering.
    ///
    /// With `allow_dup`, records comparing equal descend left, so equal
    /// keys stay reachable by an equal-goes-left search. Without it an
    /// equal key is rejected with `Exists`.
    pub fn insert<T: TreeNode>(
        &mut self,
        arena: &mut Arena<T>,
        id: NodeId,
        cmp: impl Fn(&T, &T) -> Ordering,
        allow_dup: bool,
    ) -> KernelResult<()> {
        *arena
            .get_mut(id)
            .ok_or(KernelError::Invalid)?
            .links_mut(self.axis) = Links::default();

        let mut cur = match self.root {
            None => {
                self.root = Some(id);
                return Ok(());
            }
            Some(r) => r,
        };

        loop {
            let ord = {
                let new = arena.get(id).ok_or(KernelError::Invalid)?;
                let node = arena.get(cur).ok_or(KernelError::Invalid)?;
                cmp(new, node)
            };
            if ord == Ordering::Equal && !allow_dup {
                return Err(KernelError::Exists);
            }
            let go_right = ord == Ordering::Greater;
            let next = {
                let links = arena.get(cur).ok_or(KernelError::Invalid)?.links(self.axis);
                if go_right {
                    links.right
                } else {
                    links.left
                }
            };
            match next {
                Some(n) => cur = n,
                None => {
                    let links = arena
                        .get_mut(cur)
                        .ok_or(KernelError::Invalid)?
                        .links_mut(self.axis);
                    if go_right {
                        links.right = Some(id);
                    } else {
                        links.left = Some(id);
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Remove `id` from the tree; the record stays in the arena.
    pub fn remove<T: TreeNode>(
        &mut self,
        arena: &mut Arena<T>,
        id: NodeId,
        cmp: impl Fn(&T, &T) -> Ordering,
    ) -> Option<NodeId> {
        // Descend towards `id`, remembering which parent link to patch.
        let mut parent: Option<(NodeId, bool)> = None;
        let mut cur = self.root?;
        while cur != id {
            let ord = cmp(arena.get(id)?, arena.get(cur)?);
            let go_right = ord == Ordering::Greater;
            let links = arena.get(cur)?.links(self.axis);
            let next = if go_right { links.right } else { links.left };
            parent = Some((cur, go_right));
            cur = next?;
        }

        let (left, right) = {
            let links = arena.get(id)?.links(self.axis);
            (links.left, links.right)
        };

        // Splice: lift the left subtree and hang the right subtree off its
        // rightmost node.
        let replacement = match (left, right) {
            (Some(l), Some(r)) => {
                let mut rightmost = l;
                while let Some(next) = arena.get(rightmost)?.links(self.axis).right {
                    rightmost = next;
                }
                arena.get_mut(rightmost)?.links_mut(self.axis).right = Some(r);
                Some(l)
            }
            (Some(l), None) => Some(l),
            (None, Some(r)) => Some(r),
            (None, None) => None,
        };

        match parent {
            None => self.root = replacement,
            Some((p, true)) => arena.get_mut(p)?.links_mut(self.axis).right = replacement,
            Some((p, false)) => arena.get_mut(p)?.links_mut(self.axis).left = replacement,
        }

        *arena.get_mut(id)?.links_mut(self.axis) = Links::default();
        Some(id)
    }

    /// Search by predicate: `Equal` stops, `Less` descends left, `Greater`
    /// descends right.
    pub fn search<T: TreeNode>(
        &self,
        arena: &Arena<T>,
        mut pred: impl FnMut(&T) -> Ordering,
    ) -> Option<NodeId> {
        let mut cur = self.root;
        while let Some(id) = cur {
            let node = arena.get(id)?;
            match pred(node) {
                Ordering::Equal => return Some(id),
                Ordering::Less => cur = node.links(self.axis).left,
                Ordering::Greater => cur = node.links(self.axis).right,
            }
        }
        None
    }

    /// Visit every node in key order.
    pub fn walk<T: TreeNode>(&self, arena: &Arena<T>, mut visit: impl FnMut(NodeId, &T)) {
        let mut stack: Vec<NodeId> = Vec::new();
        let mut cur = self.root;
        while cur.is_some() || !stack.is_empty() {
            while let Some(id) = cur {
                stack.push(id);
                cur = arena.get(id).and_then(|n| n.links(self.axis).left);
            }
            let id = match stack.pop() {
                Some(id) => id,
                None => break,
            };
            if let Some(node) = arena.get(id) {
                visit(id, node);
                cur = node.links(self.axis).right;
            }
        }
    }

    /// Collect the node ids in key order.
    pub fn ids<T: TreeNode>(&self, arena: &Arena<T>) -> Vec<NodeId> {
        let mut out = Vec::new();
        self.walk(arena, |id, _| out.push(id));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Rec {
        key: u64,
        links: Links,
    }

    impl Rec {
        fn new(key: u64) -> Self {
            Self {
                key,
                links: Links::default(),
            }
        }
    }

    impl TreeNode for Rec {
        fn links(&self, _axis: usize) -> &Links {
            &self.links
        }
        fn links_mut(&mut self, _axis: usize) -> &mut Links {
            &mut self.links
        }
    }

    fn by_key(a: &Rec, b: &Rec) -> Ordering {
        a.key.cmp(&b.key)
    }

    #[test]
    fn arena_exhaustion_reports_oom() {
        let mut arena: Arena<Rec> = Arena::with_capacity(2);
        arena.insert(Rec::new(1)).unwrap();
        arena.insert(Rec::new(2)).unwrap();
        assert_eq!(arena.insert(Rec::new(3)), Err(KernelError::OutOfMemory));
    }

    #[test]
    fn arena_recycles_slots() {
        let mut arena: Arena<Rec> = Arena::with_capacity(2);
        let a = arena.insert(Rec::new(1)).unwrap();
        arena.insert(Rec::new(2)).unwrap();
        assert!(arena.remove(a).is_some());
        assert!(arena.insert(Rec::new(3)).is_ok());
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn insert_search_delete() {
        let mut arena: Arena<Rec> = Arena::with_capacity(16);
        let mut tree = Tree::new(0);
        let keys = [50u64, 20, 70, 10, 30, 60, 80, 25];
        let mut ids = Vec::new();
        for k in keys {
            let id = arena.insert(Rec::new(k)).unwrap();
            tree.insert(&mut arena, id, by_key, false).unwrap();
            ids.push(id);
        }

        // In-order walk yields sorted keys
        let mut seen = Vec::new();
        tree.walk(&arena, |_, r| seen.push(r.key));
        let mut sorted = keys.to_vec();
        sorted.sort_unstable();
        assert_eq!(seen, sorted);

        // Point search
        for k in keys {
            let hit = tree.search(&arena, |r| k.cmp(&r.key));
            assert!(hit.is_some(), "key {} must be found", k);
        }
        assert!(tree.search(&arena, |r| 99u64.cmp(&r.key)).is_none());

        // Delete interior nodes and re-verify ordering each time
        for (id, k) in ids.iter().zip(keys) {
            assert_eq!(tree.remove(&mut arena, *id, by_key), Some(*id));
            assert!(tree.search(&arena, |r| k.cmp(&r.key)).is_none());
            let mut seen = Vec::new();
            tree.walk(&arena, |_, r| seen.push(r.key));
            let mut expect: Vec<u64> = seen.clone();
            expect.sort_unstable();
            assert_eq!(seen, expect, "in-order invariant broken after delete");
        }
        assert!(tree.is_empty());
    }

    #[test]
    fn duplicate_rejected_without_allow_dup() {
        let mut arena: Arena<Rec> = Arena::with_capacity(4);
        let mut tree = Tree::new(0);
        let a = arena.insert(Rec::new(5)).unwrap();
        let b = arena.insert(Rec::new(5)).unwrap();
        tree.insert(&mut arena, a, by_key, false).unwrap();
        assert_eq!(
            tree.insert(&mut arena, b, by_key, false),
            Err(KernelError::Exists)
        );
    }

    #[test]
    fn duplicates_stay_reachable_with_allow_dup() {
        let mut arena: Arena<Rec> = Arena::with_capacity(8);
        let mut tree = Tree::new(0);
        let mut ids = Vec::new();
        for k in [5u64, 3, 5, 7, 5] {
            let id = arena.insert(Rec::new(k)).unwrap();
            tree.insert(&mut arena, id, by_key, true).unwrap();
            ids.push(id);
        }
        // All three 5s removable by identity
        for id in ids {
            assert_eq!(tree.remove(&mut arena, id, by_key), Some(id));
        }
        assert!(tree.is_empty());
    }

    #[test]
    fn two_axis_record() {
        struct Dual {
            key_a: u64,
            key_b: u64,
            links: [Links; 2],
        }
        impl TreeNode for Dual {
            fn links(&self, axis: usize) -> &Links {
                &self.links[axis]
            }
            fn links_mut(&mut self, axis: usize) -> &mut Links {
                &mut self.links[axis]
            }
        }

        let mut arena: Arena<Dual> = Arena::with_capacity(8);
        let mut ta = Tree::new(0);
        let mut tb = Tree::new(1);
        // key_b deliberately reverses key_a's order
        for (a, b) in [(1u64, 30u64), (2, 20), (3, 10)] {
            let id = arena
                .insert(Dual {
                    key_a: a,
                    key_b: b,
                    links: [Links::default(); 2],
                })
                .unwrap();
            ta.insert(&mut arena, id, |x, y| x.key_a.cmp(&y.key_a), false)
                .unwrap();
            tb.insert(&mut arena, id, |x, y| x.key_b.cmp(&y.key_b), true)
                .unwrap();
        }
        let mut order_a = Vec::new();
        ta.walk(&arena, |_, r| order_a.push(r.key_a));
        let mut order_b = Vec::new();
        tb.walk(&arena, |_, r| order_b.push(r.key_b));
        assert_eq!(order_a, [1, 2, 3]);
        assert_eq!(order_b, [10, 20, 30]);
    }
}
