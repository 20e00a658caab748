//! Single-producer single-consumer byte ring.
//!
//! Fixed 8 KiB storage; `head` is written only by the consumer and
//! `tail` only by the producer. Each side publishes its own index with a
//! release store and observes the peer with an acquire load, so the ring
//! needs no lock as long as each side has a single writer; multiple
//! writers on the same side serialize on the owning devfs entry's lock.
//!
//! Empty iff `head == tail`; full iff `next(tail) == head`, which leaves
//! one slot unused.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Ring capacity in bytes (one slot stays unused).
pub const RING_SIZE: usize = 8192;

pub struct Ring {
    buf: UnsafeCell<[u8; RING_SIZE]>,
    head: AtomicUsize,
    tail: AtomicUsize,
}

// SAFETY: head/tail are atomics and each byte of `buf` is written only by
// the producer before the release store of `tail` that publishes it, and
// read only by the consumer after the acquire load of `tail` that
// observes it. The SPSC discipline is the caller's contract.
unsafe impl Sync for Ring {}

impl Default for Ring {
    fn default() -> Self {
        Self::new()
    }
}

impl Ring {
    pub const fn new() -> Self {
        Self {
            buf: UnsafeCell::new([0; RING_SIZE]),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    fn next(i: usize) -> usize {
        if i + 1 < RING_SIZE {
            i + 1
        } else {
            0
        }
    }

    /// Producer side: append one byte. Fails when the ring is full.
    pub fn put(&self, byte: u8) -> Result<(), u8> {
        let tail = self.tail.load(Ordering::Relaxed);
        let next = Self::next(tail);
        if self.head.load(Ordering::Acquire) == next {
            return Err(byte);
        }
        // SAFETY: `tail` is owned by the single producer and the slot at
        // `tail` is outside the consumer's published window.
        unsafe {
            (*self.buf.get())[tail] = byte;
        }
        self.tail.store(next, Ordering::Release);
        Ok(())
    }

    /// Consumer side: take one byte. `None` when the ring is empty.
    pub fn get(&self) -> Option<u8> {
        let head = self.head.load(Ordering::Relaxed);
        if head == self.tail.load(Ordering::Acquire) {
            return None;
        }
        // SAFETY: the acquire load of `tail` above makes the producer's
        // write of this slot visible, and `head` is owned by the single
        // consumer.
        let byte = unsafe { (*self.buf.get())[head] };
        self.head.store(Self::next(head), Ordering::Release);
        Some(byte)
    }

    /// Bytes currently queued.
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        if tail >= head {
            tail - head
        } else {
            RING_SIZE + tail - head
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Can another byte be queued?
    pub fn has_room(&self) -> bool {
        self.len() < RING_SIZE - 1
    }
}
