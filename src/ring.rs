//! Fixed-capacity frame ring buffer
//!
//! One producer (the capture loop) fills the tail slot, one consumer (the
//! recording loop) drains the head slot, and any number of preview readers may
//! look at the most recently published slot without consuming it.
//!
//! - Slot storage is allocated once and never reallocated
//! - `head`/`tail` are plain atomics, each advanced by exactly one side
//! - One slot is always left free so full and empty are distinguishable
//! - Reads are scoped: a [`ReadGuard`] retires its slot exactly once on drop
//!
//! Every slot also sits behind its own `RwLock`. The index protocol already
//! keeps producer and consumer apart, so these locks are uncontended; they exist
//! so preview readers (which race the producer by nature) stay memory safe.
//! Preview only ever calls `try_read` and never blocks.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use thiserror::Error;
use tracing::{debug, info, warn};

/// High bit of `head`: the consumer holds the head slot.
const BORROWED: usize = 1 << (usize::BITS - 1);

/// `last_produced` value before anything was published.
const NOTHING_PRODUCED: usize = usize::MAX;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    #[error("ring buffer is full")]
    Full,

    #[error("ring buffer needs at least 2 slots, got {0}")]
    TooSmall(usize),

    #[error("slot length must be > 0")]
    EmptySlot,
}

/// What the producer gets when every slot holds unread data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Evict the oldest unread slot and count it as dropped. Never fails.
    #[default]
    Overwrite,

    /// Refuse the write with [`RingError::Full`]; the caller retries.
    Reject,
}

/// Lock-free SPSC ring of fixed-size slots
pub struct RingBuffer<T = u8> {
    slots: Box<[RwLock<Box<[T]>>]>,
    slot_len: usize,
    policy: OverflowPolicy,

    head: AtomicUsize,
    tail: AtomicUsize,
    last_produced: AtomicUsize,

    produced: AtomicU64,
    dropped: AtomicU64,
    full_logged: AtomicBool,
}

impl<T: Copy + Default> RingBuffer<T> {
    /// Creates a ring with `capacity` slots of `slot_len` elements each
    pub fn new(capacity: usize, slot_len: usize, policy: OverflowPolicy) -> Result<Self, RingError> {
        if capacity < 2 {
            return Err(RingError::TooSmall(capacity));
        }
        if slot_len == 0 {
            return Err(RingError::EmptySlot);
        }

        let slots = (0..capacity)
            .map(|_| RwLock::new(vec![T::default(); slot_len].into_boxed_slice()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let total_bytes = capacity * slot_len * std::mem::size_of::<T>();
        info!(
            slots = %capacity,
            slot_bytes = %(slot_len * std::mem::size_of::<T>()),
            total_mib = %(total_bytes / 1024 / 1024),
            policy = ?policy,
            "Ring buffer created"
        );

        Ok(Self {
            slots,
            slot_len,
            policy,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            last_produced: AtomicUsize::new(NOTHING_PRODUCED),
            produced: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            full_logged: AtomicBool::new(false),
        })
    }

    /// Sizes the ring to fit `budget_bytes` of slot storage
    pub fn with_budget(budget_bytes: usize, slot_len: usize, policy: OverflowPolicy) -> Result<Self, RingError> {
        let slot_bytes = slot_len * std::mem::size_of::<T>();
        if slot_bytes == 0 {
            return Err(RingError::EmptySlot);
        }
        Self::new(budget_bytes / slot_bytes, slot_len, policy)
    }
}

impl<T> RingBuffer<T> {
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Elements per slot
    pub fn slot_len(&self) -> usize {
        self.slot_len
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Number of published, not yet retired slots (`0..=capacity - 1`)
    pub fn occupancy(&self) -> usize {
        let head = self.head.load(Ordering::Acquire) & !BORROWED;
        let tail = self.tail.load(Ordering::Acquire);
        (tail + self.capacity() - head) % self.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.occupancy() == 0
    }

    pub fn is_full(&self) -> bool {
        self.occupancy() == self.capacity() - 1
    }

    /// Fraction of the capacity holding unread frames, in `[0, 1)`
    pub fn fullness(&self) -> f32 {
        self.occupancy() as f32 / self.capacity() as f32
    }

    /// Frames lost to the overflow policy
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Frames published so far; doubles as the sequence number of the latest one
    pub fn produced(&self) -> u64 {
        self.produced.load(Ordering::Acquire)
    }

    fn next(&self, index: usize) -> usize {
        (index + 1) % self.capacity()
    }

    /// Hands the producer the tail slot to fill.
    ///
    /// Under [`OverflowPolicy::Reject`] this fails with [`RingError::Full`] when
    /// no slot is free. Under `Overwrite` it always succeeds; the eviction
    /// happens in [`WriteSlot::finalize`].
    ///
    /// Producer side only.
    pub fn acquire_write_slot(&self) -> Result<WriteSlot<'_, T>, RingError> {
        let tail = self.tail.load(Ordering::Relaxed);

        if self.policy == OverflowPolicy::Reject && self.next(tail) == self.head_index() {
            self.log_full_once("rejecting new frame");
            return Err(RingError::Full);
        }

        Ok(WriteSlot {
            ring: self,
            index: tail,
            guard: self.slots[tail].write(),
        })
    }

    /// Borrows the oldest unread slot without retiring it.
    ///
    /// Returns `None` when the ring is empty or the head slot is already
    /// borrowed. Consumer side only.
    pub fn dequeue(&self) -> Option<ReadGuard<'_, T>> {
        loop {
            let head = self.head.load(Ordering::Acquire);
            if head & BORROWED != 0 {
                return None;
            }
            if head == self.tail.load(Ordering::Acquire) {
                return None;
            }

            // Fails only when the producer evicted this slot in the meantime
            if self
                .head
                .compare_exchange(head, head | BORROWED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(ReadGuard {
                    ring: self,
                    index: head,
                    guard: Some(self.slots[head].read()),
                });
            }
        }
    }

    /// Most recently published slot, for preview.
    ///
    /// Never consumes and never blocks: if the slot is momentarily being
    /// rewritten this returns `None` and the caller tries again next refresh.
    pub fn peek_last(&self) -> Option<SlotView<'_, T>> {
        let sequence = self.produced.load(Ordering::Acquire);
        let index = self.last_produced.load(Ordering::Acquire);
        if index == NOTHING_PRODUCED {
            return None;
        }

        let guard = self.slots[index].try_read()?;
        Some(SlotView {
            index,
            sequence,
            guard,
        })
    }

    fn head_index(&self) -> usize {
        self.head.load(Ordering::Acquire) & !BORROWED
    }

    /// Makes slot `index` (the current tail) visible to the consumer.
    /// Returns false when the frame had to be discarded instead.
    fn publish(&self, index: usize) -> bool {
        let next = self.next(index);

        loop {
            let head = self.head.load(Ordering::Acquire);
            if next != head & !BORROWED {
                break;
            }

            // Publishing would wrap onto head: evict the oldest unread frame
            if head & BORROWED != 0 {
                // The consumer is still reading it, so the new frame goes instead
                self.dropped.fetch_add(1, Ordering::Relaxed);
                self.log_full_once("consumer busy, discarding newest frame");
                return false;
            }

            if self
                .head
                .compare_exchange(head, self.next(head), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                self.log_full_once("overwriting oldest frame");
                break;
            }
        }

        self.tail.store(next, Ordering::Release);
        self.last_produced.store(index, Ordering::Release);
        self.produced.fetch_add(1, Ordering::Release);

        if self.full_logged.load(Ordering::Relaxed) && !self.is_full() {
            self.full_logged.store(false, Ordering::Relaxed);
        }
        true
    }

    fn retire(&self, index: usize) {
        // Only the consumer moves a borrowed head, so a plain store is enough
        self.head.store(self.next(index), Ordering::Release);
    }

    fn log_full_once(&self, action: &str) {
        if !self.full_logged.swap(true, Ordering::Relaxed) {
            warn!(
                capacity = %self.capacity(),
                dropped = %self.dropped(),
                "Ring buffer full, {}",
                action
            );
        }
    }
}

/// Producer-side handle to the tail slot.
///
/// Call [`finalize`](Self::finalize) to publish. Dropping the handle without
/// finalizing publishes nothing, so an aborted fill never leaves a
/// half-written frame visible.
pub struct WriteSlot<'a, T> {
    ring: &'a RingBuffer<T>,
    index: usize,
    guard: RwLockWriteGuard<'a, Box<[T]>>,
}

impl<'a, T> WriteSlot<'a, T> {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Publishes the slot. Returns false if the overwrite policy had to
    /// discard it because the consumer was holding the only evictable slot.
    pub fn finalize(self) -> bool {
        let WriteSlot { ring, index, guard } = self;
        drop(guard);
        ring.publish(index)
    }
}

impl<T> Deref for WriteSlot<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.guard
    }
}

impl<T> DerefMut for WriteSlot<'_, T> {
    fn deref_mut(&mut self) -> &mut [T] {
        &mut self.guard
    }
}

/// Consumer-side borrow of the head slot; retires it on drop
pub struct ReadGuard<'a, T> {
    ring: &'a RingBuffer<T>,
    index: usize,
    guard: Option<RwLockReadGuard<'a, Box<[T]>>>,
}

impl<T> ReadGuard<'_, T> {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Retires the slot now instead of at end of scope
    pub fn retire(self) {}
}

impl<T> Deref for ReadGuard<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        match &self.guard {
            Some(guard) => guard,
            None => &[],
        }
    }
}

impl<T> Drop for ReadGuard<'_, T> {
    fn drop(&mut self) {
        self.guard.take();
        self.ring.retire(self.index);
        debug!(slot = %self.index, "Slot retired");
    }
}

/// Read-only view of the most recently published slot
pub struct SlotView<'a, T> {
    index: usize,
    sequence: u64,
    guard: RwLockReadGuard<'a, Box<[T]>>,
}

impl<T> SlotView<'_, T> {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Value of [`RingBuffer::produced`] when the view was taken
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl<T> Deref for SlotView<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(ring: &RingBuffer<u8>, value: u8) -> bool {
        let mut slot = ring.acquire_write_slot().unwrap();
        slot.fill(value);
        slot.finalize()
    }

    fn pop(ring: &RingBuffer<u8>) -> Option<u8> {
        ring.dequeue().map(|guard| guard[0])
    }

    #[test]
    fn test_rejects_degenerate_sizes() {
        assert_eq!(
            RingBuffer::<u8>::new(1, 16, OverflowPolicy::Reject).err(),
            Some(RingError::TooSmall(1))
        );
        assert_eq!(
            RingBuffer::<u8>::new(4, 0, OverflowPolicy::Reject).err(),
            Some(RingError::EmptySlot)
        );
    }

    #[test]
    fn test_with_budget() {
        let ring = RingBuffer::<u16>::with_budget(1024, 32, OverflowPolicy::Overwrite).unwrap();
        assert_eq!(ring.capacity(), 16);
        assert_eq!(ring.slot_len(), 32);
    }

    #[test]
    fn test_fifo_order() {
        let ring = RingBuffer::<u8>::new(4, 8, OverflowPolicy::Reject).unwrap();
        assert!(ring.is_empty());
        assert!(pop(&ring).is_none());

        fill(&ring, 1);
        fill(&ring, 2);
        assert_eq!(ring.occupancy(), 2);

        assert_eq!(pop(&ring), Some(1));
        assert_eq!(pop(&ring), Some(2));
        assert!(ring.is_empty());
    }

    #[test]
    fn test_reject_when_full() {
        let ring = RingBuffer::<u8>::new(3, 4, OverflowPolicy::Reject).unwrap();
        fill(&ring, 10);
        fill(&ring, 20);
        assert!(ring.is_full());
        assert!(matches!(ring.acquire_write_slot(), Err(RingError::Full)));

        // Retained slots are untouched
        assert_eq!(pop(&ring), Some(10));
        assert_eq!(pop(&ring), Some(20));
        assert_eq!(ring.dropped(), 0);
    }

    #[test]
    fn test_overwrite_evicts_oldest() {
        let ring = RingBuffer::<u8>::new(3, 4, OverflowPolicy::Overwrite).unwrap();
        fill(&ring, 1);
        fill(&ring, 2);
        assert!(fill(&ring, 3));

        assert_eq!(ring.dropped(), 1);
        assert_eq!(ring.occupancy(), 2);
        assert_eq!(pop(&ring), Some(2));
        assert_eq!(pop(&ring), Some(3));
    }

    #[test]
    fn test_overwrite_discards_new_frame_while_head_borrowed() {
        let ring = RingBuffer::<u8>::new(3, 4, OverflowPolicy::Overwrite).unwrap();
        fill(&ring, 1);
        fill(&ring, 2);

        let held = ring.dequeue().unwrap();
        assert_eq!(held[0], 1);
        assert!(!fill(&ring, 3));
        assert_eq!(ring.dropped(), 1);
        drop(held);

        assert_eq!(pop(&ring), Some(2));
        assert!(ring.is_empty());
        assert!(fill(&ring, 4));
        assert_eq!(pop(&ring), Some(4));
    }

    #[test]
    fn test_single_borrow_at_a_time() {
        let ring = RingBuffer::<u8>::new(4, 4, OverflowPolicy::Reject).unwrap();
        fill(&ring, 1);
        fill(&ring, 2);

        let first = ring.dequeue().unwrap();
        assert!(ring.dequeue().is_none());
        first.retire();

        assert_eq!(ring.occupancy(), 1);
        assert_eq!(pop(&ring), Some(2));
    }

    #[test]
    fn test_abandoned_write_publishes_nothing() {
        let ring = RingBuffer::<u8>::new(4, 4, OverflowPolicy::Reject).unwrap();
        {
            let mut slot = ring.acquire_write_slot().unwrap();
            slot[0] = 99;
        }
        assert!(ring.is_empty());
        assert!(ring.peek_last().is_none());
        assert_eq!(ring.produced(), 0);
    }

    #[test]
    fn test_peek_last_is_non_consuming() {
        let ring = RingBuffer::<u8>::new(4, 4, OverflowPolicy::Overwrite).unwrap();
        assert!(ring.peek_last().is_none());

        fill(&ring, 7);
        fill(&ring, 8);

        let view = ring.peek_last().unwrap();
        assert_eq!(view[0], 8);
        assert_eq!(view.sequence(), 2);
        drop(view);

        assert_eq!(ring.occupancy(), 2);
        assert_eq!(pop(&ring), Some(7));
    }

    #[test]
    fn test_fullness() {
        let ring = RingBuffer::<u8>::new(4, 1, OverflowPolicy::Reject).unwrap();
        assert_eq!(ring.fullness(), 0.0);
        fill(&ring, 0);
        fill(&ring, 0);
        assert_eq!(ring.fullness(), 0.5);
    }

    #[test]
    fn test_occupancy_bounded_over_mixed_sequence() {
        for policy in [OverflowPolicy::Overwrite, OverflowPolicy::Reject] {
            let ring = RingBuffer::<u8>::new(5, 2, policy).unwrap();
            let mut state: u32 = 0x2545_F491;

            for step in 0..2_000u32 {
                // xorshift picks the next operation
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;

                if state % 3 == 0 {
                    pop(&ring);
                } else if let Ok(mut slot) = ring.acquire_write_slot() {
                    slot[0] = step as u8;
                    slot.finalize();
                }

                let occupancy = ring.occupancy();
                assert!(occupancy <= ring.capacity() - 1, "step {} occupancy {}", step, occupancy);
            }
        }
    }
}
