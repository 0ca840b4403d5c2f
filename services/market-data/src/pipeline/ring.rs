//! Pre-allocated ring of event slots
//!
//! Slots are indexed by `sequence & mask` and reused in place. Producers
//! claim sequences with a CAS on the claim counter, write the slot, then
//! mark it available by storing the sequence into the slot's marker.
//! Consumers read a slot only after its marker equals the sequence they
//! want, so a claimed-but-unwritten slot is never observed.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crossbeam::utils::Backoff;

use super::sequence::{minimum, Sequence, INITIAL_SEQUENCE};
use super::PipelineError;

/// Set on the claim counter once the ring is sealed for shutdown. The
/// counter is never negative, so the bit never collides with a value.
const SEALED: i64 = 1 << 62;

pub struct RingBuffer<T> {
    slots: Box<[RwLock<T>]>,
    available: Box<[AtomicI64]>,
    mask: i64,
    capacity: i64,
    /// Number of sequences claimed so far, plus the seal bit.
    claimed: Sequence,
    /// Terminal stage sequences; a producer never laps the slowest one.
    gating: Vec<Arc<Sequence>>,
}

impl<T: Default> RingBuffer<T> {
    pub fn new(capacity: usize, gating: Vec<Arc<Sequence>>) -> Result<Self, PipelineError> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(PipelineError::InvalidCapacity(capacity));
        }
        let slots = (0..capacity).map(|_| RwLock::new(T::default())).collect();
        let available = (0..capacity)
            .map(|_| AtomicI64::new(INITIAL_SEQUENCE))
            .collect();
        Ok(Self {
            slots,
            available,
            mask: capacity as i64 - 1,
            capacity: capacity as i64,
            claimed: Sequence::new(0),
            gating,
        })
    }
}

impl<T> RingBuffer<T> {
    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// Highest claimed sequence.
    pub fn cursor(&self) -> i64 {
        (self.claimed.get() & !SEALED) - 1
    }

    pub fn is_sealed(&self) -> bool {
        self.claimed.get() & SEALED != 0
    }

    fn index(&self, sequence: i64) -> usize {
        (sequence & self.mask) as usize
    }

    /// Claim the next sequence, waiting while the ring is full.
    ///
    /// Returns `None` once the ring is sealed.
    pub(crate) fn claim_next(&self) -> Option<i64> {
        let backoff = Backoff::new();
        loop {
            let claimed = self.claimed.get();
            if claimed & SEALED != 0 {
                return None;
            }
            let next = claimed;
            let wrap_point = next - self.capacity;
            if wrap_point > minimum(&self.gating, next - 1) {
                backoff.snooze();
                continue;
            }
            if self.claimed.compare_exchange(claimed, claimed + 1).is_ok() {
                return Some(next);
            }
            backoff.spin();
        }
    }

    /// Populate the slot for a claimed sequence and make it visible.
    ///
    /// The slot is published even if `fill` panics, so consumers never
    /// wait on a sequence that will not arrive.
    pub(crate) fn fill_and_publish<F: FnOnce(&mut T)>(&self, sequence: i64, fill: F) {
        let _guard = PublishGuard {
            marker: &self.available[self.index(sequence)],
            sequence,
        };
        let mut slot = self.slots[self.index(sequence)]
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        fill(&mut slot);
    }

    pub(crate) fn read<R>(&self, sequence: i64, f: impl FnOnce(&T) -> R) -> R {
        let slot = self.slots[self.index(sequence)]
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        f(&slot)
    }

    pub fn is_available(&self, sequence: i64) -> bool {
        self.available[self.index(sequence)].load(Ordering::Acquire) == sequence
    }

    /// Highest sequence `s` in `[from, upto]` such that every sequence in
    /// `[from, s]` is available, or `from - 1` if `from` is not.
    pub fn highest_available(&self, from: i64, upto: i64) -> i64 {
        let mut seq = from;
        while seq <= upto && self.is_available(seq) {
            seq += 1;
        }
        seq - 1
    }

    /// Stop further claims. Returns the last sequence claimed before the
    /// seal, or `INITIAL_SEQUENCE` if nothing was claimed.
    pub(crate) fn seal(&self) -> i64 {
        (self.claimed.fetch_or(SEALED) & !SEALED) - 1
    }
}

struct PublishGuard<'a> {
    marker: &'a AtomicI64,
    sequence: i64,
}

impl Drop for PublishGuard<'_> {
    fn drop(&mut self) {
        self.marker.store(self.sequence, Ordering::Release);
    }
}
