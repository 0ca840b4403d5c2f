//! Sequence counters and wait strategies

use std::sync::atomic::{AtomicI64, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam::utils::{Backoff, CachePadded};

/// Sequence value before anything has been claimed or consumed.
pub const INITIAL_SEQUENCE: i64 = -1;

/// A cache-line padded sequence number.
///
/// Written by exactly one owner (a stage runner or the producer claim
/// path) and read by everyone that gates on it.
#[derive(Debug)]
pub struct Sequence(CachePadded<AtomicI64>);

impl Sequence {
    pub fn new(value: i64) -> Self {
        Self(CachePadded::new(AtomicI64::new(value)))
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Acquire)
    }

    pub fn set(&self, value: i64) {
        self.0.store(value, Ordering::Release);
    }

    pub(crate) fn compare_exchange(&self, current: i64, new: i64) -> Result<i64, i64> {
        self.0
            .compare_exchange_weak(current, new, Ordering::AcqRel, Ordering::Acquire)
    }

    pub(crate) fn fetch_or(&self, bits: i64) -> i64 {
        self.0.fetch_or(bits, Ordering::AcqRel)
    }
}

impl Default for Sequence {
    fn default() -> Self {
        Self::new(INITIAL_SEQUENCE)
    }
}

/// Smallest value among `sequences`, or `default` when empty.
pub fn minimum(sequences: &[std::sync::Arc<Sequence>], default: i64) -> i64 {
    sequences.iter().map(|s| s.get()).min().unwrap_or(default)
}

/// How an idle stage waits for new sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitStrategy {
    /// Spin on the CPU. Lowest latency, burns a core per stage.
    BusySpin,
    /// Spin, then yield the thread.
    Yielding,
    /// Spin, yield, then park for a short interval.
    #[default]
    Sleeping,
}

const PARK_INTERVAL: Duration = Duration::from_millis(1);

impl WaitStrategy {
    pub(crate) fn idle(&self, backoff: &Backoff) {
        match self {
            WaitStrategy::BusySpin => backoff.spin(),
            WaitStrategy::Yielding => backoff.snooze(),
            WaitStrategy::Sleeping => {
                if backoff.is_completed() {
                    thread::sleep(PARK_INTERVAL);
                } else {
                    backoff.snooze();
                }
            }
        }
    }
}
