//! Fan-in barrier for one client's tick cycle
//!
//! Tracks which instruments a client expects per cycle and which have
//! reported a processed boundary. Cycles are keyed by boundary timestamp.
//! A cycle completes when every expected instrument has arrived for it;
//! completing a cycle also releases any older cycle still waiting, so a
//! lagging instrument costs at most one cycle.
//!
//! Not synchronized; the owner keeps it behind a mutex.

use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Default)]
pub struct CycleBarrier {
    /// Instrument -> number of subscribed timeframes on it.
    expected: BTreeMap<String, usize>,
    /// Boundary timestamp -> instruments that reported it.
    arrivals: BTreeMap<i64, BTreeSet<String>>,
}

impl CycleBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expect one more key on `instrument`. True if the instrument is new.
    pub fn track(&mut self, instrument: &str) -> bool {
        let refs = self.expected.entry(instrument.to_string()).or_insert(0);
        *refs += 1;
        *refs == 1
    }

    /// Drop one key on `instrument`. True if it is no longer expected.
    pub fn forget(&mut self, instrument: &str) -> bool {
        let Some(refs) = self.expected.get_mut(instrument) else {
            return false;
        };
        *refs -= 1;
        if *refs > 0 {
            return false;
        }
        self.expected.remove(instrument);
        true
    }

    /// Distinct instruments the next cycle waits for.
    pub fn expected(&self) -> usize {
        self.expected.len()
    }

    pub fn pending_cycles(&self) -> usize {
        self.arrivals.len()
    }

    /// Record an arrival. Returns the released cycle if this completed one.
    ///
    /// Arrivals from instruments that are not expected are ignored.
    pub fn arrive(&mut self, instrument: &str, boundary_ts: i64) -> Option<i64> {
        if !self.expected.contains_key(instrument) {
            return None;
        }
        self.arrivals
            .entry(boundary_ts)
            .or_default()
            .insert(instrument.to_string());
        if self.is_complete(boundary_ts) {
            self.release_through(boundary_ts);
            Some(boundary_ts)
        } else {
            None
        }
    }

    /// Re-evaluate after the expected set shrank.
    ///
    /// Releases the newest cycle that is now complete. With nothing
    /// expected, anything that already arrived is released.
    pub fn recheck(&mut self) -> Option<i64> {
        let newest_complete = self
            .arrivals
            .keys()
            .rev()
            .copied()
            .find(|ts| self.is_complete(*ts))?;
        self.release_through(newest_complete);
        Some(newest_complete)
    }

    /// Forget all pending cycles. Returns the newest one, if any.
    pub fn release_all(&mut self) -> Option<i64> {
        let newest = self.arrivals.keys().next_back().copied();
        self.arrivals.clear();
        newest
    }

    /// Forget everything, expectations included.
    pub fn reset(&mut self) {
        self.expected.clear();
        self.arrivals.clear();
    }

    fn is_complete(&self, boundary_ts: i64) -> bool {
        self.arrivals
            .get(&boundary_ts)
            .is_some_and(|arrived| self.expected.keys().all(|i| arrived.contains(i)))
    }

    fn release_through(&mut self, boundary_ts: i64) {
        self.arrivals = self.arrivals.split_off(&(boundary_ts + 1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BTC: &str = "BTCUSDT@BINANCE";
    const ETH: &str = "ETHUSDT@BINANCE";

    #[test]
    fn test_single_instrument_releases_each_cycle() {
        let mut barrier = CycleBarrier::new();
        barrier.track(BTC);
        assert_eq!(barrier.arrive(BTC, 1_000), Some(1_000));
        assert_eq!(barrier.arrive(BTC, 2_000), Some(2_000));
        assert_eq!(barrier.pending_cycles(), 0);
    }

    #[test]
    fn test_waits_for_all_instruments() {
        let mut barrier = CycleBarrier::new();
        barrier.track(BTC);
        barrier.track(ETH);
        assert_eq!(barrier.arrive(ETH, 1_000), None);
        assert_eq!(barrier.arrive(BTC, 1_000), Some(1_000));
    }

    #[test]
    fn test_expectation_counts_distinct_instruments() {
        let mut barrier = CycleBarrier::new();
        assert!(barrier.track(BTC));
        assert!(!barrier.track(BTC));
        assert_eq!(barrier.expected(), 1);
        assert_eq!(barrier.arrive(BTC, 1_000), Some(1_000));
        assert!(!barrier.forget(BTC));
        assert!(barrier.forget(BTC));
        assert!(!barrier.forget(BTC));
        assert_eq!(barrier.expected(), 0);
    }

    #[test]
    fn test_unexpected_arrival_is_ignored() {
        let mut barrier = CycleBarrier::new();
        barrier.track(BTC);
        assert_eq!(barrier.arrive(ETH, 1_000), None);
        assert_eq!(barrier.pending_cycles(), 0);
    }

    #[test]
    fn test_newer_cycle_releases_older() {
        let mut barrier = CycleBarrier::new();
        barrier.track(BTC);
        barrier.track(ETH);
        assert_eq!(barrier.arrive(BTC, 1_000), None);
        assert_eq!(barrier.arrive(BTC, 2_000), None);
        assert_eq!(barrier.arrive(ETH, 2_000), Some(2_000));
        assert_eq!(barrier.pending_cycles(), 0);
    }

    #[test]
    fn test_forget_mid_cycle_releases_arrived() {
        let mut barrier = CycleBarrier::new();
        barrier.track(BTC);
        barrier.track(ETH);
        assert_eq!(barrier.arrive(BTC, 1_000), None);
        assert!(barrier.forget(ETH));
        assert_eq!(barrier.recheck(), Some(1_000));
    }

    #[test]
    fn test_forget_last_instrument_does_not_hang() {
        let mut barrier = CycleBarrier::new();
        barrier.track(BTC);
        barrier.forget(BTC);
        assert_eq!(barrier.recheck(), None);
        assert_eq!(barrier.arrive(BTC, 1_000), None);
    }

    #[test]
    fn test_release_all_and_reset() {
        let mut barrier = CycleBarrier::new();
        barrier.track(BTC);
        barrier.track(ETH);
        barrier.arrive(BTC, 1_000);
        barrier.arrive(BTC, 2_000);
        assert_eq!(barrier.release_all(), Some(2_000));
        assert_eq!(barrier.pending_cycles(), 0);
        barrier.reset();
        assert_eq!(barrier.expected(), 0);
    }
}
