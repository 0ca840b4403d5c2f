//! Pipeline metrics
//!
//! One `PipelineMetrics` per event pipeline, shared between the producer
//! side and every stage runner. Counters are monotonic; readers only load.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct PipelineMetrics {
    pub events_published: AtomicU64,
    pub events_processed: AtomicU64,
    /// Handler returned `Err`.
    pub handler_errors: AtomicU64,
    /// Handler panicked.
    pub handler_panics: AtomicU64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_published(&self) {
        self.events_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_processed(&self) {
        self.events_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.handler_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_panic(&self) {
        self.handler_panics.fetch_add(1, Ordering::Relaxed);
    }

    /// Errors plus panics.
    pub fn handler_failures(&self) -> u64 {
        self.handler_errors.load(Ordering::Relaxed) + self.handler_panics.load(Ordering::Relaxed)
    }

    pub fn published(&self) -> u64 {
        self.events_published.load(Ordering::Relaxed)
    }

    pub fn processed(&self) -> u64 {
        self.events_processed.load(Ordering::Relaxed)
    }
}
