//! Stage handlers and the stage runner loop

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use crossbeam::utils::Backoff;
use tracing::{debug, error, warn};

use super::ring::RingBuffer;
use super::sequence::{minimum, Sequence, WaitStrategy};
use crate::metrics::PipelineMetrics;

/// A consumer stage.
///
/// Each handler is owned by exactly one stage thread and sees every
/// sequence in order, so it may keep mutable state without locking.
pub trait EventHandler<T>: Send {
    fn on_event(&mut self, event: &T, sequence: i64, end_of_batch: bool) -> anyhow::Result<()>;

    fn on_start(&mut self) {}

    /// Called once after the stage has drained.
    fn on_shutdown(&mut self) {}
}

impl<T, F> EventHandler<T> for F
where
    F: FnMut(&T, i64, bool) -> anyhow::Result<()> + Send,
{
    fn on_event(&mut self, event: &T, sequence: i64, end_of_batch: bool) -> anyhow::Result<()> {
        self(event, sequence, end_of_batch)
    }
}

/// Halt coordination shared by every stage of one pipeline.
#[derive(Debug)]
pub(crate) struct HaltSignal {
    halting: AtomicBool,
    target: AtomicI64,
}

impl HaltSignal {
    pub(crate) fn new() -> Self {
        Self {
            halting: AtomicBool::new(false),
            target: AtomicI64::new(0),
        }
    }

    pub(crate) fn raise(&self, target: i64) {
        self.target.store(target, Ordering::Release);
        self.halting.store(true, Ordering::Release);
    }

    /// Last sequence to process before stopping, once halt was raised.
    fn target(&self) -> Option<i64> {
        if self.halting.load(Ordering::Acquire) {
            Some(self.target.load(Ordering::Acquire))
        } else {
            None
        }
    }
}

pub(crate) struct StageRunner<T> {
    pub(crate) pipeline: String,
    pub(crate) stage: String,
    pub(crate) handler: Box<dyn EventHandler<T>>,
    pub(crate) ring: Arc<RingBuffer<T>>,
    pub(crate) sequence: Arc<Sequence>,
    /// Empty for first-level stages, which read producer availability.
    pub(crate) dependencies: Vec<Arc<Sequence>>,
    pub(crate) halt: Arc<HaltSignal>,
    pub(crate) metrics: Arc<PipelineMetrics>,
    pub(crate) wait: WaitStrategy,
}

impl<T> StageRunner<T> {
    fn upper_bound(&self, next: i64) -> i64 {
        if self.dependencies.is_empty() {
            self.ring.highest_available(next, self.ring.cursor())
        } else {
            minimum(&self.dependencies, next - 1)
        }
    }

    fn dispatch(&mut self, sequence: i64, end_of_batch: bool) {
        let handler = &mut self.handler;
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            self.ring
                .read(sequence, |event| handler.on_event(event, sequence, end_of_batch))
        }));
        self.metrics.record_processed();
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.metrics.record_error();
                warn!(
                    pipeline = %self.pipeline,
                    stage = %self.stage,
                    sequence,
                    error = %e,
                    "Stage handler failed, continuing"
                );
            }
            Err(_) => {
                self.metrics.record_panic();
                error!(
                    pipeline = %self.pipeline,
                    stage = %self.stage,
                    sequence,
                    "Stage handler panicked, continuing"
                );
            }
        }
    }

    pub(crate) fn run(mut self) {
        debug!(pipeline = %self.pipeline, stage = %self.stage, "Stage started");
        self.handler.on_start();
        let backoff = Backoff::new();
        loop {
            let next = self.sequence.get() + 1;
            let available = self.upper_bound(next);
            if available >= next {
                for seq in next..=available {
                    self.dispatch(seq, seq == available);
                }
                self.sequence.set(available);
                backoff.reset();
                continue;
            }
            if let Some(target) = self.halt.target() {
                if self.sequence.get() >= target {
                    break;
                }
            }
            self.wait.idle(&backoff);
        }
        self.handler.on_shutdown();
        debug!(
            pipeline = %self.pipeline,
            stage = %self.stage,
            last_sequence = self.sequence.get(),
            "Stage drained"
        );
    }
}
