//! Persistence pipeline
//!
//! One pipeline per storage backend. Aggregators publish closed candles
//! into it; a single sink stage accumulates them and hands each batch to
//! the repository at end-of-batch (or when the batch is full). A failed
//! batch is logged and dropped; nothing is retried.

use std::sync::Arc;

use persistence::SaveRepository;
use tracing::{debug, info, warn};
use types::candle::Candle;

use crate::candles::CandleListener;
use crate::metrics::PipelineMetrics;
use crate::pipeline::{EventHandler, Pipeline, PipelineBuilder, PipelineError};

/// Upper bound on candles per repository call.
pub const DEFAULT_MAX_BATCH: usize = 1024;

struct SinkStage {
    repository: Arc<dyn SaveRepository>,
    buffer: Vec<Candle>,
    max_batch: usize,
}

impl SinkStage {
    fn commit(&mut self, end_of_batch: bool) -> anyhow::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let result = self.repository.on_batch(&self.buffer, end_of_batch);
        let count = self.buffer.len();
        self.buffer.clear();
        result?;
        debug!(backend = self.repository.name(), count, "Committed candle batch");
        Ok(())
    }
}

impl EventHandler<Option<Candle>> for SinkStage {
    fn on_event(
        &mut self,
        event: &Option<Candle>,
        _sequence: i64,
        end_of_batch: bool,
    ) -> anyhow::Result<()> {
        if let Some(candle) = event {
            self.buffer.push(candle.clone());
        }
        if end_of_batch || self.buffer.len() >= self.max_batch {
            self.commit(end_of_batch)?;
        }
        Ok(())
    }

    fn on_shutdown(&mut self) {
        if let Err(e) = self.commit(true) {
            warn!(backend = self.repository.name(), error = %e, "Final batch failed");
        }
    }
}

pub struct PersistencePipeline {
    backend: String,
    pipeline: Pipeline<Option<Candle>>,
}

impl PersistencePipeline {
    pub fn new(repository: Arc<dyn SaveRepository>, capacity: usize) -> Result<Self, PipelineError> {
        Self::with_max_batch(repository, capacity, DEFAULT_MAX_BATCH)
    }

    pub fn with_max_batch(
        repository: Arc<dyn SaveRepository>,
        capacity: usize,
        max_batch: usize,
    ) -> Result<Self, PipelineError> {
        let backend = repository.name().to_string();
        let mut builder = PipelineBuilder::new(format!("persist-{backend}"), capacity);
        builder.add_stage(
            "sink",
            SinkStage {
                repository,
                buffer: Vec::with_capacity(max_batch.max(1)),
                max_batch: max_batch.max(1),
            },
            &[],
        )?;
        let pipeline = builder.start()?;
        info!(backend = %backend, capacity, "Persistence pipeline started");
        Ok(Self { backend, pipeline })
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn publish(&self, candle: &Candle) -> Result<i64, PipelineError> {
        self.pipeline.publish(|slot| *slot = Some(candle.clone()))
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        self.pipeline.metrics()
    }

    /// Drain pending candles into the repository and stop. Idempotent.
    pub fn halt(&self) {
        self.pipeline.halt();
    }
}

impl CandleListener for PersistencePipeline {
    fn on_candle(&self, candle: &Candle) {
        if let Err(e) = self.publish(candle) {
            debug!(backend = %self.backend, error = %e, "Dropped candle for storage");
        }
    }
}
