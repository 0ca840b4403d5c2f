//! Storage sink contract
//!
//! The persistence pipeline hands completed candles to a
//! [`SaveRepository`] in strict emission order. Each call carries one
//! batch; `end_of_batch` is true when the pipeline has caught up with
//! everything published so far. Retry and commit semantics belong to the
//! repository.

use std::sync::Arc;

use thiserror::Error;
use types::candle::Candle;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Corrupted frame at byte offset {offset}: {detail}")]
    Corruption { offset: u64, detail: String },
}

/// Write side of a storage backend.
pub trait SaveRepository: Send + Sync {
    /// Backend identifier for logging.
    fn name(&self) -> &str;

    /// Persist a batch of candles, in order.
    fn on_batch(&self, candles: &[Candle], end_of_batch: bool) -> Result<(), StorageError>;
}

/// Read side of a storage backend.
pub trait QueryRepository: Send + Sync {
    /// Candles with `from_inclusive <= window_start < to_exclusive`, ascending.
    fn query_candles(
        &self,
        instrument: &str,
        timeframe_ms: u64,
        from_inclusive: i64,
        to_exclusive: i64,
    ) -> Result<Vec<Candle>, StorageError>;
}

/// A backend that both stores and serves candles.
pub trait Repository: SaveRepository + QueryRepository {
    fn into_save(self: Arc<Self>) -> Arc<dyn SaveRepository>;

    fn into_query(self: Arc<Self>) -> Arc<dyn QueryRepository>;
}

impl<T: SaveRepository + QueryRepository + 'static> Repository for T {
    fn into_save(self: Arc<Self>) -> Arc<dyn SaveRepository> {
        self
    }

    fn into_query(self: Arc<Self>) -> Arc<dyn QueryRepository> {
        self
    }
}
