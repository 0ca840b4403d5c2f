//! In-memory candle store
//!
//! Ordered by (instrument, timeframe, window start). Re-saving a window
//! replaces the stored candle.

use std::collections::BTreeMap;
use std::sync::Mutex;

use tracing::debug;
use types::candle::Candle;

use crate::repository::{QueryRepository, SaveRepository, StorageError};

type SeriesKey = (String, u64);

#[derive(Debug, Default)]
pub struct MemoryRepository {
    series: Mutex<BTreeMap<SeriesKey, BTreeMap<i64, Candle>>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total candles stored across all series.
    pub fn len(&self) -> usize {
        self.lock().values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<SeriesKey, BTreeMap<i64, Candle>>> {
        self.series
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl SaveRepository for MemoryRepository {
    fn name(&self) -> &str {
        "memory"
    }

    fn on_batch(&self, candles: &[Candle], end_of_batch: bool) -> Result<(), StorageError> {
        let mut series = self.lock();
        for candle in candles {
            series
                .entry((candle.key.instrument.clone(), candle.key.timeframe_ms))
                .or_default()
                .insert(candle.window_start, candle.clone());
        }
        debug!(count = candles.len(), end_of_batch, "Stored candle batch in memory");
        Ok(())
    }
}

impl QueryRepository for MemoryRepository {
    fn query_candles(
        &self,
        instrument: &str,
        timeframe_ms: u64,
        from_inclusive: i64,
        to_exclusive: i64,
    ) -> Result<Vec<Candle>, StorageError> {
        if from_inclusive >= to_exclusive {
            return Ok(Vec::new());
        }
        let series = self.lock();
        Ok(series
            .get(&(instrument.to_string(), timeframe_ms))
            .map(|s| {
                s.range(from_inclusive..to_exclusive)
                    .map(|(_, candle)| candle.clone())
                    .collect()
            })
            .unwrap_or_default())
    }
}
