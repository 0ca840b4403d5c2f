//! Journal backend — append-only candle file with checksums
//!
//! # Binary Format (per frame)
//! ```text
//! [body_len: u32]
//! [body:     bincode(Candle)]
//! [checksum: u32]  // CRC32C over body
//! ```
//!
//! Every batch is written in one buffered pass, then flushed and synced.
//! Queries scan the whole file; a torn or corrupt tail is skipped.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crc32c::crc32c;
use tracing::{debug, warn};
use types::candle::Candle;

use crate::reader::FrameReader;
use crate::repository::{QueryRepository, SaveRepository, StorageError};

/// File name inside the configured journal directory.
pub const JOURNAL_FILE: &str = "candles.journal";

/// Frames larger than this are treated as corruption.
pub(crate) const MAX_BODY_LEN: usize = 64 * 1024;

// ── Framing ─────────────────────────────────────────────────────────

pub(crate) fn encode_frame(candle: &Candle) -> Result<Vec<u8>, StorageError> {
    let body =
        bincode::serialize(candle).map_err(|e| StorageError::Serialization(e.to_string()))?;
    let mut buf = Vec::with_capacity(4 + body.len() + 4);
    buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
    buf.extend_from_slice(&body);
    buf.extend_from_slice(&crc32c(&body).to_le_bytes());
    Ok(buf)
}

// ── Journal Repository ──────────────────────────────────────────────

pub struct JournalRepository {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JournalRepository {
    /// Open (or create) the journal under `dir`.
    pub fn open(dir: &Path) -> Result<Self, StorageError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(JOURNAL_FILE);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        debug!(path = %path.display(), "Opened candle journal");
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SaveRepository for JournalRepository {
    fn name(&self) -> &str {
        "journal"
    }

    fn on_batch(&self, candles: &[Candle], end_of_batch: bool) -> Result<(), StorageError> {
        if candles.is_empty() {
            return Ok(());
        }
        let mut writer = self
            .writer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for candle in candles {
            writer.write_all(&encode_frame(candle)?)?;
        }
        writer.flush()?;
        writer.get_ref().sync_data()?;
        debug!(count = candles.len(), end_of_batch, "Appended candles to journal");
        Ok(())
    }
}

impl QueryRepository for JournalRepository {
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
        let data = fs::read(&self.path)?;
        let mut reader = FrameReader::new(&data);
        let mut matched = std::collections::BTreeMap::new();
        for candle in reader.by_ref() {
            if candle.key.instrument == instrument
                && candle.key.timeframe_ms == timeframe_ms
                && candle.window_start >= from_inclusive
                && candle.window_start < to_exclusive
            {
                // Later frames for the same window win.
                matched.insert(candle.window_start, candle);
            }
        }
        if let Some(err) = reader.corruption() {
            warn!(path = %self.path.display(), error = %err, "Skipped corrupt journal tail");
        }
        Ok(matched.into_values().collect())
    }
}
