//! Frame reader with corruption detection
//!
//! Iterates checksummed candle frames from an in-memory journal image.
//! Iteration stops at the first frame that is truncated, oversized or
//! fails its CRC32C; the byte offset is kept for diagnostics.

use crc32c::crc32c;
use types::candle::Candle;

use crate::journal::MAX_BODY_LEN;
use crate::repository::StorageError;

pub struct FrameReader<'a> {
    data: &'a [u8],
    pos: usize,
    corruption: Option<StorageError>,
}

impl<'a> FrameReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            corruption: None,
        }
    }

    /// Byte offset of the next unread frame.
    pub fn offset(&self) -> u64 {
        self.pos as u64
    }

    /// Set once iteration has stopped early on a bad frame.
    pub fn corruption(&self) -> Option<&StorageError> {
        self.corruption.as_ref()
    }

    fn fail(&mut self, detail: impl Into<String>) -> Option<Candle> {
        self.corruption = Some(StorageError::Corruption {
            offset: self.pos as u64,
            detail: detail.into(),
        });
        self.pos = self.data.len();
        None
    }

    fn read_u32(&self, at: usize) -> Option<u32> {
        let bytes = self.data.get(at..at + 4)?;
        let mut word = [0u8; 4];
        word.copy_from_slice(bytes);
        Some(u32::from_le_bytes(word))
    }
}

impl Iterator for FrameReader<'_> {
    type Item = Candle;

    fn next(&mut self) -> Option<Candle> {
        if self.pos >= self.data.len() {
            return None;
        }
        let Some(body_len) = self.read_u32(self.pos) else {
            return self.fail("truncated length prefix");
        };
        let body_len = body_len as usize;
        if body_len > MAX_BODY_LEN {
            return self.fail(format!("implausible body length {body_len}"));
        }
        let body_start = self.pos + 4;
        let body_end = body_start + body_len;
        let Some(stored) = self.read_u32(body_end) else {
            return self.fail("truncated frame");
        };
        let body = &self.data[body_start..body_end];
        if crc32c(body) != stored {
            return self.fail("checksum mismatch");
        }
        match bincode::deserialize::<Candle>(body) {
            Ok(candle) => {
                self.pos = body_end + 4;
                Some(candle)
            }
            Err(e) => self.fail(format!("undecodable frame: {e}")),
        }
    }
}
