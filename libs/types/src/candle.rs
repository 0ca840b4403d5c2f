//! Emitted OHLCV candles
//!
//! A `Candle` is produced exactly once per closed window per
//! (instrument, timeframe) and is never revised afterwards.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Join key between aggregation output and client subscriptions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionKey {
    /// Instrument full name (`NAME@SOURCE`)
    pub instrument: String,
    /// Window width in milliseconds
    pub timeframe_ms: u64,
}

impl SubscriptionKey {
    pub fn new(instrument: impl Into<String>, timeframe_ms: u64) -> Self {
        Self {
            instrument: instrument.into(),
            timeframe_ms,
        }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}ms", self.instrument, self.timeframe_ms)
    }
}

/// A closed OHLCV window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub key: SubscriptionKey,
    /// Aligned window start, epoch milliseconds
    pub window_start: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// Validate candle integrity (OHLCV invariants).
    pub fn is_valid(&self) -> bool {
        let width = self.key.timeframe_ms as i64;
        width > 0
            && self.window_start % width == 0
            && self.high >= self.open
            && self.high >= self.close
            && self.high >= self.low
            && self.low <= self.open
            && self.low <= self.close
            && self.volume >= 0.0
    }

    /// Client-facing representation.
    pub fn to_update(&self) -> CandleUpdate {
        CandleUpdate {
            instrument: self.key.instrument.clone(),
            time: self.window_start / 1000,
            timeframe_ms: self.key.timeframe_ms,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
        }
    }
}

/// Outbound candle entry as serialized to stream clients.
///
/// Field names are compact because a batch carries one entry per
/// subscribed key every second.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandleUpdate {
    #[serde(rename = "i")]
    pub instrument: String,
    /// Window start in epoch seconds
    #[serde(rename = "t")]
    pub time: i64,
    #[serde(rename = "f")]
    pub timeframe_ms: u64,
    #[serde(rename = "o")]
    pub open: f64,
    #[serde(rename = "h")]
    pub high: f64,
    #[serde(rename = "l")]
    pub low: f64,
    #[serde(rename = "c")]
    pub close: f64,
    #[serde(rename = "v")]
    pub volume: f64,
}
