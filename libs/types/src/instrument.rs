//! Instruments and price sources
//!
//! An instrument is identified by `NAME@SOURCE`, carries the set of
//! timeframe widths configured for it, and two informational counters.
//! Instruments are created at configuration load and live for the
//! process lifetime.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;
use crate::timeframe::format_timeframe;

/// Separator between instrument name and source in the full name.
pub const INSTRUMENT_SEPARATOR: char = '@';

/// Upstream price source.
///
/// The set is closed: each variant maps to exactly one connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Source {
    Binance,
}

impl Source {
    /// Upper-case identifier used in full names and configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Binance => "BINANCE",
        }
    }

    /// All supported sources.
    pub fn all() -> &'static [Source] {
        &[Source::Binance]
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BINANCE" => Ok(Source::Binance),
            _ => Err(ConfigError::UnknownSource(s.trim().to_string())),
        }
    }
}

/// A configured instrument.
///
/// `ticks` and `candles` are monotonic accumulations updated from the
/// pipeline threads; they are informational only.
#[derive(Debug)]
pub struct Instrument {
    name: String,
    source: Source,
    timeframes: Vec<u64>,
    ticks: AtomicU64,
    candles: AtomicU64,
}

impl Instrument {
    pub fn new(name: impl Into<String>, source: Source, timeframes: Vec<u64>) -> Self {
        Self {
            name: name.into(),
            source,
            timeframes,
            ticks: AtomicU64::new(0),
            candles: AtomicU64::new(0),
        }
    }

    /// Symbol as known by the source (e.g. `BTCUSDT`).
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> Source {
        self.source
    }

    /// Configured window widths in milliseconds, in configuration order.
    pub fn timeframes(&self) -> &[u64] {
        &self.timeframes
    }

    /// `NAME@SOURCE`
    pub fn full_name(&self) -> String {
        format!("{}{}{}", self.name, INSTRUMENT_SEPARATOR, self.source)
    }

    pub fn record_tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_candle(&self) {
        self.candles.fetch_add(1, Ordering::Relaxed);
    }

    /// Ticks seen since startup.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Candles emitted since startup, across all timeframes.
    pub fn candles(&self) -> u64 {
        self.candles.load(Ordering::Relaxed)
    }

    /// Serializable view for the `/config` endpoint.
    pub fn info(&self) -> InstrumentInfo {
        InstrumentInfo {
            name: self.name.clone(),
            source: self.source,
            timeframes: self.timeframes.iter().map(|tf| format_timeframe(*tf)).collect(),
        }
    }
}

/// Parse `NAME@SOURCE` into its parts.
pub fn parse_instrument_spec(spec: &str) -> Result<(String, Source), ConfigError> {
    let spec = spec.trim();
    let parts: Vec<&str> = spec.split(INSTRUMENT_SEPARATOR).collect();
    match parts.as_slice() {
        [name, source] if !name.trim().is_empty() => {
            let source = source.parse::<Source>()?;
            Ok((name.trim().to_string(), source))
        }
        _ => Err(ConfigError::InvalidInstrument {
            spec: spec.to_string(),
        }),
    }
}

/// Instrument description with timeframes rendered as tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentInfo {
    pub name: String,
    pub source: Source,
    pub timeframes: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_name() {
        let instrument = Instrument::new("BTCUSDT", Source::Binance, vec![60_000]);
        assert_eq!(instrument.full_name(), "BTCUSDT@BINANCE");
    }

    #[test]
    fn test_source_parse_case_insensitive() {
        assert_eq!("binance".parse::<Source>().unwrap(), Source::Binance);
        assert_eq!(" Binance ".parse::<Source>().unwrap(), Source::Binance);
        assert_eq!(
            "kraken".parse::<Source>(),
            Err(ConfigError::UnknownSource("kraken".into()))
        );
    }

    #[test]
    fn test_parse_instrument_spec() {
        let (name, source) = parse_instrument_spec(" ETHUSDT@BINANCE ").unwrap();
        assert_eq!(name, "ETHUSDT");
        assert_eq!(source, Source::Binance);

        assert!(matches!(
            parse_instrument_spec("ETHUSDT"),
            Err(ConfigError::InvalidInstrument { .. })
        ));
        assert!(matches!(
            parse_instrument_spec("A@B@C"),
            Err(ConfigError::InvalidInstrument { .. })
        ));
        assert!(matches!(
            parse_instrument_spec("@BINANCE"),
            Err(ConfigError::InvalidInstrument { .. })
        ));
    }

    #[test]
    fn test_counters_accumulate() {
        let instrument = Instrument::new("BTCUSDT", Source::Binance, vec![1_000]);
        instrument.record_tick();
        instrument.record_tick();
        instrument.record_candle();
        assert_eq!(instrument.ticks(), 2);
        assert_eq!(instrument.candles(), 1);
    }

    #[test]
    fn test_info_renders_tokens() {
        let instrument = Instrument::new("BTCUSDT", Source::Binance, vec![1_000, 300_000]);
        let info = instrument.info();
        assert_eq!(info.timeframes, vec!["1s".to_string(), "5m".to_string()]);
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["source"], "BINANCE");
    }
}
