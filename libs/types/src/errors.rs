//! Error types shared across the service
//!
//! Configuration errors are fatal at startup; nothing here is recovered
//! from at runtime.

use thiserror::Error;

/// Timeframe token errors (`1m`, `5s`, ...)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TimeframeError {
    #[error("Empty timeframe value")]
    Empty,

    #[error("Invalid timeframe format: {0}")]
    InvalidFormat(String),

    #[error("Unknown time unit: {unit}. Supported units: s, m, h, d")]
    UnknownUnit { unit: String },

    #[error("Timeframe must be positive: {0}")]
    NotPositive(String),

    #[error("Timeframe out of range: {0}")]
    Overflow(String),
}

/// Configuration loading errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(String),

    #[error("Invalid instrument format: {spec}. Expected format: NAME@SOURCE")]
    InvalidInstrument { spec: String },

    #[error("Unknown source: {0}")]
    UnknownSource(String),

    #[error("Duplicate instrument: {0}")]
    DuplicateInstrument(String),

    #[error("No timeframes specified for instrument {0}")]
    NoTimeframes(String),

    #[error("Invalid timeframe for instrument {instrument}: {source}")]
    Timeframe {
        instrument: String,
        #[source]
        source: TimeframeError,
    },

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("Unknown storage backend: {0}")]
    UnknownBackend(String),

    #[error("Failed to read configuration file {path}: {reason}")]
    File { path: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeframe_error_display() {
        let err = TimeframeError::UnknownUnit { unit: "x".into() };
        assert_eq!(
            err.to_string(),
            "Unknown time unit: x. Supported units: s, m, h, d"
        );
    }

    #[test]
    fn test_config_error_wraps_timeframe_error() {
        let err = ConfigError::Timeframe {
            instrument: "BTCUSDT@BINANCE".into(),
            source: TimeframeError::Empty,
        };
        assert!(err.to_string().contains("BTCUSDT@BINANCE"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
