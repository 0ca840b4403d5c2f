//! Types library for the price streaming service
//!
//! Core type definitions shared by the aggregation pipeline, the storage
//! backends and the gateway.
//!
//! # Modules
//! - `instrument`: Instruments, sources and their informational counters
//! - `timeframe`: Timeframe token parsing (`1s`, `5m`, `1h`, `1d`)
//! - `candle`: Subscription keys and emitted OHLCV candles
//! - `errors`: Error taxonomy

pub mod candle;
pub mod errors;
pub mod instrument;
pub mod timeframe;

// Library version constant
pub const LIB_VERSION: &str = "1.0.0";

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::candle::*;
    pub use crate::errors::*;
    pub use crate::instrument::*;
    pub use crate::timeframe::*;
}
