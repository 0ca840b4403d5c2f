//! Market Data Service
//!
//! Turns raw price ticks into OHLCV candles and streams them to clients.
//!
//! # Architecture
//!
//! ```text
//!  Connector ─► MarketDataProcessor (one per instrument)
//!                 │ ring buffer
//!         ┌───────┼────────┐
//!       ┌─▼─┐   ┌─▼─┐    ┌─▼─┐
//!       │1s │   │1m │ …  │1h │   CandleAggregator per timeframe
//!       └─┬─┘   └─┬─┘    └─┬─┘
//!         └───────┼────────┴──► PersistencePipeline ─► repository
//!           ┌─────▼─────┐
//!           │ Notifier  │
//!           └─────┬─────┘
//!       SubscriptionProcessor (one per client) ─► transport
//!
//!  BoundaryTimer ─► every processor, once per second
//! ```

pub mod barrier;
pub mod binance;
pub mod candles;
pub mod connector;
pub mod events;
pub mod metrics;
pub mod notifier;
pub mod pipeline;
pub mod processor;
pub mod storage;
pub mod subscription;
pub mod timer;

pub use candles::{CandleAggregator, CandleListener, ClientId};
pub use connector::{Connector, ConnectorError, ConnectorRegistry, PriceEventHandler};
pub use events::MarketDataEvent;
pub use pipeline::{Pipeline, PipelineBuilder, PipelineError};
pub use processor::{MarketDataProcessor, ProcessorError, ProcessorSet};
pub use storage::PersistencePipeline;
pub use subscription::{
    ClientTransport, ControlMessage, SubscriptionError, SubscriptionProcessor, TransportError,
};
pub use timer::{BoundaryListener, BoundaryTimer};

// Library version
pub const SERVICE_VERSION: &str = "0.1.0";
