//! Upstream connector contract
//!
//! A connector owns the feed for one [`Source`] and calls the registered
//! handler once per observed tick. Malformed upstream data is dropped
//! inside the connector and never reaches a pipeline.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;
use types::instrument::{Instrument, Source};

use crate::binance::BinanceConnector;

#[derive(Error, Debug)]
pub enum ConnectorError {
    #[error("No connector for source {0}")]
    UnknownSource(Source),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Connector {0} is already running")]
    AlreadyStarted(Source),
}

/// Per-instrument tick sink a connector feeds.
pub trait PriceEventHandler: Send + Sync {
    fn instrument(&self) -> &Instrument;

    fn handle_price_event(&self, timestamp_ms: i64, price: f64, volume: f64);
}

#[async_trait]
pub trait Connector: Send + Sync {
    fn source(&self) -> Source;

    /// Add an instrument before `start`.
    fn register(&self, handler: Arc<dyn PriceEventHandler>);

    /// Begin streaming in the background. Requires a tokio runtime.
    fn start(&self) -> Result<(), ConnectorError>;

    /// Stop streaming and wait for the feed task to finish.
    async fn close(&self);
}

fn create_connector(source: Source) -> Arc<dyn Connector> {
    match source {
        Source::Binance => Arc::new(BinanceConnector::new()),
    }
}

/// One connector per configured source.
#[derive(Default)]
pub struct ConnectorRegistry {
    connectors: BTreeMap<Source, Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_sources(sources: impl IntoIterator<Item = Source>) -> Self {
        let mut registry = Self::new();
        for source in sources {
            if !registry.connectors.contains_key(&source) {
                registry.insert(create_connector(source));
            }
        }
        registry
    }

    pub fn insert(&mut self, connector: Arc<dyn Connector>) {
        self.connectors.insert(connector.source(), connector);
    }

    pub fn len(&self) -> usize {
        self.connectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }

    /// Route a handler to the connector of its instrument's source.
    pub fn register(&self, handler: Arc<dyn PriceEventHandler>) -> Result<(), ConnectorError> {
        let source = handler.instrument().source();
        let connector = self
            .connectors
            .get(&source)
            .ok_or(ConnectorError::UnknownSource(source))?;
        info!(
            instrument = %handler.instrument().full_name(),
            source = %source,
            "Registered instrument with connector"
        );
        connector.register(handler);
        Ok(())
    }

    pub fn start_all(&self) -> Result<(), ConnectorError> {
        for connector in self.connectors.values() {
            connector.start()?;
        }
        Ok(())
    }

    pub async fn close_all(&self) {
        for connector in self.connectors.values() {
            connector.close().await;
        }
    }
}
