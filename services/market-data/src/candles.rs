//! OHLCV Candle Aggregator
//!
//! One aggregator per (instrument, timeframe), running as a pipeline stage.
//! It holds at most one open window. A tick in a different window closes
//! the open one and starts the next; a boundary event in a different
//! window closes it and leaves the aggregator idle. Windows are aligned to
//! the epoch (`floor(ts / width) * width`).
//!
//! Closed candles go to two audiences: fixed sinks wired at startup
//! (persistence pipelines) and client subscribers that come and go.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;
use types::candle::{Candle, SubscriptionKey};
use types::instrument::Instrument;
use types::timeframe::window_start;

use crate::events::MarketDataEvent;
use crate::pipeline::EventHandler;

/// Receives every candle an aggregator closes.
pub trait CandleListener: Send + Sync {
    fn on_candle(&self, candle: &Candle);
}

/// Identifier of a connected stream client.
pub type ClientId = u64;

/// Client listeners attached to one aggregator.
///
/// Emission iterates a snapshot, so listeners may (un)subscribe from
/// inside a callback without deadlocking.
#[derive(Default)]
pub struct CandleSubscribers {
    listeners: RwLock<BTreeMap<ClientId, Arc<dyn CandleListener>>>,
}

impl CandleSubscribers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the client was already registered.
    pub fn insert(&self, client: ClientId, listener: Arc<dyn CandleListener>) -> bool {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(client, listener)
            .is_none()
    }

    pub fn remove(&self, client: ClientId) -> bool {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&client)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<Arc<dyn CandleListener>> {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

/// The window currently being built. Only exists once a tick arrived.
#[derive(Debug, Clone, PartialEq)]
struct OpenCandle {
    window_start: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

impl OpenCandle {
    fn start(window_start: i64, price: f64, volume: f64) -> Self {
        Self {
            window_start,
            open: price,
            high: price,
            low: price,
            close: price,
            volume,
        }
    }

    fn update(&mut self, price: f64, volume: f64) {
        if price > self.high {
            self.high = price;
        }
        if price < self.low {
            self.low = price;
        }
        self.close = price;
        self.volume += volume;
    }
}

pub struct CandleAggregator {
    key: SubscriptionKey,
    instrument: Arc<Instrument>,
    current: Option<OpenCandle>,
    /// Start of the most recently closed window.
    last_closed: Option<i64>,
    sinks: Vec<Arc<dyn CandleListener>>,
    subscribers: Arc<CandleSubscribers>,
}

impl CandleAggregator {
    pub fn new(
        instrument: Arc<Instrument>,
        timeframe_ms: u64,
        sinks: Vec<Arc<dyn CandleListener>>,
        subscribers: Arc<CandleSubscribers>,
    ) -> Self {
        Self {
            key: SubscriptionKey::new(instrument.full_name(), timeframe_ms),
            instrument,
            current: None,
            last_closed: None,
            sinks,
            subscribers,
        }
    }

    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    pub fn is_open(&self) -> bool {
        self.current.is_some()
    }

    fn window_of(&self, timestamp: i64) -> i64 {
        window_start(timestamp, self.key.timeframe_ms)
    }

    fn close(&mut self) -> Option<Candle> {
        let open = self.current.take()?;
        self.last_closed = Some(open.window_start);
        Some(Candle {
            key: self.key.clone(),
            window_start: open.window_start,
            open: open.open,
            high: open.high,
            low: open.low,
            close: open.close,
            volume: open.volume,
        })
    }

    /// Apply a tick. Returns the previous window if the tick closed it.
    ///
    /// A tick for a window older than the open one, or for a window that
    /// was already closed, is dropped.
    pub fn on_tick(&mut self, timestamp: i64, price: f64, volume: f64) -> Option<Candle> {
        let window = self.window_of(timestamp);
        let stale = match (&self.current, self.last_closed) {
            (Some(open), _) => window < open.window_start,
            (None, Some(closed)) => window <= closed,
            (None, None) => false,
        };
        if stale {
            debug!(key = %self.key, timestamp, window, "Dropped late tick");
            return None;
        }
        if let Some(open) = self.current.as_mut() {
            if open.window_start == window {
                open.update(price, volume);
                return None;
            }
        }
        let closed = self.close();
        self.current = Some(OpenCandle::start(window, price, volume));
        closed
    }

    /// Apply a boundary. Closes the open window only if time moved past it.
    pub fn on_boundary(&mut self, timestamp: i64) -> Option<Candle> {
        let window = self.window_of(timestamp);
        let moved_on = self
            .current
            .as_ref()
            .is_some_and(|open| window > open.window_start);
        if moved_on {
            self.close()
        } else {
            None
        }
    }

    fn emit(&self, candle: &Candle) {
        self.instrument.record_candle();
        debug!(
            key = %candle.key,
            window_start = candle.window_start,
            close = candle.close,
            "Candle closed"
        );
        for sink in &self.sinks {
            sink.on_candle(candle);
        }
        for subscriber in self.subscribers.snapshot() {
            subscriber.on_candle(candle);
        }
    }
}

impl EventHandler<MarketDataEvent> for CandleAggregator {
    fn on_event(
        &mut self,
        event: &MarketDataEvent,
        _sequence: i64,
        _end_of_batch: bool,
    ) -> anyhow::Result<()> {
        let closed = match *event {
            MarketDataEvent::Tick {
                timestamp,
                price,
                volume,
            } => self.on_tick(timestamp, price, volume),
            MarketDataEvent::Boundary { timestamp } => self.on_boundary(timestamp),
            MarketDataEvent::Empty => None,
        };
        if let Some(candle) = closed {
            self.emit(&candle);
        }
        Ok(())
    }
}
