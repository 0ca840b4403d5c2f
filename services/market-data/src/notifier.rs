//! Client notifier
//!
//! Terminal stage of a market data pipeline. It runs after every
//! aggregator of the instrument, so when it sees a boundary event all
//! candles that boundary closed have already been handed to subscribers.
//! It then tells each registered client that this instrument is done for
//! the cycle.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::trace;

use crate::candles::ClientId;
use crate::events::MarketDataEvent;
use crate::pipeline::EventHandler;

/// Told when an instrument has fully processed a boundary.
pub trait CycleListener: Send + Sync {
    fn instrument_processed(&self, instrument: &str, boundary_ts: i64);
}

struct Registration {
    listener: Arc<dyn CycleListener>,
    /// One per timeframe the client holds on this instrument.
    refs: usize,
}

/// Clients to notify for one instrument, refcounted per client.
#[derive(Default)]
pub struct NotifierRegistry {
    clients: RwLock<BTreeMap<ClientId, Registration>>,
}

impl NotifierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, client: ClientId, listener: Arc<dyn CycleListener>) {
        let mut clients = self.clients.write().unwrap_or_else(PoisonError::into_inner);
        clients
            .entry(client)
            .and_modify(|r| r.refs += 1)
            .or_insert(Registration { listener, refs: 1 });
    }

    /// Drop one reference. Returns true when the client is no longer notified.
    pub fn unregister(&self, client: ClientId) -> bool {
        let mut clients = self.clients.write().unwrap_or_else(PoisonError::into_inner);
        let Some(registration) = clients.get_mut(&client) else {
            return false;
        };
        if registration.refs > 1 {
            registration.refs -= 1;
            return false;
        }
        clients.remove(&client);
        true
    }

    pub fn len(&self) -> usize {
        self.clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<Arc<dyn CycleListener>> {
        self.clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|r| Arc::clone(&r.listener))
            .collect()
    }
}

pub struct ClientNotifier {
    instrument: String,
    registry: Arc<NotifierRegistry>,
}

impl ClientNotifier {
    pub fn new(instrument: impl Into<String>, registry: Arc<NotifierRegistry>) -> Self {
        Self {
            instrument: instrument.into(),
            registry,
        }
    }
}

impl EventHandler<MarketDataEvent> for ClientNotifier {
    fn on_event(
        &mut self,
        event: &MarketDataEvent,
        _sequence: i64,
        _end_of_batch: bool,
    ) -> anyhow::Result<()> {
        if let MarketDataEvent::Boundary { timestamp } = *event {
            let clients = self.registry.snapshot();
            trace!(
                instrument = %self.instrument,
                timestamp,
                clients = clients.len(),
                "Cycle processed"
            );
            for client in clients {
                client.instrument_processed(&self.instrument, timestamp);
            }
        }
        Ok(())
    }
}
