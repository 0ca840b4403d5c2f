use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use market_data::candles::ClientId;
use market_data::processor::ProcessorSet;
use market_data::subscription::SubscriptionProcessor;
use persistence::QueryRepository;
use tokio::sync::watch;
use tracing::info;
use types::instrument::Instrument;

pub const SERVICE_NAME: &str = "price-stream";

#[derive(Clone)]
pub struct AppState {
    pub processors: Arc<ProcessorSet>,
    /// Backend serving `/history`.
    pub history: Arc<dyn QueryRepository>,
    pub instruments: Arc<Vec<Arc<Instrument>>>,
    /// Connected stream clients.
    pub clients: Arc<DashMap<ClientId, Arc<SubscriptionProcessor>>>,
    pub flush_timeout: Duration,
    next_client: Arc<AtomicU64>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl AppState {
    pub fn new(
        processors: Arc<ProcessorSet>,
        history: Arc<dyn QueryRepository>,
        instruments: Vec<Arc<Instrument>>,
        flush_timeout: Duration,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            processors,
            history,
            instruments: Arc::new(instruments),
            clients: Arc::new(DashMap::new()),
            flush_timeout,
            next_client: Arc::new(AtomicU64::new(1)),
            shutdown: Arc::new(shutdown),
        }
    }

    pub fn next_client_id(&self) -> ClientId {
        self.next_client.fetch_add(1, Ordering::Relaxed)
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Tell every stream session to end and stop their subscriptions.
    pub fn begin_shutdown(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        let clients: Vec<Arc<SubscriptionProcessor>> =
            self.clients.iter().map(|entry| Arc::clone(entry.value())).collect();
        for client in &clients {
            client.stop();
        }
        info!(clients = clients.len(), "Stream clients released");
    }
}
