//! Subscription Processor
//!
//! One per connected client. Candles for the client's keys are coalesced
//! into a map (latest per key wins). Each subscribed instrument reports
//! once per cycle through the client notifier; the last one to arrive
//! swaps the map out and queues it for the sender task, which writes one
//! message per cycle. Every completed cycle restarts the flush timeout,
//! whether or not it carried candles; if none completes within it the
//! sender drains whatever is pending. At most `OUTBOUND_QUEUE_CAPACITY`
//! batches wait for a slow client, newer ones are dropped.
//!
//! Lock order: subscriptions, then barrier, then pending. Callers into
//! this type (aggregators and notifiers) hold no registry lock while
//! calling, so taking these locks under a registry write is safe.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use types::candle::{Candle, CandleUpdate, SubscriptionKey};

use crate::barrier::CycleBarrier;
use crate::candles::{CandleListener, ClientId};
use crate::notifier::CycleListener;
use crate::processor::{ProcessorError, ProcessorSet};

pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_millis(1500);

/// Batches queued per client before new ones are dropped.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 64;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection closed")]
    Closed,

    #[error("Send failed: {0}")]
    Send(String),
}

/// Delivers serialized messages to one client connection.
#[async_trait]
pub trait ClientTransport: Send + Sync {
    async fn send_text(&self, text: String) -> Result<(), TransportError>;
}

#[derive(Error, Debug)]
pub enum SubscriptionError {
    #[error("Unknown instrument: {0}")]
    UnknownInstrument(String),

    #[error("Client {0} is stopped")]
    Stopped(ClientId),

    #[error(transparent)]
    Processor(#[from] ProcessorError),
}

/// Inbound control message from a stream client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum ControlMessage {
    Subscribe { instrument: String, timeframe: u64 },
    Unsubscribe { instrument: String, timeframe: u64 },
}

enum Outbound {
    Batch(Vec<Candle>),
    Stop,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Serialize one outbound batch, ordered by key then window.
pub fn encode_batch(candles: &[Candle]) -> Result<String, serde_json::Error> {
    let updates: Vec<CandleUpdate> = candles.iter().map(Candle::to_update).collect();
    serde_json::to_string(&updates)
}

struct ClientState {
    client: ClientId,
    subscriptions: Mutex<BTreeSet<SubscriptionKey>>,
    barrier: Mutex<CycleBarrier>,
    pending: Mutex<HashMap<SubscriptionKey, Candle>>,
    outbound: mpsc::Sender<Outbound>,
    /// Signalled on every completed cycle and on stop.
    cycle_done: Notify,
    stopped: AtomicBool,
    batches_queued: AtomicU64,
    batches_dropped: AtomicU64,
}

impl ClientState {
    /// Swap the pending map out and queue it. Takes the barrier guard to
    /// keep flushes ordered with cycle completion.
    fn flush_locked(&self, _barrier: &mut CycleBarrier) {
        let drained = std::mem::take(&mut *lock(&self.pending));
        if drained.is_empty() {
            return;
        }
        let mut candles: Vec<Candle> = drained.into_values().collect();
        candles.sort_by(|a, b| {
            a.key
                .cmp(&b.key)
                .then(a.window_start.cmp(&b.window_start))
        });
        match self.outbound.try_send(Outbound::Batch(candles)) {
            Ok(()) => {
                self.batches_queued.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(_)) => {
                let dropped = self.batches_dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(client = self.client, dropped, "Client is slow, batch dropped");
            }
            Err(TrySendError::Closed(_)) => {
                debug!(client = self.client, "Sender loop gone, batch dropped");
            }
        }
    }

    /// A cycle completed. Flush what it produced and restart the timeout.
    fn complete_cycle(&self, barrier: &mut CycleBarrier) {
        self.flush_locked(barrier);
        self.cycle_done.notify_one();
    }

    /// Timeout path: release every waiting cycle and drain.
    fn force_flush(&self) {
        let mut barrier = lock(&self.barrier);
        if let Some(cycle) = barrier.release_all() {
            trace!(client = self.client, cycle, "Flush timeout released cycle");
        }
        self.flush_locked(&mut barrier);
    }
}

impl CandleListener for ClientState {
    fn on_candle(&self, candle: &Candle) {
        let subscriptions = lock(&self.subscriptions);
        if !subscriptions.contains(&candle.key) {
            return;
        }
        lock(&self.pending).insert(candle.key.clone(), candle.clone());
    }
}

impl CycleListener for ClientState {
    fn instrument_processed(&self, instrument: &str, boundary_ts: i64) {
        let mut barrier = lock(&self.barrier);
        if let Some(cycle) = barrier.arrive(instrument, boundary_ts) {
            trace!(client = self.client, cycle, "Cycle complete");
            self.complete_cycle(&mut barrier);
        }
    }
}

pub struct SubscriptionProcessor {
    client: ClientId,
    state: Arc<ClientState>,
    processors: Arc<ProcessorSet>,
    sender: Mutex<Option<JoinHandle<()>>>,
}

impl SubscriptionProcessor {
    /// Create the processor and spawn its sender task on the current runtime.
    pub fn start(
        client: ClientId,
        processors: Arc<ProcessorSet>,
        transport: Arc<dyn ClientTransport>,
        flush_timeout: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let state = Arc::new(ClientState {
            client,
            subscriptions: Mutex::new(BTreeSet::new()),
            barrier: Mutex::new(CycleBarrier::new()),
            pending: Mutex::new(HashMap::new()),
            outbound: tx,
            cycle_done: Notify::new(),
            stopped: AtomicBool::new(false),
            batches_queued: AtomicU64::new(0),
            batches_dropped: AtomicU64::new(0),
        });
        let sender = tokio::spawn(run_sender(
            Arc::clone(&state),
            rx,
            transport,
            flush_timeout,
        ));
        debug!(client, "Subscription processor started");
        Self {
            client,
            state,
            processors,
            sender: Mutex::new(Some(sender)),
        }
    }

    pub fn client(&self) -> ClientId {
        self.client
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionKey> {
        lock(&self.state.subscriptions).iter().cloned().collect()
    }

    /// Batches handed to the sender so far.
    pub fn batches_queued(&self) -> u64 {
        self.state.batches_queued.load(Ordering::Relaxed)
    }

    /// Batches dropped because the outbound queue was full.
    pub fn batches_dropped(&self) -> u64 {
        self.state.batches_dropped.load(Ordering::Relaxed)
    }

    /// Distinct instruments each cycle waits for.
    pub fn expected_instruments(&self) -> usize {
        lock(&self.state.barrier).expected()
    }

    pub fn is_stopped(&self) -> bool {
        self.state.stopped.load(Ordering::Acquire)
    }

    /// Returns false if the key was already subscribed.
    pub fn subscribe(&self, instrument: &str, timeframe_ms: u64) -> Result<bool, SubscriptionError> {
        if self.is_stopped() {
            return Err(SubscriptionError::Stopped(self.client));
        }
        let mut subscriptions = lock(&self.state.subscriptions);
        let key = SubscriptionKey::new(instrument, timeframe_ms);
        if subscriptions.contains(&key) {
            return Ok(false);
        }
        let processor = self
            .processors
            .get(instrument)
            .ok_or_else(|| SubscriptionError::UnknownInstrument(instrument.to_string()))?;

        let candles: Arc<dyn CandleListener> = self.state.clone();
        let cycles: Arc<dyn CycleListener> = self.state.clone();
        processor.subscribe(timeframe_ms, self.client, candles, cycles)?;
        lock(&self.state.barrier).track(instrument);
        subscriptions.insert(key);
        info!(client = self.client, instrument, timeframe_ms, "Subscribed");
        Ok(true)
    }

    /// Returns false if the key was not subscribed.
    pub fn unsubscribe(&self, instrument: &str, timeframe_ms: u64) -> Result<bool, SubscriptionError> {
        let mut subscriptions = lock(&self.state.subscriptions);
        let key = SubscriptionKey::new(instrument, timeframe_ms);
        if !subscriptions.remove(&key) {
            return Ok(false);
        }
        if let Some(processor) = self.processors.get(instrument) {
            processor.unsubscribe(timeframe_ms, self.client)?;
        }
        lock(&self.state.pending).remove(&key);

        let mut barrier = lock(&self.state.barrier);
        if barrier.forget(instrument) {
            if let Some(cycle) = barrier.recheck() {
                trace!(client = self.client, cycle, "Unsubscribe completed cycle");
                self.state.complete_cycle(&mut barrier);
            }
        }
        info!(client = self.client, instrument, timeframe_ms, "Unsubscribed");
        Ok(true)
    }

    /// Apply one control message from the client.
    pub fn handle_control(&self, message: ControlMessage) -> Result<bool, SubscriptionError> {
        match message {
            ControlMessage::Subscribe {
                instrument,
                timeframe,
            } => self.subscribe(&instrument, timeframe),
            ControlMessage::Unsubscribe {
                instrument,
                timeframe,
            } => self.unsubscribe(&instrument, timeframe),
        }
    }

    /// Unregister everything and end the sender task. Idempotent.
    pub fn stop(&self) {
        if self.state.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let keys = std::mem::take(&mut *lock(&self.state.subscriptions));
        for key in &keys {
            if let Some(processor) = self.processors.get(&key.instrument) {
                if let Err(e) = processor.unsubscribe(key.timeframe_ms, self.client) {
                    warn!(client = self.client, key = %key, error = %e, "Unsubscribe on stop failed");
                }
            }
        }
        lock(&self.state.barrier).reset();
        lock(&self.state.pending).clear();
        if self.state.outbound.try_send(Outbound::Stop).is_err() {
            // Queue full or sender gone; the sender sees the flag on wake.
            self.state.cycle_done.notify_one();
        }
        info!(client = self.client, released = keys.len(), "Subscription processor stopped");
    }

    /// Stop and wait for the sender task to exit.
    pub async fn shutdown(&self) {
        self.stop();
        let handle = lock(&self.sender).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(client = self.client, error = %e, "Sender task failed");
            }
        }
    }
}

impl Drop for SubscriptionProcessor {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_sender(
    state: Arc<ClientState>,
    mut rx: mpsc::Receiver<Outbound>,
    transport: Arc<dyn ClientTransport>,
    flush_timeout: Duration,
) {
    let client = state.client;
    let deadline = tokio::time::sleep(flush_timeout);
    tokio::pin!(deadline);
    loop {
        let outbound = tokio::select! {
            outbound = rx.recv() => outbound,
            _ = state.cycle_done.notified() => {
                if state.stopped.load(Ordering::Acquire) {
                    break;
                }
                deadline.as_mut().reset(Instant::now() + flush_timeout);
                continue;
            }
            _ = &mut deadline => {
                if state.stopped.load(Ordering::Acquire) {
                    break;
                }
                state.force_flush();
                deadline.as_mut().reset(Instant::now() + flush_timeout);
                continue;
            }
        };
        match outbound {
            Some(Outbound::Batch(candles)) => {
                let text = match encode_batch(&candles) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(client, error = %e, "Failed to encode batch");
                        continue;
                    }
                };
                match transport.send_text(text).await {
                    Ok(()) => trace!(client, entries = candles.len(), "Batch sent"),
                    Err(TransportError::Closed) => {
                        debug!(client, "Transport closed, sender exiting");
                        break;
                    }
                    Err(e) => warn!(client, error = %e, "Batch send failed"),
                }
            }
            Some(Outbound::Stop) | None => break,
        }
    }
    debug!(client, "Sender loop finished");
}
