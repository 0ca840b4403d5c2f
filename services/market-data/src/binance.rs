//! Binance book-ticker connector
//!
//! Subscribes to the combined `<symbol>@bookTicker` streams of every
//! registered instrument. Each update becomes one tick:
//! `price = (bid + ask) / 2`, `volume = bid_qty + ask_qty`, stamped with
//! the local receipt time. Malformed messages and unknown symbols are
//! logged and dropped. On disconnect the feed reconnects after a fixed
//! delay until closed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::watch;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::task::{JoinHandle, block_in_place};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use types::instrument::Source;

use crate::connector::{Connector, ConnectorError, PriceEventHandler};

pub const DEFAULT_ENDPOINT: &str = "wss://stream.binance.com:9443/stream";
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// One decoded book-ticker update.
#[derive(Debug, Clone, PartialEq)]
pub struct BookTicker {
    /// Upper-case symbol, e.g. `BTCUSDT`
    pub symbol: String,
    pub price: f64,
    pub volume: f64,
}

#[derive(Debug, Deserialize)]
struct RawBookTicker {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "b")]
    bid: String,
    #[serde(rename = "B")]
    bid_qty: String,
    #[serde(rename = "a")]
    ask: String,
    #[serde(rename = "A")]
    ask_qty: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Envelope {
    Combined { data: RawBookTicker },
    Single(RawBookTicker),
}

fn parse_number(field: &str, value: &str) -> Result<f64, String> {
    let parsed: f64 = value
        .parse()
        .map_err(|_| format!("{field} is not a number: {value:?}"))?;
    if !parsed.is_finite() || parsed < 0.0 {
        return Err(format!("{field} out of range: {value}"));
    }
    Ok(parsed)
}

/// Decode a combined-stream or single-stream book-ticker message.
pub fn parse_book_ticker(text: &str) -> Result<BookTicker, String> {
    let envelope: Envelope = serde_json::from_str(text).map_err(|e| e.to_string())?;
    let raw = match envelope {
        Envelope::Combined { data } => data,
        Envelope::Single(raw) => raw,
    };
    let bid = parse_number("bid", &raw.bid)?;
    let ask = parse_number("ask", &raw.ask)?;
    let bid_qty = parse_number("bid_qty", &raw.bid_qty)?;
    let ask_qty = parse_number("ask_qty", &raw.ask_qty)?;
    let price = (bid + ask) / 2.0;
    if price <= 0.0 {
        return Err(format!("non-positive mid price for {}", raw.symbol));
    }
    Ok(BookTicker {
        symbol: raw.symbol.to_ascii_uppercase(),
        price,
        volume: bid_qty + ask_qty,
    })
}

/// Combined stream URL for `symbols`, in the order given.
pub fn stream_url(endpoint: &str, symbols: &[String]) -> String {
    let streams: Vec<String> = symbols
        .iter()
        .map(|s| format!("{}@bookTicker", s.to_ascii_lowercase()))
        .collect();
    format!("{endpoint}?streams={}", streams.join("/"))
}

type Handlers = Arc<RwLock<HashMap<String, Arc<dyn PriceEventHandler>>>>;

pub struct BinanceConnector {
    endpoint: String,
    reconnect_delay: Duration,
    handlers: Handlers,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BinanceConnector {
    pub fn new() -> Self {
        Self::with_endpoint(DEFAULT_ENDPOINT, RECONNECT_DELAY)
    }

    pub fn with_endpoint(endpoint: impl Into<String>, reconnect_delay: Duration) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            endpoint: endpoint.into(),
            reconnect_delay,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            shutdown,
            task: Mutex::new(None),
        }
    }

    fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        symbols.sort();
        symbols
    }
}

impl Default for BinanceConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for BinanceConnector {
    fn source(&self) -> Source {
        Source::Binance
    }

    fn register(&self, handler: Arc<dyn PriceEventHandler>) {
        let symbol = handler.instrument().name().to_ascii_uppercase();
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(symbol, handler);
    }

    fn start(&self) -> Result<(), ConnectorError> {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return Err(ConnectorError::AlreadyStarted(Source::Binance));
        }
        let symbols = self.symbols();
        if symbols.is_empty() {
            warn!("No instruments registered, Binance feed not started");
            return Ok(());
        }
        let url = stream_url(&self.endpoint, &symbols);
        info!(streams = symbols.len(), url = %url, "Starting Binance feed");
        *task = Some(tokio::spawn(run_feed(
            url,
            Arc::clone(&self.handlers),
            self.shutdown.subscribe(),
            self.reconnect_delay,
        )));
        Ok(())
    }

    async fn close(&self) {
        self.shutdown.send_replace(true);
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Binance feed task failed");
            }
            info!("Binance feed closed");
        }
    }
}

/// Publishing may wait on a full ring, so on a multi-threaded runtime the
/// worker is handed over to blocking mode first.
fn dispatch_blocking(handlers: &Handlers, text: &str) {
    match Handle::try_current().map(|handle| handle.runtime_flavor()) {
        Ok(RuntimeFlavor::MultiThread) => block_in_place(|| dispatch(handlers, text)),
        _ => dispatch(handlers, text),
    }
}

fn dispatch(handlers: &Handlers, text: &str) {
    let ticker = match parse_book_ticker(text) {
        Ok(ticker) => ticker,
        Err(e) => {
            warn!(error = %e, "Dropped malformed Binance message");
            return;
        }
    };
    let handler = handlers
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&ticker.symbol)
        .cloned();
    match handler {
        Some(handler) => {
            let now = chrono::Utc::now().timestamp_millis();
            handler.handle_price_event(now, ticker.price, ticker.volume);
        }
        None => warn!(symbol = %ticker.symbol, "No instrument registered for symbol"),
    }
}

async fn run_feed(
    url: String,
    handlers: Handlers,
    mut shutdown: watch::Receiver<bool>,
    reconnect_delay: Duration,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        match connect_async(url.as_str()).await {
            Ok((stream, _response)) => {
                info!("Connected to Binance");
                let (mut write, mut read) = stream.split();
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => {
                            let _ = write.send(Message::Close(None)).await;
                            return;
                        }
                        message = read.next() => match message {
                            Some(Ok(Message::Text(text))) => dispatch_blocking(&handlers, &text),
                            Some(Ok(Message::Ping(data))) => {
                                if write.send(Message::Pong(data)).await.is_err() {
                                    break;
                                }
                            }
                            Some(Ok(Message::Close(frame))) => {
                                warn!(?frame, "Binance closed the connection");
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                warn!(error = %e, "Binance stream error");
                                break;
                            }
                            None => break,
                        }
                    }
                }
            }
            Err(e) => warn!(error = %e, "Failed to connect to Binance"),
        }
        debug!(delay_ms = reconnect_delay.as_millis() as u64, "Reconnecting to Binance");
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(reconnect_delay) => {}
        }
    }
}
