//! End-to-end behaviour of the streaming pipeline: processors, timer,
//! persistence and per-client coalescing.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use market_data::candles::CandleListener;
use market_data::processor::{MarketDataProcessor, ProcessorSet};
use market_data::storage::PersistencePipeline;
use market_data::subscription::{
    ClientTransport, OUTBOUND_QUEUE_CAPACITY, SubscriptionProcessor, TransportError,
};
use market_data::timer::{BoundaryListener, BoundaryTimer};
use persistence::memory::MemoryRepository;
use persistence::QueryRepository;
use tokio::sync::mpsc;
use types::instrument::{Instrument, Source};

const BTC: &str = "BTCUSDT@BINANCE";
const ETH: &str = "ETHUSDT@BINANCE";

struct ChannelTransport(mpsc::UnboundedSender<String>);

#[async_trait]
impl ClientTransport for ChannelTransport {
    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.0.send(text).map_err(|_| TransportError::Closed)
    }
}

/// Never completes a send.
struct StalledTransport;

#[async_trait]
impl ClientTransport for StalledTransport {
    async fn send_text(&self, _text: String) -> Result<(), TransportError> {
        std::future::pending().await
    }
}

fn processor(name: &str, timeframes: Vec<u64>) -> Arc<MarketDataProcessor> {
    let instrument = Arc::new(Instrument::new(name, Source::Binance, timeframes));
    Arc::new(MarketDataProcessor::new(instrument, 256, Vec::new()).unwrap())
}

fn processor_set(processors: &[&Arc<MarketDataProcessor>]) -> Arc<ProcessorSet> {
    let mut set = ProcessorSet::new();
    for p in processors {
        set.insert(Arc::clone(p));
    }
    Arc::new(set)
}

/// Block until the pipeline has processed `events` stage invocations.
async fn wait_processed(processor: &MarketDataProcessor, events: u64) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while processor.metrics().processed() < events {
        assert!(Instant::now() < deadline, "pipeline did not catch up");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn parse(text: &str) -> Vec<serde_json::Value> {
    serde_json::from_str(text).unwrap()
}

#[test]
fn test_reference_window_is_persisted() {
    let repo = Arc::new(MemoryRepository::new());
    let persistence = Arc::new(PersistencePipeline::new(repo.clone(), 64).unwrap());
    let instrument = Arc::new(Instrument::new("BTCUSDT", Source::Binance, vec![60_000]));
    let processor = MarketDataProcessor::new(
        Arc::clone(&instrument),
        64,
        vec![persistence.clone() as Arc<dyn CandleListener>],
    )
    .unwrap();

    processor.handle_tick(1_000, 100.0, 10.0).unwrap();
    processor.handle_tick(30_000, 110.0, 20.0).unwrap();
    processor.handle_tick(50_000, 95.0, 15.0).unwrap();
    processor.handle_tick(60_000, 120.0, 3.0).unwrap();
    processor.halt();
    persistence.halt();

    let stored = repo.query_candles(BTC, 60_000, 0, 120_000).unwrap();
    assert_eq!(stored.len(), 1);
    let candle = &stored[0];
    assert_eq!(candle.window_start, 0);
    assert_eq!(
        (candle.open, candle.high, candle.low, candle.close, candle.volume),
        (100.0, 110.0, 95.0, 95.0, 45.0)
    );
    assert_eq!(instrument.ticks(), 4);
    assert_eq!(instrument.candles(), 1);
}

#[tokio::test]
async fn test_two_instruments_arrive_in_one_batch() {
    let btc = processor("BTCUSDT", vec![1_000]);
    let eth = processor("ETHUSDT", vec![1_000]);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let client = SubscriptionProcessor::start(
        1,
        processor_set(&[&btc, &eth]),
        Arc::new(ChannelTransport(tx)),
        Duration::from_secs(30),
    );
    assert!(client.subscribe(BTC, 1_000).unwrap());
    assert!(client.subscribe(ETH, 1_000).unwrap());

    btc.handle_tick(1_100, 50_000.0, 1.0).unwrap();
    eth.handle_tick(1_900, 3_000.0, 2.0).unwrap();
    eth.handle_boundary(2_000).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    btc.handle_boundary(2_000).unwrap();

    let text = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    let batch = parse(&text);
    assert_eq!(batch.len(), 2);
    assert_eq!(batch[0]["i"], BTC);
    assert_eq!(batch[1]["i"], ETH);
    assert_eq!(batch[0]["t"], 1);

    assert!(tokio::time::timeout(Duration::from_millis(200), rx.recv())
        .await
        .is_err());
    client.shutdown().await;
}

#[tokio::test]
async fn test_latest_candle_per_key_wins_within_cycle() {
    let btc = processor("BTCUSDT", vec![1_000]);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let client = SubscriptionProcessor::start(
        2,
        processor_set(&[&btc]),
        Arc::new(ChannelTransport(tx)),
        Duration::from_secs(30),
    );
    client.subscribe(BTC, 1_000).unwrap();

    // Two windows close before the boundary of the cycle arrives.
    btc.handle_tick(1_100, 1.0, 1.0).unwrap();
    btc.handle_tick(2_100, 2.0, 1.0).unwrap();
    btc.handle_tick(3_100, 3.0, 1.0).unwrap();
    btc.handle_boundary(4_000).unwrap();

    let text = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    let batch = parse(&text);
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0]["t"], 3);
    assert_eq!(batch[0]["c"], 3.0);
    client.shutdown().await;
}

#[tokio::test]
async fn test_unsubscribe_mid_cycle_does_not_hang() {
    let btc = processor("BTCUSDT", vec![1_000]);
    let eth = processor("ETHUSDT", vec![1_000]);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let client = SubscriptionProcessor::start(
        3,
        processor_set(&[&btc, &eth]),
        Arc::new(ChannelTransport(tx)),
        Duration::from_secs(30),
    );
    client.subscribe(BTC, 1_000).unwrap();
    client.subscribe(ETH, 1_000).unwrap();

    btc.handle_tick(1_100, 10.0, 1.0).unwrap();
    btc.handle_boundary(2_000).unwrap();
    // tick + boundary through one aggregator and the notifier
    wait_processed(&btc, 4).await;

    // ETH never reports; dropping it completes the cycle for BTC.
    assert!(client.unsubscribe(ETH, 1_000).unwrap());
    let text = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    let batch = parse(&text);
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0]["i"], BTC);

    // With nothing subscribed, later cycles stay silent.
    assert!(client.unsubscribe(BTC, 1_000).unwrap());
    assert_eq!(client.expected_instruments(), 0);
    btc.handle_tick(2_100, 11.0, 1.0).unwrap();
    btc.handle_boundary(3_000).unwrap();
    eth.handle_boundary(3_000).unwrap();
    assert!(tokio::time::timeout(Duration::from_millis(200), rx.recv())
        .await
        .is_err());
    client.shutdown().await;
}

#[tokio::test]
async fn test_flush_timeout_drains_stalled_cycle() {
    let btc = processor("BTCUSDT", vec![1_000]);
    let eth = processor("ETHUSDT", vec![1_000]);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let client = SubscriptionProcessor::start(
        4,
        processor_set(&[&btc, &eth]),
        Arc::new(ChannelTransport(tx)),
        Duration::from_millis(100),
    );
    client.subscribe(BTC, 1_000).unwrap();
    client.subscribe(ETH, 1_000).unwrap();

    btc.handle_tick(1_100, 10.0, 1.0).unwrap();
    btc.handle_boundary(2_000).unwrap();

    let text = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(parse(&text).len(), 1);
    client.shutdown().await;
}

#[tokio::test]
async fn test_empty_cycles_restart_flush_timeout() {
    let btc = processor("BTCUSDT", vec![1_000]);
    let eth = processor("ETHUSDT", vec![1_000]);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let client = SubscriptionProcessor::start(
        7,
        processor_set(&[&btc, &eth]),
        Arc::new(ChannelTransport(tx)),
        Duration::from_millis(400),
    );
    client.subscribe(BTC, 1_000).unwrap();
    client.subscribe(ETH, 1_000).unwrap();

    // Cycles with no candles, spanning more than one flush timeout.
    for cycle in 1..=7 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        btc.handle_boundary(cycle * 1_000).unwrap();
        eth.handle_boundary(cycle * 1_000).unwrap();
    }
    wait_processed(&btc, 14).await;
    wait_processed(&eth, 14).await;

    btc.handle_tick(7_100, 10.0, 1.0).unwrap();
    eth.handle_tick(7_200, 20.0, 1.0).unwrap();
    btc.handle_boundary(8_000).unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(rx.try_recv().is_err(), "half a cycle was flushed early");
    eth.handle_boundary(8_000).unwrap();

    let text = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    let batch = parse(&text);
    assert_eq!(batch.len(), 2);
    assert_eq!(batch[0]["t"], 7);
    assert_eq!(batch[1]["t"], 7);
    client.shutdown().await;
}

#[tokio::test]
async fn test_slow_client_queue_is_bounded() {
    let btc = processor("BTCUSDT", vec![1_000]);
    let client = SubscriptionProcessor::start(
        8,
        processor_set(&[&btc]),
        Arc::new(StalledTransport),
        Duration::from_secs(30),
    );
    client.subscribe(BTC, 1_000).unwrap();

    let cycles = OUTBOUND_QUEUE_CAPACITY as i64 + 20;
    for cycle in 1..=cycles {
        btc.handle_tick(cycle * 1_000 + 100, 1.0, 1.0).unwrap();
        btc.handle_boundary((cycle + 1) * 1_000).unwrap();
    }
    wait_processed(&btc, 4 * cycles as u64).await;

    // One batch is stuck in the transport, the rest fill the queue.
    assert!(client.batches_queued() <= OUTBOUND_QUEUE_CAPACITY as u64 + 1);
    assert!(client.batches_dropped() >= 19);
    assert_eq!(
        client.batches_queued() + client.batches_dropped(),
        cycles as u64
    );
    client.stop();
    assert!(client.is_stopped());
}

#[test]
fn test_late_tick_does_not_reopen_closed_window() {
    let repo = Arc::new(MemoryRepository::new());
    let persistence = Arc::new(PersistencePipeline::new(repo.clone(), 64).unwrap());
    let instrument = Arc::new(Instrument::new("BTCUSDT", Source::Binance, vec![1_000]));
    let processor = MarketDataProcessor::new(
        Arc::clone(&instrument),
        64,
        vec![persistence.clone() as Arc<dyn CandleListener>],
    )
    .unwrap();

    processor.handle_tick(1_100, 10.0, 1.0).unwrap();
    processor.handle_boundary(2_000).unwrap();
    processor.handle_tick(1_999, 99.0, 5.0).unwrap();
    processor.handle_boundary(3_000).unwrap();
    processor.halt();
    persistence.halt();

    let stored = repo.query_candles(BTC, 1_000, 0, i64::MAX).unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].window_start, 1_000);
    assert_eq!((stored[0].close, stored[0].volume), (10.0, 1.0));
}

#[tokio::test]
async fn test_stop_releases_everything() {
    let btc = processor("BTCUSDT", vec![1_000, 60_000]);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let client = SubscriptionProcessor::start(
        5,
        processor_set(&[&btc]),
        Arc::new(ChannelTransport(tx)),
        Duration::from_secs(30),
    );
    client.subscribe(BTC, 1_000).unwrap();
    client.subscribe(BTC, 60_000).unwrap();
    assert_eq!(client.expected_instruments(), 1);
    assert!(client.subscribe("DOGEUSDT@BINANCE", 1_000).is_err());

    client.shutdown().await;
    client.stop();
    assert!(client.is_stopped());
    assert!(client.subscriptions().is_empty());
    assert!(client.subscribe(BTC, 1_000).is_err());

    btc.handle_tick(1_100, 1.0, 1.0).unwrap();
    btc.handle_boundary(2_000).unwrap();
    wait_processed(&btc, 6).await;
    assert!(rx.recv().await.is_none());
}

#[test]
fn test_halt_twice_is_noop() {
    let repo = Arc::new(MemoryRepository::new());
    let persistence = Arc::new(PersistencePipeline::new(repo, 16).unwrap());
    let processor = MarketDataProcessor::new(
        Arc::new(Instrument::new("BTCUSDT", Source::Binance, vec![1_000])),
        16,
        vec![persistence.clone() as Arc<dyn CandleListener>],
    )
    .unwrap();
    processor.handle_tick(1, 1.0, 1.0).unwrap();

    processor.halt();
    processor.halt();
    persistence.halt();
    persistence.halt();
    assert!(processor.handle_boundary(1_000).is_err());
}

#[test]
fn test_timer_closes_windows_without_ticks() {
    let repo = Arc::new(MemoryRepository::new());
    let persistence = Arc::new(PersistencePipeline::new(repo.clone(), 64).unwrap());
    let instrument = Arc::new(Instrument::new("BTCUSDT", Source::Binance, vec![100]));
    let btc = Arc::new(
        MarketDataProcessor::new(
            instrument,
            64,
            vec![persistence.clone() as Arc<dyn CandleListener>],
        )
        .unwrap(),
    );
    let timer = BoundaryTimer::with_period(Duration::from_millis(100));
    timer.add(btc.clone() as Arc<dyn BoundaryListener>);
    timer.start().unwrap();

    let now = chrono::Utc::now().timestamp_millis();
    btc.handle_tick(now, 42.0, 1.0).unwrap();
    std::thread::sleep(Duration::from_millis(400));

    timer.stop();
    btc.halt();
    persistence.halt();

    let stored = repo.query_candles(BTC, 100, 0, i64::MAX).unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].window_start, now - now % 100);
    assert_eq!(stored[0].close, 42.0);
}
