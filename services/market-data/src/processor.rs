//! Market Data Processor
//!
//! One per instrument. Owns the instrument's event pipeline:
//!
//! ```text
//! ticks ──┐                ┌─► aggregator(tf1) ─┐
//!         ├─► [ring] ──────┼─► aggregator(tf2) ─┼─► client notifier
//! timer ──┘                └─► aggregator(tfN) ─┘
//! ```
//!
//! Aggregators form one parallel stage-set; the notifier depends on all
//! of them.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};
use types::instrument::Instrument;

use crate::candles::{CandleAggregator, CandleListener, CandleSubscribers, ClientId};
use crate::connector::PriceEventHandler;
use crate::events::MarketDataEvent;
use crate::metrics::PipelineMetrics;
use crate::notifier::{ClientNotifier, CycleListener, NotifierRegistry};
use crate::pipeline::{Pipeline, PipelineBuilder, PipelineError, WaitStrategy};
use crate::timer::BoundaryListener;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessorError {
    #[error("Instrument {0} has no configured timeframes")]
    NoTimeframes(String),

    #[error("Instrument {instrument} has no {timeframe_ms}ms timeframe")]
    UnknownTimeframe { instrument: String, timeframe_ms: u64 },

    #[error("Instrument {instrument} lists timeframe {timeframe_ms}ms twice")]
    DuplicateTimeframe { instrument: String, timeframe_ms: u64 },

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

pub struct MarketDataProcessor {
    instrument: Arc<Instrument>,
    full_name: String,
    pipeline: Pipeline<MarketDataEvent>,
    subscribers: BTreeMap<u64, Arc<CandleSubscribers>>,
    notifier: Arc<NotifierRegistry>,
}

impl MarketDataProcessor {
    /// Build and start the pipeline. `sinks` receive every closed candle
    /// of every timeframe (persistence pipelines).
    pub fn new(
        instrument: Arc<Instrument>,
        capacity: usize,
        sinks: Vec<Arc<dyn CandleListener>>,
    ) -> Result<Self, ProcessorError> {
        Self::with_wait_strategy(instrument, capacity, sinks, WaitStrategy::default())
    }

    pub fn with_wait_strategy(
        instrument: Arc<Instrument>,
        capacity: usize,
        sinks: Vec<Arc<dyn CandleListener>>,
        wait: WaitStrategy,
    ) -> Result<Self, ProcessorError> {
        let full_name = instrument.full_name();
        if instrument.timeframes().is_empty() {
            return Err(ProcessorError::NoTimeframes(full_name));
        }

        let mut builder = PipelineBuilder::new(full_name.clone(), capacity).wait_strategy(wait);
        let mut subscribers = BTreeMap::new();
        let mut aggregators = Vec::with_capacity(instrument.timeframes().len());
        for &timeframe_ms in instrument.timeframes() {
            let registry = Arc::new(CandleSubscribers::new());
            if subscribers.insert(timeframe_ms, Arc::clone(&registry)).is_some() {
                return Err(ProcessorError::DuplicateTimeframe {
                    instrument: full_name,
                    timeframe_ms,
                });
            }
            let aggregator =
                CandleAggregator::new(Arc::clone(&instrument), timeframe_ms, sinks.clone(), registry);
            aggregators.push(builder.add_stage(format!("{timeframe_ms}ms"), aggregator, &[])?);
        }

        let notifier = Arc::new(NotifierRegistry::new());
        builder.add_stage(
            "notifier",
            ClientNotifier::new(full_name.clone(), Arc::clone(&notifier)),
            &aggregators,
        )?;
        let pipeline = builder.start()?;

        info!(
            instrument = %full_name,
            timeframes = ?instrument.timeframes(),
            "Market data processor started"
        );
        Ok(Self {
            instrument,
            full_name,
            pipeline,
            subscribers,
            notifier,
        })
    }

    pub fn instrument(&self) -> &Arc<Instrument> {
        &self.instrument
    }

    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        self.pipeline.metrics()
    }

    pub fn handle_tick(&self, timestamp: i64, price: f64, volume: f64) -> Result<i64, PipelineError> {
        let sequence = self.pipeline.publish(|slot| {
            *slot = MarketDataEvent::Tick {
                timestamp,
                price,
                volume,
            }
        })?;
        self.instrument.record_tick();
        Ok(sequence)
    }

    pub fn handle_boundary(&self, timestamp: i64) -> Result<i64, PipelineError> {
        self.pipeline
            .publish(|slot| *slot = MarketDataEvent::Boundary { timestamp })
    }

    /// Attach a client to one timeframe. Returns false if it already was.
    pub fn subscribe(
        &self,
        timeframe_ms: u64,
        client: ClientId,
        candles: Arc<dyn CandleListener>,
        cycles: Arc<dyn CycleListener>,
    ) -> Result<bool, ProcessorError> {
        let registry = self.timeframe(timeframe_ms)?;
        if !registry.insert(client, candles) {
            return Ok(false);
        }
        self.notifier.register(client, cycles);
        debug!(instrument = %self.full_name, timeframe_ms, client, "Client subscribed");
        Ok(true)
    }

    /// Detach a client from one timeframe. Returns false if it was not attached.
    pub fn unsubscribe(&self, timeframe_ms: u64, client: ClientId) -> Result<bool, ProcessorError> {
        let registry = self.timeframe(timeframe_ms)?;
        if !registry.remove(client) {
            return Ok(false);
        }
        self.notifier.unregister(client);
        debug!(instrument = %self.full_name, timeframe_ms, client, "Client unsubscribed");
        Ok(true)
    }

    pub fn has_timeframe(&self, timeframe_ms: u64) -> bool {
        self.subscribers.contains_key(&timeframe_ms)
    }

    fn timeframe(&self, timeframe_ms: u64) -> Result<&Arc<CandleSubscribers>, ProcessorError> {
        self.subscribers
            .get(&timeframe_ms)
            .ok_or_else(|| ProcessorError::UnknownTimeframe {
                instrument: self.full_name.clone(),
                timeframe_ms,
            })
    }

    /// Drain and stop the pipeline. Idempotent.
    pub fn halt(&self) {
        self.pipeline.halt();
    }
}

impl PriceEventHandler for MarketDataProcessor {
    fn instrument(&self) -> &Instrument {
        &self.instrument
    }

    fn handle_price_event(&self, timestamp_ms: i64, price: f64, volume: f64) {
        if let Err(e) = self.handle_tick(timestamp_ms, price, volume) {
            debug!(instrument = %self.full_name, error = %e, "Dropped tick");
        }
    }
}

impl BoundaryListener for MarketDataProcessor {
    fn on_boundary(&self, timestamp_ms: i64) {
        if let Err(e) = self.handle_boundary(timestamp_ms) {
            debug!(instrument = %self.full_name, error = %e, "Dropped boundary");
        }
    }
}

/// All processors, looked up by instrument full name.
#[derive(Default)]
pub struct ProcessorSet {
    by_name: BTreeMap<String, Arc<MarketDataProcessor>>,
}

impl ProcessorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, processor: Arc<MarketDataProcessor>) {
        self.by_name.insert(processor.full_name().to_string(), processor);
    }

    pub fn get(&self, full_name: &str) -> Option<&Arc<MarketDataProcessor>> {
        self.by_name.get(full_name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<MarketDataProcessor>> {
        self.by_name.values()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub fn halt_all(&self) {
        for processor in self.by_name.values() {
            processor.halt();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use types::candle::Candle;
    use types::instrument::Source;

    #[derive(Default)]
    struct Collect(Mutex<Vec<Candle>>);

    impl CandleListener for Collect {
        fn on_candle(&self, candle: &Candle) {
            self.0.lock().unwrap().push(candle.clone());
        }
    }

    #[derive(Default)]
    struct Cycles(Mutex<Vec<i64>>);

    impl CycleListener for Cycles {
        fn instrument_processed(&self, _instrument: &str, boundary_ts: i64) {
            self.0.lock().unwrap().push(boundary_ts);
        }
    }

    fn instrument(timeframes: Vec<u64>) -> Arc<Instrument> {
        Arc::new(Instrument::new("BTCUSDT", Source::Binance, timeframes))
    }

    #[test]
    fn test_rejects_zero_timeframes() {
        let result = MarketDataProcessor::new(instrument(vec![]), 64, Vec::new());
        assert!(matches!(result, Err(ProcessorError::NoTimeframes(name)) if name == "BTCUSDT@BINANCE"));
    }

    #[test]
    fn test_rejects_duplicate_timeframes() {
        let result = MarketDataProcessor::new(instrument(vec![1_000, 1_000]), 64, Vec::new());
        assert!(matches!(result, Err(ProcessorError::DuplicateTimeframe { .. })));
    }

    #[test]
    fn test_ticks_fan_out_to_every_timeframe() {
        let sink = Arc::new(Collect::default());
        let processor = MarketDataProcessor::new(
            instrument(vec![1_000, 60_000]),
            64,
            vec![sink.clone() as Arc<dyn CandleListener>],
        )
        .unwrap();

        processor.handle_tick(1_000, 100.0, 10.0).unwrap();
        processor.handle_tick(30_000, 110.0, 20.0).unwrap();
        processor.handle_tick(50_000, 95.0, 15.0).unwrap();
        processor.handle_tick(60_000, 120.0, 1.0).unwrap();
        processor.halt();

        let candles = sink.0.lock().unwrap();
        let minute: Vec<&Candle> = candles.iter().filter(|c| c.key.timeframe_ms == 60_000).collect();
        assert_eq!(minute.len(), 1);
        assert_eq!(minute[0].window_start, 0);
        assert_eq!(minute[0].open, 100.0);
        assert_eq!(minute[0].high, 110.0);
        assert_eq!(minute[0].low, 95.0);
        assert_eq!(minute[0].close, 95.0);
        assert_eq!(minute[0].volume, 45.0);

        let seconds = candles.iter().filter(|c| c.key.timeframe_ms == 1_000).count();
        assert_eq!(seconds, 3);
        assert_eq!(processor.instrument().ticks(), 4);
    }

    #[test]
    fn test_notifier_runs_after_aggregators() {
        let client = Arc::new(Collect::default());
        let cycles = Arc::new(Cycles::default());
        let processor = MarketDataProcessor::new(instrument(vec![1_000]), 64, Vec::new()).unwrap();
        assert!(processor
            .subscribe(1_000, 9, client.clone(), cycles.clone())
            .unwrap());
        assert!(!processor
            .subscribe(1_000, 9, client.clone(), cycles.clone())
            .unwrap());

        processor.handle_tick(1_200, 5.0, 1.0).unwrap();
        processor.handle_boundary(2_000).unwrap();
        processor.halt();

        assert_eq!(client.0.lock().unwrap().len(), 1);
        assert_eq!(*cycles.0.lock().unwrap(), vec![2_000]);
    }

    #[test]
    fn test_unknown_timeframe_and_unsubscribe() {
        let processor = MarketDataProcessor::new(instrument(vec![1_000]), 64, Vec::new()).unwrap();
        let client = Arc::new(Collect::default());
        let cycles = Arc::new(Cycles::default());
        assert!(matches!(
            processor.subscribe(5_000, 1, client.clone(), cycles.clone()),
            Err(ProcessorError::UnknownTimeframe { timeframe_ms: 5_000, .. })
        ));
        processor.subscribe(1_000, 1, client, cycles).unwrap();
        assert!(processor.unsubscribe(1_000, 1).unwrap());
        assert!(!processor.unsubscribe(1_000, 1).unwrap());
    }

    #[test]
    fn test_publish_after_halt_is_rejected() {
        let processor = MarketDataProcessor::new(instrument(vec![1_000]), 64, Vec::new()).unwrap();
        processor.halt();
        processor.halt();
        assert!(matches!(
            processor.handle_tick(1, 1.0, 1.0),
            Err(PipelineError::Halted(_))
        ));
        // Trait entry points swallow the rejection.
        processor.handle_price_event(1, 1.0, 1.0);
        processor.on_boundary(1_000);
    }
}
