//! Event Pipeline
//!
//! A fixed-capacity ring of pre-allocated slots with sequence-based
//! coordination. Any number of producers publish into it; consumers are
//! stages arranged as a DAG, each on its own OS thread. A stage processes
//! sequence N only after every stage it depends on has finished N.
//!
//! ```text
//!  producers ──► [ring] ──► stage A ─┐
//!                      └──► stage B ─┴──► stage C   (C depends on A and B)
//! ```
//!
//! Producers never overwrite a slot the slowest terminal stage has not
//! consumed; a full ring makes `publish` wait. `halt` seals the ring,
//! lets every stage drain what was claimed before the seal, then joins
//! the stage threads.

pub mod handler;
pub mod ring;
pub mod sequence;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use thiserror::Error;
use tracing::{debug, info, warn};

pub use handler::EventHandler;
pub use ring::RingBuffer;
pub use sequence::{Sequence, WaitStrategy};

use crate::metrics::PipelineMetrics;
use handler::{HaltSignal, StageRunner};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("Ring buffer capacity must be a non-zero power of two, got {0}")]
    InvalidCapacity(usize),

    #[error("Pipeline {0} has no stages")]
    NoStages(String),

    #[error("Stage dependency {0} does not exist")]
    UnknownStage(usize),

    #[error("Pipeline {0} is halted")]
    Halted(String),

    #[error("Failed to spawn stage thread: {0}")]
    Spawn(String),
}

/// Handle to a stage added to a [`PipelineBuilder`], used to declare
/// dependencies of later stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StageId(usize);

struct StageSpec<T> {
    name: String,
    handler: Box<dyn EventHandler<T>>,
    dependencies: Vec<StageId>,
}

pub struct PipelineBuilder<T> {
    name: String,
    capacity: usize,
    wait: WaitStrategy,
    stages: Vec<StageSpec<T>>,
}

impl<T: Default + Send + Sync + 'static> PipelineBuilder<T> {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            capacity,
            wait: WaitStrategy::default(),
            stages: Vec::new(),
        }
    }

    pub fn wait_strategy(mut self, wait: WaitStrategy) -> Self {
        self.wait = wait;
        self
    }

    /// Add a stage that runs after every stage in `after`.
    ///
    /// Stages added with the same dependencies form a parallel stage-set.
    pub fn add_stage(
        &mut self,
        name: impl Into<String>,
        handler: impl EventHandler<T> + 'static,
        after: &[StageId],
    ) -> Result<StageId, PipelineError> {
        if let Some(missing) = after.iter().find(|id| id.0 >= self.stages.len()) {
            return Err(PipelineError::UnknownStage(missing.0));
        }
        self.stages.push(StageSpec {
            name: name.into(),
            handler: Box::new(handler),
            dependencies: after.to_vec(),
        });
        Ok(StageId(self.stages.len() - 1))
    }

    /// Allocate the ring and spawn one thread per stage.
    pub fn start(self) -> Result<Pipeline<T>, PipelineError> {
        if self.stages.is_empty() {
            return Err(PipelineError::NoStages(self.name));
        }

        let sequences: Vec<Arc<Sequence>> = self
            .stages
            .iter()
            .map(|_| Arc::new(Sequence::default()))
            .collect();

        let mut is_dependency = vec![false; self.stages.len()];
        for stage in &self.stages {
            for dep in &stage.dependencies {
                is_dependency[dep.0] = true;
            }
        }
        let gating: Vec<Arc<Sequence>> = sequences
            .iter()
            .zip(&is_dependency)
            .filter(|(_, used)| !**used)
            .map(|(seq, _)| Arc::clone(seq))
            .collect();

        let ring = Arc::new(RingBuffer::new(self.capacity, gating)?);
        let halt = Arc::new(HaltSignal::new());
        let metrics = Arc::new(PipelineMetrics::new());

        let mut handles = Vec::with_capacity(self.stages.len());
        for (index, spec) in self.stages.into_iter().enumerate() {
            let runner = StageRunner {
                pipeline: self.name.clone(),
                stage: spec.name.clone(),
                handler: spec.handler,
                ring: Arc::clone(&ring),
                sequence: Arc::clone(&sequences[index]),
                dependencies: spec
                    .dependencies
                    .iter()
                    .map(|dep| Arc::clone(&sequences[dep.0]))
                    .collect(),
                halt: Arc::clone(&halt),
                metrics: Arc::clone(&metrics),
                wait: self.wait,
            };
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", self.name, spec.name))
                .spawn(move || runner.run());
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    // Stop whatever already started before reporting.
                    halt.raise(ring.seal());
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(PipelineError::Spawn(e.to_string()));
                }
            }
        }

        info!(
            pipeline = %self.name,
            capacity = self.capacity,
            stages = handles.len(),
            "Pipeline started"
        );

        Ok(Pipeline {
            name: self.name,
            ring,
            halt,
            metrics,
            halted: AtomicBool::new(false),
            handles: Mutex::new(handles),
        })
    }
}

pub struct Pipeline<T> {
    name: String,
    ring: Arc<RingBuffer<T>>,
    halt: Arc<HaltSignal>,
    metrics: Arc<PipelineMetrics>,
    halted: AtomicBool,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<T> Pipeline<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Claim the next slot, populate it in place and make it visible.
    ///
    /// Safe to call from several threads; each caller's own events keep
    /// their submission order. Waits while the ring is full.
    pub fn publish<F: FnOnce(&mut T)>(&self, fill: F) -> Result<i64, PipelineError> {
        let sequence = self
            .ring
            .claim_next()
            .ok_or_else(|| PipelineError::Halted(self.name.clone()))?;
        self.ring.fill_and_publish(sequence, fill);
        self.metrics.record_published();
        Ok(sequence)
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Highest sequence claimed so far.
    pub fn cursor(&self) -> i64 {
        self.ring.cursor()
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    /// Drain everything published so far, then stop all stages.
    ///
    /// Idempotent; later calls return immediately.
    pub fn halt(&self) {
        if self.halted.swap(true, Ordering::AcqRel) {
            return;
        }
        let target = self.ring.seal();
        self.halt.raise(target);

        let handles = std::mem::take(
            &mut *self.handles.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for handle in handles {
            if handle.join().is_err() {
                warn!(pipeline = %self.name, "Stage thread terminated abnormally");
            }
        }
        debug!(pipeline = %self.name, last_sequence = target, "Pipeline halted");
    }
}

impl<T> Drop for Pipeline<T> {
    fn drop(&mut self) {
        self.halt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::sync::Mutex as StdMutex;

    fn recorder(log: Arc<StdMutex<Vec<(u64, bool)>>>) -> impl EventHandler<u64> {
        move |event: &u64, _seq: i64, eob: bool| {
            log.lock().unwrap().push((*event, eob));
            Ok::<(), anyhow::Error>(())
        }
    }

    #[test]
    fn test_single_stage_sees_every_event_in_order() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let mut builder = PipelineBuilder::new("test", 8);
        builder.add_stage("record", recorder(Arc::clone(&log)), &[]).unwrap();
        let pipeline = builder.start().unwrap();

        for i in 0..100u64 {
            pipeline.publish(|slot| *slot = i).unwrap();
        }
        pipeline.halt();

        let events: Vec<u64> = log.lock().unwrap().iter().map(|(v, _)| *v).collect();
        assert_eq!(events, (0..100).collect::<Vec<_>>());
        assert_eq!(log.lock().unwrap().last().map(|(_, eob)| *eob), Some(true));
        assert_eq!(pipeline.metrics().published(), 100);
        assert_eq!(pipeline.metrics().processed(), 100);
    }

    #[test]
    fn test_dependent_stage_runs_after_dependencies() {
        // Stage C must never observe a sequence that A or B has not finished.
        let a_done = Arc::new(AtomicU64::new(0));
        let b_done = Arc::new(AtomicU64::new(0));
        let violations = Arc::new(AtomicU64::new(0));

        let mut builder = PipelineBuilder::new("dag", 16);
        let a = {
            let done = Arc::clone(&a_done);
            builder
                .add_stage(
                    "a",
                    move |_: &u64, _: i64, _: bool| {
                        done.fetch_add(1, Ordering::SeqCst);
                        Ok::<(), anyhow::Error>(())
                    },
                    &[],
                )
                .unwrap()
        };
        let b = {
            let done = Arc::clone(&b_done);
            builder
                .add_stage(
                    "b",
                    move |_: &u64, _: i64, _: bool| {
                        done.fetch_add(1, Ordering::SeqCst);
                        Ok::<(), anyhow::Error>(())
                    },
                    &[],
                )
                .unwrap()
        };
        {
            let (a_done, b_done, violations) =
                (Arc::clone(&a_done), Arc::clone(&b_done), Arc::clone(&violations));
            builder
                .add_stage(
                    "c",
                    move |_: &u64, seq: i64, _: bool| {
                        let needed = seq as u64 + 1;
                        if a_done.load(Ordering::SeqCst) < needed
                            || b_done.load(Ordering::SeqCst) < needed
                        {
                            violations.fetch_add(1, Ordering::SeqCst);
                        }
                        Ok::<(), anyhow::Error>(())
                    },
                    &[a, b],
                )
                .unwrap();
        }
        let pipeline = builder.start().unwrap();
        for i in 0..1_000u64 {
            pipeline.publish(|slot| *slot = i).unwrap();
        }
        pipeline.halt();

        assert_eq!(violations.load(Ordering::SeqCst), 0);
        assert_eq!(a_done.load(Ordering::SeqCst), 1_000);
        assert_eq!(pipeline.metrics().processed(), 3_000);
    }

    #[test]
    fn test_failing_and_panicking_handlers_are_contained() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let mut builder = PipelineBuilder::new("faulty", 4);
        let sink = Arc::clone(&log);
        builder
            .add_stage(
                "faulty",
                move |event: &u64, _: i64, _: bool| {
                    match *event {
                        3 => anyhow::bail!("bad event"),
                        5 => panic!("handler bug"),
                        v => sink.lock().unwrap().push(v),
                    }
                    Ok(())
                },
                &[],
            )
            .unwrap();
        let pipeline = builder.start().unwrap();
        for i in 0..8u64 {
            pipeline.publish(|slot| *slot = i).unwrap();
        }
        pipeline.halt();

        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 4, 6, 7]);
        assert_eq!(pipeline.metrics().handler_failures(), 2);
    }

    #[test]
    fn test_concurrent_producers_keep_per_producer_order() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let mut builder = PipelineBuilder::new("mp", 32);
        builder.add_stage("record", recorder(Arc::clone(&log)), &[]).unwrap();
        let pipeline = Arc::new(builder.start().unwrap());

        let producers: Vec<_> = (0..4u64)
            .map(|p| {
                let pipeline = Arc::clone(&pipeline);
                thread::spawn(move || {
                    for i in 0..500u64 {
                        pipeline.publish(|slot| *slot = p * 1_000_000 + i).unwrap();
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }
        pipeline.halt();

        let events = log.lock().unwrap();
        assert_eq!(events.len(), 2_000);
        for p in 0..4u64 {
            let own: Vec<u64> = events
                .iter()
                .map(|(v, _)| *v)
                .filter(|v| v / 1_000_000 == p)
                .collect();
            assert_eq!(own, (0..500).map(|i| p * 1_000_000 + i).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_halt_is_idempotent_and_rejects_publish() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let mut builder = PipelineBuilder::new("halt", 4);
        builder.add_stage("record", recorder(Arc::clone(&log)), &[]).unwrap();
        let pipeline = builder.start().unwrap();
        pipeline.publish(|slot| *slot = 1).unwrap();

        pipeline.halt();
        pipeline.halt();

        assert!(pipeline.is_halted());
        assert_eq!(log.lock().unwrap().len(), 1);
        assert_eq!(
            pipeline.publish(|slot| *slot = 2),
            Err(PipelineError::Halted("halt".to_string()))
        );
    }

    #[test]
    fn test_halt_before_any_publish() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let mut builder = PipelineBuilder::new("idle", 4);
        builder.add_stage("record", recorder(Arc::clone(&log)), &[]).unwrap();
        let pipeline = builder.start().unwrap();
        assert_eq!(pipeline.cursor(), -1);

        pipeline.halt();
        assert!(log.lock().unwrap().is_empty());
        assert!(pipeline.publish(|slot| *slot = 1).is_err());
    }

    #[test]
    fn test_first_publish_gets_sequence_zero() {
        let mut builder = PipelineBuilder::new("fresh", 4);
        builder
            .add_stage("noop", |_: &u64, _: i64, _: bool| Ok::<(), anyhow::Error>(()), &[])
            .unwrap();
        let pipeline = builder.start().unwrap();
        assert_eq!(pipeline.publish(|slot| *slot = 9), Ok(0));
        assert_eq!(pipeline.publish(|slot| *slot = 10), Ok(1));
        assert_eq!(pipeline.cursor(), 1);
    }

    #[test]
    fn test_builder_validation() {
        let builder = PipelineBuilder::<u64>::new("empty", 8);
        assert!(matches!(builder.start(), Err(PipelineError::NoStages(_))));

        let mut builder = PipelineBuilder::<u64>::new("bad-dep", 8);
        let result = builder.add_stage(
            "orphan",
            |_: &u64, _: i64, _: bool| Ok::<(), anyhow::Error>(()),
            &[StageId(3)],
        );
        assert_eq!(result, Err(PipelineError::UnknownStage(3)));

        let mut builder = PipelineBuilder::<u64>::new("bad-capacity", 6);
        builder
            .add_stage("noop", |_: &u64, _: i64, _: bool| Ok::<(), anyhow::Error>(()), &[])
            .unwrap();
        assert!(matches!(builder.start(), Err(PipelineError::InvalidCapacity(6))));
    }
}
