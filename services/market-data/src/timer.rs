//! Drift-free boundary timer
//!
//! Fires once per period at wall-clock period boundaries. Each deadline
//! is derived from the previous *planned* deadline, never from the moment
//! the thread actually woke, so jitter does not accumulate. A fire that
//! runs later than a whole period is not repeated; the timer moves on to
//! the next boundary after now.

use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

/// Receives the planned boundary timestamp (epoch ms) on every fire.
pub trait BoundaryListener: Send + Sync {
    fn on_boundary(&self, timestamp_ms: i64);
}

pub const DEFAULT_PERIOD: Duration = Duration::from_secs(1);

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// First boundary strictly after `now`.
pub fn next_boundary(now_ms: i64, period_ms: i64) -> i64 {
    (now_ms.div_euclid(period_ms) + 1) * period_ms
}

/// Deadline after firing `planned`: one period later, or the next boundary
/// after `now` if that has already passed.
pub fn following_boundary(planned: i64, now_ms: i64, period_ms: i64) -> i64 {
    let next = planned + period_ms;
    if next > now_ms {
        next
    } else {
        next_boundary(now_ms, period_ms)
    }
}

type Listeners = Arc<RwLock<Arc<Vec<Arc<dyn BoundaryListener>>>>>;

#[derive(Default)]
struct StopFlag {
    stopped: Mutex<bool>,
    signal: Condvar,
}

impl StopFlag {
    /// Sleep until `deadline_ms` on the wall clock or until stopped.
    /// Returns true if stopped.
    fn sleep_until(&self, deadline_ms: i64) -> bool {
        let mut stopped = self.stopped.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if *stopped {
                return true;
            }
            let remaining = deadline_ms - now_ms();
            if remaining <= 0 {
                return false;
            }
            let (guard, _) = self
                .signal
                .wait_timeout(stopped, Duration::from_millis(remaining as u64))
                .unwrap_or_else(PoisonError::into_inner);
            stopped = guard;
        }
    }

    fn stop(&self) {
        *self.stopped.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.signal.notify_all();
    }
}

pub struct BoundaryTimer {
    period_ms: i64,
    listeners: Listeners,
    stop: Arc<StopFlag>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BoundaryTimer {
    pub fn new() -> Self {
        Self::with_period(DEFAULT_PERIOD)
    }

    pub fn with_period(period: Duration) -> Self {
        Self {
            period_ms: (period.as_millis() as i64).max(1),
            listeners: Arc::new(RwLock::new(Arc::new(Vec::new()))),
            stop: Arc::new(StopFlag::default()),
            handle: Mutex::new(None),
        }
    }

    /// Register a listener. Safe while the timer is firing; the change is
    /// seen from the next fire on.
    pub fn add(&self, listener: Arc<dyn BoundaryListener>) {
        let mut current = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = Vec::clone(&current);
        next.push(listener);
        *current = Arc::new(next);
    }

    /// Remove a listener by identity. The fire in progress, if any, still
    /// delivers to it.
    pub fn remove(&self, listener: &Arc<dyn BoundaryListener>) -> bool {
        let mut current = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let before = current.len();
        let next: Vec<_> = current
            .iter()
            .filter(|l| !Arc::ptr_eq(l, listener))
            .cloned()
            .collect();
        let removed = next.len() != before;
        *current = Arc::new(next);
        removed
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Start the timer thread. Calling twice is a no-op.
    pub fn start(&self) -> std::io::Result<()> {
        let mut handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        if handle.is_some() {
            return Ok(());
        }
        let listeners = Arc::clone(&self.listeners);
        let stop = Arc::clone(&self.stop);
        let period_ms = self.period_ms;
        *handle = Some(
            thread::Builder::new()
                .name("boundary-timer".to_string())
                .spawn(move || run(period_ms, listeners, stop))?,
        );
        info!(period_ms, "Boundary timer started");
        Ok(())
    }

    /// Stop and join the timer thread. Idempotent.
    pub fn stop(&self) {
        self.stop.stop();
        let handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("Boundary timer thread terminated abnormally");
            }
            info!("Boundary timer stopped");
        }
    }
}

impl Default for BoundaryTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BoundaryTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(period_ms: i64, listeners: Listeners, stop: Arc<StopFlag>) {
    let mut planned = next_boundary(now_ms(), period_ms);
    loop {
        if stop.sleep_until(planned) {
            break;
        }
        let snapshot = listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in snapshot.iter() {
            listener.on_boundary(planned);
        }
        let now = now_ms();
        let next = following_boundary(planned, now, period_ms);
        if next != planned + period_ms {
            warn!(planned, now, skipped_to = next, "Boundary timer fell behind");
        } else {
            debug!(boundary = planned, listeners = snapshot.len(), "Boundary fired");
        }
        planned = next;
    }
}
