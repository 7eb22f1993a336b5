//! Circuit breaker: the `{closed, open, probing}` state machine that gates admission based on
//! the health reported by a circuit's metric collector.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::config::CommandConfig;
use crate::error::Error;
use crate::metrics::{CommandExecution, EventTag, MetricCollector};
use crate::pool::ExecutorPool;

/// Converts an `Instant` into nanoseconds relative to a fixed epoch, so it can live in an
/// `AtomicI64` and be updated via compare-and-swap. All breakers in a process share one epoch.
fn nanos_since_epoch(epoch: Instant, t: Instant) -> i64 {
    t.saturating_duration_since(epoch).as_nanos() as i64
}

/// Per-circuit breaker. Owns references to the pool and collector it gates.
pub struct CircuitBreaker {
    name: String,
    epoch: Instant,
    open: RwLock<bool>,
    force_open: AtomicBool,
    opened_or_last_tested_at: AtomicI64,
    pub pool: Arc<ExecutorPool>,
    pub metrics: Arc<MetricCollector>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: &CommandConfig) -> Arc<Self> {
        let name = name.into();
        let pool = ExecutorPool::new(name.clone(), config.max_concurrent_requests, config.rolling_window_secs);
        let metrics = MetricCollector::new(name.clone(), config.rolling_window_secs);
        Arc::new(Self {
            name,
            epoch: Instant::now(),
            open: RwLock::new(false),
            force_open: AtomicBool::new(false),
            opened_or_last_tested_at: AtomicI64::new(0),
            pool,
            metrics,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn switch_force_open(&self, force_open: bool) {
        self.force_open.store(force_open, Ordering::SeqCst);
    }

    /// Whether a request should be admitted right now.
    pub fn allow_request(&self, config: &CommandConfig) -> bool {
        if self.force_open.load(Ordering::SeqCst) {
            return false;
        }

        let now = Instant::now();
        let is_open = *self.open.read();

        if !is_open {
            if self.metrics.requests(now) < config.request_volume_threshold as f64 {
                return true;
            }
            if self.metrics.is_healthy(now, config.error_percent_threshold) {
                return true;
            }
            self.set_open(now);
            return false;
        }

        self.allow_single_test(now, config.sleep_window)
    }

    fn allow_single_test(&self, now: Instant, sleep_window: Duration) -> bool {
        let now_nanos = nanos_since_epoch(self.epoch, now);
        let observed = self.opened_or_last_tested_at.load(Ordering::SeqCst);

        if now_nanos <= observed + sleep_window.as_nanos() as i64 {
            return false;
        }

        let swapped = self
            .opened_or_last_tested_at
            .compare_exchange(observed, now_nanos, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if swapped {
            info!(circuit = %self.name, "allowing single test to possibly close circuit");
        }
        swapped
    }

    fn set_open(&self, now: Instant) {
        let mut is_open = self.open.write();
        if *is_open {
            return;
        }
        warn!(circuit = %self.name, "opening circuit");
        self.opened_or_last_tested_at
            .store(nanos_since_epoch(self.epoch, now), Ordering::SeqCst);
        *is_open = true;
    }

    fn set_closed(&self) {
        let mut is_open = self.open.write();
        if !*is_open {
            return;
        }
        info!(circuit = %self.name, "closing circuit");
        *is_open = false;
        self.metrics.reset();
    }

    /// Reports the outcome of one execution. Returns `Err(Error::EmptyEvents)` if `events` is
    /// empty, or `Err(Error::MetricsInboxFull)` if the collector's inbox rejected the update.
    pub fn report_event(
        &self,
        events: Vec<EventTag>,
        start: Instant,
        run_duration: Duration,
    ) -> Result<(), Error> {
        if events.is_empty() {
            return Err(Error::EmptyEvents);
        }

        if events[0] == EventTag::Success && *self.open.read() {
            self.set_closed();
        }

        let max_req = self.pool.max_req();
        let concurrency_in_use = if max_req > 0 {
            self.pool.active_count() as f64 / max_req as f64
        } else {
            0.0
        };

        let accepted = self.metrics.report(CommandExecution {
            events,
            start,
            run_duration,
            concurrency_in_use,
        });

        if accepted {
            Ok(())
        } else {
            Err(Error::MetricsInboxFull)
        }
    }
}
