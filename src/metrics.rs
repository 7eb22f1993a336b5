//! Per-circuit metric aggregation: rolling numbers for every event kind, fed by a bounded inbox
//! with a single consumer task, draining updates reported by the circuit breaker.

use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::warn;

use crate::rolling::RollingNumber;

/// Capacity of a metric collector's update inbox. Producers that find it full drop the update
/// rather than block the hot path.
pub const INBOX_CAPACITY: usize = 2000;

/// The outcome tags a command can report, in the order the pipeline appends them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventTag {
    Success,
    Failure,
    Rejected,
    ShortCircuit,
    Timeout,
    ContextCanceled,
    ContextDeadlineExceeded,
    FallbackSuccess,
    FallbackFailure,
}

/// One reported execution: its event tags (terminal tag first, optional fallback tag second),
/// wall-clock start, measured run duration, and bulkhead occupancy at report time.
#[derive(Debug, Clone)]
pub struct CommandExecution {
    pub events: Vec<EventTag>,
    pub start: Instant,
    pub run_duration: Duration,
    pub concurrency_in_use: f64,
}

/// Per-update deltas applied atomically across the collector's rolling numbers.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricResult {
    pub attempts: f64,
    pub errors: f64,
    pub successes: f64,
    pub failures: f64,
    pub rejects: f64,
    pub short_circuits: f64,
    pub timeouts: f64,
    pub context_canceled: f64,
    pub context_deadline_exceeded: f64,
    pub fallback_successes: f64,
    pub fallback_failures: f64,
    pub total_duration_ms: f64,
    pub run_duration_ms: f64,
    pub concurrency_in_use: f64,
}

impl MetricResult {
    fn from_execution(update: &CommandExecution) -> Self {
        let mut r = MetricResult {
            attempts: 1.0,
            total_duration_ms: update.start.elapsed().as_secs_f64() * 1000.0,
            run_duration_ms: update.run_duration.as_secs_f64() * 1000.0,
            concurrency_in_use: update.concurrency_in_use,
            ..Default::default()
        };

        match update.events.first() {
            Some(EventTag::Success) => r.successes = 1.0,
            Some(EventTag::Failure) => {
                r.failures = 1.0;
                r.errors = 1.0;
            }
            Some(EventTag::Rejected) => {
                r.rejects = 1.0;
                r.errors = 1.0;
            }
            Some(EventTag::ShortCircuit) => {
                r.short_circuits = 1.0;
                r.errors = 1.0;
            }
            Some(EventTag::Timeout) => {
                r.timeouts = 1.0;
                r.errors = 1.0;
            }
            Some(EventTag::ContextCanceled) => r.context_canceled = 1.0,
            Some(EventTag::ContextDeadlineExceeded) => r.context_deadline_exceeded = 1.0,
            _ => {}
        }

        match update.events.get(1) {
            Some(EventTag::FallbackSuccess) => r.fallback_successes = 1.0,
            Some(EventTag::FallbackFailure) => r.fallback_failures = 1.0,
            _ => {}
        }

        r
    }
}

struct Numbers {
    attempts: RollingNumber,
    errors: RollingNumber,
    successes: RollingNumber,
    failures: RollingNumber,
    rejects: RollingNumber,
    short_circuits: RollingNumber,
    timeouts: RollingNumber,
    context_canceled: RollingNumber,
    context_deadline_exceeded: RollingNumber,
    fallback_successes: RollingNumber,
    fallback_failures: RollingNumber,
    total_duration: RollingNumber,
    run_duration: RollingNumber,
    concurrency_in_use: RollingNumber,
}

impl Numbers {
    fn new(window_secs: u64) -> Self {
        Self {
            attempts: RollingNumber::new(window_secs),
            errors: RollingNumber::new(window_secs),
            successes: RollingNumber::new(window_secs),
            failures: RollingNumber::new(window_secs),
            rejects: RollingNumber::new(window_secs),
            short_circuits: RollingNumber::new(window_secs),
            timeouts: RollingNumber::new(window_secs),
            context_canceled: RollingNumber::new(window_secs),
            context_deadline_exceeded: RollingNumber::new(window_secs),
            fallback_successes: RollingNumber::new(window_secs),
            fallback_failures: RollingNumber::new(window_secs),
            total_duration: RollingNumber::new(window_secs),
            run_duration: RollingNumber::new(window_secs),
            concurrency_in_use: RollingNumber::new(window_secs),
        }
    }

    fn apply(&self, r: MetricResult) {
        self.attempts.increment(r.attempts);
        self.errors.increment(r.errors);
        self.successes.increment(r.successes);
        self.failures.increment(r.failures);
        self.rejects.increment(r.rejects);
        self.short_circuits.increment(r.short_circuits);
        self.timeouts.increment(r.timeouts);
        self.context_canceled.increment(r.context_canceled);
        self.context_deadline_exceeded.increment(r.context_deadline_exceeded);
        self.fallback_successes.increment(r.fallback_successes);
        self.fallback_failures.increment(r.fallback_failures);
        self.total_duration.update_max(r.total_duration_ms);
        self.run_duration.update_max(r.run_duration_ms);
        self.concurrency_in_use.update_max(r.concurrency_in_use);
    }
}

/// Per-circuit aggregation of attempts/successes/failures/... over a rolling window.
///
/// Updates arrive over a bounded channel and are applied by a dedicated consumer task, so
/// `report` never blocks the calling command's hot path.
pub struct MetricCollector {
    name: String,
    numbers: RwLock<Numbers>,
    window_secs: u64,
    tx: mpsc::Sender<CommandExecution>,
}

impl MetricCollector {
    pub fn new(name: impl Into<String>, window_secs: u64) -> std::sync::Arc<Self> {
        let (tx, mut rx) = mpsc::channel(INBOX_CAPACITY);
        let collector = std::sync::Arc::new(Self {
            name: name.into(),
            numbers: RwLock::new(Numbers::new(window_secs)),
            window_secs,
            tx,
        });

        let worker = collector.clone();
        tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                let result = MetricResult::from_execution(&update);
                // A read lock is enough: we're only mutating the rolling numbers' internal
                // state, which is independently synchronized. The write lock is reserved for
                // `reset`, which swaps the whole `Numbers` struct out from under us.
                worker.numbers.read().apply(result);
            }
        });

        collector
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue a reported execution. Drops the update and returns `false` if the inbox is full.
    pub fn report(&self, update: CommandExecution) -> bool {
        match self.tx.try_send(update) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(circuit = %self.name, "metrics channel at capacity");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn requests(&self, now: Instant) -> f64 {
        self.numbers.read().attempts.sum(now)
    }

    pub fn errors(&self, now: Instant) -> f64 {
        self.numbers.read().errors.sum(now)
    }

    pub fn error_percent(&self, now: Instant) -> u32 {
        let numbers = self.numbers.read();
        let requests = numbers.attempts.sum(now).max(1.0);
        let errors = numbers.errors.sum(now);
        let pct = (100.0 * errors / requests).round();
        pct.clamp(0.0, 100.0) as u32
    }

    pub fn is_healthy(&self, now: Instant, error_percent_threshold: u32) -> bool {
        self.error_percent(now) < error_percent_threshold
    }

    /// Atomically replace every rolling number with a fresh one.
    pub fn reset(&self) {
        *self.numbers.write() = Numbers::new(self.window_secs);
    }
}
