//! Executor pool: a per-circuit bulkhead rationing concurrent executions via opaque tickets.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;

use crate::rolling::RollingNumber;

/// An opaque token representing one unit of bulkhead capacity. Fungible: any released ticket is
/// indistinguishable from any other.
#[derive(Debug)]
pub struct Ticket(());

struct PoolMetrics {
    executed: RollingNumber,
    max_active_requests: RollingNumber,
    tx: mpsc::Sender<usize>,
}

impl PoolMetrics {
    fn new(window_secs: u64) -> (Arc<Self>, mpsc::Receiver<usize>) {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        (
            Arc::new(Self {
                executed: RollingNumber::new(window_secs),
                max_active_requests: RollingNumber::new(window_secs),
                tx,
            }),
            rx,
        )
    }
}

const INBOX_CAPACITY: usize = 2000;

/// A bounded bag of `max_req` tickets for one circuit name, plus the small metric surface the
/// spec assigns to the pool (`executed`, `max_active_requests`).
pub struct ExecutorPool {
    name: String,
    max_req: usize,
    tickets_tx: mpsc::Sender<Ticket>,
    tickets_rx: parking_lot::Mutex<mpsc::Receiver<Ticket>>,
    active: std::sync::atomic::AtomicUsize,
    metrics: Arc<PoolMetrics>,
}

impl ExecutorPool {
    pub fn new(name: impl Into<String>, max_req: usize, window_secs: u64) -> Arc<Self> {
        let (tickets_tx, tickets_rx) = mpsc::channel(max_req.max(1));
        for _ in 0..max_req {
            // Capacity is exactly `max_req` (or 1 if max_req == 0, in which case this loop never
            // runs and every acquire attempt immediately misses).
            let _ = tickets_tx.try_send(Ticket(()));
        }

        let (metrics, mut metrics_rx) = PoolMetrics::new(window_secs);
        let pool_metrics = metrics.clone();
        tokio::spawn(async move {
            while let Some(active_count) = metrics_rx.recv().await {
                pool_metrics.executed.increment(1.0);
                pool_metrics.max_active_requests.update_max(active_count as f64);
            }
        });

        Arc::new(Self {
            name: name.into(),
            max_req,
            tickets_tx,
            tickets_rx: parking_lot::Mutex::new(tickets_rx),
            active: std::sync::atomic::AtomicUsize::new(0),
            metrics,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_req(&self) -> usize {
        self.max_req
    }

    /// Returns a ticket iff one is immediately available; never blocks.
    pub fn try_acquire(&self) -> Option<Ticket> {
        let ticket = self.tickets_rx.lock().try_recv().ok()?;
        self.active.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Some(ticket)
    }

    /// Returns a ticket to the pool, recording the pre-release active count into this pool's
    /// metrics.
    pub fn release(&self, ticket: Ticket) {
        let active_before = self.active.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
        let _ = self.metrics.tx.try_send(active_before);
        // The channel always has room for every outstanding ticket, so this send cannot fail
        // except if the pool itself is being torn down.
        let _ = self.tickets_tx.try_send(ticket);
    }

    pub fn active_count(&self) -> usize {
        self.active.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn executed(&self, now: Instant) -> f64 {
        self.metrics.executed.sum(now)
    }

    pub fn max_active_requests(&self, now: Instant) -> f64 {
        self.metrics.max_active_requests.max(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn try_acquire_succeeds_up_to_capacity_then_misses() {
        let pool = ExecutorPool::new("p", 2, 10);
        let t1 = pool.try_acquire().expect("first ticket");
        let t2 = pool.try_acquire().expect("second ticket");
        assert!(pool.try_acquire().is_none());
        assert_eq!(pool.active_count(), 2);

        pool.release(t1);
        assert_eq!(pool.active_count(), 1);
        let t3 = pool.try_acquire().expect("ticket freed by release");
        pool.release(t2);
        pool.release(t3);
    }

    #[tokio::test]
    async fn tickets_are_conserved_at_quiescence() {
        let pool = ExecutorPool::new("p", 3, 10);
        let tickets: Vec<_> = std::iter::from_fn(|| pool.try_acquire()).collect();
        assert_eq!(tickets.len(), 3);
        assert!(pool.try_acquire().is_none());

        for t in tickets {
            pool.release(t);
        }
        assert_eq!(pool.active_count(), 0);
        let all_back: Vec<_> = std::iter::from_fn(|| pool.try_acquire()).collect();
        assert_eq!(all_back.len(), 3);
    }

    #[tokio::test]
    async fn zero_capacity_pool_always_misses() {
        let pool = ExecutorPool::new("p", 0, 10);
        assert!(pool.try_acquire().is_none());
    }
}
