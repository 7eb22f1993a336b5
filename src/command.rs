//! The command pipeline: one execution races a runner task against a sentinel task, sharing a
//! single command's state, and finalizes exactly once via an atomic once-latch.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::circuit::CircuitBreaker;
use crate::config::CommandConfig;
use crate::error::{BoxError, Error};
use crate::metrics::EventTag;
use crate::pool::Ticket;
use crate::registry::{Runtime, DEFAULT};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
type FallbackFn = Box<dyn FnOnce(CancellationToken, Arc<Error>) -> BoxFuture<'static, Result<(), BoxError>> + Send>;

/// State shared between the runner and sentinel tasks for one command execution.
struct Shared {
    start: Instant,
    once_claimed: AtomicBool,
    ticket_slot: Mutex<Option<Ticket>>,
    ticket_determined: Mutex<Option<oneshot::Receiver<bool>>>,
    fallback: Mutex<Option<FallbackFn>>,
    err_tx: Mutex<Option<oneshot::Sender<Arc<Error>>>>,
}

/// What triggered finalization: the runner's own `run` completed, or either task preempted it
/// (admission rejection, bulkhead exhaustion, timeout, or cancellation).
enum FinalOutcome {
    Ran(Result<(), BoxError>, Duration),
    Preempted(Error),
}

/// Spawns the runner and sentinel tasks for one execution and returns the channel the caller
/// drains for an error (or, on a dropped sender, success).
fn spawn_command<F, Fut, Fb, FbFut>(
    breaker: Arc<CircuitBreaker>,
    config: CommandConfig,
    token: CancellationToken,
    run: F,
    fallback: Option<Fb>,
) -> oneshot::Receiver<Arc<Error>>
where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    Fb: FnOnce(CancellationToken, Arc<Error>) -> FbFut + Send + 'static,
    FbFut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    let (err_tx, err_rx) = oneshot::channel();
    let (determined_tx, determined_rx) = oneshot::channel();
    let (finished_tx, finished_rx) = oneshot::channel();

    let fallback: Option<FallbackFn> = fallback.map(|f| {
        Box::new(move |token, err| Box::pin(f(token, err)) as BoxFuture<'static, Result<(), BoxError>>) as FallbackFn
    });

    let shared = Arc::new(Shared {
        start: Instant::now(),
        once_claimed: AtomicBool::new(false),
        ticket_slot: Mutex::new(None),
        ticket_determined: Mutex::new(Some(determined_rx)),
        fallback: Mutex::new(fallback),
        err_tx: Mutex::new(Some(err_tx)),
    });

    tokio::spawn({
        let shared = shared.clone();
        let breaker = breaker.clone();
        let token = token.clone();
        async move {
            runner(shared, breaker, config, token, run, determined_tx, finished_tx).await;
        }
    });

    tokio::spawn({
        let shared = shared.clone();
        async move {
            sentinel(shared, breaker, config.timeout, token, finished_rx).await;
        }
    });

    err_rx
}

async fn runner<F, Fut>(
    shared: Arc<Shared>,
    breaker: Arc<CircuitBreaker>,
    config: CommandConfig,
    token: CancellationToken,
    run: F,
    determined_tx: oneshot::Sender<bool>,
    finished_tx: oneshot::Sender<()>,
) where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = Result<(), BoxError>>,
{
    if !breaker.allow_request(&config) {
        let _ = determined_tx.send(false);
        finalize(&shared, &breaker, token, FinalOutcome::Preempted(Error::CircuitOpen)).await;
        let _ = finished_tx.send(());
        return;
    }

    let ticket = match breaker.pool.try_acquire() {
        Some(ticket) => ticket,
        None => {
            let _ = determined_tx.send(false);
            finalize(&shared, &breaker, token, FinalOutcome::Preempted(Error::MaxConcurrency)).await;
            let _ = finished_tx.send(());
            return;
        }
    };
    *shared.ticket_slot.lock() = Some(ticket);
    let _ = determined_tx.send(true);

    let run_start = Instant::now();
    let result = run(token.clone()).await;
    let run_duration = run_start.elapsed();

    finalize(&shared, &breaker, token, FinalOutcome::Ran(result, run_duration)).await;
    let _ = finished_tx.send(());
}

async fn sentinel(
    shared: Arc<Shared>,
    breaker: Arc<CircuitBreaker>,
    timeout: Duration,
    token: CancellationToken,
    finished_rx: oneshot::Receiver<()>,
) {
    tokio::select! {
        _ = finished_rx => {
            // The runner already finalized (or lost the race to us, which cannot happen here
            // since we only reach this arm when it signaled completion first).
        }
        _ = token.cancelled() => {
            finalize(&shared, &breaker, token.clone(), FinalOutcome::Preempted(Error::Cancelled)).await;
        }
        _ = tokio::time::sleep(timeout) => {
            finalize(&shared, &breaker, token.clone(), FinalOutcome::Preempted(Error::Timeout)).await;
        }
    }
}

/// Claims the once-latch; the loser's call is a no-op. The winner waits for the ticket to be
/// determined (acquired or refused), releases it if held, maps the outcome to event tags and an
/// optional fallback, delivers any final error, and always reports the accumulated events.
async fn finalize(shared: &Arc<Shared>, breaker: &Arc<CircuitBreaker>, token: CancellationToken, outcome: FinalOutcome) {
    if shared.once_claimed.swap(true, Ordering::SeqCst) {
        return;
    }

    let determined_rx = shared.ticket_determined.lock().take();
    let acquired = match determined_rx {
        Some(rx) => rx.await.unwrap_or(false),
        None => false,
    };
    if acquired {
        if let Some(ticket) = shared.ticket_slot.lock().take() {
            breaker.pool.release(ticket);
        }
    }

    let (events, run_duration, final_err) = match outcome {
        FinalOutcome::Ran(Ok(()), run_duration) => (vec![EventTag::Success], run_duration, None),
        FinalOutcome::Ran(Err(run_err), run_duration) => {
            // A `run` that deliberately returns one of our own error variants (most commonly
            // `Cancelled` or `DeadlineExceeded`, observed via the token it was handed) passes
            // through as that variant instead of being opaquely wrapped, so it keeps its event
            // tag instead of falling into the `Run` catch-all.
            let err = match run_err.downcast::<Error>() {
                Ok(passthrough) => *passthrough,
                Err(run_err) => Error::Run(run_err),
            };
            let (events, err) = error_with_fallback(err, shared, token).await;
            (events, run_duration, err)
        }
        FinalOutcome::Preempted(err) => {
            let (events, err) = error_with_fallback(err, shared, token).await;
            (events, Duration::ZERO, err)
        }
    };

    if let Some(err) = final_err {
        if let Some(tx) = shared.err_tx.lock().take() {
            let _ = tx.send(err);
        }
    }

    if let Err(e) = breaker.report_event(events, shared.start, run_duration) {
        tracing::warn!(circuit = %breaker.name(), error = %e, "dropping command outcome report");
    }
}

async fn error_with_fallback(err: Error, shared: &Arc<Shared>, token: CancellationToken) -> (Vec<EventTag>, Option<Arc<Error>>) {
    let mut events = vec![err.event_tag()];
    let err = Arc::new(err);

    let fallback = shared.fallback.lock().take();
    let final_err = match fallback {
        None => Some(err),
        Some(fallback) => match fallback(token, err.clone()).await {
            Ok(()) => {
                events.push(EventTag::FallbackSuccess);
                None
            }
            Err(fallback_err) => {
                events.push(EventTag::FallbackFailure);
                Some(Arc::new(Error::Fallback { cause: err, fallback: fallback_err }))
            }
        },
    };

    (events, final_err)
}

impl Runtime {
    /// Asynchronous execution with no caller-supplied cancellation.
    pub fn go<F, Fut, Fb, FbFut>(&self, name: &str, run: F, fallback: Option<Fb>) -> oneshot::Receiver<Arc<Error>>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
        Fb: FnOnce(CancellationToken, Arc<Error>) -> FbFut + Send + 'static,
        FbFut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.go_c(CancellationToken::new(), name, run, fallback)
    }

    /// Asynchronous execution with a caller-supplied cancellation token.
    pub fn go_c<F, Fut, Fb, FbFut>(
        &self,
        token: CancellationToken,
        name: &str,
        run: F,
        fallback: Option<Fb>,
    ) -> oneshot::Receiver<Arc<Error>>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
        Fb: FnOnce(CancellationToken, Arc<Error>) -> FbFut + Send + 'static,
        FbFut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let breaker = self.get_or_create(name);
        let config = self.get_circuit_config(name);
        spawn_command(breaker, config, token, run, fallback)
    }

    /// Awaits completion, returning `Ok(())` on success (including a masked failure) or the
    /// final error otherwise.
    pub async fn do_<F, Fut, Fb, FbFut>(&self, name: &str, run: F, fallback: Option<Fb>) -> Result<(), Arc<Error>>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
        Fb: FnOnce(CancellationToken, Arc<Error>) -> FbFut + Send + 'static,
        FbFut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.do_c(CancellationToken::new(), name, run, fallback).await
    }

    /// Awaits completion with a caller-supplied cancellation token.
    pub async fn do_c<F, Fut, Fb, FbFut>(
        &self,
        token: CancellationToken,
        name: &str,
        run: F,
        fallback: Option<Fb>,
    ) -> Result<(), Arc<Error>>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
        Fb: FnOnce(CancellationToken, Arc<Error>) -> FbFut + Send + 'static,
        FbFut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        match self.go_c(token, name, run, fallback).await {
            Ok(err) => Err(err),
            Err(_recv_error) => Ok(()),
        }
    }
}

/// Asynchronous execution against the process-wide default runtime.
pub fn go<F, Fut, Fb, FbFut>(name: &str, run: F, fallback: Option<Fb>) -> oneshot::Receiver<Arc<Error>>
where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    Fb: FnOnce(CancellationToken, Arc<Error>) -> FbFut + Send + 'static,
    FbFut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    DEFAULT.go(name, run, fallback)
}

/// Asynchronous execution against the default runtime with a caller-supplied cancellation token.
pub fn go_c<F, Fut, Fb, FbFut>(
    token: CancellationToken,
    name: &str,
    run: F,
    fallback: Option<Fb>,
) -> oneshot::Receiver<Arc<Error>>
where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    Fb: FnOnce(CancellationToken, Arc<Error>) -> FbFut + Send + 'static,
    FbFut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    DEFAULT.go_c(token, name, run, fallback)
}

/// Awaits completion against the process-wide default runtime.
pub async fn do_<F, Fut, Fb, FbFut>(name: &str, run: F, fallback: Option<Fb>) -> Result<(), Arc<Error>>
where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    Fb: FnOnce(CancellationToken, Arc<Error>) -> FbFut + Send + 'static,
    FbFut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    DEFAULT.do_(name, run, fallback).await
}

/// Awaits completion against the default runtime with a caller-supplied cancellation token.
pub async fn do_c<F, Fut, Fb, FbFut>(
    token: CancellationToken,
    name: &str,
    run: F,
    fallback: Option<Fb>,
) -> Result<(), Arc<Error>>
where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    Fb: FnOnce(CancellationToken, Arc<Error>) -> FbFut + Send + 'static,
    FbFut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    DEFAULT.do_c(token, name, run, fallback).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CommandConfigOverrides;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    fn no_fallback() -> Option<fn(CancellationToken, Arc<Error>) -> BoxFuture<'static, Result<(), BoxError>>> {
        None
    }

    #[tokio::test]
    async fn successful_run_reports_success_and_no_error() {
        let rt = Runtime::new();
        let result = rt
            .do_("ok", |_token| async { Ok(()) }, no_fallback())
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn failing_run_without_fallback_surfaces_the_error() {
        let rt = Runtime::new();
        let result = rt
            .do_(
                "fail",
                |_token| async { Err::<(), _>("boom".into()) },
                no_fallback(),
            )
            .await;
        let err = result.unwrap_err();
        assert!(matches!(*err, Error::Run(_)));
    }

    #[tokio::test]
    async fn run_returning_a_boxed_faultline_error_passes_through_instead_of_wrapping() {
        let rt = Runtime::new();
        let result = rt
            .do_(
                "deadline",
                |_token| async { Err::<(), BoxError>(Box::new(Error::DeadlineExceeded)) },
                no_fallback(),
            )
            .await;
        assert!(matches!(*result.unwrap_err(), Error::DeadlineExceeded));
    }

    #[tokio::test]
    async fn fallback_masks_the_original_error() {
        let rt = Runtime::new();
        let result = rt
            .do_(
                "fail-masked",
                |_token| async { Err::<(), _>("boom".into()) },
                Some(|_token, _err: Arc<Error>| async { Ok(()) }),
            )
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn timeout_fires_and_returns_within_a_bounded_margin() {
        let rt = Runtime::new();
        rt.configure_command(
            "slow",
            CommandConfigOverrides {
                timeout: Some(Duration::from_millis(50)),
                ..Default::default()
            },
        );

        let start = Instant::now();
        let result = rt
            .do_(
                "slow",
                |_token| async {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    Ok(())
                },
                no_fallback(),
            )
            .await;
        let elapsed = start.elapsed();

        assert!(matches!(*result.unwrap_err(), Error::Timeout));
        assert!(elapsed < Duration::from_millis(450), "ticket should return promptly after timeout");
    }

    #[tokio::test]
    async fn bulkhead_rejects_the_third_of_two_concurrent_slots() {
        let rt = Arc::new(Runtime::new());
        rt.configure_command(
            "bh",
            CommandConfigOverrides {
                max_concurrent_requests: Some(2),
                ..Default::default()
            },
        );

        // Only the two commands that actually acquire a ticket run this closure, so the barrier
        // has two parties; the third is rejected before it ever reaches `run`.
        let gate = Arc::new(tokio::sync::Barrier::new(2));
        let mut handles = Vec::new();
        for _ in 0..3 {
            let rt = rt.clone();
            let gate = gate.clone();
            handles.push(tokio::spawn(async move {
                rt.do_(
                    "bh",
                    move |_token| async move {
                        gate.wait().await;
                        Ok(())
                    },
                    no_fallback(),
                )
                .await
            }));
        }

        let mut rejected = 0;
        let mut succeeded = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(()) => succeeded += 1,
                Err(e) if matches!(*e, Error::MaxConcurrency) => rejected += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(rejected, 1);
        assert_eq!(succeeded, 2);
    }

    #[tokio::test]
    async fn cancellation_is_passed_through() {
        let rt = Runtime::new();
        let token = CancellationToken::new();
        let cancel_token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel_token.cancel();
        });

        let result = rt
            .do_c(
                token,
                "cancel",
                |inner_token| async move {
                    inner_token.cancelled().await;
                    // The runner's own result is discarded by the sentinel's once-latch win.
                    Ok(())
                },
                no_fallback(),
            )
            .await;

        assert!(matches!(*result.unwrap_err(), Error::Cancelled));
    }

    #[tokio::test]
    async fn finalization_runs_exactly_once_even_when_timeout_races_completion() {
        let rt = Runtime::new();
        rt.configure_command(
            "race",
            CommandConfigOverrides {
                timeout: Some(Duration::from_millis(10)),
                ..Default::default()
            },
        );

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let _ = rt
            .do_(
                "race",
                move |_token| async move {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    calls_clone.fetch_add(1, AtomicOrdering::SeqCst);
                    Ok(())
                },
                no_fallback(),
            )
            .await;

        // Give the discarded runner time to finish in the background; it must not double-report.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);
    }
}
