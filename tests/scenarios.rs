//! End-to-end scenario tests (S1-S6).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Barrier;
use tokio_util::sync::CancellationToken;

use faultline::{BoxError, CommandConfigOverrides, Error, Runtime};

fn none_fallback() -> Option<fn(CancellationToken, Arc<Error>) -> std::future::Ready<Result<(), BoxError>>> {
    None
}

/// S1 - Bulkhead rejects overflow.
#[tokio::test]
async fn bulkhead_rejects_overflow() {
    let rt = Arc::new(Runtime::new());
    rt.configure_command(
        "A",
        CommandConfigOverrides {
            max_concurrent_requests: Some(2),
            ..Default::default()
        },
    );

    // Only the two commands that actually acquire a ticket ever run the closure below, so the
    // barrier has two parties: the third command is rejected before `run` is ever invoked.
    let gate = Arc::new(Barrier::new(2));
    let release = Arc::new(tokio::sync::Notify::new());
    let mut handles = Vec::new();
    for _ in 0..3 {
        let rt = rt.clone();
        let gate = gate.clone();
        let release = release.clone();
        handles.push(tokio::spawn(async move {
            rt.do_(
                "A",
                move |_token| async move {
                    gate.wait().await;
                    release.notified().await;
                    Ok(())
                },
                none_fallback(),
            )
            .await
        }));
    }

    // Give the bulkhead-rejected attempt a moment to fail before releasing the other two.
    tokio::time::sleep(Duration::from_millis(50)).await;
    release.notify_waiters();

    let mut succeeded = 0;
    let mut rejected = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(()) => succeeded += 1,
            Err(e) if matches!(*e, Error::MaxConcurrency) => rejected += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(succeeded, 2);
    assert_eq!(rejected, 1);
}

/// S2 - Timeout fires.
#[tokio::test]
async fn timeout_fires_and_returns_ticket_promptly() {
    let rt = Runtime::new();
    rt.configure_command(
        "B",
        CommandConfigOverrides {
            timeout: Some(Duration::from_millis(100)),
            ..Default::default()
        },
    );

    let start = Instant::now();
    let result = rt
        .do_(
            "B",
            |_token| async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(())
            },
            none_fallback(),
        )
        .await;
    let elapsed_since_timeout = start.elapsed().saturating_sub(Duration::from_millis(100));

    assert!(matches!(*result.unwrap_err(), Error::Timeout));
    assert!(
        elapsed_since_timeout < Duration::from_millis(50),
        "ticket should return within ~10ms of the timeout firing, took {elapsed_since_timeout:?}"
    );
}

/// S3 - Circuit opens.
#[tokio::test]
async fn circuit_opens_after_volume_and_error_threshold() {
    let rt = Runtime::new();
    rt.configure_command(
        "C",
        CommandConfigOverrides {
            request_volume_threshold: Some(5),
            error_percent_threshold: Some(50),
            ..Default::default()
        },
    );

    for _ in 0..10 {
        let _ = rt
            .do_("C", |_token| async { Err::<(), BoxError>("boom".into()) }, none_fallback())
            .await;
    }
    // Let the metrics consumer task drain the reports.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let ran = Arc::new(AtomicU32::new(0));
    let ran_clone = ran.clone();
    let result = rt
        .do_(
            "C",
            move |_token| async move {
                ran_clone.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            none_fallback(),
        )
        .await;

    assert!(matches!(*result.unwrap_err(), Error::CircuitOpen));
    assert_eq!(ran.load(Ordering::SeqCst), 0, "run must not execute while the circuit is open");
}

/// S4 - Probe closes (continues S3's setup with a short sleep window).
#[tokio::test]
async fn probe_closes_the_circuit_on_success() {
    let rt = Runtime::new();
    rt.configure_command(
        "C4",
        CommandConfigOverrides {
            request_volume_threshold: Some(5),
            error_percent_threshold: Some(50),
            sleep_window: Some(Duration::from_millis(200)),
            ..Default::default()
        },
    );

    for _ in 0..10 {
        let _ = rt
            .do_("C4", |_token| async { Err::<(), BoxError>("boom".into()) }, none_fallback())
            .await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(matches!(
        *rt.do_("C4", |_token| async { Ok(()) }, none_fallback()).await.unwrap_err(),
        Error::CircuitOpen
    ));

    tokio::time::sleep(Duration::from_millis(250)).await;

    let result = rt.do_("C4", |_token| async { Ok(()) }, none_fallback()).await;
    assert!(result.is_ok(), "the probe must be admitted and succeed");

    tokio::time::sleep(Duration::from_millis(50)).await;
    let breaker = rt.get_or_create("C4");
    let config = rt.get_circuit_config("C4");
    assert!(breaker.allow_request(&config), "the breaker should be closed again");
}

/// S5 - Fallback masks failure.
#[tokio::test]
async fn fallback_masks_a_timeout() {
    let rt = Runtime::new();
    rt.configure_command(
        "D",
        CommandConfigOverrides {
            timeout: Some(Duration::from_millis(50)),
            ..Default::default()
        },
    );

    let result = rt
        .do_(
            "D",
            |_token| async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(())
            },
            Some(|_token: CancellationToken, cause: Arc<Error>| async move {
                assert!(matches!(*cause, Error::Timeout));
                Ok(())
            }),
        )
        .await;

    assert!(result.is_ok(), "a successful fallback must mask the timeout");
}

/// S6 - Cancellation passthrough.
#[tokio::test]
async fn cancellation_passes_through_and_returns_the_ticket() {
    let rt = Runtime::new();
    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let result = rt
        .do_c(
            token,
            "E",
            |inner_token| async move {
                inner_token.cancelled().await;
                Ok(())
            },
            none_fallback(),
        )
        .await;

    assert!(matches!(*result.unwrap_err(), Error::Cancelled));

    let breaker = rt.get_or_create("E");
    let config = rt.get_circuit_config("E");
    assert_eq!(breaker.pool.active_count(), 0, "the ticket must have been returned");
    assert!(breaker.allow_request(&config));
}
