/// Faultline Demo - Production Usage Examples
///
/// Run with: cargo run --example resilience_demo
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use faultline::{BoxError, CommandConfigOverrides, Error, Runtime};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    println!("=== Faultline Demo ===\n");

    demo_circuit_breaker().await;
    demo_bulkhead().await;
    demo_timeout().await;
    demo_fallback().await;
    demo_cancellation().await;

    println!("\n=== All demos completed ===");
}

fn none_fallback() -> Option<fn(CancellationToken, Arc<Error>) -> std::future::Ready<Result<(), BoxError>>> {
    None
}

async fn demo_circuit_breaker() {
    println!("--- Circuit Breaker ---");
    let rt = Runtime::new();
    rt.configure_command(
        "flaky-service",
        CommandConfigOverrides {
            request_volume_threshold: Some(4),
            error_percent_threshold: Some(50),
            sleep_window: Some(Duration::from_millis(200)),
            ..Default::default()
        },
    );

    // Fails on the first 7 of 10 calls, then recovers.
    let failures_left = Arc::new(AtomicU32::new(7));
    for i in 0..10 {
        let failures_left = failures_left.clone();
        let result = rt
            .do_(
                "flaky-service",
                move |_token| async move {
                    let still_failing = failures_left
                        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                        .is_ok();
                    if still_failing {
                        Err("downstream unavailable".into())
                    } else {
                        Ok(())
                    }
                },
                none_fallback(),
            )
            .await;
        match result {
            Ok(()) => println!("  call {i}: ok"),
            Err(e) if matches!(*e, Error::CircuitOpen) => println!("  call {i}: short-circuited"),
            Err(e) => println!("  call {i}: failed ({e})"),
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
    println!();
}

async fn demo_bulkhead() {
    println!("--- Bulkhead ---");
    let rt = Arc::new(Runtime::new());
    rt.configure_command(
        "limited-pool",
        CommandConfigOverrides {
            max_concurrent_requests: Some(3),
            ..Default::default()
        },
    );

    let gate = Arc::new(tokio::sync::Barrier::new(6));
    let mut handles = Vec::new();
    for i in 0..6 {
        let rt = rt.clone();
        let gate = gate.clone();
        handles.push(tokio::spawn(async move {
            let result = rt
                .do_(
                    "limited-pool",
                    move |_token| async move {
                        gate.wait().await;
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(())
                    },
                    none_fallback(),
                )
                .await;
            (i, result)
        }));
    }
    for h in handles {
        let (i, result) = h.await.unwrap();
        match result {
            Ok(()) => println!("  slot {i}: admitted"),
            Err(e) => println!("  slot {i}: rejected ({e})"),
        }
    }
    println!();
}

async fn demo_timeout() {
    println!("--- Timeout ---");
    let rt = Runtime::new();
    rt.configure_command(
        "slow-service",
        CommandConfigOverrides {
            timeout: Some(Duration::from_millis(100)),
            ..Default::default()
        },
    );

    let result = rt
        .do_(
            "slow-service",
            |_token| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
            none_fallback(),
        )
        .await;
    println!("  result: {:?}", result.err().map(|e| e.to_string()));
    println!();
}

async fn demo_fallback() {
    println!("--- Fallback ---");
    let rt = Runtime::new();
    let result = rt
        .do_(
            "unreliable-cache",
            |_token| async { Err::<(), BoxError>("cache miss".into()) },
            Some(|_token: CancellationToken, cause: Arc<Error>| async move {
                println!("  fallback invoked for: {cause}");
                Ok(())
            }),
        )
        .await;
    println!("  masked as: {:?}", result);
    println!();
}

async fn demo_cancellation() {
    println!("--- Cancellation ---");
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
            "cancellable-service",
            |inner_token| async move {
                inner_token.cancelled().await;
                Ok(())
            },
            none_fallback(),
        )
        .await;
    println!("  result: {:?}", result.err().map(|e| e.to_string()));
    println!();
}
