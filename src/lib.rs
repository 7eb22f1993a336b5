//! `faultline`: an in-process fault-tolerance runtime combining a circuit breaker, a bulkhead and
//! cooperative timeout/cancellation around user-supplied async work, with an optional fallback
//! to mask a failed call.
//!
//! Most callers use the free functions (backed by a process-wide default [`Runtime`]):
//!
//! ```no_run
//! # use tokio_util::sync::CancellationToken;
//! # async fn call(_token: CancellationToken) -> Result<(), faultline::BoxError> { Ok(()) }
//! # async fn run() {
//! let fallback: Option<fn(CancellationToken, std::sync::Arc<faultline::Error>)
//!     -> std::future::Ready<Result<(), faultline::BoxError>>> = None;
//! let result = faultline::do_("downstream-call", call, fallback).await;
//! # let _ = result;
//! # }
//! ```
//!
//! Tests and multi-tenant hosts that want isolated circuit state construct their own
//! [`Runtime`] instead.

pub mod circuit;
pub mod command;
pub mod config;
pub mod error;
pub mod metrics;
pub mod pool;
pub mod registry;
pub mod rolling;

pub use circuit::CircuitBreaker;
pub use command::{do_, do_c, go, go_c};
pub use config::{CommandConfig, CommandConfigOverrides};
pub use error::{BoxError, Error};
pub use metrics::EventTag;
pub use pool::Ticket;
pub use registry::{Runtime, DEFAULT};

use std::collections::HashMap;

/// Replaces a single circuit's configuration, applying `overrides` on top of the defaults.
/// Circuits created by a prior call with the old configuration keep their accumulated metrics;
/// only the tunables change.
pub fn configure_command(name: &str, overrides: CommandConfigOverrides) {
    DEFAULT.configure_command(name, overrides);
}

/// Batch form of [`configure_command`].
pub fn configure(overrides: HashMap<String, CommandConfigOverrides>) {
    DEFAULT.configure(overrides);
}

/// Returns the effective configuration for `name`, creating a default-initialized record on
/// first access (mirrors the lazy-default behavior `go`/`do_` rely on internally).
pub fn get_circuit_config(name: &str) -> CommandConfig {
    DEFAULT.get_circuit_config(name)
}

/// Drops every circuit and configuration override known to the default runtime. Intended for
/// test isolation; a running process calling this against live traffic loses all rolling metrics
/// and forces every circuit to re-learn its health from scratch.
pub fn flush() {
    DEFAULT.flush();
}
