//! Closed taxonomy of admission, execution, fallback and internal errors.

use std::sync::Arc;

/// A boxed, type-erased error returned by a user-supplied `run` or `fallback` function.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error values surfaced by the command pipeline.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The breaker rejected the call because the circuit is open.
    #[error("circuit open")]
    CircuitOpen,

    /// The bulkhead had no ticket available.
    #[error("max concurrency")]
    MaxConcurrency,

    /// `run` did not complete within the configured timeout.
    #[error("timeout")]
    Timeout,

    /// The caller's cancellation token fired before `run` completed.
    #[error("context canceled")]
    Cancelled,

    /// The caller's deadline elapsed before `run` completed.
    #[error("context deadline exceeded")]
    DeadlineExceeded,

    /// `run` returned an error and no fallback masked it.
    #[error("run failed: {0}")]
    Run(#[source] BoxError),

    /// Both `run` and `fallback` failed; `cause` is the original error, shared (not cloned)
    /// with the fallback invocation that produced `fallback`.
    #[error("fallback err: {fallback}, run err: {cause}")]
    Fallback { cause: Arc<Error>, fallback: BoxError },

    /// `report_event` was called with an empty event list. Internal; never observed by callers
    /// of the public facade.
    #[error("no event types sent for metrics")]
    EmptyEvents,

    /// The metrics inbox was at capacity and the update was dropped. Internal; logged, never
    /// surfaced on a command's error channel (see Open Question iii in DESIGN.md).
    #[error("metrics channel at capacity")]
    MetricsInboxFull,
}

impl Error {
    /// The event tag this error maps to, per `error_with_fallback` in the spec.
    pub(crate) fn event_tag(&self) -> crate::metrics::EventTag {
        use crate::metrics::EventTag;
        match self {
            Error::CircuitOpen => EventTag::ShortCircuit,
            Error::MaxConcurrency => EventTag::Rejected,
            Error::Timeout => EventTag::Timeout,
            Error::Cancelled => EventTag::ContextCanceled,
            Error::DeadlineExceeded => EventTag::ContextDeadlineExceeded,
            _ => EventTag::Failure,
        }
    }
}

