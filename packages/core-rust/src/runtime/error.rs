//! Error values of the task runtime.
//!
//! Failures are values, never panics: a task settles with `Ok`, its own
//! error, or an [`AbortError`] carrying the reason cancellation was
//! requested. Combinator-specific failures ([`TimeoutError`],
//! [`RetryError`]) wrap or accompany these.

use std::fmt;
use std::sync::Arc;

/// Why cancellation was requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// The owning runner is disposing.
    RunnerClosing,
    /// The task lost a [`race`](super::combinators::race).
    RaceLost,
    /// A [`timeout`](super::combinators::timeout) fired.
    Timeout,
    /// The semaphore the task held or waited on was disposed.
    SemaphoreDisposed,
    /// The deferred the task awaited was disposed.
    DeferredDisposed,
    /// An embedder-provided reason.
    Other(Arc<str>),
}

impl AbortReason {
    /// Convenience constructor for embedder reasons.
    #[must_use]
    pub fn other(reason: impl Into<Arc<str>>) -> Self {
        Self::Other(reason.into())
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RunnerClosing => f.write_str("runner closing"),
            Self::RaceLost => f.write_str("race lost"),
            Self::Timeout => f.write_str("timeout"),
            Self::SemaphoreDisposed => f.write_str("semaphore disposed"),
            Self::DeferredDisposed => f.write_str("deferred disposed"),
            Self::Other(reason) => f.write_str(reason),
        }
    }
}

/// Cancellation observed by a task or reported at a fiber boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("aborted: {reason}")]
pub struct AbortError {
    /// Why cancellation was requested.
    pub reason: AbortReason,
}

impl AbortError {
    /// Wraps a reason.
    #[must_use]
    pub fn new(reason: AbortReason) -> Self {
        Self { reason }
    }
}

/// How a settled task failed, as seen through its fiber.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError<E> {
    /// Cancellation won; see [`AbortError::reason`].
    #[error(transparent)]
    Aborted(AbortError),
    /// The task itself failed.
    #[error("task failed")]
    Failed(E),
}

impl<E> TaskError<E> {
    /// The task failure, if this is not an abort.
    pub fn into_failure(self) -> Option<E> {
        match self {
            Self::Aborted(_) => None,
            Self::Failed(e) => Some(e),
        }
    }
}

/// Result of joining a fiber.
pub type TaskResult<T, E> = Result<T, TaskError<E>>;

/// A [`timeout`](super::combinators::timeout) elapsed before the task settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("timed out")]
pub struct TimeoutError;

/// A [`retry`](super::combinators::retry) exhausted its schedule.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("gave up after {attempts} attempts")]
pub struct RetryError<E> {
    /// The failure of the final attempt.
    pub cause: E,
    /// How many attempts ran.
    pub attempts: u32,
}
