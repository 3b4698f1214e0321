//! Task combinators: race, timeout, retry, repeat.
//!
//! All combinators treat cancellation as a first-class result:
//! `TaskError::Aborted` is never retried, losers of a race are aborted with
//! [`AbortReason::RaceLost`] and not awaited, and a timeout aborts its task
//! with [`AbortReason::Timeout`] while an unabortable inner task simply
//! keeps running invisibly, its result discarded.

use std::future::Future;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

use super::error::{AbortReason, RetryError, TaskError, TaskResult, TimeoutError};
use super::runner::{Runner, Scope};

/// A boxed spawnable task, for combinators over heterogeneous task lists.
pub type BoxTask<T, E> = Box<dyn FnOnce(Scope) -> BoxFuture<'static, Result<T, E>> + Send>;

/// Boxes a closure into a [`BoxTask`].
pub fn boxed_task<T, E, F, Fut>(task: F) -> BoxTask<T, E>
where
    F: FnOnce(Scope) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
{
    Box::new(move |scope| Box::pin(task(scope)))
}

/// Runs all tasks concurrently; the first to settle wins. Losers are aborted
/// with [`AbortReason::RaceLost`] and are not awaited -- their eventual
/// results are discarded (a background fiber disposes their scopes). An
/// external abort of `runner` propagates to every contestant.
///
/// # Panics
///
/// Panics when `tasks` is empty.
///
/// # Errors
///
/// The winner's result, abort wrapping included.
pub async fn race<T, E>(runner: &Runner, tasks: Vec<BoxTask<T, E>>) -> TaskResult<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    race_with_reason(runner, tasks, AbortReason::RaceLost).await
}

/// [`race`] with an explicit reason handed to the losers.
///
/// # Panics
///
/// Panics when `tasks` is empty.
///
/// # Errors
///
/// The winner's result, abort wrapping included.
pub async fn race_with_reason<T, E>(
    runner: &Runner,
    tasks: Vec<BoxTask<T, E>>,
    loser_reason: AbortReason,
) -> TaskResult<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    assert!(!tasks.is_empty(), "race requires at least one task");

    let arena = match runner.child() {
        Ok(arena) => arena,
        Err(err) => return Err(TaskError::Aborted(err)),
    };
    let (settled_tx, mut settled_rx) = mpsc::unbounded_channel::<usize>();

    let mut fibers = Vec::with_capacity(tasks.len());
    for (index, task) in tasks.into_iter().enumerate() {
        let settled_tx = settled_tx.clone();
        fibers.push(arena.spawn(move |scope| async move {
            let result = task(scope).await;
            let _ = settled_tx.send(index);
            result
        }));
    }
    drop(settled_tx);

    let winner = settled_rx.recv().await.expect("at least one contestant");
    for (index, fiber) in fibers.iter().enumerate() {
        if index != winner {
            fiber.abort(loser_reason.clone());
        }
    }
    let result = fibers.swap_remove(winner).join().await;

    // Settle the losers off to the side so the arena eventually leaves the
    // tree; the race itself does not wait for them.
    tokio::spawn(async move {
        drop(fibers);
        arena.dispose().await;
    });

    result
}

/// Races `task` against a timer.
///
/// On expiry the task is aborted with [`AbortReason::Timeout`] and
/// `Err(TimeoutError)` is returned immediately; an unabortable task keeps
/// running to completion invisibly and its result is discarded.
///
/// # Errors
///
/// `Err(TimeoutError)` on expiry; otherwise the task's own settled result.
pub async fn timeout<T, E, F, Fut>(
    runner: &Runner,
    duration: Duration,
    task: F,
) -> Result<TaskResult<T, E>, TimeoutError>
where
    T: Send + 'static,
    E: Send + 'static,
    F: FnOnce(Scope) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
{
    let fiber = runner.spawn(task);
    let mut done = fiber.done_receiver();
    tokio::select! {
        _ = done.wait_for(|d| *d) => Ok(fiber.join().await),
        () = tokio::time::sleep(duration) => {
            fiber.abort(AbortReason::Timeout);
            fiber.detach();
            Err(TimeoutError)
        }
    }
}

/// Delay schedule consulted between attempts.
pub trait Schedule: Send {
    /// Delay before the next attempt, or `None` to stop. `attempt` counts
    /// completed attempts, starting at 1.
    fn next_delay(&mut self, attempt: u32) -> Option<Duration>;
}

/// Retries at a fixed interval, a bounded number of times.
#[derive(Debug, Clone)]
pub struct FixedDelay {
    /// Pause between attempts.
    pub delay: Duration,
    /// How many re-attempts to allow after the first.
    pub max_retries: u32,
}

impl Schedule for FixedDelay {
    fn next_delay(&mut self, attempt: u32) -> Option<Duration> {
        (attempt <= self.max_retries).then_some(self.delay)
    }
}

/// Exponential backoff with a cap.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Delay before the first re-attempt.
    pub initial: Duration,
    /// Multiplier applied per attempt.
    pub factor: f64,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// How many re-attempts to allow after the first.
    pub max_retries: u32,
}

impl Schedule for ExponentialBackoff {
    fn next_delay(&mut self, attempt: u32) -> Option<Duration> {
        if attempt > self.max_retries {
            return None;
        }
        let factor = self.factor.powi(attempt.saturating_sub(1) as i32);
        let delay = self.initial.mul_f64(factor);
        Some(delay.min(self.max_delay))
    }
}

/// Options for [`retry`].
pub struct RetryOptions<E> {
    /// Predicate deciding whether a failure is worth retrying. Defaults to
    /// retrying everything.
    pub retryable: Option<Box<dyn Fn(&E) -> bool + Send>>,
    /// Observer invoked before each re-attempt with (attempt, failure).
    pub on_retry: Option<Box<dyn FnMut(u32, &E) + Send>>,
}

impl<E> Default for RetryOptions<E> {
    fn default() -> Self {
        Self {
            retryable: None,
            on_retry: None,
        }
    }
}

/// Reruns `attempt` until it succeeds, the schedule gives up, or the failure
/// is not retryable. Cancellation is never retried: an observable abort
/// before or during an attempt (or during the backoff sleep) returns
/// `TaskError::Aborted` at once.
///
/// # Errors
///
/// `TaskError::Failed(RetryError { cause, attempts })` when attempts are
/// exhausted or a failure is not retryable; `TaskError::Aborted` on
/// cancellation.
pub async fn retry<T, E, F, Fut, S>(
    scope: &Scope,
    mut schedule: S,
    mut options: RetryOptions<E>,
    mut attempt: F,
) -> TaskResult<T, RetryError<E>>
where
    F: FnMut(Scope) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    S: Schedule,
{
    let mut attempts = 0_u32;
    loop {
        if let Some(err) = scope.abort_error() {
            return Err(TaskError::Aborted(err));
        }
        attempts += 1;
        match attempt(scope.clone()).await {
            Ok(value) => return Ok(value),
            Err(cause) => {
                let retryable = options.retryable.as_ref().map_or(true, |p| p(&cause));
                let delay = retryable
                    .then(|| schedule.next_delay(attempts))
                    .flatten();
                match delay {
                    None => {
                        return Err(TaskError::Failed(RetryError { cause, attempts }));
                    }
                    Some(delay) => {
                        if let Some(on_retry) = options.on_retry.as_mut() {
                            on_retry(attempts, &cause);
                        }
                        scope.sleep(delay).await.map_err(TaskError::Aborted)?;
                    }
                }
            }
        }
    }
}

/// Options for [`repeat`].
pub struct RepeatOptions<T> {
    /// Predicate deciding whether to go around again after a success;
    /// returning `false` signals done. Defaults to always repeating until
    /// the schedule terminates.
    pub repeatable: Option<Box<dyn Fn(&T) -> bool + Send>>,
    /// Observer invoked before each repetition with (iteration, value).
    pub on_repeat: Option<Box<dyn FnMut(u32, &T) + Send>>,
}

impl<T> Default for RepeatOptions<T> {
    fn default() -> Self {
        Self {
            repeatable: None,
            on_repeat: None,
        }
    }
}

/// Runs `iteration` to success, then keeps re-running it until the schedule
/// terminates, the value signals done, or an iteration fails.
///
/// # Errors
///
/// The first iteration failure as `TaskError::Failed`, or
/// `TaskError::Aborted` on cancellation.
pub async fn repeat<T, E, F, Fut, S>(
    scope: &Scope,
    mut schedule: S,
    mut options: RepeatOptions<T>,
    mut iteration: F,
) -> TaskResult<T, E>
where
    F: FnMut(Scope) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    S: Schedule,
{
    let mut iterations = 0_u32;
    loop {
        if let Some(err) = scope.abort_error() {
            return Err(TaskError::Aborted(err));
        }
        iterations += 1;
        let value = iteration(scope.clone())
            .await
            .map_err(TaskError::Failed)?;
        if !options.repeatable.as_ref().map_or(true, |p| p(&value)) {
            return Ok(value);
        }
        let Some(delay) = schedule.next_delay(iterations) else {
            return Ok(value);
        };
        if let Some(on_repeat) = options.on_repeat.as_mut() {
            on_repeat(iterations, &value);
        }
        scope.sleep(delay).await.map_err(TaskError::Aborted)?;
    }
}
