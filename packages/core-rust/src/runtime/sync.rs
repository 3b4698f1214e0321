//! Suspension-based synchronization primitives: semaphore, mutex, deferred
//! values, and gates.
//!
//! All of them are disposal-aware: disposing a primitive settles every
//! waiter (and, for semaphores, every running holder) with an
//! [`AbortError`] carrying the matching reason, so no task is left parked
//! on a dead resource.

use std::future::Future;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Notify};

use super::error::{AbortError, AbortReason, TaskError, TaskResult};
use super::runner::Scope;

struct SemaphoreInner {
    permits: tokio::sync::Semaphore,
    disposed: AtomicBool,
    disposed_notify: Notify,
}

/// Bounded concurrency gate: at most `n` holders at a time.
///
/// Waiters queue on [`Semaphore::with_permit`]; disposal aborts waiters and
/// running holders with [`AbortReason::SemaphoreDisposed`].
#[derive(Clone)]
pub struct Semaphore {
    inner: Arc<SemaphoreInner>,
}

impl Semaphore {
    /// Creates a semaphore with `permits` concurrent holders.
    #[must_use]
    pub fn new(permits: usize) -> Self {
        Self {
            inner: Arc::new(SemaphoreInner {
                permits: tokio::sync::Semaphore::new(permits),
                disposed: AtomicBool::new(false),
                disposed_notify: Notify::new(),
            }),
        }
    }

    /// Permits not currently held.
    #[must_use]
    pub fn available_permits(&self) -> usize {
        self.inner.permits.available_permits()
    }

    /// Whether the semaphore has been disposed.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Disposes the semaphore: waiters fail to acquire and running holders
    /// are settled with [`AbortReason::SemaphoreDisposed`]. Idempotent.
    pub fn dispose(&self) {
        self.inner.disposed.store(true, Ordering::Release);
        self.inner.permits.close();
        self.inner.disposed_notify.notify_waiters();
    }

    /// Acquires a permit, runs `task`, releases the permit.
    ///
    /// Acquisition suspends and is abort-aware; while `task` runs, disposal
    /// of the semaphore settles the call with
    /// [`AbortReason::SemaphoreDisposed`] (the task future is dropped at its
    /// next suspension point).
    ///
    /// # Errors
    ///
    /// `TaskError::Aborted` on observable cancellation or disposal;
    /// `TaskError::Failed` for the task's own error.
    pub async fn with_permit<T, E, F, Fut>(&self, scope: &Scope, task: F) -> TaskResult<T, E>
    where
        F: FnOnce(Scope) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = tokio::select! {
            biased;
            err = scope.aborted() => return Err(TaskError::Aborted(err)),
            permit = self.inner.permits.acquire() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    return Err(TaskError::Aborted(AbortError::new(
                        AbortReason::SemaphoreDisposed,
                    )))
                }
            },
        };

        let result = tokio::select! {
            result = task(scope.clone()) => match result {
                Ok(value) => Ok(value),
                Err(error) => Err(TaskError::Failed(error)),
            },
            () = self.disposed() => {
                Err(TaskError::Aborted(AbortError::new(AbortReason::SemaphoreDisposed)))
            }
        };
        drop(permit);
        result
    }

    async fn disposed(&self) {
        loop {
            let mut notified = pin!(self.inner.disposed_notify.notified());
            notified.as_mut().enable();
            if self.is_disposed() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Semaphore")
            .field("available", &self.available_permits())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Mutual exclusion: a semaphore with a single permit.
#[derive(Clone, Debug)]
pub struct Mutex {
    semaphore: Semaphore,
}

impl Mutex {
    /// Creates an unlocked mutex.
    #[must_use]
    pub fn new() -> Self {
        Self {
            semaphore: Semaphore::new(1),
        }
    }

    /// Runs `task` while holding the lock.
    ///
    /// # Errors
    ///
    /// As for [`Semaphore::with_permit`].
    pub async fn with_lock<T, E, F, Fut>(&self, scope: &Scope, task: F) -> TaskResult<T, E>
    where
        F: FnOnce(Scope) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.semaphore.with_permit(scope, task).await
    }

    /// Disposes the mutex, settling waiters and the holder.
    pub fn dispose(&self) {
        self.semaphore.dispose();
    }

    /// Whether the mutex has been disposed.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.semaphore.is_disposed()
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
enum DeferredState<T, E> {
    Pending,
    Settled(Result<T, E>),
    Disposed,
}

/// A single-shot value produced once and awaited by any number of tasks.
///
/// The first `resolve`/`reject` wins; disposal settles waiters with
/// [`AbortReason::DeferredDisposed`].
pub struct Deferred<T, E> {
    state: watch::Sender<DeferredState<T, E>>,
}

impl<T, E> Deferred<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Creates an unresolved deferred.
    #[must_use]
    pub fn new() -> Self {
        let (state, _) = watch::channel(DeferredState::Pending);
        Self { state }
    }

    /// Resolves with a value. Returns `false` if already settled or disposed.
    pub fn resolve(&self, value: T) -> bool {
        self.settle(DeferredState::Settled(Ok(value)))
    }

    /// Rejects with an error. Returns `false` if already settled or disposed.
    pub fn reject(&self, error: E) -> bool {
        self.settle(DeferredState::Settled(Err(error)))
    }

    /// Disposes the deferred; pending waiters observe
    /// [`AbortReason::DeferredDisposed`]. Returns `false` if already settled.
    pub fn dispose(&self) -> bool {
        self.settle(DeferredState::Disposed)
    }

    fn settle(&self, next: DeferredState<T, E>) -> bool {
        self.state.send_if_modified(|state| {
            if matches!(state, DeferredState::Pending) {
                *state = next;
                true
            } else {
                false
            }
        })
    }

    /// Whether a value or error has been recorded.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        matches!(&*self.state.borrow(), DeferredState::Settled(_))
    }

    /// Suspends until the deferred settles.
    ///
    /// # Errors
    ///
    /// The recorded rejection as `TaskError::Failed`, or `TaskError::Aborted`
    /// on observable cancellation or disposal.
    pub async fn task(&self, scope: &Scope) -> TaskResult<T, E> {
        let mut rx = self.state.subscribe();
        let settled = tokio::select! {
            biased;
            err = scope.aborted() => return Err(TaskError::Aborted(err)),
            settled = rx.wait_for(|s| !matches!(s, DeferredState::Pending)) => settled,
        };
        let result = match &*settled.expect("sender lives in self") {
            DeferredState::Settled(Ok(value)) => Ok(value.clone()),
            DeferredState::Settled(Err(error)) => Err(TaskError::Failed(error.clone())),
            DeferredState::Disposed => Err(TaskError::Aborted(AbortError::new(
                AbortReason::DeferredDisposed,
            ))),
            DeferredState::Pending => unreachable!("wait_for excludes pending"),
        };
        result
    }
}

impl<T, E> Default for Deferred<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> Clone for Deferred<T, E> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T, E> std::fmt::Debug for Deferred<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.state.borrow() {
            DeferredState::Pending => "pending",
            DeferredState::Settled(_) => "settled",
            DeferredState::Disposed => "disposed",
        };
        f.debug_struct("Deferred").field("state", &state).finish()
    }
}

/// A repeatable open/close barrier. Tasks wait while the gate is closed.
#[derive(Clone)]
pub struct Gate {
    open: watch::Sender<bool>,
}

impl Gate {
    /// Creates a gate in the given initial position.
    #[must_use]
    pub fn new(initially_open: bool) -> Self {
        let (open, _) = watch::channel(initially_open);
        Self { open }
    }

    /// Opens the gate, releasing all waiters.
    pub fn open(&self) {
        self.open.send_replace(true);
    }

    /// Closes the gate; subsequent waits suspend.
    pub fn close(&self) {
        self.open.send_replace(false);
    }

    /// Whether the gate is currently open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        *self.open.borrow()
    }

    /// Suspends while the gate is closed.
    ///
    /// # Errors
    ///
    /// The observable [`AbortError`] on cancellation.
    pub async fn wait(&self, scope: &Scope) -> Result<(), AbortError> {
        let mut rx = self.open.subscribe();
        tokio::select! {
            biased;
            err = scope.aborted() => Err(err),
            result = rx.wait_for(|open| *open) => {
                result.expect("sender lives in self");
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for Gate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gate").field("open", &self.is_open()).finish()
    }
}
