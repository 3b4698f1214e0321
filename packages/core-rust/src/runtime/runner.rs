//! Runner tree: task scopes with ownership-bound cancellation.
//!
//! A [`Runner`] is a node in a tree of task scopes. Tasks spawned on a
//! runner become [`Fiber`]s; child runners subdivide the scope. Aborting a
//! runner marks its whole subtree; disposing it aborts the subtree, awaits
//! every descendant fiber, and only then settles into `Disposed`. Abort is
//! always cooperative -- a task is never killed, it observes cancellation at
//! its suspension points.
//!
//! # Abort masks
//!
//! Every runner carries a non-negative mask inherited by its children. While
//! the mask is above zero, an abort request still sets the subtree's flag
//! but is invisible to the tasks inside ([`Scope::is_aborted`] stays
//! `false`), so masked work runs to natural completion; the abort surfaces
//! only at the fiber boundary, where the join result is wrapped into
//! [`AbortError`] while the task's own outcome is preserved.

use std::collections::HashMap;
use std::future::Future;
use std::pin::pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Notify};

use super::error::{AbortError, AbortReason, TaskError, TaskResult};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Identifier of a runner within its process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RunnerId(pub u64);

/// Identifier of a fiber within its process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(pub u64);

/// Lifecycle state of a runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    /// Accepting tasks and children.
    Active,
    /// Dispose in progress: subtree aborted, awaiting descendants.
    Disposing,
    /// Fully settled; every descendant has emitted its result.
    Disposed,
}

/// What a settled task actually returned, independent of abort wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Not settled yet.
    Pending,
    /// The task returned a value.
    Ok,
    /// The task returned its own error.
    Err,
    /// The task never ran (submitted to a closing runner).
    Aborted,
}

/// Tree events, bubbled to the root subscriber when one is installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerEvent {
    /// A fiber or child runner joined `runner`.
    ChildAdded {
        /// The parent runner.
        runner: RunnerId,
        /// The new child.
        child: ChildRef,
    },
    /// A fiber settled or a child runner disposed.
    ChildRemoved {
        /// The parent runner.
        runner: RunnerId,
        /// The removed child.
        child: ChildRef,
    },
    /// A runner changed lifecycle state.
    StateChanged {
        /// The runner.
        runner: RunnerId,
        /// Its new state.
        state: RunnerState,
    },
    /// A fiber's outcome was recorded. Always precedes its `ChildRemoved`.
    ResultSet {
        /// The runner owning the fiber.
        runner: RunnerId,
        /// The fiber.
        fiber: FiberId,
        /// What the task returned.
        outcome: Outcome,
    },
}

/// A child edge in the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildRef {
    /// A child runner.
    Runner(RunnerId),
    /// A fiber.
    Fiber(FiberId),
}

/// Immutable snapshot of a runner subtree.
///
/// Snapshots are memoized with structural sharing: as long as a subtree does
/// not change, the same `Arc` is handed out again (compare with
/// [`Arc::ptr_eq`]).
#[derive(Debug)]
pub struct RunnerSnapshot {
    /// The runner.
    pub id: RunnerId,
    /// Lifecycle state at snapshot time.
    pub state: RunnerState,
    /// Whether abort has been requested for this subtree.
    pub aborted: bool,
    /// Live fibers and their outcomes.
    pub fibers: Vec<FiberSnapshot>,
    /// Child runner subtrees.
    pub children: Vec<Arc<RunnerSnapshot>>,
}

/// One fiber inside a [`RunnerSnapshot`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiberSnapshot {
    /// The fiber.
    pub id: FiberId,
    /// Its outcome so far.
    pub outcome: Outcome,
}

struct FiberTracker {
    done: watch::Receiver<bool>,
    outcome: Arc<Mutex<Outcome>>,
}

struct RunnerInner {
    id: RunnerId,
    mask: u32,
    parent: Weak<RunnerInner>,
    state: watch::Sender<RunnerState>,
    children: Mutex<Vec<Weak<RunnerInner>>>,
    fibers: Mutex<HashMap<u64, FiberTracker>>,
    aborted: Mutex<Option<AbortError>>,
    abort_notify: Notify,
    events: Mutex<Option<mpsc::UnboundedSender<RunnerEvent>>>,
    snapshot: Mutex<Option<Arc<RunnerSnapshot>>>,
}

/// Handle to a node in the runner tree. Cheap to clone.
#[derive(Clone)]
pub struct Runner {
    inner: Arc<RunnerInner>,
}

impl Runner {
    /// Creates a root runner with mask zero.
    #[must_use]
    pub fn new() -> Self {
        Self::build(Weak::new(), 0, None)
    }

    fn build(parent: Weak<RunnerInner>, mask: u32, inherited_abort: Option<AbortError>) -> Self {
        let (state, _) = watch::channel(RunnerState::Active);
        Self {
            inner: Arc::new(RunnerInner {
                id: RunnerId(next_id()),
                mask,
                parent,
                state,
                children: Mutex::new(Vec::new()),
                fibers: Mutex::new(HashMap::new()),
                aborted: Mutex::new(inherited_abort),
                abort_notify: Notify::new(),
                events: Mutex::new(None),
                snapshot: Mutex::new(None),
            }),
        }
    }

    /// This runner's identifier.
    #[must_use]
    pub fn id(&self) -> RunnerId {
        self.inner.id
    }

    /// This runner's abort mask depth. Zero means cancellable.
    #[must_use]
    pub fn mask(&self) -> u32 {
        self.inner.mask
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> RunnerState {
        *self.inner.state.borrow()
    }

    /// The pending abort, if one was requested, regardless of mask.
    #[must_use]
    pub fn abort_error(&self) -> Option<AbortError> {
        self.inner.aborted.lock().clone()
    }

    /// Walks to the root of the tree.
    #[must_use]
    pub fn root(&self) -> Runner {
        let mut current = self.inner.clone();
        while let Some(parent) = current.parent.upgrade() {
            current = parent;
        }
        Runner { inner: current }
    }

    /// Creates a child runner inheriting this runner's mask.
    ///
    /// # Errors
    ///
    /// `AbortError { reason: RunnerClosing }` when this runner is disposing
    /// or disposed.
    pub fn child(&self) -> Result<Runner, AbortError> {
        self.child_with_mask(self.inner.mask)
    }

    /// Creates a child runner with an explicit mask (used by `unabortable`
    /// and `Restore`).
    ///
    /// # Errors
    ///
    /// `AbortError { reason: RunnerClosing }` when this runner is disposing
    /// or disposed.
    pub fn child_with_mask(&self, mask: u32) -> Result<Runner, AbortError> {
        if self.state() != RunnerState::Active {
            return Err(AbortError::new(AbortReason::RunnerClosing));
        }
        let child = Self::build(
            Arc::downgrade(&self.inner),
            mask,
            self.inner.aborted.lock().clone(),
        );
        self.inner.children.lock().push(Arc::downgrade(&child.inner));
        self.emit(RunnerEvent::ChildAdded {
            runner: self.id(),
            child: ChildRef::Runner(child.id()),
        });
        self.touch();
        Ok(child)
    }

    /// Spawns a task on this runner.
    ///
    /// The task receives a [`Scope`] for cooperative cancellation and
    /// sub-structuring. If the runner is disposing or disposed the returned
    /// fiber settles immediately with `AbortError { reason: RunnerClosing }`
    /// and outcome [`Outcome::Aborted`].
    pub fn spawn<T, E, F, Fut>(&self, task: F) -> Fiber<T, E>
    where
        T: Send + 'static,
        E: Send + 'static,
        F: FnOnce(Scope) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let id = FiberId(next_id());
        let (done_tx, done_rx) = watch::channel(false);
        let outcome = Arc::new(Mutex::new(Outcome::Pending));
        let abort = Arc::new(FiberAbort::default());
        let shared = Arc::new(FiberShared {
            id,
            runner: self.clone(),
            abort: abort.clone(),
            outcome: outcome.clone(),
            result: Mutex::new(None),
            done: done_tx,
        });

        if self.state() != RunnerState::Active {
            *outcome.lock() = Outcome::Aborted;
            *shared.result.lock() =
                Some(Err(TaskError::Aborted(AbortError::new(AbortReason::RunnerClosing))));
            let _ = shared.done.send(true);
            return Fiber { shared };
        }

        self.inner.fibers.lock().insert(
            id.0,
            FiberTracker { done: done_rx, outcome: outcome.clone() },
        );
        self.emit(RunnerEvent::ChildAdded {
            runner: self.id(),
            child: ChildRef::Fiber(id),
        });
        self.touch();

        let scope = Scope {
            runner: self.clone(),
            fiber_abort: Some(abort),
        };
        let settle = shared.clone();
        let runner = self.clone();
        tokio::spawn(async move {
            let result = task(scope).await;
            let outcome_now = match &result {
                Ok(_) => Outcome::Ok,
                Err(_) => Outcome::Err,
            };
            *settle.outcome.lock() = outcome_now;

            let abort = runner
                .abort_error()
                .or_else(|| settle.abort.error.lock().clone());
            *settle.result.lock() = Some(match (abort, result) {
                (Some(err), _) => Err(TaskError::Aborted(err)),
                (None, Ok(v)) => Ok(v),
                (None, Err(e)) => Err(TaskError::Failed(e)),
            });

            runner.emit(RunnerEvent::ResultSet {
                runner: runner.id(),
                fiber: id,
                outcome: outcome_now,
            });
            runner.inner.fibers.lock().remove(&id.0);
            runner.emit(RunnerEvent::ChildRemoved {
                runner: runner.id(),
                child: ChildRef::Fiber(id),
            });
            runner.touch();
            let _ = settle.done.send(true);
        });

        Fiber { shared }
    }

    /// Requests cancellation of this subtree. Idempotent; the first reason
    /// wins. Tasks observe it cooperatively at their suspension points,
    /// masked tasks not at all.
    pub fn abort(&self, reason: AbortReason) {
        {
            let mut guard = self.inner.aborted.lock();
            if guard.is_some() {
                return;
            }
            *guard = Some(AbortError::new(reason.clone()));
        }
        self.inner.abort_notify.notify_waiters();
        self.touch();
        for child in self.strong_children() {
            child.abort(reason.clone());
        }
    }

    /// Disposes this subtree: aborts every descendant with
    /// [`AbortReason::RunnerClosing`], awaits all fibers, and settles into
    /// [`RunnerState::Disposed`]. Concurrent calls all resolve when the
    /// subtree has fully settled.
    pub fn dispose(&self) -> BoxFuture<'static, ()> {
        let this = self.clone();
        async move {
            let mut claimed = false;
            this.inner.state.send_if_modified(|s| {
                if *s == RunnerState::Active {
                    *s = RunnerState::Disposing;
                    claimed = true;
                    true
                } else {
                    false
                }
            });

            if !claimed {
                let mut rx = this.inner.state.subscribe();
                let _ = rx.wait_for(|s| *s == RunnerState::Disposed).await;
                return;
            }

            this.emit(RunnerEvent::StateChanged {
                runner: this.id(),
                state: RunnerState::Disposing,
            });
            this.touch();
            this.abort(AbortReason::RunnerClosing);

            for child in this.strong_children() {
                child.dispose().await;
            }

            let trackers: Vec<watch::Receiver<bool>> = this
                .inner
                .fibers
                .lock()
                .values()
                .map(|t| t.done.clone())
                .collect();
            for mut done in trackers {
                let _ = done.wait_for(|d| *d).await;
            }

            this.inner.state.send_replace(RunnerState::Disposed);
            this.emit(RunnerEvent::StateChanged {
                runner: this.id(),
                state: RunnerState::Disposed,
            });
            if let Some(parent) = this.inner.parent.upgrade() {
                let parent = Runner { inner: parent };
                parent
                    .inner
                    .children
                    .lock()
                    .retain(|w| w.upgrade().map_or(false, |c| c.id != this.inner.id));
                parent.emit(RunnerEvent::ChildRemoved {
                    runner: parent.id(),
                    child: ChildRef::Runner(this.id()),
                });
                parent.touch();
            }
            this.touch();
        }
        .boxed()
    }

    /// Runs `task` shielded from cancellation: the task executes in a child
    /// scope with mask + 1, so it never observes abort and always runs to
    /// natural completion. If abort was requested meanwhile, the returned
    /// result is wrapped into `AbortError` at the fiber boundary while the
    /// task's outcome is preserved.
    ///
    /// # Errors
    ///
    /// `TaskError::Aborted` when the runner is already closing, when abort
    /// was requested during the masked execution, or with the task's own
    /// failure as `TaskError::Failed`.
    pub async fn unabortable<T, E, F, Fut>(&self, task: F) -> TaskResult<T, E>
    where
        T: Send + 'static,
        E: Send + 'static,
        F: FnOnce(Scope) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let child = self
            .child_with_mask(self.inner.mask + 1)
            .map_err(TaskError::Aborted)?;
        let fiber = child.spawn(task);
        let result = fiber.join().await;
        child.dispose().await;
        result
    }

    /// Runs `f` masked, handing it a [`Restore`] that can re-enter the
    /// previous mask for a cancellable middle section (acquire / use /
    /// release patterns).
    ///
    /// # Errors
    ///
    /// As for [`Runner::unabortable`].
    pub async fn unabortable_mask<T, E, F, Fut>(&self, f: F) -> TaskResult<T, E>
    where
        T: Send + 'static,
        E: Send + 'static,
        F: FnOnce(Scope, Restore) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let child = self
            .child_with_mask(self.inner.mask + 1)
            .map_err(TaskError::Aborted)?;
        let restore = Restore {
            origin: child.id(),
            previous_mask: self.inner.mask,
        };
        let fiber = child.spawn(move |scope| f(scope, restore));
        let result = fiber.join().await;
        child.dispose().await;
        result
    }

    /// Installs the event subscriber for this runner. Events from the whole
    /// subtree bubble up to the nearest subscribed ancestor.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<RunnerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.events.lock() = Some(tx);
        rx
    }

    /// Returns the memoized snapshot of this subtree.
    #[must_use]
    pub fn snapshot(&self) -> Arc<RunnerSnapshot> {
        if let Some(cached) = self.inner.snapshot.lock().clone() {
            return cached;
        }
        let fibers: Vec<FiberSnapshot> = {
            let fibers = self.inner.fibers.lock();
            let mut list: Vec<FiberSnapshot> = fibers
                .iter()
                .map(|(id, t)| FiberSnapshot {
                    id: FiberId(*id),
                    outcome: *t.outcome.lock(),
                })
                .collect();
            list.sort_by_key(|f| f.id);
            list
        };
        let children: Vec<Arc<RunnerSnapshot>> = self
            .strong_children()
            .into_iter()
            .map(|c| c.snapshot())
            .collect();
        let built = Arc::new(RunnerSnapshot {
            id: self.id(),
            state: self.state(),
            aborted: self.abort_error().is_some(),
            fibers,
            children,
        });
        *self.inner.snapshot.lock() = Some(built.clone());
        built
    }

    /// Number of live fibers on this runner (excluding children).
    #[must_use]
    pub fn fiber_count(&self) -> usize {
        self.inner.fibers.lock().len()
    }

    fn strong_children(&self) -> Vec<Runner> {
        self.inner
            .children
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .map(|inner| Runner { inner })
            .collect()
    }

    /// Invalidates the memoized snapshot of this runner and its ancestors.
    fn touch(&self) {
        let mut current = Some(self.inner.clone());
        while let Some(node) = current {
            node.snapshot.lock().take();
            current = node.parent.upgrade();
        }
    }

    /// Delivers an event to the nearest subscribed ancestor (or self).
    fn emit(&self, event: RunnerEvent) {
        let mut current = Some(self.inner.clone());
        while let Some(node) = current {
            if let Some(tx) = node.events.lock().as_ref() {
                let _ = tx.send(event);
                return;
            }
            current = node.parent.upgrade();
        }
    }
}

impl Default for Runner {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("mask", &self.inner.mask)
            .finish()
    }
}

/// Re-enters a previous abort mask from inside a masked section.
///
/// Produced by [`Runner::unabortable_mask`]; only valid inside the scope it
/// was handed to.
#[derive(Debug, Clone, Copy)]
pub struct Restore {
    origin: RunnerId,
    previous_mask: u32,
}

impl Restore {
    /// Runs `task` with the mask that was in effect before the enclosing
    /// `unabortable_mask`, making it cancellable again.
    ///
    /// # Panics
    ///
    /// Panics when used from a scope other than the one the enclosing
    /// `unabortable_mask` created -- a precondition violation.
    ///
    /// # Errors
    ///
    /// `TaskError::Aborted` when the restored section observes abort, or the
    /// task's own failure as `TaskError::Failed`.
    pub async fn restore<T, E, F, Fut>(&self, scope: &Scope, task: F) -> TaskResult<T, E>
    where
        T: Send + 'static,
        E: Send + 'static,
        F: FnOnce(Scope) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        assert_eq!(
            scope.runner.id(),
            self.origin,
            "restore used outside the mask scope that created it"
        );
        let child = scope
            .runner
            .child_with_mask(self.previous_mask)
            .map_err(TaskError::Aborted)?;
        let fiber = child.spawn(task);
        let result = fiber.join().await;
        child.dispose().await;
        result
    }
}

#[derive(Default)]
struct FiberAbort {
    error: Mutex<Option<AbortError>>,
    notify: Notify,
}

struct FiberShared<T, E> {
    id: FiberId,
    runner: Runner,
    abort: Arc<FiberAbort>,
    outcome: Arc<Mutex<Outcome>>,
    result: Mutex<Option<TaskResult<T, E>>>,
    done: watch::Sender<bool>,
}

/// Handle to a running task.
#[must_use = "a fiber must be joined, aborted, or explicitly detached"]
pub struct Fiber<T, E> {
    shared: Arc<FiberShared<T, E>>,
}

impl<T, E> Fiber<T, E> {
    /// This fiber's identifier.
    pub fn id(&self) -> FiberId {
        self.shared.id
    }

    /// What the task actually returned so far, independent of any abort
    /// wrapping applied to the join result.
    pub fn outcome(&self) -> Outcome {
        *self.shared.outcome.lock()
    }

    /// Requests cancellation of this fiber only. Idempotent.
    pub fn abort(&self, reason: AbortReason) {
        {
            let mut guard = self.shared.abort.error.lock();
            if guard.is_some() {
                return;
            }
            *guard = Some(AbortError::new(reason));
        }
        self.shared.abort.notify.notify_waiters();
    }

    /// Whether the fiber has settled.
    pub fn is_settled(&self) -> bool {
        *self.shared.done.subscribe().borrow()
    }

    pub(crate) fn done_receiver(&self) -> watch::Receiver<bool> {
        self.shared.done.subscribe()
    }

    /// Awaits settlement and returns the result.
    ///
    /// # Errors
    ///
    /// `TaskError::Aborted` whenever abort was requested before the task
    /// settled -- even if the task returned a value (inspect
    /// [`Fiber::outcome`] for what it actually did) -- and
    /// `TaskError::Failed` for the task's own error.
    pub async fn join(self) -> TaskResult<T, E> {
        let mut done = self.shared.done.subscribe();
        let _ = done.wait_for(|d| *d).await;
        self.shared
            .result
            .lock()
            .take()
            .expect("fiber settled exactly once")
    }

    /// Detaches the fiber: it keeps running, its result is discarded.
    pub fn detach(self) {}
}

impl<T, E> std::fmt::Debug for Fiber<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.shared.id)
            .field("outcome", &self.outcome())
            .finish()
    }
}

/// Capability handle passed to every task: its runner plus the per-fiber
/// abort channel.
#[derive(Clone)]
pub struct Scope {
    runner: Runner,
    fiber_abort: Option<Arc<FiberAbort>>,
}

impl Scope {
    /// A scope not tied to any fiber, for driving code from outside the
    /// tree (tests, composition roots).
    #[must_use]
    pub fn detached(runner: &Runner) -> Self {
        Self {
            runner: runner.clone(),
            fiber_abort: None,
        }
    }

    /// The runner this task belongs to.
    #[must_use]
    pub fn runner(&self) -> &Runner {
        &self.runner
    }

    /// The abort observable by this task: `None` while unrequested or while
    /// the mask is above zero.
    #[must_use]
    pub fn abort_error(&self) -> Option<AbortError> {
        if self.runner.mask() > 0 {
            return None;
        }
        self.runner.abort_error().or_else(|| {
            self.fiber_abort
                .as_ref()
                .and_then(|a| a.error.lock().clone())
        })
    }

    /// Whether this task observes a cancellation request.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.abort_error().is_some()
    }

    /// Suspends until cancellation becomes observable. Never resolves inside
    /// a masked scope.
    pub async fn aborted(&self) -> AbortError {
        if self.runner.mask() > 0 {
            std::future::pending::<()>().await;
        }
        loop {
            // Register the waiters before checking the flags, otherwise a
            // notify_waiters between check and await is lost.
            let mut runner_notified = pin!(self.runner.inner.abort_notify.notified());
            runner_notified.as_mut().enable();
            match &self.fiber_abort {
                Some(fiber) => {
                    let mut fiber_notified = pin!(fiber.notify.notified());
                    fiber_notified.as_mut().enable();
                    if let Some(err) = self.abort_error() {
                        return err;
                    }
                    futures_util::future::select(runner_notified, fiber_notified).await;
                }
                None => {
                    if let Some(err) = self.abort_error() {
                        return err;
                    }
                    runner_notified.await;
                }
            }
        }
    }

    /// Cooperative suspension point: yields to the scheduler once and then
    /// reports whether cancellation became observable.
    ///
    /// # Errors
    ///
    /// The observable [`AbortError`], if any.
    pub async fn yield_now(&self) -> Result<(), AbortError> {
        tokio::task::yield_now().await;
        match self.abort_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Sleeps for `duration`, waking early with the abort error when
    /// cancellation becomes observable (the timer is dropped).
    ///
    /// # Errors
    ///
    /// The observable [`AbortError`] when cancellation interrupts the sleep.
    pub async fn sleep(&self, duration: Duration) -> Result<(), AbortError> {
        tokio::select! {
            () = tokio::time::sleep(duration) => Ok(()),
            err = self.aborted() => Err(err),
        }
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope").field("runner", &self.runner.id()).finish()
    }
}
