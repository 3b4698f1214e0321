//! Ordered asynchronous resource release.
//!
//! An [`AsyncDisposableStack`] collects cleanup obligations and releases
//! them in LIFO order. Every release runs shielded from cancellation (mask
//! above zero, rooted at the tree's root runner), so cleanup completes even
//! when the surrounding task was aborted. A stack belongs to its owning
//! task's scope and is not shared across tasks.

use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;

use super::runner::{Runner, RunnerState, Scope};

/// A resource with an asynchronous cleanup routine.
pub trait AsyncDisposable: Send + Sync + 'static {
    /// Releases the resource. Runs shielded from cancellation.
    fn dispose<'a>(&'a self, scope: &'a Scope) -> BoxFuture<'a, ()>;
}

type Release = Box<dyn FnOnce(Scope) -> BoxFuture<'static, ()> + Send + 'static>;

/// LIFO stack of cleanup obligations.
pub struct AsyncDisposableStack {
    runner: Runner,
    entries: Vec<Release>,
    disposed: bool,
}

impl AsyncDisposableStack {
    /// Creates an empty stack rooted in `runner`'s tree.
    #[must_use]
    pub fn new(runner: &Runner) -> Self {
        Self {
            runner: runner.clone(),
            entries: Vec::new(),
            disposed: false,
        }
    }

    /// Whether the stack has been disposed (or moved out of).
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Number of pending releases.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no releases are pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registers a bare cleanup task.
    ///
    /// # Panics
    ///
    /// Panics when the stack is already disposed.
    pub fn defer<F, Fut>(&mut self, release: F)
    where
        F: FnOnce(Scope) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        assert!(!self.disposed, "stack already disposed");
        self.entries.push(Box::new(move |scope| Box::pin(release(scope))));
    }

    /// Takes ownership of a disposable resource, scheduling its `dispose`.
    /// Returns a shared handle for continued use.
    ///
    /// # Panics
    ///
    /// Panics when the stack is already disposed.
    pub fn use_disposable<D: AsyncDisposable>(&mut self, resource: D) -> Arc<D> {
        assert!(!self.disposed, "stack already disposed");
        let resource = Arc::new(resource);
        let held = resource.clone();
        self.entries.push(Box::new(move |scope| {
            Box::pin(async move { held.dispose(&scope).await })
        }));
        resource
    }

    /// Adopts a non-disposable value together with an explicit release task.
    /// Returns a shared handle to the value.
    ///
    /// # Panics
    ///
    /// Panics when the stack is already disposed.
    pub fn adopt<V, F, Fut>(&mut self, value: V, release: F) -> Arc<V>
    where
        V: Send + Sync + 'static,
        F: FnOnce(Arc<V>, Scope) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        assert!(!self.disposed, "stack already disposed");
        let value = Arc::new(value);
        let held = value.clone();
        self.entries
            .push(Box::new(move |scope| Box::pin(release(held, scope))));
        value
    }

    /// Transfers all pending releases into a new stack, leaving this one
    /// disposed and empty. Used to move cleanup ownership out of the
    /// current scope.
    ///
    /// # Panics
    ///
    /// Panics when the stack is already disposed.
    #[must_use]
    pub fn move_out(&mut self) -> AsyncDisposableStack {
        assert!(!self.disposed, "stack already disposed");
        self.disposed = true;
        AsyncDisposableStack {
            runner: self.runner.clone(),
            entries: std::mem::take(&mut self.entries),
            disposed: false,
        }
    }

    /// Runs all pending releases in LIFO order. Idempotent.
    ///
    /// Each release runs shielded: on a mask + 1 child of the tree's root
    /// runner, or on a detached masked scope when the tree itself is already
    /// closing. Either way an abort of the original task cannot interrupt
    /// cleanup.
    pub async fn dispose_all(mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        let root = self.runner.root();
        while let Some(release) = self.entries.pop() {
            let shield = if root.state() == RunnerState::Active {
                root.child_with_mask(root.mask() + 1).ok()
            } else {
                None
            };
            match shield {
                Some(shield) => {
                    let fiber = shield.spawn::<(), (), _, _>(move |scope| async move {
                        release(scope).await;
                        Ok(())
                    });
                    let _ = fiber.join().await;
                    shield.dispose().await;
                }
                // The tree is already closing; the release still must run.
                None => {
                    let detached = Runner::new();
                    release(Scope::detached(&detached)).await;
                }
            }
        }
    }
}

impl Drop for AsyncDisposableStack {
    fn drop(&mut self) {
        if !self.disposed && !self.entries.is_empty() {
            tracing::warn!(
                pending = self.entries.len(),
                "disposable stack dropped without dispose_all; releases skipped"
            );
        }
    }
}

impl std::fmt::Debug for AsyncDisposableStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncDisposableStack")
            .field("pending", &self.entries.len())
            .field("disposed", &self.disposed)
            .finish()
    }
}
