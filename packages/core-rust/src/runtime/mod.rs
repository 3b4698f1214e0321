//! Structured-concurrency runtime: runner trees, fibers, combinators.
//!
//! The synchronization engine coordinates its work through a tree of task
//! scopes with ownership-bound cancellation:
//!
//! - **Runner / Fiber** ([`runner`]): spawning, cooperative abort, abort
//!   masks, lifecycle events, memoized tree snapshots
//! - **Combinators** ([`combinators`]): `race`, `timeout`, `retry`,
//!   `repeat`, delay schedules
//! - **Synchronization** ([`sync`]): semaphore, mutex, deferred, gate
//! - **Resource release** ([`stack`]): LIFO disposable stacks that run
//!   shielded from cancellation
//!
//! Scheduling is cooperative: suspension happens only at `sleep`,
//! `yield_now`, combinator steps, semaphore/deferred/gate waits, and fiber
//! joins. Abort never kills a task; it becomes observable at those points
//! (or not at all under a mask) and is reported as a value.

pub mod combinators;
pub mod error;
pub mod runner;
pub mod stack;
pub mod sync;

pub use combinators::{
    boxed_task, race, race_with_reason, repeat, retry, timeout, BoxTask, ExponentialBackoff,
    FixedDelay, RepeatOptions, RetryOptions, Schedule,
};
pub use error::{AbortError, AbortReason, RetryError, TaskError, TaskResult, TimeoutError};
pub use runner::{
    ChildRef, Fiber, FiberId, FiberSnapshot, Outcome, Restore, Runner, RunnerEvent, RunnerId,
    RunnerSnapshot, RunnerState, Scope,
};
pub use stack::{AsyncDisposable, AsyncDisposableStack};
pub use sync::{Deferred, Gate, Mutex, Semaphore};
