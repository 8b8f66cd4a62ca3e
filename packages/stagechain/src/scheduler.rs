//! Scheduling contract between the engine and the caller.
//!
//! The engine never decides *when* anything runs. Every handler and every
//! flush of pending continuations is wrapped in a [`Task`] and handed to the
//! scheduler of the stage it belongs to. The scheduler may run it inline,
//! push it onto a queue for the next tick or frame, or never run it at all.
//!
//! # Example
//!
//! ```ignore
//! use stagechain::{Engine, Task};
//!
//! // Run everything inline, but route panics back into the chain.
//! let engine = Engine::builder()
//!     .with_standard_stages(|task: Task| {
//!         let recovery = task.recovery();
//!         if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| task.run())).is_err() {
//!             recovery.reject("handler panicked".into());
//!         }
//!     })
//!     .build()?;
//! ```

use std::sync::Arc;

use serde_json::Value;

use crate::link::Link;
use crate::settle::{ChainValue, Outcome};

/// Decides when a queued task runs.
///
/// Any `Fn(Task<V>) + Send + Sync` closure is a scheduler.
pub trait Scheduler<V = Value>: Send + Sync + 'static {
    /// Take ownership of `task` and run it whenever this stage's policy says so.
    fn schedule(&self, task: Task<V>);
}

impl<V, F> Scheduler<V> for F
where
    F: Fn(Task<V>) + Send + Sync + 'static,
{
    fn schedule(&self, task: Task<V>) {
        self(task)
    }
}

/// A single-shot unit of work handed to a scheduler.
///
/// Running a task consumes it. Dropping it without running leaves the link
/// it belongs to pending forever.
pub struct Task<V = Value> {
    run: Box<dyn FnOnce(V) + Send>,
    recovery: Resolver<V>,
}

impl<V: ChainValue> Task<V> {
    pub(crate) fn new(run: impl FnOnce(V) + Send + 'static, recovery: Resolver<V>) -> Self {
        Self {
            run: Box::new(run),
            recovery,
        }
    }

    /// Run the task with the default scheduler argument.
    pub fn run(self) {
        (self.run)(V::default())
    }

    /// Run the task, passing `arg` through to the stage handler.
    ///
    /// Frame or tick based schedulers use this to hand a timestamp to
    /// handlers registered with [`Chain::stage_with`](crate::Chain::stage_with).
    pub fn run_with(self, arg: V) {
        (self.run)(arg)
    }

    /// The reject path of the link this task belongs to.
    ///
    /// Grab it before running the task; a scheduler that catches a failure
    /// while running the task reports it here.
    pub fn recovery(&self) -> Resolver<V> {
        self.recovery.clone()
    }
}

impl<V> std::fmt::Debug for Task<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("chain", &self.recovery.link.id())
            .finish_non_exhaustive()
    }
}

/// Settles one link from the outside.
///
/// Handed to [`Engine::promise`](crate::Engine::promise) executors, to
/// [`Thenable`](crate::Thenable) subscriptions, and exposed by
/// [`Task::recovery`]. Only the first settlement counts; later calls are
/// ignored.
pub struct Resolver<V = Value> {
    link: Arc<Link<V>>,
}

impl<V> Clone for Resolver<V> {
    fn clone(&self) -> Self {
        Self {
            link: self.link.clone(),
        }
    }
}

impl<V: ChainValue> Resolver<V> {
    pub(crate) fn new(link: Arc<Link<V>>) -> Self {
        Self { link }
    }

    /// Fulfill the link with a value, or adopt the eventual settlement of a
    /// chain or other thenable.
    pub fn resolve(&self, value: impl Into<Outcome<V>>) {
        if self.link.is_settled() {
            self.link.ignored();
            return;
        }
        self.link.adopt(value.into());
    }

    /// Reject the link with `error`.
    pub fn reject(&self, error: V) {
        self.link.settle(Err(error));
    }

    /// Returns true once the link has settled.
    pub fn is_settled(&self) -> bool {
        self.link.is_settled()
    }
}

impl<V> std::fmt::Debug for Resolver<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("chain", &self.link.id())
            .finish_non_exhaustive()
    }
}
