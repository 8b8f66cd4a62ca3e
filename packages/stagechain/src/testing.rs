//! Testing utilities for stagechain engines and chains.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! stagechain = { version = "0.1", features = ["testing"] }
//! ```
//!
//! # Quick Start
//!
//! ## Driving Stages By Hand
//!
//! ```ignore
//! use stagechain::testing::{immediate, ManualScheduler};
//!
//! let frames = ManualScheduler::new();
//! let engine = Engine::builder()
//!     .with_standard_stages(immediate())
//!     .with_scheduler("render", frames.clone())
//!     .build()?;
//!
//! let chain = engine.resolve(state).stage("render", draw);
//! assert!(!chain.is_settled());
//!
//! frames.run_all();  // one "frame"
//! assert!(chain.is_settled());
//! ```
//!
//! ## Settling From The Test
//!
//! ```ignore
//! use stagechain::testing::deferred;
//!
//! let (chain, resolver) = deferred(&engine);
//! let doubled = chain.then(|x| x * 2);
//!
//! resolver.resolve(21);
//! assert_eq!(doubled.peek(), Some(Ok(42)));
//! ```

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tracing::error;

use crate::chain::Chain;
use crate::engine::Engine;
use crate::scheduler::{Resolver, Scheduler, Task};
use crate::settle::ChainValue;

/// Scheduler that runs every task inline, on the caller's stack.
pub fn immediate<V: ChainValue>() -> impl Fn(Task<V>) + Send + Sync + 'static {
    |task: Task<V>| task.run()
}

/// Inline scheduler that turns a panicking task into a rejection.
///
/// The panic message becomes the rejection value, routed through
/// [`Task::recovery`].
pub fn recovering<V>() -> impl Fn(Task<V>) + Send + Sync + 'static
where
    V: ChainValue + From<String>,
{
    |task: Task<V>| {
        let recovery = task.recovery();
        if let Err(panic_info) = catch_unwind(AssertUnwindSafe(|| task.run())) {
            let panic_msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                (*s).to_string()
            } else if let Some(s) = panic_info.downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown panic".to_string()
            };

            error!(panic = %panic_msg, "stage handler panicked");
            recovery.reject(V::from(panic_msg));
        }
    }
}

/// Start a promise and hand back its resolver.
pub fn deferred<V: ChainValue>(engine: &Engine<V>) -> (Chain<V>, Resolver<V>) {
    let mut slot = None;
    let chain = engine.promise(|resolver| slot = Some(resolver));
    let resolver = slot.expect("promise executor runs synchronously");
    (chain, resolver)
}

/// Scheduler that queues tasks until the test runs them.
///
/// Clones share the same queue, so one clone can be handed to the engine
/// while the test keeps another.
pub struct ManualScheduler<V = Value> {
    queue: Arc<Mutex<VecDeque<Task<V>>>>,
}

impl<V> Clone for ManualScheduler<V> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
        }
    }
}

impl<V: ChainValue> Default for ManualScheduler<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: ChainValue> ManualScheduler<V> {
    pub fn new() -> Self {
        Self {
            queue: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Number of queued tasks.
    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    /// Run the oldest queued task. Returns false if the queue was empty.
    pub fn run_next(&self) -> bool {
        self.run_next_with(V::default())
    }

    /// Run the oldest queued task with a scheduler argument.
    pub fn run_next_with(&self, arg: V) -> bool {
        // Pop first: the task may schedule more work onto this queue.
        let task = self.lock().pop_front();
        match task {
            Some(task) => {
                task.run_with(arg);
                true
            }
            None => false,
        }
    }

    /// Run tasks until the queue is empty, including tasks queued while
    /// running. Returns how many ran.
    pub fn run_all(&self) -> usize {
        let mut ran = 0;
        while self.run_next() {
            ran += 1;
        }
        ran
    }

    /// Drop every queued task without running it.
    pub fn clear(&self) -> usize {
        let mut queue = self.lock();
        let dropped = queue.len();
        queue.clear();
        dropped
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Task<V>>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<V: ChainValue> Scheduler<V> for ManualScheduler<V> {
    fn schedule(&self, task: Task<V>) {
        self.lock().push_back(task);
    }
}

impl<V> std::fmt::Debug for ManualScheduler<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualScheduler").finish_non_exhaustive()
    }
}

/// Shared, ordered record of what happened, for ordering assertions.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: impl Into<String>) {
        self.lock().push(entry.into());
    }

    /// Snapshot of everything recorded so far.
    pub fn entries(&self) -> Vec<String> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<String>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}
