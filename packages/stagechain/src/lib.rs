//! # Stagechain
//!
//! A promise-style chaining engine where every stage runs on a scheduler the
//! caller supplies.
//!
//! ## Core Concepts
//!
//! Stagechain separates **what** runs from **when** it runs:
//! - [`Chain`] = what happens next (a handler attached under a stage name)
//! - [`Scheduler`] = when it happens (inline, next tick, next frame, a worker)
//!
//! An [`Engine`] is built from named stages. `then`, `catch` and `finally`
//! are always present; any other name (`render`, `decrypt`, `idle`) is a
//! stage that behaves like `then` but runs on its own scheduler.
//!
//! ## Architecture
//!
//! ```text
//! engine.resolve(v)                       root link ── then scheduler
//!     │
//!     ▼ .then(f)
//! child link ◄── queued on parent's tail until the parent settles
//!     │
//!     ▼ .stage("render", g)
//! child link ◄── g runs as a Task on the render scheduler
//!     │
//!     ▼ .catch(h)
//! child link ◄── h only sees rejections
//!
//! Parent settles
//!     │
//!     └─► one flush Task on the parent's scheduler
//!             │
//!             └─► for each child, in attachment order:
//!                     child Task ─► child's own stage scheduler
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Settle once** - A link's first settlement is final; later ones are ignored
//! 2. **Never mutate the parent** - Every stage call returns a new link
//! 3. **Attachment order** - Siblings start in the order they were attached
//! 4. **Scheduler owns timing** - The engine never runs a handler on its own
//! 5. **Rejection is in-band** - `Err` settlements flow until a `catch` stage
//!
//! ## Example
//!
//! ```ignore
//! use stagechain::{mark_rejected, Engine, Task};
//! use serde_json::json;
//!
//! let engine = Engine::builder()
//!     .with_standard_stages(|task: Task| task.run())
//!     .with_stage("render", move |task: Task| frame_queue.push(task))
//!     .build()?;
//!
//! engine
//!     .resolve(json!({ "user": 7 }))
//!     .then(|req| fetch_profile(req))
//!     .stage("render", |profile| draw(profile))
//!     .catch(|err| {
//!         tracing::warn!(%err, "profile failed");
//!         json!(null)
//!     })
//!     .finally(|| spinner.hide());
//! ```
//!
//! ## What This Is Not
//!
//! Stagechain does **not** own an event loop, a thread pool, or a timer.
//! Drop a [`Task`] and its link stays pending forever; that is the
//! scheduler's call to make.

mod chain;
mod engine;
mod error;
mod link;
mod scheduler;
mod settle;
mod stage;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;


// Re-export the chain surface
pub use chain::Chain;
pub use link::ChainId;

// Re-export engine types (primary entry point)
pub use engine::{Engine, EngineBuilder};

// Re-export error types
pub use error::ChainError;

// Re-export scheduling contract
pub use scheduler::{Resolver, Scheduler, Task};

// Re-export settlement types
pub use settle::{mark_rejected, ChainValue, Outcome, Settled, Thenable};

pub use stage::{StageKind, CATCH, FINALLY, THEN};
