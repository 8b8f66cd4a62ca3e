//! Structured error types for stagechain.
//!
//! Failures *inside* a chain never use this type: they travel in-band as an
//! `Err` settlement (see [`Settled`](crate::Settled)) and are consumed by a
//! `catch` stage. `ChainError` covers misuse of the API surface itself:
//! asking for a stage that was never configured, registering a stage twice,
//! or waiting on a chain that can no longer settle.
//!
//! # Example
//!
//! ```ignore
//! use stagechain::ChainError;
//!
//! match chain.try_stage("render", draw) {
//!     Ok(next) => next,
//!     Err(ChainError::UnknownStage { name }) => {
//!         eprintln!("engine has no {} stage", name);
//!         chain
//!     }
//!     Err(e) => return Err(e),
//! }
//! ```

use std::time::Duration;

use thiserror::Error;

/// Structured error type for stagechain operations.
///
/// Each variant is pattern-matchable and carries the context needed to
/// explain what went wrong.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    /// A chain or engine was asked for a stage name it was not built with.
    #[error("no stage named {name} is configured")]
    UnknownStage {
        /// The stage name that was requested.
        name: String,
    },

    /// A stage name was registered twice on the same builder.
    #[error("stage already registered: {name}")]
    StageAlreadyRegistered {
        /// The duplicated stage name.
        name: String,
    },

    /// One of the stages the engine itself relies on was not configured.
    #[error("required stage {name} is missing")]
    MissingStage {
        /// The missing stage name.
        name: &'static str,
    },

    /// The link was dropped before it settled, so the settlement can never
    /// be observed.
    #[error("chain was dropped before it settled")]
    Abandoned,

    /// Waiting for a settlement exceeded the caller's deadline.
    ///
    /// The chain itself keeps running; only the wait was abandoned.
    #[error("settlement wait timed out after {duration:?}")]
    Timeout {
        /// How long we waited.
        duration: Duration,
    },
}
