//! Stage table: the set of chainable method names an engine was built with.
//!
//! Built once by [`EngineBuilder::build`](crate::EngineBuilder::build) and
//! shared read-only by every chain of that engine. Each entry pairs a stage
//! name with its scheduler and with the [`StageKind`] that decides how a
//! parent's settlement is fed to the stage's handler.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::ChainError;
use crate::scheduler::Scheduler;

pub const THEN: &str = "then";
pub const CATCH: &str = "catch";
pub const FINALLY: &str = "finally";

/// How a stage treats its parent's settlement.
///
/// Decided purely by name: `catch` and `finally` are special, every other
/// name (including `then`) continues on success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    /// Run the handler on fulfillment; pass rejections through untouched.
    Continue,
    /// Run the handler on rejection; pass fulfillment through untouched.
    Catch,
    /// Always run the handler for its side effect; pass the parent's
    /// settlement through unchanged.
    Finally,
}

impl StageKind {
    pub fn of(name: &str) -> Self {
        match name {
            CATCH => StageKind::Catch,
            FINALLY => StageKind::Finally,
            _ => StageKind::Continue,
        }
    }
}

pub(crate) struct Stage<V> {
    pub(crate) name: String,
    pub(crate) kind: StageKind,
    pub(crate) scheduler: Arc<dyn Scheduler<V>>,
}

pub(crate) struct StageTable<V> {
    stages: Vec<Stage<V>>,
    index: HashMap<String, usize>,
    then: usize,
    catch: usize,
    finally: usize,
}

impl<V> StageTable<V> {
    /// Build the table, keeping registration order.
    pub(crate) fn new(entries: Vec<(String, Arc<dyn Scheduler<V>>)>) -> Result<Self, ChainError> {
        let mut stages = Vec::with_capacity(entries.len());
        let mut index = HashMap::with_capacity(entries.len());

        for (name, scheduler) in entries {
            if index.contains_key(&name) {
                return Err(ChainError::StageAlreadyRegistered { name });
            }
            index.insert(name.clone(), stages.len());
            stages.push(Stage {
                kind: StageKind::of(&name),
                name,
                scheduler,
            });
        }

        let require = |name: &'static str| {
            index
                .get(name)
                .copied()
                .ok_or(ChainError::MissingStage { name })
        };
        let then = require(THEN)?;
        let catch = require(CATCH)?;
        let finally = require(FINALLY)?;

        Ok(Self {
            stages,
            index,
            then,
            catch,
            finally,
        })
    }

    pub(crate) fn get(&self, name: &str) -> Result<&Stage<V>, ChainError> {
        self.index
            .get(name)
            .map(|&i| &self.stages[i])
            .ok_or_else(|| ChainError::UnknownStage {
                name: name.to_string(),
            })
    }

    pub(crate) fn then(&self) -> &Stage<V> {
        &self.stages[self.then]
    }

    pub(crate) fn catch(&self) -> &Stage<V> {
        &self.stages[self.catch]
    }

    pub(crate) fn finally(&self) -> &Stage<V> {
        &self.stages[self.finally]
    }

    pub(crate) fn names(&self) -> impl Iterator<Item = &str> {
        self.stages.iter().map(|stage| stage.name.as_str())
    }
}
