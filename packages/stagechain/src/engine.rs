//! Stagechain Engine - the entry point that turns a set of schedulers into
//! chainable stages.
//!
//! ```text
//! EngineBuilder
//!     .with_stage("then",    next_tick)
//!     .with_stage("catch",   next_tick)
//!     .with_stage("finally", next_tick)
//!     .with_stage("render",  next_frame)
//!     .build()
//!         │
//!         ▼
//!     Engine ── then / catch / stage(name) ──► Chain ── stage(...) ──► Chain ...
//!         │
//!         └── promise / resolve / reject / race / all ──► Chain
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use stagechain::{Engine, Task};
//!
//! let engine = Engine::builder()
//!     .with_standard_stages(|task: Task| task.run())
//!     .with_stage("render", move |task: Task| frames.push(task))
//!     .build()?;
//!
//! engine
//!     .resolve(json!({ "count": 1 }))
//!     .then(update_state)
//!     .stage_with("render", |state, timestamp| draw(state, timestamp))
//!     .catch(report);
//! ```
//!
//! # Combinators
//!
//! `resolve`, `reject`, `race` and `all` are built from the same primitives
//! as user chains: `resolve` is a `then` stage returning the value, `reject`
//! a `catch` stage returning a rejection, and `race`/`all` are promises fed
//! by `then`/`catch` stages attached to every input.

use std::fmt;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::{debug, trace};

use crate::chain::Chain;
use crate::error::ChainError;
use crate::link::{ChainId, Handler, Link};
use crate::scheduler::{Resolver, Scheduler, Task};
use crate::settle::{mark_rejected, ChainValue, Outcome};
use crate::stage::{Stage, StageTable, CATCH, FINALLY, THEN};

/// Builder for an [`Engine`].
///
/// Stage order is registration order. `then`, `catch` and `finally` must
/// all be registered; any other name becomes an extra stage that behaves
/// like `then`.
///
/// # Example
///
/// ```ignore
/// let engine = EngineBuilder::new()
///     .with_stage("decrypt", worker)
///     .with_standard_stages(|task: Task| task.run())
///     .with_stage("encrypt", worker)
///     .build()?;
/// ```
pub struct EngineBuilder<V = Value> {
    stages: Vec<(String, Arc<dyn Scheduler<V>>)>,
}

impl<V: ChainValue> Default for EngineBuilder<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: ChainValue> EngineBuilder<V> {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    /// Register a stage whose scheduler is a closure.
    ///
    /// # Panics
    ///
    /// Panics if a stage with this name is already registered.
    pub fn with_stage<F>(self, name: impl Into<String>, scheduler: F) -> Self
    where
        F: Fn(Task<V>) + Send + Sync + 'static,
    {
        self.with_scheduler(name, scheduler)
    }

    /// Register a stage backed by any [`Scheduler`].
    ///
    /// # Panics
    ///
    /// Panics if a stage with this name is already registered.
    /// Use [`try_with_scheduler`](Self::try_with_scheduler) for a
    /// non-panicking version.
    pub fn with_scheduler<S: Scheduler<V>>(self, name: impl Into<String>, scheduler: S) -> Self {
        self.try_with_scheduler(name, scheduler)
            .unwrap_or_else(|e| panic!("{}", e))
    }

    /// Register a stage, returning an error if the name is taken.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let builder = EngineBuilder::new()
    ///     .try_with_scheduler("then", queue.clone())?
    ///     .try_with_scheduler("then", queue.clone()); // Err(StageAlreadyRegistered)
    /// ```
    pub fn try_with_scheduler<S: Scheduler<V>>(
        self,
        name: impl Into<String>,
        scheduler: S,
    ) -> Result<Self, ChainError> {
        self.try_with_shared(name.into(), Arc::new(scheduler))
    }

    /// Register `then`, `catch` and `finally` with one shared scheduler.
    ///
    /// # Panics
    ///
    /// Panics if any of the three is already registered.
    pub fn with_standard_stages<F>(mut self, scheduler: F) -> Self
    where
        F: Fn(Task<V>) + Send + Sync + 'static,
    {
        let shared: Arc<dyn Scheduler<V>> = Arc::new(scheduler);
        for name in [THEN, CATCH, FINALLY] {
            self = self
                .try_with_shared(name.to_string(), shared.clone())
                .unwrap_or_else(|e| panic!("{}", e));
        }
        self
    }

    /// Number of stages registered so far.
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Build the engine.
    ///
    /// Fails with [`ChainError::MissingStage`] if `then`, `catch` or
    /// `finally` was never registered.
    pub fn build(self) -> Result<Engine<V>, ChainError> {
        let stages = StageTable::new(self.stages)?;
        debug!(stages = ?stages.names().collect::<Vec<_>>(), "engine built");
        Ok(Engine {
            stages: Arc::new(stages),
        })
    }

    fn try_with_shared(
        mut self,
        name: String,
        scheduler: Arc<dyn Scheduler<V>>,
    ) -> Result<Self, ChainError> {
        if self.stages.iter().any(|(existing, _)| *existing == name) {
            return Err(ChainError::StageAlreadyRegistered { name });
        }
        self.stages.push((name, scheduler));
        Ok(self)
    }
}

impl<V> fmt::Debug for EngineBuilder<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineBuilder")
            .field(
                "stages",
                &self.stages.iter().map(|(name, _)| name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Entry point for starting chains.
///
/// Cheap to clone; clones share the same read-only stage table.
pub struct Engine<V = Value> {
    stages: Arc<StageTable<V>>,
}

impl<V> Clone for Engine<V> {
    fn clone(&self) -> Self {
        Self {
            stages: self.stages.clone(),
        }
    }
}

impl<V: ChainValue> Engine<V> {
    /// Start configuring an engine.
    pub fn builder() -> EngineBuilder<V> {
        EngineBuilder::new()
    }

    /// Stage names in registration order.
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.names().collect()
    }

    /// Start a chain whose first handler runs on the stage called `name`.
    ///
    /// The handler receives the argument its scheduler ran it with.
    ///
    /// # Panics
    ///
    /// Panics if the engine has no stage called `name`.
    pub fn stage<F, R>(&self, name: &str, handler: F) -> Chain<V>
    where
        F: FnOnce(V) -> R + Send + 'static,
        R: Into<Outcome<V>>,
    {
        self.try_stage(name, handler)
            .unwrap_or_else(|e| panic!("{}", e))
    }

    /// Non-panicking version of [`stage`](Self::stage).
    pub fn try_stage<F, R>(&self, name: &str, handler: F) -> Result<Chain<V>, ChainError>
    where
        F: FnOnce(V) -> R + Send + 'static,
        R: Into<Outcome<V>>,
    {
        let stage = self.stages.get(name)?;
        Ok(self.start(stage, handler))
    }

    /// Start a chain on the `then` stage.
    pub fn then<F, R>(&self, handler: F) -> Chain<V>
    where
        F: FnOnce(V) -> R + Send + 'static,
        R: Into<Outcome<V>>,
    {
        self.start(self.stages.then(), handler)
    }

    /// Start a chain on the `catch` stage.
    pub fn catch<F, R>(&self, handler: F) -> Chain<V>
    where
        F: FnOnce(V) -> R + Send + 'static,
        R: Into<Outcome<V>>,
    {
        self.start(self.stages.catch(), handler)
    }

    /// Start a chain on the `finally` stage.
    ///
    /// There is no parent settlement to pass through at the top of a chain,
    /// so like every other top-level stage the handler's return becomes the
    /// settlement.
    pub fn finally<F, R>(&self, handler: F) -> Chain<V>
    where
        F: FnOnce(V) -> R + Send + 'static,
        R: Into<Outcome<V>>,
    {
        self.start(self.stages.finally(), handler)
    }

    /// Start a chain that the caller settles.
    ///
    /// `executor` runs synchronously and receives the chain's [`Resolver`].
    /// Resolving with another chain adopts its eventual settlement. The root
    /// link has no stage of its own: continuations queued on it are flushed
    /// on whatever stack settles it.
    pub fn promise<F>(&self, executor: F) -> Chain<V>
    where
        F: FnOnce(Resolver<V>),
    {
        let link = Link::new(ChainId::new(), None);
        trace!(chain = %link.id(), "promise created");
        executor(Resolver::new(link.clone()));
        Chain::new(link, self.stages.clone())
    }

    /// A chain that fulfills with `value` on the `then` stage.
    pub fn resolve(&self, value: V) -> Chain<V> {
        self.then(move |_| value)
    }

    /// A chain on the `then` stage that adopts whatever `outcome` settles to:
    /// a value, a tagged rejection, or another chain (even one from a
    /// different engine).
    pub fn adopt<T>(&self, outcome: T) -> Chain<V>
    where
        T: Into<Outcome<V>> + Send + 'static,
    {
        self.then(move |_| outcome)
    }

    /// A chain that rejects with `error` on the `catch` stage.
    pub fn reject(&self, error: V) -> Chain<V> {
        self.catch(move |_| mark_rejected(error))
    }

    /// Settle with whichever input settles first, fulfilled or rejected.
    ///
    /// Later settlements are ignored. An empty list never settles. Inputs
    /// are subscribed in list order, so when several have already settled
    /// under an inline scheduler the first listed wins (not the last).
    pub fn race<I>(&self, chains: I) -> Chain<V>
    where
        I: IntoIterator<Item = Chain<V>>,
    {
        self.promise(move |resolver| {
            for chain in chains {
                chain.forward(resolver.clone());
            }
        })
    }

    /// Fulfill with every input's value, in input order, once all inputs
    /// have fulfilled. The first rejection rejects the result; later
    /// settlements are ignored.
    ///
    /// An empty list fulfills right away with an empty sequence.
    pub fn all<I>(&self, chains: I) -> Chain<V>
    where
        I: IntoIterator<Item = Chain<V>>,
        V: From<Vec<V>>,
    {
        let chains: Vec<Chain<V>> = chains.into_iter().collect();
        self.promise(move |resolver| {
            if chains.is_empty() {
                resolver.resolve(V::from(Vec::new()));
                return;
            }

            let gather = Arc::new(Mutex::new(Gather::new(chains.len())));
            for (index, chain) in chains.into_iter().enumerate() {
                let gather = gather.clone();
                let on_value = resolver.clone();
                let on_error = resolver.clone();
                chain.then_or(
                    move |value: V| {
                        let complete = gather
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .fill(index, value.clone());
                        if let Some(values) = complete {
                            on_value.resolve(V::from(values));
                        }
                        value
                    },
                    move |error: V| {
                        on_error.reject(error.clone());
                        mark_rejected(error)
                    },
                );
            }
        })
    }

    fn start<F, R>(&self, stage: &Stage<V>, handler: F) -> Chain<V>
    where
        F: FnOnce(V) -> R + Send + 'static,
        R: Into<Outcome<V>>,
    {
        let link = Link::new(ChainId::new(), Some(stage.scheduler.clone()));
        trace!(chain = %link.id(), stage = %stage.name, "chain started");
        let handler: Handler<V> = Box::new(move |arg: V| -> Outcome<V> { handler(arg).into() });
        link.start(handler);
        Chain::new(link, self.stages.clone())
    }
}

impl<V> fmt::Debug for Engine<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("stages", &self.stages.names().collect::<Vec<_>>())
            .finish()
    }
}

/// Values collected by [`Engine::all`], slotted by input position.
struct Gather<V> {
    values: Vec<Option<V>>,
    remaining: usize,
}

impl<V> Gather<V> {
    fn new(len: usize) -> Self {
        Self {
            values: std::iter::repeat_with(|| None).take(len).collect(),
            remaining: len,
        }
    }

    /// Record one value; returns the full ordered list once every slot is
    /// filled.
    fn fill(&mut self, index: usize, value: V) -> Option<Vec<V>> {
        if self.values[index].replace(value).is_none() {
            self.remaining -= 1;
        }
        if self.remaining == 0 {
            Some(self.values.iter_mut().filter_map(Option::take).collect())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::testing::{deferred, immediate, CallLog, ManualScheduler};

    fn inline_engine() -> Engine<i64> {
        Engine::builder()
            .with_standard_stages(immediate())
            .build()
            .unwrap()
    }

    fn json_engine() -> Engine<Value> {
        Engine::builder()
            .with_standard_stages(immediate())
            .build()
            .unwrap()
    }

    // ==========================================================================
    // Builder
    // ==========================================================================

    #[test]
    fn test_build_requires_standard_stages() {
        let result = Engine::<i64>::builder()
            .with_stage("then", immediate())
            .with_stage("catch", immediate())
            .build();
        assert_eq!(result.err(), Some(ChainError::MissingStage { name: "finally" }));
    }

    #[test]
    fn test_try_with_scheduler_rejects_duplicates() {
        let result = Engine::<i64>::builder()
            .try_with_scheduler("render", immediate())
            .and_then(|b| b.try_with_scheduler("render", immediate()));
        assert!(matches!(
            result,
            Err(ChainError::StageAlreadyRegistered { name }) if name == "render"
        ));
    }

    #[test]
    #[should_panic(expected = "stage already registered: then")]
    fn test_with_stage_panics_on_duplicate() {
        let _ = Engine::<i64>::builder()
            .with_standard_stages(immediate())
            .with_stage("then", immediate());
    }

    #[test]
    fn test_stage_names_keep_order() {
        let engine = Engine::<i64>::builder()
            .with_stage("next", immediate())
            .with_stage("decrypt", immediate())
            .with_standard_stages(immediate())
            .with_stage("render", immediate())
            .build()
            .unwrap();

        assert_eq!(
            engine.stage_names(),
            vec!["next", "decrypt", "then", "catch", "finally", "render"]
        );
        assert!(format!("{:?}", engine).contains("decrypt"));
    }

    // ==========================================================================
    // Top-level stages
    // ==========================================================================

    #[test]
    fn test_top_level_stage_uses_its_scheduler() {
        let frames = ManualScheduler::<i64>::new();
        let engine = Engine::builder()
            .with_standard_stages(immediate())
            .with_scheduler("render", frames.clone())
            .build()
            .unwrap();

        let chain = engine.stage("render", |timestamp| timestamp + 1);
        assert!(!chain.is_settled());

        frames.run_next_with(41);
        assert_eq!(chain.peek(), Some(Ok(42)));
    }

    #[test]
    fn test_top_level_finally_settles_to_handler_return() {
        let engine = inline_engine();
        let log = CallLog::new();
        let sink = log.clone();

        let chain = engine.finally(move |arg| {
            sink.push("cleanup");
            arg + 5
        });

        assert_eq!(log.entries(), vec!["cleanup"]);
        assert_eq!(chain.peek(), Some(Ok(5)));
        assert_eq!(
            engine.finally(|_| mark_rejected(2)).peek(),
            engine.stage("finally", |_| mark_rejected(2)).peek()
        );
    }

    #[test]
    fn test_top_level_unknown_stage() {
        let engine = inline_engine();
        assert!(matches!(
            engine.try_stage("render", |x| x),
            Err(ChainError::UnknownStage { .. })
        ));
    }

    // ==========================================================================
    // Promise
    // ==========================================================================

    #[test]
    fn test_promise_chain_settles_synchronously() {
        let engine = inline_engine();

        let chain = engine
            .promise(|r| r.resolve(1))
            .then(|x| x + 1)
            .then(|x| x + 1);

        assert_eq!(chain.peek(), Some(Ok(3)));
    }

    #[test]
    fn test_promise_settles_at_most_once() {
        let engine = inline_engine();
        let chain = engine.promise(|r| {
            r.resolve(1);
            r.reject(2);
            r.resolve(3);
        });
        assert_eq!(chain.peek(), Some(Ok(1)));
    }

    #[test]
    fn test_promise_reject_reaches_catch() {
        let engine = inline_engine();
        let chain = engine
            .promise(|r| r.reject(4))
            .then(|x| x + 100)
            .catch(|e| e * 2);
        assert_eq!(chain.peek(), Some(Ok(8)));
    }

    #[test]
    fn test_late_resolution_flushes_pending_children() {
        let engine = inline_engine();
        let (root, resolver) = deferred(&engine);
        let log = CallLog::new();

        let a = log.clone();
        let first = root.then(move |x| {
            a.push(format!("a:{}", x));
            x + 1
        });
        let b = log.clone();
        let second = root.then(move |x| {
            b.push(format!("b:{}", x));
            x + 2
        });
        assert!(log.is_empty());

        resolver.resolve(10);
        assert_eq!(log.entries(), vec!["a:10", "b:10"]);
        assert_eq!(first.peek(), Some(Ok(11)));
        assert_eq!(second.peek(), Some(Ok(12)));
    }

    #[test]
    fn test_promise_adopts_chain() {
        let engine = inline_engine();
        let (inner, inner_resolver) = deferred(&engine);

        let outer = engine.promise(move |r| r.resolve(inner));
        assert!(!outer.is_settled());

        inner_resolver.reject(5);
        assert_eq!(outer.peek(), Some(Err(5)));
    }

    // ==========================================================================
    // resolve / reject / adopt
    // ==========================================================================

    #[test]
    fn test_resolve_then_doubles() {
        let engine = inline_engine();
        let chain = engine.resolve(5).then(|x| x * 2);
        assert_eq!(chain.peek(), Some(Ok(10)));
    }

    #[test]
    fn test_resolve_waits_for_then_scheduler() {
        let queue = ManualScheduler::<i64>::new();
        let engine = Engine::builder()
            .with_scheduler("then", queue.clone())
            .with_stage("catch", immediate())
            .with_stage("finally", immediate())
            .build()
            .unwrap();

        let chain = engine.resolve(5).then(|x| x * 2);
        assert!(!chain.is_settled());

        queue.run_all();
        assert_eq!(chain.peek(), Some(Ok(10)));
    }

    #[test]
    fn test_reject_skips_then_and_reaches_catch() {
        let engine = inline_engine();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let chain = engine
            .reject(3)
            .then(move |x| {
                counter.fetch_add(1, Ordering::SeqCst);
                x
            })
            .catch(|e| e + 1);

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(chain.peek(), Some(Ok(4)));
    }

    #[test]
    fn test_adopt_chain_from_another_engine() {
        let lazy_queue = ManualScheduler::<i64>::new();
        let lazy = Engine::builder()
            .with_scheduler("then", lazy_queue.clone())
            .with_stage("catch", immediate())
            .with_stage("finally", immediate())
            .build()
            .unwrap();
        let eager = inline_engine();

        let fetched = lazy.then(|_| 7);
        let chain = eager.adopt(fetched).then(|x| x * 3);
        assert!(!chain.is_settled());

        lazy_queue.run_all();
        assert_eq!(chain.peek(), Some(Ok(21)));
    }

    // ==========================================================================
    // race
    // ==========================================================================

    #[test]
    fn test_race_first_fulfillment_wins() {
        let engine = inline_engine();
        let (p1, r1) = deferred(&engine);
        let (p2, r2) = deferred(&engine);

        let race = engine.race([p1, p2]);
        assert!(!race.is_settled());

        r1.resolve(1);
        r2.reject(2);
        assert_eq!(race.peek(), Some(Ok(1)));
    }

    #[test]
    fn test_race_first_rejection_wins() {
        let engine = inline_engine();
        let (p1, r1) = deferred(&engine);
        let (p2, r2) = deferred(&engine);

        let race = engine.race(vec![p1, p2]);
        r2.reject(9);
        r1.resolve(1);
        assert_eq!(race.peek(), Some(Err(9)));
    }

    #[test]
    fn test_race_of_settled_inputs_takes_first_listed() {
        let engine = inline_engine();
        let race = engine.race([engine.resolve(1), engine.resolve(2)]);
        assert_eq!(race.peek(), Some(Ok(1)));
    }

    #[test]
    fn test_race_of_nothing_stays_pending() {
        let engine = inline_engine();
        let race = engine.race(Vec::new());
        assert!(!race.is_settled());
    }

    // ==========================================================================
    // all
    // ==========================================================================

    #[test]
    fn test_all_keeps_input_order() {
        let engine = json_engine();
        let (p1, r1) = deferred(&engine);
        let (p2, r2) = deferred(&engine);

        let all = engine.all([p1, p2]);
        r2.resolve(json!("b"));
        assert!(!all.is_settled());
        r1.resolve(json!("a"));

        assert_eq!(all.peek(), Some(Ok(json!(["a", "b"]))));
    }

    #[test]
    fn test_all_first_rejection_wins() {
        let engine = json_engine();
        let (p1, r1) = deferred(&engine);
        let (p2, r2) = deferred(&engine);
        let (p3, r3) = deferred(&engine);

        let all = engine.all(vec![p1, p2, p3]);
        r2.reject(json!("first"));
        r3.reject(json!("second"));
        r1.resolve(json!(1));

        assert_eq!(all.peek(), Some(Err(json!("first"))));
    }

    #[test]
    fn test_all_of_nothing_is_empty() {
        let engine = json_engine();
        let all = engine.all(Vec::new());
        assert_eq!(all.peek(), Some(Ok(json!([]))));
    }

    #[test]
    fn test_all_then_sees_sequence() {
        let engine = json_engine();
        let chain = engine
            .all([engine.resolve(json!(1)), engine.resolve(json!(2))])
            .then(|values: Value| json!(values.as_array().map(Vec::len)));
        assert_eq!(chain.peek(), Some(Ok(json!(2))));
    }

    #[test]
    fn test_gather_counts_each_slot_once() {
        let mut gather = Gather::new(2);
        assert_eq!(gather.fill(1, "b"), None);
        assert_eq!(gather.fill(1, "b"), None);
        assert_eq!(gather.fill(0, "a"), Some(vec!["a", "b"]));
    }

    // ==========================================================================
    // Async interop
    // ==========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_spawned_stages_settle_asynchronously() {
        let engine: Engine<i64> = Engine::builder()
            .with_standard_stages(|task: Task<i64>| {
                tokio::spawn(async move { task.run() });
            })
            .build()
            .unwrap();

        let chain = engine.resolve(5).then(|x| x * 2).catch(|e| e);
        assert_eq!(chain.settled().await, Ok(Ok(10)));
    }

    #[tokio::test]
    async fn test_settled_reports_rejection() {
        let engine = inline_engine();
        let (chain, resolver) = deferred(&engine);
        let waiting = chain.then(|x| x).settled();

        resolver.reject(3);
        assert_eq!(waiting.await, Ok(Err(3)));
    }

    #[tokio::test]
    async fn test_settled_timeout_leaves_chain_running() {
        let engine = inline_engine();
        let (chain, resolver) = deferred(&engine);

        let result = chain.settled_timeout(Duration::from_millis(20)).await;
        assert_eq!(
            result,
            Err(ChainError::Timeout {
                duration: Duration::from_millis(20)
            })
        );

        resolver.resolve(1);
        assert_eq!(chain.peek(), Some(Ok(1)));
    }

    #[tokio::test]
    async fn test_dropped_chain_is_abandoned() {
        let engine = inline_engine();
        let (chain, resolver) = deferred(&engine);
        let waiting = chain.settled();

        drop(chain);
        drop(resolver);
        assert_eq!(waiting.await, Err(ChainError::Abandoned));
    }
}
