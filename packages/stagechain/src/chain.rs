//! The chainable surface of a link.
//!
//! A [`Chain`] is a cheap handle to one link plus the stage table of the
//! engine that made it. Every stage method creates a *new* child link and
//! returns its handle; the parent is never mutated, it is only read once it
//! has settled.
//!
//! # Dispatch
//!
//! ```text
//! chain.stage("render", f)
//!     │
//!     ├─ look up "render" in the stage table
//!     ├─ create child link (scheduler = render's scheduler)
//!     └─ parent.attach(child, |settled, arg| fill(settled, f, arg))
//!                 │
//!                 ├─ parent already settled: render's scheduler gets the task now
//!                 └─ parent pending: queued on parent's tail, in call order
//! ```
//!
//! How `fill` feeds the parent's settlement to `f` depends only on the stage
//! name (see [`StageKind`]):
//!
//! | Stage     | Parent fulfilled       | Parent rejected            |
//! |-----------|------------------------|----------------------------|
//! | `catch`   | pass through           | `f(error)` may recover     |
//! | `finally` | `f()`, pass through    | `f()`, pass through        |
//! | any other | `f(value)`             | pass through               |

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::trace;

use crate::error::ChainError;
use crate::link::{ChainId, Link};
use crate::scheduler::Resolver;
use crate::settle::{inner, mark_rejected, ChainValue, Outcome, Settled, Thenable};
use crate::stage::{Stage, StageKind, StageTable};

/// Stage handler: receives the parent's value and the scheduler argument.
type StageFn<V> = Box<dyn FnOnce(V, V) -> Outcome<V> + Send>;

/// Handle to one link of a chain.
///
/// Cloning the handle does not fork the chain; both clones refer to the same
/// link. Calling a stage method twice on the same handle creates two sibling
/// links that both run once this link settles, in call order.
pub struct Chain<V = Value> {
    link: Arc<Link<V>>,
    stages: Arc<StageTable<V>>,
}

impl<V> Clone for Chain<V> {
    fn clone(&self) -> Self {
        Self {
            link: self.link.clone(),
            stages: self.stages.clone(),
        }
    }
}

impl<V: ChainValue> Chain<V> {
    pub(crate) fn new(link: Arc<Link<V>>, stages: Arc<StageTable<V>>) -> Self {
        Self { link, stages }
    }

    /// The ID shared by every link of this chain.
    pub fn id(&self) -> ChainId {
        self.link.id()
    }

    /// Returns true once this link has settled.
    pub fn is_settled(&self) -> bool {
        self.link.is_settled()
    }

    /// Snapshot of this link's settlement, `None` while pending.
    pub fn peek(&self) -> Option<Settled<V>> {
        self.link.peek()
    }

    /// Attach a handler under the stage called `name`.
    ///
    /// # Panics
    ///
    /// Panics if the engine has no stage called `name`.
    /// Use [`try_stage`](Self::try_stage) for a non-panicking version.
    pub fn stage<F, R>(&self, name: &str, handler: F) -> Chain<V>
    where
        F: FnOnce(V) -> R + Send + 'static,
        R: Into<Outcome<V>>,
    {
        self.try_stage(name, handler)
            .unwrap_or_else(|e| panic!("{}", e))
    }

    /// Attach a handler under the stage called `name`, returning an error if
    /// the engine has no such stage.
    pub fn try_stage<F, R>(&self, name: &str, handler: F) -> Result<Chain<V>, ChainError>
    where
        F: FnOnce(V) -> R + Send + 'static,
        R: Into<Outcome<V>>,
    {
        let stage = self.stages.get(name)?;
        Ok(self.attach(stage, stage_fn(handler)))
    }

    /// Like [`stage`](Self::stage), but the handler also receives the
    /// argument its scheduler ran the task with (a frame timestamp, say).
    ///
    /// # Panics
    ///
    /// Panics if the engine has no stage called `name`.
    pub fn stage_with<F, R>(&self, name: &str, handler: F) -> Chain<V>
    where
        F: FnOnce(V, V) -> R + Send + 'static,
        R: Into<Outcome<V>>,
    {
        self.try_stage_with(name, handler)
            .unwrap_or_else(|e| panic!("{}", e))
    }

    /// Non-panicking version of [`stage_with`](Self::stage_with).
    pub fn try_stage_with<F, R>(&self, name: &str, handler: F) -> Result<Chain<V>, ChainError>
    where
        F: FnOnce(V, V) -> R + Send + 'static,
        R: Into<Outcome<V>>,
    {
        let stage = self.stages.get(name)?;
        Ok(self.attach(
            stage,
            Box::new(move |value: V, arg: V| -> Outcome<V> { handler(value, arg).into() }),
        ))
    }

    /// Attach `handler` under `name`, then a trailing `catch` stage running
    /// `recover`.
    ///
    /// `recover` sees rejections of this link *and* of `handler` itself.
    ///
    /// # Panics
    ///
    /// Panics if the engine has no stage called `name`.
    pub fn stage_or<F, R, G, S>(&self, name: &str, handler: F, recover: G) -> Chain<V>
    where
        F: FnOnce(V) -> R + Send + 'static,
        R: Into<Outcome<V>>,
        G: FnOnce(V) -> S + Send + 'static,
        S: Into<Outcome<V>>,
    {
        self.stage(name, handler).catch(recover)
    }

    /// Non-panicking version of [`stage_or`](Self::stage_or).
    pub fn try_stage_or<F, R, G, S>(
        &self,
        name: &str,
        handler: F,
        recover: G,
    ) -> Result<Chain<V>, ChainError>
    where
        F: FnOnce(V) -> R + Send + 'static,
        R: Into<Outcome<V>>,
        G: FnOnce(V) -> S + Send + 'static,
        S: Into<Outcome<V>>,
    {
        Ok(self.try_stage(name, handler)?.catch(recover))
    }

    /// Continue with the fulfilled value; rejections pass through.
    pub fn then<F, R>(&self, handler: F) -> Chain<V>
    where
        F: FnOnce(V) -> R + Send + 'static,
        R: Into<Outcome<V>>,
    {
        self.attach(self.stages.then(), stage_fn(handler))
    }

    /// `then(handler)` followed by `catch(recover)`.
    pub fn then_or<F, R, G, S>(&self, handler: F, recover: G) -> Chain<V>
    where
        F: FnOnce(V) -> R + Send + 'static,
        R: Into<Outcome<V>>,
        G: FnOnce(V) -> S + Send + 'static,
        S: Into<Outcome<V>>,
    {
        self.then(handler).catch(recover)
    }

    /// Handle a rejection. The handler's return becomes the new settlement,
    /// so returning a plain value recovers.
    pub fn catch<F, R>(&self, handler: F) -> Chain<V>
    where
        F: FnOnce(V) -> R + Send + 'static,
        R: Into<Outcome<V>>,
    {
        self.attach(self.stages.catch(), stage_fn(handler))
    }

    /// Run `handler` whatever the outcome, keeping this link's settlement.
    pub fn finally<F>(&self, handler: F) -> Chain<V>
    where
        F: FnOnce() + Send + 'static,
    {
        self.attach(
            self.stages.finally(),
            Box::new(move |value: V, _: V| -> Outcome<V> {
                handler();
                value.into()
            }),
        )
    }

    /// Wait for this link to settle.
    ///
    /// The returned future owns what it needs, so the handle may be dropped.
    /// It resolves to [`ChainError::Abandoned`] if the link is dropped
    /// before settling.
    pub fn settled(&self) -> impl Future<Output = Result<Settled<V>, ChainError>> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        self.link.when_settled(move |settled| {
            let _ = tx.send(settled.clone());
        });
        async move { rx.await.map_err(|_| ChainError::Abandoned) }
    }

    /// [`settled`](Self::settled) with a deadline.
    ///
    /// Timing out abandons the wait only; the chain keeps running.
    pub fn settled_timeout(
        &self,
        duration: Duration,
    ) -> impl Future<Output = Result<Settled<V>, ChainError>> + Send + 'static {
        let settled = self.settled();
        async move {
            match tokio::time::timeout(duration, settled).await {
                Ok(result) => result,
                Err(_) => Err(ChainError::Timeout { duration }),
            }
        }
    }

    /// Settle `resolver` with whatever this link settles to.
    pub(crate) fn forward(&self, resolver: Resolver<V>) {
        let on_reject = resolver.clone();
        self.then_or(
            move |value: V| {
                resolver.resolve(value.clone());
                value
            },
            move |error: V| {
                on_reject.reject(error.clone());
                mark_rejected(error)
            },
        );
    }

    fn attach(&self, stage: &Stage<V>, handler: StageFn<V>) -> Chain<V> {
        trace!(chain = %self.link.id(), stage = %stage.name, "stage attached");

        let child = Link::new(self.link.id(), Some(stage.scheduler.clone()));
        let kind = stage.kind;
        self.link.attach(
            child.clone(),
            Box::new(move |parent: Settled<V>, arg: V| -> Outcome<V> {
                fill(kind, parent, handler, arg)
            }),
        );

        Chain::new(child, self.stages.clone())
    }
}

fn stage_fn<V, F, R>(handler: F) -> StageFn<V>
where
    V: ChainValue,
    F: FnOnce(V) -> R + Send + 'static,
    R: Into<Outcome<V>>,
{
    Box::new(move |value: V, _: V| -> Outcome<V> { handler(value).into() })
}

/// Feed the parent's settlement to a stage handler according to its kind.
fn fill<V: ChainValue>(kind: StageKind, parent: Settled<V>, handler: StageFn<V>, arg: V) -> Outcome<V> {
    match (kind, parent) {
        (StageKind::Finally, settled) => {
            let _ = handler(inner(&settled).clone(), arg);
            Outcome::Ready(settled)
        }
        (StageKind::Catch, Err(error)) => handler(error, arg),
        (StageKind::Continue, Ok(value)) => handler(value, arg),
        (_, settled) => Outcome::Ready(settled),
    }
}

impl<V: ChainValue> Thenable<V> for Chain<V> {
    fn subscribe(self: Box<Self>, resolver: Resolver<V>) {
        self.forward(resolver);
    }
}

impl<V> fmt::Debug for Chain<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chain")
            .field("id", &self.link.id())
            .finish_non_exhaustive()
    }
}
