//! Chain links: one pending computation each.
//!
//! A [`Link`] owns three things:
//! - its settlement, written exactly once,
//! - a tail queue of waiters for that settlement,
//! - the scheduler its own tasks go through.
//!
//! # Lifecycle
//!
//! ```text
//! PENDING ──settle(Ok | Err), once──► SETTLED
//!    │                                   │
//!    └─ attach() queues on tail          └─ attach() starts the child now
//! ```
//!
//! On settlement the tail is drained in attachment order inside one flush
//! task, and that task is handed to the link's own scheduler. Links created
//! by [`Engine::promise`](crate::Engine::promise) have no scheduler and flush
//! inline.
//!
//! # Stack depth
//!
//! Inline schedulers make settlement re-entrant: a flush starts a child, the
//! child settles, and its own flush would run on top of the parent's. Flushes
//! are therefore trampolined per thread. A settle that happens while another
//! flush is running on the same thread queues its flush, and the outermost
//! settle drains the queue in FIFO order. Dropping a long pending chain is
//! unrolled the same way (see `Drop for LinkState`).

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use smallvec::SmallVec;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::scheduler::{Resolver, Scheduler, Task};
use crate::settle::{ChainValue, Outcome, Settled};

/// Identifier shared by every link of one chain.
///
/// Assigned when a chain is started and inherited by every link derived
/// from it, so log lines of one chain can be correlated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChainId(Uuid);

impl ChainId {
    /// Create a new random chain ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get a reference to the inner UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ChainId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ChainId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handler body owned by a link: receives the scheduler argument.
pub(crate) type Handler<V> = Box<dyn FnOnce(V) -> Outcome<V> + Send>;

/// Child handler: receives the parent's settlement and the scheduler
/// argument.
pub(crate) type Continuation<V> = Box<dyn FnOnce(Settled<V>, V) -> Outcome<V> + Send>;

/// Something waiting on a pending link.
enum Waiter<V> {
    /// A child link to start with the parent's settlement. The child is held
    /// here, not inside the closure, so drops can be unrolled.
    Child {
        link: Arc<Link<V>>,
        continuation: Continuation<V>,
    },
    /// A plain callback.
    Action(Box<dyn FnOnce(&Settled<V>) + Send>),
}

impl<V: ChainValue> Waiter<V> {
    fn fire(self, settled: &Settled<V>) {
        match self {
            Waiter::Child { link, continuation } => {
                let parent = settled.clone();
                link.start(Box::new(move |arg: V| -> Outcome<V> {
                    continuation(parent, arg)
                }));
            }
            Waiter::Action(action) => action(settled),
        }
    }
}

impl<V> Waiter<V> {
    fn into_child(self) -> Option<Arc<Link<V>>> {
        match self {
            Waiter::Child { link, .. } => Some(link),
            Waiter::Action(_) => None,
        }
    }
}

struct LinkState<V> {
    settled: Option<Settled<V>>,
    tail: SmallVec<[Waiter<V>; 2]>,
}

impl<V> Drop for LinkState<V> {
    fn drop(&mut self) {
        if self.tail.is_empty() {
            return;
        }
        // Children we solely own are emptied here instead of recursively.
        let mut orphans: Vec<Arc<Link<V>>> = std::mem::take(&mut self.tail)
            .into_iter()
            .filter_map(Waiter::into_child)
            .collect();
        while let Some(link) = orphans.pop() {
            if let Ok(link) = Arc::try_unwrap(link) {
                let mut state = link.state.into_inner().unwrap_or_else(|e| e.into_inner());
                orphans.extend(
                    std::mem::take(&mut state.tail)
                        .into_iter()
                        .filter_map(Waiter::into_child),
                );
            }
        }
    }
}

type Flush = Box<dyn FnOnce()>;

thread_local! {
    /// Flushes queued by settles nested inside a running flush. `None` when
    /// no flush is running on this thread.
    static PENDING_FLUSHES: RefCell<Option<VecDeque<Flush>>> = const { RefCell::new(None) };
}

/// Run `flush` now, or queue it behind the flush already running on this
/// thread.
fn trampoline(flush: Flush) {
    let first = PENDING_FLUSHES.with(|pending| {
        let mut pending = pending.borrow_mut();
        match pending.as_mut() {
            Some(queue) => {
                queue.push_back(flush);
                None
            }
            None => {
                *pending = Some(VecDeque::new());
                Some(flush)
            }
        }
    });
    let Some(first) = first else {
        return;
    };

    let _reset = DrainGuard;
    first();
    while let Some(next) =
        PENDING_FLUSHES.with(|pending| pending.borrow_mut().as_mut().and_then(VecDeque::pop_front))
    {
        next();
    }
}

/// Clears the thread's flush queue when the outermost drain ends, including
/// by unwinding.
struct DrainGuard;

impl Drop for DrainGuard {
    fn drop(&mut self) {
        let leftover = PENDING_FLUSHES.with(|pending| pending.borrow_mut().take());
        drop(leftover);
    }
}

pub(crate) struct Link<V> {
    id: ChainId,
    state: Mutex<LinkState<V>>,
    /// `None` flushes inline on the settling call stack.
    scheduler: Option<Arc<dyn Scheduler<V>>>,
}

impl<V> Link<V> {
    pub(crate) fn id(&self) -> ChainId {
        self.id
    }

    fn state(&self) -> MutexGuard<'_, LinkState<V>> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!(chain = %self.id, "link state mutex was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

impl<V: ChainValue> Link<V> {
    pub(crate) fn new(id: ChainId, scheduler: Option<Arc<dyn Scheduler<V>>>) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: Mutex::new(LinkState {
                settled: None,
                tail: SmallVec::new(),
            }),
            scheduler,
        })
    }

    pub(crate) fn is_settled(&self) -> bool {
        self.state().settled.is_some()
    }

    pub(crate) fn peek(&self) -> Option<Settled<V>> {
        self.state().settled.clone()
    }

    pub(crate) fn ignored(&self) {
        trace!(chain = %self.id, "settlement ignored, link already settled");
    }

    /// Fix the settlement and flush the tail. No-op once settled.
    pub(crate) fn settle(self: &Arc<Self>, settled: Settled<V>) {
        let tail = {
            let mut state = self.state();
            if state.settled.is_some() {
                drop(state);
                self.ignored();
                return;
            }
            debug!(chain = %self.id, rejected = settled.is_err(), "link settled");
            state.settled = Some(settled.clone());
            std::mem::take(&mut state.tail)
        };

        if tail.is_empty() {
            return;
        }

        trace!(chain = %self.id, queued = tail.len(), "flushing tail");
        let flush = Task::new(
            move |_| {
                for waiter in tail {
                    waiter.fire(&settled);
                }
            },
            Resolver::new(self.clone()),
        );
        let link = self.clone();
        trampoline(Box::new(move || link.dispatch(flush)));
    }

    /// Settle now, or wait for a thenable to report back.
    pub(crate) fn adopt(self: &Arc<Self>, outcome: Outcome<V>) {
        match outcome {
            Outcome::Ready(settled) => self.settle(settled),
            Outcome::Deferred(thenable) => {
                trace!(chain = %self.id, "waiting on thenable");
                thenable.subscribe(Resolver::new(self.clone()));
            }
        }
    }

    /// Start `child` with `continuation` once this link settles: right away
    /// if it already has, otherwise after every earlier waiter.
    pub(crate) fn attach(&self, child: Arc<Link<V>>, continuation: Continuation<V>) {
        self.push_or_fire(Waiter::Child {
            link: child,
            continuation,
        });
    }

    /// Run `action` with the settlement: right away if already settled,
    /// otherwise after every earlier waiter once the link settles.
    pub(crate) fn when_settled(&self, action: impl FnOnce(&Settled<V>) + Send + 'static) {
        self.push_or_fire(Waiter::Action(Box::new(action)));
    }

    fn push_or_fire(&self, waiter: Waiter<V>) {
        let mut state = self.state();
        match state.settled.clone() {
            Some(settled) => {
                drop(state);
                waiter.fire(&settled);
            }
            None => state.tail.push(waiter),
        }
    }

    /// Wrap `handler` into the task that settles this link.
    pub(crate) fn task(self: &Arc<Self>, handler: Handler<V>) -> Task<V> {
        let link = self.clone();
        Task::new(
            move |arg| {
                if link.is_settled() {
                    trace!(chain = %link.id, "task skipped, link already settled");
                    return;
                }
                let outcome = handler(arg);
                link.adopt(outcome);
            },
            Resolver::new(self.clone()),
        )
    }

    /// Hand `handler` to this link's own scheduler.
    pub(crate) fn start(self: &Arc<Self>, handler: Handler<V>) {
        let task = self.task(handler);
        self.dispatch(task);
    }

    fn dispatch(&self, task: Task<V>) {
        match &self.scheduler {
            Some(scheduler) => scheduler.schedule(task),
            None => task.run(),
        }
    }
}
