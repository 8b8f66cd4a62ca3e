//! Settlement values and what handlers may return.
//!
//! A link settles exactly once to a [`Settled`] value. Rejection is not a
//! separate channel: it is the `Err` side of the same result, so a rejected
//! value flows through the chain like any other until a `catch` stage turns
//! it back into `Ok`.

use crate::chain::Chain;
use crate::scheduler::Resolver;

/// Values a chain can carry.
///
/// `Default` supplies the scheduler argument when a task is run without one.
pub trait ChainValue: Clone + Default + Send + 'static {}

impl<T: Clone + Default + Send + 'static> ChainValue for T {}

/// The final state of a link: `Ok` when fulfilled, `Err` when rejected.
pub type Settled<V> = Result<V, V>;

/// Tag `error` as a rejection.
///
/// Returning the result from a handler settles the link as rejected. Tagging
/// an already rejected value again changes nothing.
pub fn mark_rejected<V>(error: V) -> Settled<V> {
    Err(error)
}

/// Something that settles later and can report into a [`Resolver`].
///
/// When a handler returns a thenable, the link it belongs to stays pending
/// until the thenable reports back.
pub trait Thenable<V>: Send {
    /// Arrange for `resolver` to be settled once this value settles.
    fn subscribe(self: Box<Self>, resolver: Resolver<V>);
}

/// What a stage handler hands back to the engine.
pub enum Outcome<V> {
    /// Settle the link now.
    Ready(Settled<V>),
    /// Keep the link pending until the thenable settles.
    Deferred(Box<dyn Thenable<V>>),
}

impl<V> Outcome<V> {
    /// Defer to any [`Thenable`].
    pub fn deferred<T: Thenable<V> + 'static>(thenable: T) -> Self {
        Outcome::Deferred(Box::new(thenable))
    }

    /// Returns true if the outcome still has to wait for a thenable.
    pub fn is_deferred(&self) -> bool {
        matches!(self, Outcome::Deferred(_))
    }
}

impl<V> From<V> for Outcome<V> {
    fn from(value: V) -> Self {
        Outcome::Ready(Ok(value))
    }
}

impl<V> From<Settled<V>> for Outcome<V> {
    fn from(settled: Settled<V>) -> Self {
        Outcome::Ready(settled)
    }
}

impl<V: ChainValue> From<Chain<V>> for Outcome<V> {
    fn from(chain: Chain<V>) -> Self {
        Outcome::Deferred(Box::new(chain))
    }
}

impl<V> std::fmt::Debug for Outcome<V>
where
    V: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Ready(settled) => f.debug_tuple("Ready").field(settled).finish(),
            Outcome::Deferred(_) => f.debug_tuple("Deferred").finish_non_exhaustive(),
        }
    }
}

/// Borrow the value inside a settlement, ignoring whether it was rejected.
pub(crate) fn inner<V>(settled: &Settled<V>) -> &V {
    match settled {
        Ok(value) | Err(value) => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_rejected_is_err() {
        let tagged = mark_rejected(7);
        assert_eq!(tagged, Err(7));
    }

    #[test]
    fn test_mark_rejected_twice_is_same() {
        let once: Settled<i32> = mark_rejected(7);
        let twice = mark_rejected(once.clone().unwrap_err());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_plain_value_becomes_fulfilled() {
        let outcome: Outcome<i32> = 5.into();
        assert!(matches!(outcome, Outcome::Ready(Ok(5))));
        assert!(!outcome.is_deferred());
    }

    #[test]
    fn test_tagged_value_becomes_rejected() {
        let outcome: Outcome<&'static str> = mark_rejected("boom").into();
        assert!(matches!(outcome, Outcome::Ready(Err("boom"))));
    }

    #[test]
    fn test_inner_ignores_rejection() {
        assert_eq!(*inner(&Ok::<_, i32>(1)), 1);
        assert_eq!(*inner(&Err::<i32, _>(2)), 2);
    }
}
