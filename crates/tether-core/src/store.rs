//! State stores.
//!
//! A store owns the single value a channel synchronizes. While a connection
//! is live, only the synchronization core calls [`StateStore::process`].

use crate::event::{Event, Reducer};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tether_protocol::ChannelInfo;
use tracing::trace;

/// Owner of a channel's current state value.
///
/// Methods take `&self` so a store can be shared between the application and
/// the connection behind an `Arc`.
pub trait StateStore<T>: Send + Sync {
    /// Replace the value, unless `state` is `None`.
    ///
    /// `None` means "no state supplied" and is ignored. A present value always
    /// overwrites, even when it is itself a null-like value of `T`.
    fn init(&self, state: Option<T>);

    /// Fold `event` into the current value.
    fn process(&self, event: &Event);

    /// Read the current value.
    fn state(&self) -> T;
}

/// Reference store that folds events with a [`Reducer`].
pub struct ReducingStateStore<T> {
    state: Mutex<T>,
    reducer: Arc<dyn Reducer<T>>,
}

impl<T> ReducingStateStore<T>
where
    T: Clone + Send + 'static,
{
    /// Create a store holding `default_state` until [`StateStore::init`] overrides it.
    #[must_use]
    pub fn new(default_state: T, reducer: impl Reducer<T> + 'static) -> Self {
        Self::with_shared_reducer(default_state, Arc::new(reducer))
    }

    /// Create a store around a reducer that is shared with other stores.
    #[must_use]
    pub fn with_shared_reducer(default_state: T, reducer: Arc<dyn Reducer<T>>) -> Self {
        Self {
            state: Mutex::new(default_state),
            reducer,
        }
    }

    fn lock(&self) -> MutexGuard<'_, T> {
        // A panicking reducer never leaves a half-written value behind.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> StateStore<T> for ReducingStateStore<T>
where
    T: Clone + Send + 'static,
{
    fn init(&self, state: Option<T>) {
        if let Some(state) = state {
            *self.lock() = state;
        }
    }

    fn process(&self, event: &Event) {
        let mut current = self.lock();
        let next = self.reducer.reduce(&current, event);
        *current = next;
        trace!(event_type = %event.event_type, "Processed event");
    }

    fn state(&self) -> T {
        self.lock().clone()
    }
}

impl<T> std::fmt::Debug for ReducingStateStore<T>
where
    T: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReducingStateStore")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Manufactures one store per channel, for connectors that own their stores.
pub trait StateStoreFactory<T>: Send + Sync {
    /// Create a fresh store for `info`.
    fn create(&self, info: &ChannelInfo) -> Arc<dyn StateStore<T>>;
}

impl<T, F> StateStoreFactory<T> for F
where
    F: Fn(&ChannelInfo) -> Arc<dyn StateStore<T>> + Send + Sync,
{
    fn create(&self, info: &ChannelInfo) -> Arc<dyn StateStore<T>> {
        self(info)
    }
}

/// Factory producing [`ReducingStateStore`]s that share one reducer.
pub struct ReducingStoreFactory<T> {
    default_state: T,
    reducer: Arc<dyn Reducer<T>>,
}

impl<T> ReducingStoreFactory<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a factory; every store starts at a clone of `default_state`.
    #[must_use]
    pub fn new(default_state: T, reducer: impl Reducer<T> + 'static) -> Self {
        Self {
            default_state,
            reducer: Arc::new(reducer),
        }
    }
}

impl<T> StateStoreFactory<T> for ReducingStoreFactory<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn create(&self, info: &ChannelInfo) -> Arc<dyn StateStore<T>> {
        trace!(channel = %info.id(), "Creating state store");
        Arc::new(ReducingStateStore::with_shared_reducer(
            self.default_state.clone(),
            Arc::clone(&self.reducer),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn counter(state: &i64, event: &Event) -> i64 {
        match event.event_type.as_str() {
            "add" => state + 1,
            "subtract" => state - 1,
            _ => *state,
        }
    }

    #[test]
    fn test_default_state_until_init() {
        let store = ReducingStateStore::new(10i64, counter);
        assert_eq!(store.state(), 10);

        store.init(Some(3));
        assert_eq!(store.state(), 3);
    }

    #[test]
    fn test_init_absent_is_ignored() {
        let store = ReducingStateStore::new(7i64, counter);
        store.init(None);
        assert_eq!(store.state(), 7);
    }

    #[test]
    fn test_init_null_overwrites() {
        let store =
            ReducingStateStore::new(json!({"count": 1}), |s: &Value, _: &Event| s.clone());
        store.init(Some(Value::Null));
        assert_eq!(store.state(), Value::Null);

        let optional = ReducingStateStore::new(Some(4i64), |s: &Option<i64>, _: &Event| *s);
        optional.init(Some(None));
        assert_eq!(optional.state(), None);
    }

    #[test]
    fn test_process_applies_reducer() {
        let store = ReducingStateStore::new(0i64, counter);
        store.process(&Event::new("add"));
        store.process(&Event::new("add"));
        store.process(&Event::new("subtract"));
        store.process(&Event::new("noop"));
        assert_eq!(store.state(), 1);
    }

    #[test]
    fn test_factory_creates_independent_stores() {
        let factory = ReducingStoreFactory::new(0i64, counter);
        let a = factory.create(&ChannelInfo::new("counter", "a"));
        let b = factory.create(&ChannelInfo::new("counter", "b"));

        a.process(&Event::new("add"));
        assert_eq!(a.state(), 1);
        assert_eq!(b.state(), 0);
    }

    #[test]
    fn test_closure_factory() {
        let factory = |_: &ChannelInfo| -> Arc<dyn StateStore<i64>> {
            Arc::new(ReducingStateStore::new(5i64, counter))
        };
        let store: Arc<dyn StateStore<i64>> = factory.create(&ChannelInfo::new("counter", "c"));
        assert_eq!(store.state(), 5);
    }
}
