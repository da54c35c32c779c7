//! Events and the reducer contract.
//!
//! An [`Event`] is opaque to the synchronization core. Only a [`Reducer`]
//! interprets it, folding it into the previous state to produce the next one.

pub use tether_protocol::Event;

/// Pure fold of an event into a state value.
///
/// Reducers must pass the state through unchanged for events they do not
/// recognize. The core never catches a panicking reducer.
pub trait Reducer<T>: Send + Sync {
    /// Produce the state that follows `state` once `event` is applied.
    fn reduce(&self, state: &T, event: &Event) -> T;
}

impl<T, F> Reducer<T> for F
where
    F: Fn(&T, &Event) -> T + Send + Sync,
{
    fn reduce(&self, state: &T, event: &Event) -> T {
        self(state, event)
    }
}

/// Fold a sequence of events, left to right, starting from `initial`.
pub fn fold_events<'a, T, R>(
    reducer: &R,
    initial: T,
    events: impl IntoIterator<Item = &'a Event>,
) -> T
where
    R: Reducer<T> + ?Sized,
{
    events
        .into_iter()
        .fold(initial, |state, event| reducer.reduce(&state, event))
}
