//! State kept for hosted channels.
//!
//! The server cannot interpret application events, so a hosted channel's
//! state is simply its most recent events, oldest first.

use serde_json::Value;
use tether_core::{Event, Reducer, ReducingStoreFactory};
use tracing::warn;

/// Appends each event to a JSON array capped at `max` entries.
#[derive(Debug, Clone, Copy)]
pub struct HistoryReducer {
    max: usize,
}

impl HistoryReducer {
    /// Keep at most `max` events.
    #[must_use]
    pub fn new(max: usize) -> Self {
        Self { max }
    }
}

impl Reducer<Value> for HistoryReducer {
    fn reduce(&self, state: &Value, event: &Event) -> Value {
        let mut history = match state {
            Value::Array(events) => events.clone(),
            _ => Vec::new(),
        };
        match serde_json::to_value(event) {
            Ok(entry) => history.push(entry),
            Err(e) => warn!(error = %e, "Dropping unencodable event from history"),
        }
        let excess = history.len().saturating_sub(self.max);
        history.drain(..excess);
        Value::Array(history)
    }
}

/// Store factory for hosted channels: every channel starts with no history.
#[must_use]
pub fn history_store_factory(max: usize) -> ReducingStoreFactory<Value> {
    ReducingStoreFactory::new(Value::Array(Vec::new()), HistoryReducer::new(max))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tether_core::{fold_events, ChannelInfo, StateStore, StateStoreFactory};

    #[test]
    fn test_history_is_capped_oldest_first() {
        let events: Vec<Event> = (0..5)
            .map(|i| Event::new("add").with_payload(json!(i)).at(i))
            .collect();

        let state = fold_events(&HistoryReducer::new(3), json!([]), &events);

        let payloads: Vec<&Value> = state
            .as_array()
            .unwrap()
            .iter()
            .map(|entry| &entry["payload"])
            .collect();
        assert_eq!(payloads, vec![&json!(2), &json!(3), &json!(4)]);
    }

    #[test]
    fn test_non_array_state_restarts_history() {
        let state = HistoryReducer::new(10).reduce(&json!({"stale": true}), &Event::new("add"));
        assert_eq!(state.as_array().map(Vec::len), Some(1));
        assert_eq!(state[0]["type"], "add");
    }

    #[test]
    fn test_zero_history_keeps_nothing() {
        let state = HistoryReducer::new(0).reduce(&json!([]), &Event::new("add"));
        assert_eq!(state, json!([]));
    }

    #[test]
    fn test_factory_stores_are_independent() {
        let factory = history_store_factory(2);
        let a = factory.create(&ChannelInfo::new("room", "a"));
        let b = factory.create(&ChannelInfo::new("room", "b"));

        a.process(&Event::new("add"));
        assert_eq!(a.state().as_array().map(Vec::len), Some(1));
        assert_eq!(b.state(), json!([]));
    }
}
