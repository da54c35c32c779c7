//! Per-name listener registry shared by the transports.
//!
//! Connectivity changes travel on their own ordered channel as well as under
//! the `connected`/`disconnected` names, so a drop followed by a quick
//! reconnect is never seen the wrong way round.

use dashmap::DashMap;
use futures_util::stream::BoxStream;
use serde_json::Value;
use tether_core::stream::broadcast_stream;
use tether_protocol::{CONNECTED, DISCONNECTED};
use tokio::sync::broadcast;
use tracing::trace;

/// Default number of payloads buffered per listened name.
pub const DEFAULT_LISTENER_CAPACITY: usize = 256;

/// Fans received payloads out to the listeners of their name.
#[derive(Debug)]
pub struct Listeners {
    by_name: DashMap<String, broadcast::Sender<Value>>,
    lifecycle: broadcast::Sender<bool>,
    capacity: usize,
}

impl Listeners {
    /// Create an empty registry.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            by_name: DashMap::new(),
            lifecycle: broadcast::channel(capacity).0,
            capacity,
        }
    }

    /// Subscribe to `name`.
    pub fn subscribe(&self, name: &str) -> BoxStream<'static, Value> {
        let rx = self
            .by_name
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();
        broadcast_stream(rx)
    }

    /// Deliver `payload` to the listeners of `name`.
    ///
    /// Returns the number of listeners reached. Names nobody listens to any
    /// more are dropped from the registry.
    pub fn publish(&self, name: &str, payload: Value) -> usize {
        let delivered = match self.by_name.get(name) {
            Some(tx) => tx.send(payload).unwrap_or(0),
            None => 0,
        };
        if delivered == 0 {
            self.by_name.remove_if(name, |_, tx| tx.receiver_count() == 0);
            trace!(name, "No listeners");
        }
        delivered
    }

    /// Stream every connectivity change from now on, in the order raised.
    pub fn connectivity(&self) -> BoxStream<'static, bool> {
        broadcast_stream(self.lifecycle.subscribe())
    }

    /// Raise a connectivity change.
    ///
    /// The ordered stream gets it first, then the listeners of
    /// `connected`/`disconnected`.
    pub fn publish_connectivity(&self, connected: bool) {
        let _ = self.lifecycle.send(connected);
        let name = if connected { CONNECTED } else { DISCONNECTED };
        self.publish(name, Value::Null);
    }

    /// Number of names with at least one registered listener channel.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    /// Whether no name has a listener channel.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

impl Default for Listeners {
    fn default() -> Self {
        Self::new(DEFAULT_LISTENER_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use serde_json::json;

    #[tokio::test]
    async fn test_publish_reaches_only_matching_name() {
        let listeners = Listeners::default();
        let mut room = listeners.subscribe("events:room");
        let _other = listeners.subscribe("events:other");

        assert_eq!(listeners.publish("events:room", json!(1)), 1);
        assert_eq!(room.next().await, Some(json!(1)));
    }

    #[tokio::test]
    async fn test_dropped_listeners_are_pruned() {
        let listeners = Listeners::default();
        let stream = listeners.subscribe("events:room");
        assert_eq!(listeners.len(), 1);

        drop(stream);
        assert_eq!(listeners.publish("events:room", json!(1)), 0);
        assert!(listeners.is_empty());
    }

    #[tokio::test]
    async fn test_connectivity_keeps_order() {
        let listeners = Listeners::default();
        let mut connectivity = listeners.connectivity();
        let mut disconnected = listeners.subscribe(DISCONNECTED);

        listeners.publish_connectivity(false);
        listeners.publish_connectivity(true);
        listeners.publish_connectivity(false);

        let seen: Vec<bool> = connectivity.by_ref().take(3).collect().await;
        assert_eq!(seen, vec![false, true, false]);
        assert_eq!(disconnected.next().await, Some(Value::Null));
    }
}
