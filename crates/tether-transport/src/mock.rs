//! Mock transport for testing.
//!
//! Requests are answered from per-name scripts, emitted events are captured,
//! and the test drives incoming events and connectivity by hand.

use crate::listeners::Listeners;
use crate::traits::{Transport, TransportError};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Mock transport for testing.
///
/// Clones share state, so a test can keep one handle while a connector owns
/// another.
#[derive(Clone, Default)]
pub struct MockTransport {
    inner: Arc<Mutex<MockTransportInner>>,
    listeners: Arc<Listeners>,
}

#[derive(Default)]
struct MockTransportInner {
    disconnected: bool,
    replies: HashMap<String, VecDeque<Result<Value, String>>>,
    requests: Vec<(String, Value)>,
    emitted: Vec<(String, Value)>,
    fail_next_emit: Option<String>,
}

impl MockTransport {
    /// Create a connected mock transport.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, MockTransportInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a successful reply for the next `name` request.
    pub fn reply(&self, name: &str, payload: Value) {
        self.inner()
            .replies
            .entry(name.to_string())
            .or_default()
            .push_back(Ok(payload));
    }

    /// Queue an error reply for the next `name` request.
    pub fn reject(&self, name: &str, reason: &str) {
        self.inner()
            .replies
            .entry(name.to_string())
            .or_default()
            .push_back(Err(reason.to_string()));
    }

    /// Cause the next `emit()` to fail with the given error.
    pub fn fail_next_emit(&self, error: &str) {
        self.inner().fail_next_emit = Some(error.to_string());
    }

    /// Deliver a payload to the listeners of `name`, as if the peer sent it.
    ///
    /// Returns the number of listeners reached.
    pub fn push(&self, name: &str, payload: Value) -> usize {
        self.listeners.publish(name, payload)
    }

    /// Change connectivity and raise the matching lifecycle signal.
    pub fn set_connected(&self, connected: bool) {
        let mut inner = self.inner();
        inner.disconnected = !connected;
        self.listeners.publish_connectivity(connected);
    }

    /// Every request sent so far, oldest first.
    #[must_use]
    pub fn requests(&self) -> Vec<(String, Value)> {
        self.inner().requests.clone()
    }

    /// Every event emitted so far, oldest first.
    #[must_use]
    pub fn emitted(&self) -> Vec<(String, Value)> {
        self.inner().emitted.clone()
    }

    /// Payloads emitted under `name`.
    #[must_use]
    pub fn emitted_named(&self, name: &str) -> Vec<Value> {
        self.inner()
            .emitted
            .iter()
            .filter(|(emitted, _)| emitted == name)
            .map(|(_, payload)| payload.clone())
            .collect()
    }
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner();
        f.debug_struct("MockTransport")
            .field("connected", &!inner.disconnected)
            .field("requests", &inner.requests.len())
            .field("emitted", &inner.emitted.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn request(&self, name: &str, payload: Value) -> Result<Value, TransportError> {
        let mut inner = self.inner();

        if inner.disconnected {
            return Err(TransportError::NotConnected);
        }

        inner.requests.push((name.to_string(), payload));
        match inner.replies.get_mut(name).and_then(VecDeque::pop_front) {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(reason)) => Err(TransportError::Rejected(reason)),
            None => Err(TransportError::Other(format!("No reply scripted for {name}"))),
        }
    }

    fn emit(&self, name: &str, payload: Value) -> Result<(), TransportError> {
        let mut inner = self.inner();

        if inner.disconnected {
            return Err(TransportError::NotConnected);
        }

        // Check for forced failure
        if let Some(error) = inner.fail_next_emit.take() {
            return Err(TransportError::SendFailed(error));
        }

        inner.emitted.push((name.to_string(), payload));
        Ok(())
    }

    fn listen(&self, name: &str) -> BoxStream<'static, Value> {
        self.listeners.subscribe(name)
    }

    fn connectivity(&self) -> BoxStream<'static, bool> {
        self.listeners.connectivity()
    }

    fn is_connected(&self) -> bool {
        !self.inner().disconnected
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use serde_json::json;
    use tether_protocol::DISCONNECTED;

    #[tokio::test]
    async fn test_scripted_replies_in_order() {
        let transport = MockTransport::new();
        transport.reply("state", json!(1));
        transport.reject("state", "gone");

        assert_eq!(transport.request("state", json!({})).await.unwrap(), json!(1));
        assert!(matches!(
            transport.request("state", json!({})).await,
            Err(TransportError::Rejected(reason)) if reason == "gone"
        ));
        assert!(matches!(
            transport.request("state", json!({})).await,
            Err(TransportError::Other(_))
        ));
        assert_eq!(transport.requests().len(), 3);
    }

    #[tokio::test]
    async fn test_emit_is_captured() {
        let transport = MockTransport::new();
        transport.emit("leave", json!({"channel": "c-1"})).unwrap();

        transport.fail_next_emit("boom");
        assert!(transport.emit("leave", json!({})).is_err());

        assert_eq!(
            transport.emitted_named("leave"),
            vec![json!({"channel": "c-1"})]
        );
    }

    #[tokio::test]
    async fn test_disconnected_transport_refuses_traffic() {
        let transport = MockTransport::new();
        let mut lifecycle = transport.listen(DISCONNECTED);

        transport.set_connected(false);
        assert!(!transport.is_connected());
        assert_eq!(lifecycle.next().await, Some(Value::Null));
        assert!(matches!(
            transport.emit("x", Value::Null),
            Err(TransportError::NotConnected)
        ));
        assert!(matches!(
            transport.request("x", Value::Null).await,
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_push_reaches_listeners() {
        let transport = MockTransport::new();
        let mut events = transport.listen("events:c-1");

        assert_eq!(transport.push("events:c-1", json!({"type": "add"})), 1);
        assert_eq!(events.next().await, Some(json!({"type": "add"})));
    }
}
