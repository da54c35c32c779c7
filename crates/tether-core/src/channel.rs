//! Channel entity and connector contracts.
//!
//! Application code holds a [`SyncChannel`]; the concrete [`ChannelConnector`]
//! behind it decides how joining, leaving and event relay actually happen.

use crate::connection::{ChannelConnection, ConnectionError};
use crate::store::StateStore;
use async_trait::async_trait;
use std::sync::Arc;
use tether_protocol::ChannelInfo;
use tracing::debug;

/// Maximum channel id length.
pub const MAX_CHANNEL_ID_LENGTH: usize = 256;

/// Validate a channel id.
///
/// # Errors
///
/// Returns an error message if the channel id is invalid.
pub fn validate_channel_id(id: &str) -> Result<(), &'static str> {
    if id.is_empty() {
        return Err("Channel id cannot be empty");
    }
    if id.len() > MAX_CHANNEL_ID_LENGTH {
        return Err("Channel id too long");
    }
    if id.starts_with('$') {
        return Err("Channel ids starting with '$' are reserved");
    }
    if !id.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Channel id contains invalid characters");
    }
    Ok(())
}

/// What a connector needs to open a connection.
pub struct ChannelConnectionRequest<T> {
    /// The channel being joined.
    pub info: ChannelInfo,
    /// Store the connection applies events to, unless the connector substitutes its own.
    pub store: Arc<dyn StateStore<T>>,
}

impl<T> ChannelConnectionRequest<T> {
    /// Create a request.
    #[must_use]
    pub fn new(info: ChannelInfo, store: Arc<dyn StateStore<T>>) -> Self {
        Self { info, store }
    }
}

impl<T> std::fmt::Debug for ChannelConnectionRequest<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelConnectionRequest")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

/// Performs the transport-specific join for a channel.
#[async_trait]
pub trait ChannelConnector<T>: Send + Sync {
    /// Join the channel and return its live connection.
    ///
    /// # Errors
    ///
    /// An error means the join handshake failed and no connection exists.
    async fn connect_to_channel(
        &self,
        request: ChannelConnectionRequest<T>,
    ) -> Result<Arc<ChannelConnection<T>>, ConnectionError>;
}

/// The capabilities application code depends on.
#[async_trait]
pub trait SyncChannel<T>: Send + Sync {
    /// The channel id.
    fn id(&self) -> &str;

    /// The full channel info.
    fn info(&self) -> &ChannelInfo;

    /// Join the channel.
    async fn subscribe(&self) -> Result<Arc<ChannelConnection<T>>, ConnectionError>;
}

/// A channel bound to a connector and a store.
pub struct Channel<T> {
    info: ChannelInfo,
    connector: Arc<dyn ChannelConnector<T>>,
    store: Arc<dyn StateStore<T>>,
}

impl<T> Channel<T> {
    /// Create a new channel.
    #[must_use]
    pub fn new(
        info: ChannelInfo,
        connector: Arc<dyn ChannelConnector<T>>,
        store: Arc<dyn StateStore<T>>,
    ) -> Self {
        Self {
            info,
            connector,
            store,
        }
    }

    /// The store handed to the connector on subscribe.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn StateStore<T>> {
        &self.store
    }
}

#[async_trait]
impl<T> SyncChannel<T> for Channel<T>
where
    T: Send + Sync + 'static,
{
    fn id(&self) -> &str {
        self.info.id()
    }

    fn info(&self) -> &ChannelInfo {
        &self.info
    }

    async fn subscribe(&self) -> Result<Arc<ChannelConnection<T>>, ConnectionError> {
        debug!(channel = %self.info.id(), "Subscribing");
        let request = ChannelConnectionRequest::new(self.info.clone(), Arc::clone(&self.store));
        self.connector.connect_to_channel(request).await
    }
}

impl<T> std::fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionBuilder;
    use crate::event::Event;
    use crate::store::ReducingStateStore;
    use std::sync::Mutex;

    /// Records requests and builds plain local connections.
    #[derive(Default)]
    struct RecordingConnector {
        requested: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ChannelConnector<i64> for RecordingConnector {
        async fn connect_to_channel(
            &self,
            request: ChannelConnectionRequest<i64>,
        ) -> Result<Arc<ChannelConnection<i64>>, ConnectionError> {
            self.requested
                .lock()
                .unwrap()
                .push(request.info.id().to_string());
            ConnectionBuilder::new(request).build()
        }
    }

    fn counter(state: &i64, event: &Event) -> i64 {
        match event.event_type.as_str() {
            "add" => state + 1,
            _ => *state,
        }
    }

    #[test]
    fn test_channel_id_validation() {
        assert!(validate_channel_id("valid:channel").is_ok());
        assert!(validate_channel_id("").is_err());
        assert!(validate_channel_id("$system").is_err());
        assert!(validate_channel_id("tab\there").is_err());

        let long_id = "a".repeat(MAX_CHANNEL_ID_LENGTH + 1);
        assert!(validate_channel_id(&long_id).is_err());
    }

    #[tokio::test]
    async fn test_channel_subscribe_delegates_to_connector() {
        let connector = Arc::new(RecordingConnector::default());
        let store: Arc<dyn StateStore<i64>> = Arc::new(ReducingStateStore::new(0i64, counter));
        let channel = Channel::new(
            ChannelInfo::new("counter", "c-1").with_name("Counter"),
            connector.clone(),
            Arc::clone(&store),
        );

        assert_eq!(channel.id(), "c-1");
        assert_eq!(channel.info().name(), Some("Counter"));

        let connection = channel.subscribe().await.unwrap();
        assert_eq!(*connector.requested.lock().unwrap(), vec!["c-1".to_string()]);

        connection.emit(Event::new("add"));
        assert_eq!(store.state(), 1);
    }
}
