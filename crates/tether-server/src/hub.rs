//! Channel hub for the Tether server.
//!
//! The hub hosts the authoritative copy of every joined channel and routes
//! events between the sockets subscribed to it. Each hosted channel is an
//! in-memory connection whose store keeps the channel's recent history.

use crate::history::history_store_factory;
use crate::metrics;
use dashmap::{DashMap, DashSet};
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use tether_core::{
    validate_channel_id, ChannelConnection, ChannelConnectionRequest, ChannelConnector,
    ChannelInfo, ConnectionError, Event, MemoryConnector, StateStore, StateStoreFactory,
};
use tether_protocol::JoinReply;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

/// Hub errors.
#[derive(Debug, Error)]
pub enum HubError {
    /// Invalid channel id.
    #[error("Invalid channel id: {0}")]
    InvalidChannel(&'static str),

    /// Channel not found.
    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    /// Not subscribed to channel.
    #[error("Not subscribed to channel: {0}")]
    NotSubscribed(String),

    /// Maximum subscriptions reached.
    #[error("Maximum subscriptions reached")]
    MaxSubscriptionsReached,

    /// Maximum channels reached.
    #[error("Maximum channels reached")]
    MaxChannelsReached,

    /// The hosted connection could not be created.
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Maximum number of hosted channels.
    pub max_channels: usize,
    /// Maximum subscriptions per socket.
    pub max_subscriptions_per_connection: usize,
    /// Fan-out broadcast capacity per channel.
    pub channel_capacity: usize,
    /// Events kept as each channel's state.
    pub max_history: usize,
    /// Whether to tear down channels nobody subscribes to.
    pub auto_delete_empty_channels: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_channels: 10_000,
            max_subscriptions_per_connection: 100,
            channel_capacity: 1024,
            max_history: 100,
            auto_delete_empty_channels: true,
        }
    }
}

/// An event relayed to the subscribers of a channel.
#[derive(Debug)]
pub struct Delivery {
    /// Socket the event came from.
    pub origin: String,
    /// Channel id.
    pub channel: String,
    /// The event itself.
    pub event: Event,
}

struct HostedChannel {
    connection: Arc<ChannelConnection<Value>>,
    /// Held while emitting so fan-out order matches store order.
    fanout: Mutex<broadcast::Sender<Arc<Delivery>>>,
    subscribers: DashSet<String>,
}

impl HostedChannel {
    fn new(connection: Arc<ChannelConnection<Value>>, capacity: usize) -> Self {
        Self {
            connection,
            fanout: Mutex::new(broadcast::channel(capacity).0),
            subscribers: DashSet::new(),
        }
    }

    /// Current state and, if asked for, a receiver that starts right after it.
    fn snapshot(
        &self,
        subscribe: bool,
    ) -> (JoinReply, Option<broadcast::Receiver<Arc<Delivery>>>) {
        let fanout = self.fanout.lock().unwrap_or_else(PoisonError::into_inner);
        let reply = JoinReply {
            info: self.connection.info().clone(),
            state: self.connection.store().state(),
        };
        (reply, subscribe.then(|| fanout.subscribe()))
    }
}

/// A socket's feed of events published on one channel by other sockets.
pub struct Subscription {
    connection_id: String,
    receiver: broadcast::Receiver<Arc<Delivery>>,
}

impl Subscription {
    /// Next event from another socket; `None` once the channel is gone.
    pub async fn recv(&mut self) -> Option<Arc<Delivery>> {
        loop {
            match self.receiver.recv().await {
                Ok(delivery) if delivery.origin == self.connection_id => continue,
                Ok(delivery) => return Some(delivery),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(connection = %self.connection_id, skipped, "Subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Result of a successful join.
pub struct Joined {
    /// Confirmed channel info and its current state.
    pub reply: JoinReply,
    /// Fresh feed, or `None` if the socket was already subscribed.
    pub subscription: Option<Subscription>,
}

/// The server's channel hub.
pub struct Hub {
    connector: MemoryConnector<Value>,
    stores: Box<dyn StateStoreFactory<Value>>,
    /// Hosted channels indexed by id.
    channels: DashMap<String, Arc<HostedChannel>>,
    /// Socket subscriptions (connection_id -> set of channel ids).
    subscriptions: DashMap<String, DashSet<String>>,
    config: HubConfig,
}

impl Hub {
    /// Create a new hub with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(HubConfig::default())
    }

    /// Create a new hub with custom configuration.
    #[must_use]
    pub fn with_config(config: HubConfig) -> Self {
        info!("Creating hub with config: {:?}", config);
        let connector = MemoryConnector::new()
            .on_emit(|info: &ChannelInfo, _: &Event| metrics::record_event(info.kind()));
        Self {
            connector,
            stores: Box::new(history_store_factory(config.max_history)),
            channels: DashMap::new(),
            subscriptions: DashMap::new(),
            config,
        }
    }

    /// Get hub statistics.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        HubStats {
            channel_count: self.channels.len(),
            connection_count: self.subscriptions.len(),
            total_subscriptions: self.subscriptions.iter().map(|s| s.len()).sum(),
        }
    }

    /// Subscribe a socket to a channel, hosting the channel on first join.
    ///
    /// Joining a channel the socket already follows succeeds without a new
    /// [`Subscription`].
    ///
    /// # Errors
    ///
    /// Returns an error if the channel id is invalid or limits are exceeded.
    pub async fn join(&self, connection_id: &str, info: ChannelInfo) -> Result<Joined, HubError> {
        validate_channel_id(info.id()).map_err(HubError::InvalidChannel)?;

        let already = match self.subscriptions.get(connection_id) {
            Some(subs) if subs.contains(info.id()) => true,
            Some(subs) if subs.len() >= self.config.max_subscriptions_per_connection => {
                return Err(HubError::MaxSubscriptionsReached);
            }
            _ => false,
        };

        if !self.channels.contains_key(info.id())
            && self.channels.len() >= self.config.max_channels
        {
            return Err(HubError::MaxChannelsReached);
        }

        let hosted = self.host(&info, connection_id).await?;
        self.subscriptions
            .entry(connection_id.to_string())
            .or_default()
            .insert(info.id().to_string());

        let (reply, receiver) = hosted.snapshot(!already);
        let subscription = receiver.map(|receiver| Subscription {
            connection_id: connection_id.to_string(),
            receiver,
        });

        debug!(
            channel = %info.id(),
            connection = %connection_id,
            subscribers = hosted.subscribers.len(),
            "Subscribed"
        );
        metrics::record_join();
        metrics::set_active_channels(self.channels.len());

        Ok(Joined {
            reply,
            subscription,
        })
    }

    /// Re-attach a socket to a channel that is still hosted.
    ///
    /// A client whose transport reconnected asks for the channel state over
    /// a fresh socket; this subscribes that socket again.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::ChannelNotFound`] if the channel is no longer hosted.
    pub async fn resume(&self, connection_id: &str, channel_id: &str) -> Result<Joined, HubError> {
        let info = self
            .channels
            .get(channel_id)
            .map(|hosted| hosted.connection.info().clone())
            .ok_or_else(|| HubError::ChannelNotFound(channel_id.to_string()))?;
        self.join(connection_id, info).await
    }

    async fn host(
        &self,
        info: &ChannelInfo,
        connection_id: &str,
    ) -> Result<Arc<HostedChannel>, HubError> {
        loop {
            let request = ChannelConnectionRequest::new(info.clone(), self.stores.create(info));
            let connection = self.connector.connect_to_channel(request).await?;

            let hosted = {
                let entry = self
                    .channels
                    .entry(info.id().to_string())
                    .or_insert_with(|| {
                        debug!(channel = %info.id(), "Hosting channel");
                        Arc::new(HostedChannel::new(
                            Arc::clone(&connection),
                            self.config.channel_capacity,
                        ))
                    });
                if entry.connection.is_closed() {
                    None
                } else {
                    entry.subscribers.insert(connection_id.to_string());
                    Some(Arc::clone(entry.value()))
                }
            };

            match hosted {
                Some(hosted) => return Ok(hosted),
                None => {
                    // Lost a race with the last subscriber leaving.
                    self.channels
                        .remove_if(info.id(), |_, hosted| hosted.connection.is_closed());
                    tokio::task::yield_now().await;
                }
            }
        }
    }

    /// Apply an event from a socket and relay it to the other subscribers.
    ///
    /// Returns the number of subscriptions the event was delivered to,
    /// including the origin's own (which skips it).
    ///
    /// # Errors
    ///
    /// Returns an error if the socket is not subscribed to the channel.
    pub fn publish(
        &self,
        connection_id: &str,
        channel_id: &str,
        event: Event,
    ) -> Result<usize, HubError> {
        let hosted = self
            .channels
            .get(channel_id)
            .map(|hosted| Arc::clone(hosted.value()))
            .ok_or_else(|| HubError::ChannelNotFound(channel_id.to_string()))?;
        if !hosted.subscribers.contains(connection_id) {
            return Err(HubError::NotSubscribed(channel_id.to_string()));
        }

        let fanout = hosted.fanout.lock().unwrap_or_else(PoisonError::into_inner);
        hosted.connection.emit(event.clone());
        let delivery = Delivery {
            origin: connection_id.to_string(),
            channel: channel_id.to_string(),
            event,
        };
        let count = fanout.send(Arc::new(delivery)).unwrap_or(0);

        trace!(channel = %channel_id, recipients = count, "Published event");
        Ok(count)
    }

    /// Current state of a hosted channel.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::ChannelNotFound`] if the channel is not hosted.
    pub fn state(&self, channel_id: &str) -> Result<Value, HubError> {
        self.channels
            .get(channel_id)
            .map(|hosted| hosted.connection.store().state())
            .ok_or_else(|| HubError::ChannelNotFound(channel_id.to_string()))
    }

    /// Unsubscribe a socket from a channel.
    ///
    /// # Errors
    ///
    /// Returns an error if not subscribed.
    pub fn leave(&self, connection_id: &str, channel_id: &str) -> Result<(), HubError> {
        let removed = self
            .subscriptions
            .get(connection_id)
            .and_then(|subs| subs.remove(channel_id));
        if removed.is_none() {
            return Err(HubError::NotSubscribed(channel_id.to_string()));
        }

        self.detach(connection_id, channel_id);
        Ok(())
    }

    /// Unsubscribe a socket from all channels.
    pub fn leave_all(&self, connection_id: &str) {
        if let Some((_, channels)) = self.subscriptions.remove(connection_id) {
            for channel_id in channels {
                self.detach(connection_id, &channel_id);
            }
        }

        debug!(connection = %connection_id, "Unsubscribed from all channels");
    }

    fn detach(&self, connection_id: &str, channel_id: &str) {
        let Some(hosted) = self
            .channels
            .get(channel_id)
            .map(|hosted| Arc::clone(hosted.value()))
        else {
            return;
        };

        hosted.subscribers.remove(connection_id);
        debug!(
            channel = %channel_id,
            connection = %connection_id,
            subscribers = hosted.subscribers.len(),
            "Unsubscribed"
        );

        // Auto-delete empty channels
        if self.config.auto_delete_empty_channels {
            let removed = self
                .channels
                .remove_if(channel_id, |_, hosted| hosted.subscribers.is_empty());
            if let Some((_, hosted)) = removed {
                hosted.connection.unsubscribe();
                debug!(channel = %channel_id, "Deleted empty channel");
            }
        }
        metrics::set_active_channels(self.channels.len());
    }

    /// Check if a channel is hosted.
    #[must_use]
    pub fn channel_exists(&self, channel_id: &str) -> bool {
        self.channels.contains_key(channel_id)
    }

    /// Get the subscriber count for a channel.
    #[must_use]
    pub fn subscriber_count(&self, channel_id: &str) -> usize {
        self.channels
            .get(channel_id)
            .map(|hosted| hosted.subscribers.len())
            .unwrap_or(0)
    }

    /// Whether a socket follows a channel.
    #[must_use]
    pub fn is_subscribed(&self, connection_id: &str, channel_id: &str) -> bool {
        self.subscriptions
            .get(connection_id)
            .is_some_and(|subs| subs.contains(channel_id))
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

/// Hub statistics.
#[derive(Debug, Clone)]
pub struct HubStats {
    /// Number of hosted channels.
    pub channel_count: usize,
    /// Number of sockets with subscriptions.
    pub connection_count: usize,
    /// Total number of subscriptions.
    pub total_subscriptions: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(1);

    fn room(id: &str) -> ChannelInfo {
        ChannelInfo::new("room", id)
    }

    #[tokio::test]
    async fn test_hub_join_leave() {
        let hub = Hub::new();

        let joined = hub.join("conn-1", room("test:channel")).await.unwrap();
        assert_eq!(joined.reply.info.id(), "test:channel");
        assert_eq!(joined.reply.state, json!([]));
        assert!(hub.channel_exists("test:channel"));
        assert_eq!(hub.subscriber_count("test:channel"), 1);

        hub.leave("conn-1", "test:channel").unwrap();
        // Channel should be auto-deleted
        assert!(!hub.channel_exists("test:channel"));
        assert!(matches!(
            hub.leave("conn-1", "test:channel"),
            Err(HubError::NotSubscribed(_))
        ));
    }

    #[tokio::test]
    async fn test_hub_join_is_idempotent_per_socket() {
        let hub = Hub::new();

        let first = hub.join("conn-1", room("test")).await.unwrap();
        let second = hub.join("conn-1", room("test")).await.unwrap();

        assert!(first.subscription.is_some());
        assert!(second.subscription.is_none());
        assert_eq!(hub.stats().total_subscriptions, 1);
    }

    #[tokio::test]
    async fn test_hub_invalid_channel() {
        let hub = Hub::new();

        assert!(matches!(
            hub.join("conn-1", room("")).await,
            Err(HubError::InvalidChannel(_))
        ));
        assert!(hub.join("conn-1", room("$system")).await.is_err());
        assert!(!hub.channel_exists(""));
    }

    #[tokio::test]
    async fn test_hub_limits() {
        let hub = Hub::with_config(HubConfig {
            max_channels: 2,
            max_subscriptions_per_connection: 1,
            ..HubConfig::default()
        });

        hub.join("conn-1", room("a")).await.unwrap();
        assert!(matches!(
            hub.join("conn-1", room("b")).await,
            Err(HubError::MaxSubscriptionsReached)
        ));

        hub.join("conn-2", room("b")).await.unwrap();
        assert!(matches!(
            hub.join("conn-3", room("c")).await,
            Err(HubError::MaxChannelsReached)
        ));
        // Existing channels stay joinable.
        hub.join("conn-3", room("a")).await.unwrap();
    }

    #[tokio::test]
    async fn test_hub_publish_skips_origin() {
        let hub = Hub::new();
        let mut a = hub.join("conn-a", room("test")).await.unwrap().subscription.unwrap();
        let mut b = hub.join("conn-b", room("test")).await.unwrap().subscription.unwrap();

        hub.publish("conn-a", "test", Event::new("from-a")).unwrap();
        hub.publish("conn-b", "test", Event::new("from-b")).unwrap();

        let seen_by_b = timeout(WAIT, b.recv()).await.unwrap().unwrap();
        assert_eq!(seen_by_b.event.event_type, "from-a");
        assert_eq!(seen_by_b.origin, "conn-a");

        // "from-a" is skipped for its own origin.
        let seen_by_a = timeout(WAIT, a.recv()).await.unwrap().unwrap();
        assert_eq!(seen_by_a.event.event_type, "from-b");

        let state = hub.state("test").unwrap();
        assert_eq!(state[0]["type"], "from-a");
        assert_eq!(state[1]["type"], "from-b");
    }

    #[tokio::test]
    async fn test_hub_publish_requires_subscription() {
        let hub = Hub::new();
        hub.join("conn-1", room("test")).await.unwrap();

        assert!(matches!(
            hub.publish("conn-2", "test", Event::new("add")),
            Err(HubError::NotSubscribed(_))
        ));
        assert!(matches!(
            hub.publish("conn-1", "missing", Event::new("add")),
            Err(HubError::ChannelNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_hub_history_is_capped() {
        let hub = Hub::with_config(HubConfig {
            max_history: 2,
            ..HubConfig::default()
        });
        hub.join("conn-1", room("test")).await.unwrap();
        for i in 0..5 {
            hub.publish("conn-1", "test", Event::new("add").with_payload(json!(i)))
                .unwrap();
        }

        let state = hub.state("test").unwrap();
        assert_eq!(state.as_array().map(Vec::len), Some(2));
        assert_eq!(state[1]["payload"], 4);
    }

    #[tokio::test]
    async fn test_hub_deleted_channel_starts_fresh() {
        let hub = Hub::new();
        hub.join("conn-1", room("test")).await.unwrap();
        hub.publish("conn-1", "test", Event::new("add")).unwrap();
        hub.leave_all("conn-1");
        assert!(!hub.channel_exists("test"));

        let rejoined = hub.join("conn-1", room("test")).await.unwrap();
        assert_eq!(rejoined.reply.state, json!([]));
    }

    #[tokio::test]
    async fn test_hub_resume() {
        let hub = Hub::new();
        hub.join("conn-1", room("test")).await.unwrap();
        hub.publish("conn-1", "test", Event::new("add")).unwrap();

        let resumed = hub.resume("conn-2", "test").await.unwrap();
        assert!(resumed.subscription.is_some());
        assert_eq!(resumed.reply.state.as_array().map(Vec::len), Some(1));
        assert!(hub.is_subscribed("conn-2", "test"));

        assert!(matches!(
            hub.resume("conn-2", "missing").await,
            Err(HubError::ChannelNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_hub_stats() {
        let hub = Hub::new();

        hub.join("conn-1", room("channel-1")).await.unwrap();
        hub.join("conn-1", room("channel-2")).await.unwrap();
        hub.join("conn-2", room("channel-1")).await.unwrap();

        let stats = hub.stats();
        assert_eq!(stats.channel_count, 2);
        assert_eq!(stats.connection_count, 2);
        assert_eq!(stats.total_subscriptions, 3);
    }
}
