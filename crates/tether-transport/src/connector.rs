//! Connector that joins channels hosted by a remote server.
//!
//! ## Join handshake
//!
//! ```text
//! client                                  server
//!   │ request("join", ChannelInfo)          │
//!   │──────────────────────────────────────▶│
//!   │         reply { info, state } / error │
//!   │◀──────────────────────────────────────│
//!   │ listen("events:<confirmed id>")       │
//!   │ emit("events:<confirmed id>", Event)  │  while online
//!   │ request("state", { channel })         │  after connectivity returns
//!   │ emit("leave", { channel })            │  on unsubscribe
//! ```

use crate::traits::{Transport, TransportError};
use async_trait::async_trait;
use futures_util::future;
use futures_util::stream::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::Arc;
use tether_core::{
    ChannelConnection, ChannelConnectionRequest, ChannelConnector, ConnectionBuilder,
    ConnectionError, Event,
};
use tether_protocol::{
    event_channel_name, event_from_payload, ChannelRef, JoinReply, JOIN, LEAVE, STATE,
};
use tracing::{debug, warn};

/// Joins channels over a [`Transport`].
pub struct NetworkConnector<T> {
    transport: Arc<dyn Transport>,
    _state: PhantomData<fn() -> T>,
}

impl<T> NetworkConnector<T> {
    /// Create a connector over `transport`.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            _state: PhantomData,
        }
    }

    /// The underlying transport.
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }
}

impl<T> Clone for NetworkConnector<T> {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.transport))
    }
}

impl<T> std::fmt::Debug for NetworkConnector<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkConnector")
            .field("transport", &self.transport.name())
            .finish()
    }
}

fn join_error(channel: &str, error: TransportError) -> ConnectionError {
    match error {
        TransportError::Rejected(reason) => ConnectionError::JoinRejected {
            channel: channel.to_string(),
            reason,
        },
        other => ConnectionError::Transport(other.to_string()),
    }
}

fn decode_event(channel: &str, payload: Value) -> Option<Event> {
    match event_from_payload(payload) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!(channel = %channel, error = %e, "Dropping malformed server event");
            None
        }
    }
}

fn to_payload(value: &impl Serialize) -> Result<Value, ConnectionError> {
    serde_json::to_value(value).map_err(ConnectionError::from)
}

#[async_trait]
impl<T> ChannelConnector<T> for NetworkConnector<T>
where
    T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    async fn connect_to_channel(
        &self,
        request: ChannelConnectionRequest<T>,
    ) -> Result<Arc<ChannelConnection<T>>, ConnectionError> {
        let ChannelConnectionRequest { info, store } = request;

        // Listen before joining; the server relays events right after its reply.
        let requested_events = self.transport.listen(&event_channel_name(info.id()));
        let reply = self
            .transport
            .request(JOIN, to_payload(&info)?)
            .await
            .map_err(|e| join_error(info.id(), e))?;
        let JoinReply {
            info: confirmed,
            state,
        } = serde_json::from_value(reply)?;
        let initial: T = serde_json::from_value(state)?;
        store.init(Some(initial));

        let channel = confirmed.id().to_string();
        let event_name = event_channel_name(&channel);
        debug!(
            requested = %info.id(),
            channel = %channel,
            transport = self.transport.name(),
            "Joined channel"
        );

        let events_channel = channel.clone();
        let raw_events = if channel == info.id() {
            requested_events
        } else {
            self.transport.listen(&event_name)
        };
        let server_events = raw_events
            .filter_map(move |payload| future::ready(decode_event(&events_channel, payload)));

        let connectivity = self.transport.connectivity();

        let transport = Arc::clone(&self.transport);
        let emit_to_server = move |event: Event| match serde_json::to_value(&event) {
            Ok(payload) => {
                if let Err(e) = transport.emit(&event_name, payload) {
                    warn!(name = %event_name, error = %e, "Failed to send event");
                }
            }
            Err(e) => warn!(name = %event_name, error = %e, "Failed to encode event"),
        };

        let transport = Arc::clone(&self.transport);
        let state_request = to_payload(&ChannelRef::new(channel.clone()))?;
        let server_state = move || {
            let transport = Arc::clone(&transport);
            let payload = state_request.clone();
            async move {
                let value = transport
                    .request(STATE, payload)
                    .await
                    .map_err(|e| ConnectionError::ServerState(e.to_string()))?;
                serde_json::from_value::<T>(value).map_err(ConnectionError::from)
            }
        };

        let transport = Arc::clone(&self.transport);
        let leave = to_payload(&ChannelRef::new(channel.clone()))?;
        let on_close = move || {
            if let Err(e) = transport.emit(LEAVE, leave) {
                debug!(channel = %channel, error = %e, "Leave not delivered");
            }
        };

        ConnectionBuilder::new(ChannelConnectionRequest::new(confirmed, store))
            .server_events(server_events)
            .emit_to_server(emit_to_server)
            .connection_state(connectivity)
            .initially_connected(self.transport.is_connected())
            .server_state(server_state)
            .on_close(on_close)
            .build()
    }
}
