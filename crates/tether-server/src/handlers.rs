//! Connection handlers for the Tether server.
//!
//! This module handles the socket lifecycle and frame processing:
//!
//! - `request join` - subscribe the socket, reply `{ info, state }`
//! - `request state` - reply with the channel state, re-attaching the socket
//! - `event events:<id>` - apply to the hosted channel, relay to other sockets
//! - `event leave` - unsubscribe the socket

use crate::config::Config;
use crate::hub::{Delivery, Hub, HubConfig, HubError, Subscription};
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tether_protocol::{
    channel_id_from_event_name, codec, event_channel_name, event_from_payload, ChannelInfo,
    ChannelRef, Frame, FrameReader, JOIN, LEAVE, PROTOCOL_VERSION, STATE,
};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The channel hub.
    pub hub: Hub,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let hub_config = HubConfig {
            max_channels: config.limits.max_channels,
            max_subscriptions_per_connection: config.limits.max_subscriptions_per_connection,
            channel_capacity: 1024,
            max_history: config.channels.max_history,
            auto_delete_empty_channels: config.channels.auto_delete_empty,
        };

        Self {
            hub: Hub::with_config(hub_config),
            config,
        }
    }
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Tether server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    serve(listener, Arc::new(AppState::new(config))).await
}

/// Serve the routes on an already bound listener.
///
/// # Errors
///
/// Returns an error if the server stops with an I/O error.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    let app = Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    axum::serve(listener, app).await?;
    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.hub.stats();
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "channels": stats.channel_count,
        "connections": stats.connection_count,
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state))
}

fn next_connection_id() -> String {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    format!("conn_{:x}", NEXT.fetch_add(1, Ordering::Relaxed))
}

/// Errors answered to the client in a failed reply.
#[derive(Debug, Error)]
enum RequestError {
    #[error("Invalid payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error(transparent)]
    Hub(#[from] HubError),

    #[error("Unknown request: {0}")]
    Unknown(String),
}

/// Per-socket state.
struct Session {
    connection_id: String,
    state: Arc<AppState>,
    /// Forwarding task per joined channel.
    forwarders: HashMap<String, JoinHandle<()>>,
    deliveries: mpsc::UnboundedSender<Arc<Delivery>>,
}

impl Session {
    fn forward(&mut self, channel: &str, mut subscription: Subscription) {
        let tx = self.deliveries.clone();
        let handle = tokio::spawn(async move {
            while let Some(delivery) = subscription.recv().await {
                if tx.send(delivery).is_err() {
                    break; // Receiver dropped
                }
            }
        });
        if let Some(previous) = self.forwarders.insert(channel.to_string(), handle) {
            previous.abort();
        }
    }

    fn stop_forwarding(&mut self, channel: &str) {
        if let Some(handle) = self.forwarders.remove(channel) {
            handle.abort();
        }
    }

    async fn handle_request(&mut self, name: &str, payload: Value) -> Result<Value, RequestError> {
        match name {
            JOIN => {
                let info: ChannelInfo = serde_json::from_value(payload)?;
                debug!(connection = %self.connection_id, channel = %info.id(), "Join request");
                let joined = self.state.hub.join(&self.connection_id, info).await?;
                if let Some(subscription) = joined.subscription {
                    self.forward(joined.reply.info.id(), subscription);
                }
                Ok(serde_json::to_value(&joined.reply)?)
            }
            STATE => {
                let ChannelRef { channel } = serde_json::from_value(payload)?;
                if self.state.hub.is_subscribed(&self.connection_id, &channel) {
                    return Ok(self.state.hub.state(&channel)?);
                }
                debug!(connection = %self.connection_id, channel = %channel, "Resuming channel");
                let joined = self.state.hub.resume(&self.connection_id, &channel).await?;
                if let Some(subscription) = joined.subscription {
                    self.forward(&channel, subscription);
                }
                Ok(joined.reply.state)
            }
            other => Err(RequestError::Unknown(other.to_string())),
        }
    }

    fn handle_event(&mut self, name: &str, payload: Value) {
        if name == LEAVE {
            match serde_json::from_value::<ChannelRef>(payload) {
                Ok(ChannelRef { channel }) => {
                    self.stop_forwarding(&channel);
                    if let Err(e) = self.state.hub.leave(&self.connection_id, &channel) {
                        debug!(connection = %self.connection_id, error = %e, "Leave ignored");
                    }
                }
                Err(e) => warn!(connection = %self.connection_id, error = %e, "Malformed leave"),
            }
            return;
        }

        let Some(channel) = channel_id_from_event_name(name) else {
            warn!(connection = %self.connection_id, name = %name, "Unknown event");
            return;
        };
        let result = event_from_payload(payload)
            .map_err(RequestError::from)
            .and_then(|event| {
                self.state
                    .hub
                    .publish(&self.connection_id, channel, event)
                    .map_err(RequestError::from)
            });
        match result {
            Ok(recipients) => {
                debug!(connection = %self.connection_id, channel = %channel, recipients, "Published");
            }
            Err(e) => {
                warn!(connection = %self.connection_id, channel = %channel, error = %e, "Event rejected");
                metrics::record_error("event");
            }
        }
    }
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    // Record connection metrics
    let _metrics_guard = ConnectionMetricsGuard::new();
    let connection_id = next_connection_id();

    debug!(connection = %connection_id, "WebSocket connected");

    // Split the WebSocket
    let (mut sender, mut receiver) = socket.split();

    let heartbeat = &state.config.heartbeat;
    let hello = Frame::hello(
        PROTOCOL_VERSION.major,
        u32::try_from(heartbeat.interval_ms).unwrap_or(u32::MAX),
    );
    if send_frame(&mut sender, &hello).await.is_err() {
        error!(connection = %connection_id, "Failed to send hello frame");
        return;
    }

    let timeout = Duration::from_millis(heartbeat.timeout_ms);
    let mut liveness = tokio::time::interval(Duration::from_millis(
        (heartbeat.timeout_ms / 2).max(100),
    ));
    let mut last_seen = Instant::now();

    // Frames may span several binary messages
    let mut reader = FrameReader::new(state.config.limits.max_message_size);

    // Every joined channel's deliveries are merged into one queue
    let (deliveries, mut delivery_rx) = mpsc::unbounded_channel::<Arc<Delivery>>();
    let mut session = Session {
        connection_id,
        state: Arc::clone(&state),
        forwarders: HashMap::new(),
        deliveries,
    };

    // Message processing loop
    loop {
        tokio::select! {
            biased;

            // Events other sockets published on our channels
            Some(delivery) = delivery_rx.recv() => {
                let frame = match serde_json::to_value(&delivery.event) {
                    Ok(payload) => Frame::event(event_channel_name(&delivery.channel), payload),
                    Err(e) => {
                        warn!(connection = %session.connection_id, error = %e, "Failed to encode event");
                        continue;
                    }
                };
                if send_frame(&mut sender, &frame).await.is_err() {
                    break;
                }
            }

            // Receive from WebSocket
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        last_seen = Instant::now();
                        metrics::record_frame(data.len(), "inbound");
                        reader.push(&data);
                        if let Err(e) = process_frames(&mut reader, &mut session, &mut sender).await {
                            warn!(connection = %session.connection_id, error = %e, "Closing connection");
                            metrics::record_error("frame");
                            break;
                        }
                    }
                    Some(Ok(Message::Text(_))) => {
                        warn!(connection = %session.connection_id, "Text message on a binary protocol, closing connection");
                        metrics::record_error("frame");
                        let _ = sender.send(Message::Close(Some(CloseFrame {
                            code: close_code::UNSUPPORTED,
                            reason: "binary frames only".into(),
                        }))).await;
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        last_seen = Instant::now();
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_seen = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %session.connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %session.connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %session.connection_id, "WebSocket stream ended");
                        break;
                    }
                }
            }

            _ = liveness.tick(), if heartbeat.timeout_ms > 0 => {
                if last_seen.elapsed() > timeout {
                    warn!(connection = %session.connection_id, "Heartbeat timeout");
                    metrics::record_error("timeout");
                    break;
                }
            }
        }
    }

    // Cleanup: abort all forwarding tasks
    for (_, handle) in session.forwarders.drain() {
        handle.abort();
    }

    // Cleanup: unsubscribe from all channels
    state.hub.leave_all(&session.connection_id);

    debug!(connection = %session.connection_id, "WebSocket disconnected");
}

/// Handle every complete frame the reader holds.
async fn process_frames(
    reader: &mut FrameReader,
    session: &mut Session,
    sender: &mut SplitSink<WebSocket, Message>,
) -> Result<()> {
    while let Some(frame) = reader.next_frame()? {
        let start = Instant::now();
        handle_frame(frame, session, sender).await?;
        metrics::record_latency(start.elapsed().as_secs_f64());
    }
    Ok(())
}

/// Handle a decoded frame.
async fn handle_frame(
    frame: Frame,
    session: &mut Session,
    sender: &mut SplitSink<WebSocket, Message>,
) -> Result<()> {
    match frame {
        Frame::Request { id, name, payload } => {
            let reply = match session.handle_request(&name, payload).await {
                Ok(value) => Frame::reply(id, value),
                Err(e) => {
                    warn!(connection = %session.connection_id, request = %name, error = %e, "Request failed");
                    metrics::record_error("request");
                    Frame::reply_error(id, e.to_string())
                }
            };
            send_frame(sender, &reply).await?;
        }

        Frame::Event { name, payload } => session.handle_event(&name, payload),

        Frame::Ping { timestamp } => {
            send_frame(sender, &Frame::pong(timestamp)).await?;
        }

        Frame::Pong { .. } => {}

        other => {
            warn!(
                connection = %session.connection_id,
                frame_type = ?other.frame_type(),
                "Unexpected frame type"
            );
        }
    }

    Ok(())
}

/// Send a frame to the WebSocket.
async fn send_frame(sender: &mut SplitSink<WebSocket, Message>, frame: &Frame) -> Result<()> {
    let data = codec::encode(frame)?;
    metrics::record_frame(data.len(), "outbound");
    sender.send(Message::Binary(data.to_vec())).await?;
    Ok(())
}
