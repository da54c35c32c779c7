//! WebSocket client transport.
//!
//! This module provides a WebSocket-based transport using tokio-tungstenite.
//! One reader task resolves pending requests and dispatches events to
//! listeners; one writer task owns the sink. Reconnection is manual: call
//! [`WebSocketTransport::connect`] again after a `disconnected` signal.

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::stream::BoxStream;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tether_protocol::{codec, now_millis, Frame, FrameReader, ProtocolError, PROTOCOL_VERSION};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
};
use tracing::{debug, info, trace, warn};

use crate::listeners::{Listeners, DEFAULT_LISTENER_CAPACITY};
use crate::traits::{Transport, TransportError};

/// WebSocket transport configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Server endpoint, e.g. `ws://127.0.0.1:8080/ws`.
    pub url: String,
    /// Largest frame body accepted from the server, in bytes.
    pub max_message_size: usize,
    /// How long to wait for the handshake and for each reply.
    pub request_timeout: Duration,
    /// Payloads buffered per listened name.
    pub listener_capacity: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080/ws".to_string(),
            max_message_size: 64 * 1024, // 64 KB
            request_timeout: Duration::from_secs(10),
            listener_capacity: DEFAULT_LISTENER_CAPACITY,
        }
    }
}

type PendingReply = oneshot::Sender<Result<Value, TransportError>>;

struct Shared {
    connected: AtomicBool,
    next_id: AtomicU64,
    pending: DashMap<u64, PendingReply>,
    listeners: Listeners,
    outgoing: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn send(&self, frame: Frame) -> Result<(), TransportError> {
        let outgoing = lock(&self.outgoing);
        let tx = outgoing.as_ref().ok_or(TransportError::NotConnected)?;
        tx.send(frame).map_err(|_| TransportError::ConnectionClosed)
    }

    fn handle(&self, frame: Frame) {
        match frame {
            Frame::Reply { id, error, payload } => {
                let Some((_, reply)) = self.pending.remove(&id) else {
                    trace!(id, "Reply for unknown request");
                    return;
                };
                let result = match error {
                    Some(reason) => Err(TransportError::Rejected(reason)),
                    None => Ok(payload),
                };
                let _ = reply.send(result);
            }
            Frame::Event { name, payload } => {
                self.listeners.publish(&name, payload);
            }
            Frame::Ping { timestamp } => {
                if let Err(e) = self.send(Frame::pong(timestamp)) {
                    debug!(error = %e, "Failed to answer ping");
                }
            }
            Frame::Pong { timestamp } => {
                if let Some(sent) = timestamp {
                    trace!(rtt_ms = now_millis().saturating_sub(sent), "Pong");
                }
            }
            Frame::Hello { version, .. } => {
                debug!(version, "Ignoring repeated hello");
            }
            Frame::Request { name, .. } => {
                warn!(name = %name, "Ignoring request from server");
            }
        }
    }

    /// Returns whether this call performed the transition.
    fn mark_disconnected(&self) -> bool {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return false;
        }
        *lock(&self.outgoing) = None;
        // Dropping the senders fails every in-flight request.
        self.pending.clear();
        self.listeners.publish_connectivity(false);
        true
    }
}

/// WebSocket transport.
pub struct WebSocketTransport {
    config: WebSocketConfig,
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WebSocketTransport {
    /// Create a disconnected transport.
    #[must_use]
    pub fn new(config: WebSocketConfig) -> Self {
        let listeners = Listeners::new(config.listener_capacity);
        Self {
            config,
            shared: Arc::new(Shared {
                connected: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
                pending: DashMap::new(),
                listeners,
                outgoing: Mutex::new(None),
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Create a transport for `url` and connect it.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or the handshake fails.
    pub async fn connect_to(url: impl Into<String>) -> Result<Self, TransportError> {
        let transport = Self::new(WebSocketConfig {
            url: url.into(),
            ..Default::default()
        });
        transport.connect().await?;
        Ok(transport)
    }

    /// The transport configuration.
    #[must_use]
    pub fn config(&self) -> &WebSocketConfig {
        &self.config
    }

    /// Open the socket and wait for the server's `hello`.
    ///
    /// Raises `connected` on success. Any previous socket is dropped first.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be opened, the handshake times
    /// out, or the server speaks an incompatible protocol version.
    pub async fn connect(&self) -> Result<(), TransportError> {
        self.close();

        let url = self.config.url.as_str();
        let (ws, _) = timeout(self.config.request_timeout, connect_async(url))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        debug!(url, "WebSocket handshake completed");

        let (sink, mut stream) = ws.split();
        let mut reader = FrameReader::new(self.config.max_message_size);
        let hello = timeout(
            self.config.request_timeout,
            read_frame(&mut stream, &mut reader),
        )
        .await
        .map_err(|_| TransportError::Timeout)??;

        let heartbeat = match hello {
            Some(Frame::Hello { version, heartbeat }) => {
                PROTOCOL_VERSION.accept_peer(version)?;
                heartbeat
            }
            Some(other) => {
                return Err(ProtocolError::Invalid(format!(
                    "expected hello, got {:?}",
                    other.frame_type()
                ))
                .into());
            }
            None => return Err(TransportError::ConnectionClosed),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.shared.outgoing) = Some(tx);
        self.shared.connected.store(true, Ordering::SeqCst);

        let mut tasks = vec![
            tokio::spawn(write_loop(sink, rx)),
            tokio::spawn(read_loop(Arc::clone(&self.shared), stream, reader)),
        ];
        if heartbeat > 0 {
            let period = Duration::from_millis(u64::from(heartbeat));
            tasks.push(tokio::spawn(heartbeat_loop(
                Arc::clone(&self.shared),
                period,
            )));
        }
        *lock(&self.tasks) = tasks;

        info!(url, heartbeat, "Connected");
        self.shared.listeners.publish_connectivity(true);
        Ok(())
    }

    /// Close the socket. Raises `disconnected` if it was open.
    pub fn close(&self) {
        if self.shared.mark_disconnected() {
            info!(url = %self.config.url, "Disconnected");
        }
        // The writer sends a close frame once its queue is dropped; the
        // remaining tasks are stale.
        for task in lock(&self.tasks).drain(..).skip(1) {
            task.abort();
        }
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

impl std::fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("url", &self.config.url)
            .field("connected", &self.shared.connected.load(Ordering::SeqCst))
            .field("pending", &self.shared.pending.len())
            .finish()
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn request(&self, name: &str, payload: Value) -> Result<Value, TransportError> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.pending.insert(id, tx);

        if let Err(e) = self.shared.send(Frame::request(id, name, payload)) {
            self.shared.pending.remove(&id);
            return Err(e);
        }

        match timeout(self.config.request_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(TransportError::ConnectionClosed),
            Err(_) => {
                self.shared.pending.remove(&id);
                warn!(name, id, "Request timed out");
                Err(TransportError::Timeout)
            }
        }
    }

    fn emit(&self, name: &str, payload: Value) -> Result<(), TransportError> {
        self.shared.send(Frame::event(name, payload))
    }

    fn listen(&self, name: &str) -> BoxStream<'static, Value> {
        self.shared.listeners.subscribe(name)
    }

    fn connectivity(&self) -> BoxStream<'static, bool> {
        self.shared.listeners.connectivity()
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}

/// Read the next complete frame, buffering partial data.
///
/// Returns `Ok(None)` once the socket is closed.
async fn read_frame<S>(
    stream: &mut S,
    reader: &mut FrameReader,
) -> Result<Option<Frame>, TransportError>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        if let Some(frame) = reader.next_frame()? {
            return Ok(Some(frame));
        }
        match stream.next().await {
            Some(Ok(Message::Binary(data))) => reader.push(&data),
            Some(Ok(Message::Text(_))) => {
                return Err(ProtocolError::Invalid("text message on a binary stream".into()).into());
            }
            Some(Ok(Message::Close(_))) => {
                debug!("Received close frame");
                return Ok(None);
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
            Some(Err(WsError::ConnectionClosed)) | None => {
                debug!("WebSocket stream ended");
                return Ok(None);
            }
            Some(Err(e)) => return Err(TransportError::ReceiveFailed(e.to_string())),
        }
    }
}

async fn read_loop<S>(shared: Arc<Shared>, mut stream: S, mut reader: FrameReader)
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        match read_frame(&mut stream, &mut reader).await {
            Ok(Some(frame)) => shared.handle(frame),
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "WebSocket receive failed");
                break;
            }
        }
    }
    if shared.mark_disconnected() {
        info!("Connection lost");
    }
}

async fn write_loop<S>(mut sink: S, mut outgoing: mpsc::UnboundedReceiver<Frame>)
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    while let Some(frame) = outgoing.recv().await {
        let data = match codec::encode(&frame) {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "Failed to encode frame");
                continue;
            }
        };
        if let Err(e) = sink.send(Message::Binary(data.to_vec())).await {
            warn!(error = %e, "WebSocket send failed");
            break;
        }
    }
    let _ = sink.close().await;
}

async fn heartbeat_loop(shared: Arc<Shared>, period: Duration) {
    let mut ticks = interval_at(Instant::now() + period, period);
    loop {
        ticks.tick().await;
        let ping = Frame::Ping {
            timestamp: Some(now_millis()),
        };
        if shared.send(ping).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tether_protocol::{CONNECTED, DISCONNECTED};
    use tokio::net::TcpListener;
    use tokio_tungstenite::{accept_async, WebSocketStream};

    const WAIT: Duration = Duration::from_secs(2);

    async fn send(ws: &mut WebSocketStream<tokio::net::TcpStream>, frame: Frame) {
        let data = codec::encode(&frame).unwrap();
        ws.send(Message::Binary(data.to_vec())).await.unwrap();
    }

    /// Minimal server: answers `join`, echoes events, drops the socket on `drop`.
    async fn spawn_server(version: u8) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut ws = accept_async(stream).await.unwrap();
                    send(&mut ws, Frame::hello(version, 0)).await;
                    while let Some(Ok(Message::Binary(data))) = ws.next().await {
                        match codec::decode(&data).unwrap() {
                            Frame::Request { id, name, payload } => match name.as_str() {
                                "join" => {
                                    let reply = json!({ "info": payload, "state": 0 });
                                    send(&mut ws, Frame::reply(id, reply)).await;
                                }
                                "drop" => return,
                                _ => send(&mut ws, Frame::reply_error(id, "unknown")).await,
                            },
                            Frame::Event { name, payload } => {
                                send(&mut ws, Frame::event(name, payload)).await;
                            }
                            _ => {}
                        }
                    }
                });
            }
        });
        format!("ws://{addr}")
    }

    fn transport(url: String) -> WebSocketTransport {
        WebSocketTransport::new(WebSocketConfig {
            url,
            request_timeout: WAIT,
            ..Default::default()
        })
    }

    #[test]
    fn test_websocket_config_default() {
        let config = WebSocketConfig::default();
        assert_eq!(config.url, "ws://127.0.0.1:8080/ws");
        assert_eq!(config.max_message_size, 64 * 1024);
    }

    #[tokio::test]
    async fn test_request_before_connect_fails() {
        let transport = WebSocketTransport::new(WebSocketConfig::default());
        assert!(!transport.is_connected());
        assert!(matches!(
            transport.request("join", Value::Null).await,
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_request_reply_and_events() {
        let transport = transport(spawn_server(PROTOCOL_VERSION.major).await);
        let mut connected = transport.listen(CONNECTED);
        transport.connect().await.unwrap();
        assert!(transport.is_connected());
        assert_eq!(connected.next().await, Some(Value::Null));

        let reply = transport
            .request("join", json!({ "type": "room", "id": "r-1" }))
            .await
            .unwrap();
        assert_eq!(reply["info"]["id"], "r-1");

        assert!(matches!(
            transport.request("nope", Value::Null).await,
            Err(TransportError::Rejected(reason)) if reason == "unknown"
        ));

        let mut events = transport.listen("events:r-1");
        transport.emit("events:r-1", json!({ "type": "add" })).unwrap();
        let echoed = timeout(WAIT, events.next()).await.unwrap();
        assert_eq!(echoed, Some(json!({ "type": "add" })));
    }

    #[tokio::test]
    async fn test_incompatible_server_is_refused() {
        let transport = transport(spawn_server(PROTOCOL_VERSION.major + 1).await);
        assert!(matches!(
            transport.connect().await,
            Err(TransportError::Protocol(ProtocolError::Invalid(_)))
        ));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_lost_socket_fails_pending_and_signals() {
        let transport = transport(spawn_server(PROTOCOL_VERSION.major).await);
        transport.connect().await.unwrap();
        let mut disconnected = transport.listen(DISCONNECTED);

        assert!(matches!(
            transport.request("drop", Value::Null).await,
            Err(TransportError::ConnectionClosed)
        ));
        assert_eq!(
            timeout(WAIT, disconnected.next()).await.unwrap(),
            Some(Value::Null)
        );
        assert!(!transport.is_connected());

        // Manual reconnection.
        let mut connectivity = transport.connectivity();
        transport.connect().await.unwrap();
        assert!(transport.is_connected());
        assert_eq!(timeout(WAIT, connectivity.next()).await.unwrap(), Some(true));
    }

    #[tokio::test]
    async fn test_oversized_frame_from_server_drops_connection() {
        let transport = WebSocketTransport::new(WebSocketConfig {
            url: spawn_server(PROTOCOL_VERSION.major).await,
            request_timeout: WAIT,
            max_message_size: 256,
            ..Default::default()
        });
        transport.connect().await.unwrap();
        let mut disconnected = transport.listen(DISCONNECTED);
        let mut events = transport.listen("events:r-1");

        transport.emit("events:r-1", json!({ "type": "small" })).unwrap();
        assert_eq!(
            timeout(WAIT, events.next()).await.unwrap(),
            Some(json!({ "type": "small" }))
        );

        // The echo comes back larger than this client accepts.
        let big = json!({ "type": "big", "data": "x".repeat(1024) });
        transport.emit("events:r-1", big).unwrap();
        assert_eq!(
            timeout(WAIT, disconnected.next()).await.unwrap(),
            Some(Value::Null)
        );
        assert!(!transport.is_connected());
    }
}
