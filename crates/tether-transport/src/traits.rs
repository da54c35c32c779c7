//! Transport abstraction traits for Tether.
//!
//! A transport moves named JSON payloads between a client and the server.
//! Three interaction styles cover everything the network connector needs:
//!
//! - `request` - a call that resolves to exactly one reply
//! - `emit` - fire-and-forget
//! - `listen` - every payload that arrives under a name
//!
//! Transports also raise the lifecycle signals
//! [`CONNECTED`](tether_protocol::CONNECTED) and
//! [`DISCONNECTED`](tether_protocol::DISCONNECTED) with a null payload, and
//! report the same changes, in order, through `connectivity`.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde_json::Value;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The transport is not connected.
    #[error("Not connected")]
    NotConnected,

    /// A request got no reply in time.
    #[error("Request timed out")]
    Timeout,

    /// The peer answered a request with an error.
    #[error("Request rejected: {0}")]
    Rejected(String),

    /// Failed to establish the connection.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] tether_protocol::ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// A named-event transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and wait for its reply.
    ///
    /// # Errors
    ///
    /// [`TransportError::Rejected`] carries the reason when the peer answered
    /// with an error; other variants mean no reply was obtained.
    async fn request(&self, name: &str, payload: Value) -> Result<Value, TransportError>;

    /// Send a fire-and-forget event.
    ///
    /// # Errors
    ///
    /// Returns an error if the event could not be queued for sending.
    fn emit(&self, name: &str, payload: Value) -> Result<(), TransportError>;

    /// Stream every payload received under `name` from now on.
    fn listen(&self, name: &str) -> BoxStream<'static, Value>;

    /// Stream every connectivity change from now on, in the order it happened.
    fn connectivity(&self) -> BoxStream<'static, bool>;

    /// Whether the transport is currently connected.
    fn is_connected(&self) -> bool;

    /// Get the transport name (e.g., "websocket", "mock").
    fn name(&self) -> &'static str;
}
