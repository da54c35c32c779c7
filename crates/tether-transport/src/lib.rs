//! # tether-transport
//!
//! Transports and the network connector for Tether.
//!
//! This crate provides:
//!
//! - **Transport** - named-event request/reply, emit and listen
//! - **NetworkConnector** - joins channels hosted by a remote server over any transport
//! - **WebSocket** - client transport speaking the Tether wire protocol
//! - **MockTransport** - scripted transport for tests
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tether_core::{Channel, ChannelInfo, ReducingStateStore, SyncChannel};
//! use tether_transport::{NetworkConnector, WebSocketTransport};
//!
//! let transport = Arc::new(WebSocketTransport::connect_to("ws://127.0.0.1:8080/ws").await?);
//! let channel = Channel::new(
//!     ChannelInfo::new("counter", "c-1"),
//!     Arc::new(NetworkConnector::new(transport)),
//!     Arc::new(ReducingStateStore::new(0i64, counter)),
//! );
//! let connection = channel.subscribe().await?;
//! ```

pub mod connector;
pub mod listeners;
pub mod mock;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use connector::NetworkConnector;
pub use listeners::Listeners;
pub use mock::MockTransport;
pub use traits::{Transport, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConfig, WebSocketTransport};
