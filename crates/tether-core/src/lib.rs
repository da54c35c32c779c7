//! # tether-core
//!
//! Transport-agnostic channel synchronization.
//!
//! An application keeps a locally owned state store consistent with a remote
//! authority. This crate provides the pieces that do not depend on any
//! particular transport:
//!
//! - **Event / Reducer** - the shape of a mutation and the fold that applies it
//! - **StateStore** - owner of a channel's current value
//! - **Channel / ChannelConnector** - what applications subscribe through
//! - **ChannelConnection** - the synchronization core: one ordered event bus,
//!   the connectivity state machine, and one-shot teardown
//! - **MemoryConnector** - in-process connector sharing one connection per id
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   subscribe   ┌──────────────────┐   hooks   ┌────────────────────┐
//! │   Channel   │──────────────▶│ ChannelConnector │──────────▶│ ConnectionBuilder  │
//! └─────────────┘               └──────────────────┘           └─────────┬──────────┘
//!                                                                        │ build
//!                                                                        ▼
//!                               ┌──────────────────┐  process  ┌────────────────────┐
//!                               │    StateStore    │◀──────────│ ChannelConnection  │
//!                               └──────────────────┘           └────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use tether_core::{
//!     Channel, ChannelInfo, Event, MemoryConnector, ReducingStateStore, StateStore, SyncChannel,
//! };
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let counter = |state: &i64, event: &Event| match event.event_type.as_str() {
//!     "add" => state + 1,
//!     "subtract" => state - 1,
//!     _ => *state,
//! };
//! let store: Arc<dyn StateStore<i64>> = Arc::new(ReducingStateStore::new(0, counter));
//! let channel = Channel::new(
//!     ChannelInfo::new("counter", "c-1"),
//!     Arc::new(MemoryConnector::new()),
//!     store,
//! );
//!
//! let connection = channel.subscribe().await.unwrap();
//! connection.emit(Event::new("add"));
//! assert_eq!(connection.store().state(), 1);
//! # }
//! ```

pub mod channel;
pub mod connection;
pub mod event;
pub mod memory;
pub mod state;
pub mod store;
pub mod stream;

pub use channel::{
    validate_channel_id, Channel, ChannelConnectionRequest, ChannelConnector, SyncChannel,
};
pub use connection::{ChannelConnection, ConnectionBuilder, ConnectionError, ServerStateFuture};
pub use event::{fold_events, Event, Reducer};
pub use memory::MemoryConnector;
pub use state::{ConnectionState, Effect, Signal};
pub use store::{ReducingStateStore, ReducingStoreFactory, StateStore, StateStoreFactory};
pub use tether_protocol::ChannelInfo;
