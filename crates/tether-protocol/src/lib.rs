//! # tether-protocol
//!
//! Wire protocol and shared data model for Tether channel synchronization.
//!
//! - [`ChannelInfo`] and [`Event`] - the data every other crate passes around
//! - [`Frame`] - request/reply, fire-and-forget events, keepalives
//! - [`codec`] - MessagePack with a 4-byte length prefix, reassembled by [`FrameReader`]
//!
//! ## Example
//!
//! ```rust
//! use tether_protocol::{codec, event_channel_name, Event, Frame};
//!
//! let event = serde_json::to_value(Event::new("add")).unwrap();
//! let frame = Frame::event(event_channel_name("counter-1"), event);
//!
//! let encoded = codec::encode(&frame).unwrap();
//! assert_eq!(codec::decode(&encoded).unwrap(), frame);
//!
//! // Frames may arrive split across messages.
//! let mut reader = codec::FrameReader::new(64 * 1024);
//! reader.push(&encoded[..3]);
//! assert!(reader.next_frame().unwrap().is_none());
//! reader.push(&encoded[3..]);
//! assert_eq!(reader.next_frame().unwrap(), Some(frame));
//! ```

pub mod codec;
pub mod frames;
pub mod types;
pub mod version;

pub use codec::{decode, encode, FrameReader, ProtocolError};
pub use frames::{
    channel_id_from_event_name, event_channel_name, event_from_payload, ChannelRef, Frame,
    FrameType, JoinReply, CONNECTED, DISCONNECTED, JOIN, LEAVE, STATE,
};
pub use types::{now_millis, ChannelInfo, Event};
pub use version::{Version, PROTOCOL_VERSION};
