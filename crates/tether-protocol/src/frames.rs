//! Frame types for the Tether protocol.
//!
//! The network connector speaks a small named-event protocol: request/reply
//! calls, fire-and-forget events, and keepalives. Each frame is serialized
//! using MessagePack.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{ChannelInfo, Event};

/// Name of the join request.
pub const JOIN: &str = "join";

/// Name of the leave event.
pub const LEAVE: &str = "leave";

/// Name of the server-state request used on reconnection.
pub const STATE: &str = "state";

/// Lifecycle signal raised by a transport once it is reachable.
pub const CONNECTED: &str = "connected";

/// Lifecycle signal raised by a transport once it is lost.
pub const DISCONNECTED: &str = "disconnected";

/// Prefix of per-channel event names.
pub const EVENTS_PREFIX: &str = "events:";

/// Name of the event stream for a (confirmed) channel id.
#[must_use]
pub fn event_channel_name(channel_id: &str) -> String {
    format!("{EVENTS_PREFIX}{channel_id}")
}

/// Extract the channel id from a per-channel event name.
#[must_use]
pub fn channel_id_from_event_name(name: &str) -> Option<&str> {
    name.strip_prefix(EVENTS_PREFIX)
}

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum FrameType {
    Request = 0x01,
    Reply = 0x02,
    Event = 0x03,
    Ping = 0x04,
    Pong = 0x05,
    Hello = 0x06,
}

impl From<FrameType> for u8 {
    fn from(ft: FrameType) -> u8 {
        ft as u8
    }
}

impl TryFrom<u8> for FrameType {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(FrameType::Request),
            0x02 => Ok(FrameType::Reply),
            0x03 => Ok(FrameType::Event),
            0x04 => Ok(FrameType::Ping),
            0x05 => Ok(FrameType::Pong),
            0x06 => Ok(FrameType::Hello),
            _ => Err("Invalid frame type"),
        }
    }
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// A call that expects exactly one reply.
    #[serde(rename = "request")]
    Request {
        /// Correlation id, echoed by the reply.
        id: u64,
        /// Call name, e.g. `join`.
        name: String,
        /// Call arguments.
        payload: Value,
    },

    /// Reply to a request.
    #[serde(rename = "reply")]
    Reply {
        /// Id of the request being answered.
        id: u64,
        /// Failure reason; `None` on success.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        /// Reply value (null on failure).
        #[serde(default)]
        payload: Value,
    },

    /// A fire-and-forget named event.
    #[serde(rename = "event")]
    Event {
        /// Event name, e.g. `events:room-1` or `leave`.
        name: String,
        /// Event payload.
        payload: Value,
    },

    /// Keepalive ping.
    #[serde(rename = "ping")]
    Ping {
        /// Optional timestamp.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Keepalive pong.
    #[serde(rename = "pong")]
    Pong {
        /// Echoed timestamp from ping.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Sent by the server right after the socket is upgraded.
    #[serde(rename = "hello")]
    Hello {
        /// Protocol major version.
        version: u8,
        /// Recommended heartbeat interval in milliseconds.
        heartbeat: u32,
    },
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Request { .. } => FrameType::Request,
            Frame::Reply { .. } => FrameType::Reply,
            Frame::Event { .. } => FrameType::Event,
            Frame::Ping { .. } => FrameType::Ping,
            Frame::Pong { .. } => FrameType::Pong,
            Frame::Hello { .. } => FrameType::Hello,
        }
    }

    /// Create a new Request frame.
    #[must_use]
    pub fn request(id: u64, name: impl Into<String>, payload: Value) -> Self {
        Frame::Request {
            id,
            name: name.into(),
            payload,
        }
    }

    /// Create a successful Reply frame.
    #[must_use]
    pub fn reply(id: u64, payload: Value) -> Self {
        Frame::Reply {
            id,
            error: None,
            payload,
        }
    }

    /// Create a failed Reply frame.
    #[must_use]
    pub fn reply_error(id: u64, error: impl Into<String>) -> Self {
        Frame::Reply {
            id,
            error: Some(error.into()),
            payload: Value::Null,
        }
    }

    /// Create a new Event frame.
    #[must_use]
    pub fn event(name: impl Into<String>, payload: Value) -> Self {
        Frame::Event {
            name: name.into(),
            payload,
        }
    }

    /// Create a new Ping frame.
    #[must_use]
    pub fn ping() -> Self {
        Frame::Ping { timestamp: None }
    }

    /// Create a new Pong frame.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        Frame::Pong { timestamp }
    }

    /// Create a new Hello frame.
    #[must_use]
    pub fn hello(version: u8, heartbeat: u32) -> Self {
        Frame::Hello { version, heartbeat }
    }
}

/// Payload of a successful join reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinReply {
    /// Confirmed, possibly renamed channel.
    pub info: ChannelInfo,
    /// Authoritative initial state.
    pub state: Value,
}

/// Payload naming a single channel (`leave`, `state`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRef {
    /// Confirmed channel id.
    pub channel: String,
}

impl ChannelRef {
    /// Create a channel reference.
    #[must_use]
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
        }
    }
}

/// Decode an [`Event`] carried by an event frame payload.
///
/// # Errors
///
/// Returns an error if the payload is not a valid event.
pub fn event_from_payload(payload: Value) -> Result<Event, serde_json::Error> {
    serde_json::from_value(payload)
}
