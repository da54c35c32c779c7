//! Data model shared by every Tether crate.
//!
//! These types cross the wire unchanged, so they live next to the frames
//! that carry them.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the UNIX epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Identity of a logical event stream.
///
/// `id` is the key under which connectors cache and deduplicate connections.
/// The fields are private so an info cannot change once created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelInfo {
    #[serde(rename = "type")]
    kind: String,
    id: String,
    #[serde(default)]
    name: Option<String>,
}

impl ChannelInfo {
    /// Create a channel info without a display name.
    #[must_use]
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
            name: None,
        }
    }

    /// Attach a human-readable name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// The channel type.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The unique channel id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The human-readable name, if any.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

impl fmt::Display for ChannelInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// A single state mutation.
///
/// Only `event_type` is looked at outside of a reducer, and only for logging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event type, e.g. `"add"`.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Creation time in milliseconds since the UNIX epoch.
    pub creation_time: u64,
    /// Application payload.
    #[serde(default)]
    pub payload: Value,
}

impl Event {
    /// Create an event with an empty payload, stamped with the current time.
    #[must_use]
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            creation_time: now_millis(),
            payload: Value::Null,
        }
    }

    /// Attach a payload.
    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Override the creation time.
    #[must_use]
    pub fn at(mut self, creation_time: u64) -> Self {
        self.creation_time = creation_time;
        self
    }
}
