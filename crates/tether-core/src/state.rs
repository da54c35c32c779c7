//! Connectivity state machine.
//!
//! A pure transition function: it takes a signal and returns the next state
//! plus the effects to run. The connection core performs the effects; this
//! module does no I/O, so every transition is unit-testable on its own.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Whether locally emitted events may currently leave the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionState {
    /// Transport reachable and caught up; local events are forwarded.
    Online,
    /// Transport unreachable.
    Offline,
    /// Transport reachable again, but the application has not yet
    /// reconciled with the server. Local events stay local.
    OnlineDisconnected,
}

/// Input to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Deduplicated raw transport connectivity.
    Connectivity(bool),
    /// The application called `reconnect()`.
    Reconnect,
}

/// Side effect requested by a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Publish the store's current value on `disconnected`.
    EmitDisconnected,
    /// Fetch the authoritative state and publish it on `reconnected`.
    FetchServerState,
}

impl ConnectionState {
    /// Apply a signal.
    #[must_use]
    pub fn on_signal(self, signal: Signal) -> (Self, Vec<Effect>) {
        match (self, signal) {
            (Self::Online, Signal::Connectivity(false)) => {
                (Self::Offline, vec![Effect::EmitDisconnected])
            }
            (Self::OnlineDisconnected, Signal::Connectivity(false)) => (Self::Offline, vec![]),
            (Self::Offline, Signal::Connectivity(true)) => {
                (Self::OnlineDisconnected, vec![Effect::FetchServerState])
            }
            (Self::OnlineDisconnected, Signal::Reconnect) => (Self::Online, vec![]),
            (state, _) => (state, vec![]),
        }
    }

    /// Whether local events are relayed to the server in this state.
    #[must_use]
    pub fn forwards_local_events(self) -> bool {
        self == Self::Online
    }

    /// Wire/display spelling of the state.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::OnlineDisconnected => "online-disconnected",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Collapses consecutive equal connectivity readings into one.
#[derive(Debug, Default)]
pub struct DistinctConnectivity {
    last: Option<bool>,
}

impl DistinctConnectivity {
    /// Create a filter that has seen nothing yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a filter that treats `connected` as the last reading.
    #[must_use]
    pub fn starting_from(connected: bool) -> Self {
        Self {
            last: Some(connected),
        }
    }

    /// Returns the signal to feed the machine, or `None` for a repeat.
    pub fn observe(&mut self, connected: bool) -> Option<Signal> {
        if self.last == Some(connected) {
            return None;
        }
        self.last = Some(connected);
        Some(Signal::Connectivity(connected))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_online_to_offline_emits_disconnected() {
        let (state, effects) = ConnectionState::Online.on_signal(Signal::Connectivity(false));
        assert_eq!(state, ConnectionState::Offline);
        assert_eq!(effects, vec![Effect::EmitDisconnected]);
    }

    #[test]
    fn test_online_disconnected_to_offline_is_silent() {
        let (state, effects) =
            ConnectionState::OnlineDisconnected.on_signal(Signal::Connectivity(false));
        assert_eq!(state, ConnectionState::Offline);
        assert!(effects.is_empty());
    }

    #[test]
    fn test_offline_to_online_disconnected_fetches_state() {
        let (state, effects) = ConnectionState::Offline.on_signal(Signal::Connectivity(true));
        assert_eq!(state, ConnectionState::OnlineDisconnected);
        assert_eq!(effects, vec![Effect::FetchServerState]);
    }

    #[test]
    fn test_reconnect_only_from_online_disconnected() {
        let (state, effects) = ConnectionState::OnlineDisconnected.on_signal(Signal::Reconnect);
        assert_eq!(state, ConnectionState::Online);
        assert!(effects.is_empty());

        for from in [ConnectionState::Online, ConnectionState::Offline] {
            assert_eq!(from.on_signal(Signal::Reconnect), (from, vec![]));
        }
    }

    #[test]
    fn test_ignored_signals() {
        assert_eq!(
            ConnectionState::Online.on_signal(Signal::Connectivity(true)),
            (ConnectionState::Online, vec![])
        );
        assert_eq!(
            ConnectionState::Offline.on_signal(Signal::Connectivity(false)),
            (ConnectionState::Offline, vec![])
        );
        assert_eq!(
            ConnectionState::OnlineDisconnected.on_signal(Signal::Connectivity(true)),
            (ConnectionState::OnlineDisconnected, vec![])
        );
    }

    #[test]
    fn test_only_online_forwards() {
        assert!(ConnectionState::Online.forwards_local_events());
        assert!(!ConnectionState::Offline.forwards_local_events());
        assert!(!ConnectionState::OnlineDisconnected.forwards_local_events());
    }

    #[test]
    fn test_state_spelling() {
        assert_eq!(ConnectionState::OnlineDisconnected.to_string(), "online-disconnected");
        assert_eq!(
            serde_json::to_value(ConnectionState::OnlineDisconnected).unwrap(),
            "online-disconnected"
        );
    }

    #[test]
    fn test_distinct_connectivity() {
        let mut distinct = DistinctConnectivity::new();
        assert_eq!(distinct.observe(true), Some(Signal::Connectivity(true)));
        assert_eq!(distinct.observe(true), None);
        assert_eq!(distinct.observe(false), Some(Signal::Connectivity(false)));
        assert_eq!(distinct.observe(false), None);
        assert_eq!(distinct.observe(true), Some(Signal::Connectivity(true)));

        let mut seeded = DistinctConnectivity::starting_from(true);
        assert_eq!(seeded.observe(true), None);
        assert_eq!(seeded.observe(false), Some(Signal::Connectivity(false)));
    }
}
