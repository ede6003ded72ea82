//! Lifecycle status and role identifiers.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a single connection endpoint.
///
/// Transitions only move forward:
///
/// ```text
/// Connecting ──dial ok──▶ WaitTrust ──handshake ok──▶ Connected
///     │                      │                           │
///     └──dial failed─────────┴──handshake failed─────────┴──▶ Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ConnectionStatus {
    /// Outbound dial in progress.
    Connecting = 0,
    /// Socket established, trust handshake running.
    WaitTrust = 1,
    /// Handshake complete; frames may flow.
    Connected = 2,
    /// Terminal.
    Closed = 3,
}

impl ConnectionStatus {
    /// Decode the `u8` representation used for atomic storage.
    ///
    /// Unknown values decode as `Closed`.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::WaitTrust,
            2 => Self::Connected,
            _ => Self::Closed,
        }
    }

    /// Whether this is the terminal state.
    pub fn is_terminal(self) -> bool {
        self == Self::Closed
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::WaitTrust => write!(f, "wait_trust"),
            Self::Connected => write!(f, "connected"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Lifecycle status of a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ListenerStatus {
    /// Accepting new connections.
    Listening = 0,
    /// Socket released; no more accepts.
    Closed = 1,
}

impl ListenerStatus {
    /// Decode the `u8` representation used for atomic storage.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Listening,
            _ => Self::Closed,
        }
    }
}

impl std::fmt::Display for ListenerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Listening => write!(f, "listening"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Which side of the handshake an endpoint plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Dialed out; sends the trust token first and receives its ID.
    Active,
    /// Accepted by a listener; verifies the peer token and assigns the ID.
    Passive,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Passive => write!(f, "passive"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_u8_roundtrip() {
        for status in [
            ConnectionStatus::Connecting,
            ConnectionStatus::WaitTrust,
            ConnectionStatus::Connected,
            ConnectionStatus::Closed,
        ] {
            assert_eq!(ConnectionStatus::from_u8(status as u8), status);
        }
        assert_eq!(ConnectionStatus::from_u8(200), ConnectionStatus::Closed);
    }

    #[test]
    fn test_status_ordering_is_forward() {
        assert!(ConnectionStatus::Connecting < ConnectionStatus::WaitTrust);
        assert!(ConnectionStatus::WaitTrust < ConnectionStatus::Connected);
        assert!(ConnectionStatus::Connected < ConnectionStatus::Closed);
        assert!(ConnectionStatus::Closed.is_terminal());
    }

    #[test]
    fn test_display() {
        assert_eq!(ConnectionStatus::WaitTrust.to_string(), "wait_trust");
        assert_eq!(ListenerStatus::Listening.to_string(), "listening");
        assert_eq!(Role::Passive.to_string(), "passive");
    }
}
