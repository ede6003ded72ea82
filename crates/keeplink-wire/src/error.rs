//! Errors from the wire protocol layer.

use keeplink_types::{ConfigError, ConnectionStatus};
use std::time::Duration;
use thiserror::Error;

/// Coarse classification of a [`WireError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing or invalid construction parameters.
    Configuration,
    /// Dial failure or socket I/O failure.
    Connection,
    /// The peer violated the wire protocol.
    Protocol,
    /// A deadline elapsed.
    Timeout,
    /// The operation is not valid in the endpoint's current status.
    State,
}

/// Errors from the wire protocol layer.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Endpoint not ready: status is {status}")]
    NotReady { status: ConnectionStatus },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Dial to {address} timed out after {elapsed:?}")]
    DialTimeout { address: String, elapsed: Duration },
    #[error("Dial to {address} cancelled")]
    DialCancelled { address: String },
    #[error("Trust token mismatch")]
    TrustMismatch,
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u32, max: u32 },
    #[error("Handshake did not complete within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("Listener closed")]
    ListenerClosed,
}

impl WireError {
    /// Which failure class this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Configuration,
            Self::NotReady { .. } | Self::ListenerClosed => ErrorKind::State,
            Self::Io(_) | Self::ConnectionClosed | Self::DialCancelled { .. } => {
                ErrorKind::Connection
            }
            Self::TrustMismatch | Self::FrameTooLarge { .. } => ErrorKind::Protocol,
            Self::DialTimeout { .. } | Self::HandshakeTimeout(_) => ErrorKind::Timeout,
        }
    }

    /// Whether the peer broke the protocol (as opposed to simply going away).
    pub fn is_protocol_violation(&self) -> bool {
        self.kind() == ErrorKind::Protocol
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(
            WireError::Config(ConfigError::MissingTarget).kind(),
            ErrorKind::Configuration
        );
        assert_eq!(
            WireError::NotReady {
                status: ConnectionStatus::WaitTrust
            }
            .kind(),
            ErrorKind::State
        );
        assert_eq!(WireError::ConnectionClosed.kind(), ErrorKind::Connection);
        assert_eq!(WireError::TrustMismatch.kind(), ErrorKind::Protocol);
        assert_eq!(
            WireError::HandshakeTimeout(Duration::from_secs(5)).kind(),
            ErrorKind::Timeout
        );
        assert!(WireError::FrameTooLarge { size: 10, max: 5 }.is_protocol_violation());
        assert!(!WireError::ConnectionClosed.is_protocol_violation());
    }

    #[test]
    fn test_display() {
        let err = WireError::FrameTooLarge {
            size: 70_000_000,
            max: 67_108_864,
        };
        assert_eq!(
            err.to_string(),
            "Frame too large: 70000000 bytes (max 67108864)"
        );
    }
}
