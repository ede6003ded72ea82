//! Protocol, endpoint and listener configuration.
//!
//! Every struct implements `Default` with the protocol's stock values and
//! deserializes from TOML with missing fields filled from those defaults:
//!
//! ```toml
//! [endpoint]
//! heartbeat_interval_ms = 16000
//!
//! [listener]
//! bind_address = "0.0.0.0"
//! bind_port = 7000
//!
//! [listener.protocol]
//! trust_token = "hello ztcp"
//! ```

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default trust token exchanged during the handshake.
pub const DEFAULT_TRUST_TOKEN: &str = "hello ztcp";
/// Default time allowed for the trust handshake.
pub const DEFAULT_WAIT_TRUST_TIMEOUT_MS: u64 = 5_000;
/// Default heartbeat clock tick.
pub const DEFAULT_HEARTBEAT_PRECISION_MS: u64 = 1_000;
/// Default ceiling on a declared frame length (64 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 1024 * 1024 * 64;
/// Default bound on a single socket read (64 KiB).
pub const DEFAULT_READ_CHUNK_SIZE: usize = 1024 * 64;
/// Default idle interval for dialed endpoints (recommended 2/5 of the
/// listener's check interval).
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 16_000;
/// Default idle interval after which a listener drops a silent peer.
pub const DEFAULT_HEARTBEAT_CHECK_INTERVAL_MS: u64 = 40_000;
/// Default registry pre-allocation.
pub const DEFAULT_INITIAL_CAPACITY: usize = 1000;

/// Settings both ends of a connection must agree on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Byte sequence both sides exchange and compare during the handshake.
    pub trust_token: String,
    /// Time allowed for the whole handshake.
    pub wait_trust_timeout_ms: u64,
    /// Heartbeat clock tick.
    pub heartbeat_precision_ms: u64,
    /// Declared frame lengths at or above this are rejected.
    pub max_frame_size: u32,
    /// Upper bound on a single read while filling a frame.
    pub read_chunk_size: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            trust_token: DEFAULT_TRUST_TOKEN.to_string(),
            wait_trust_timeout_ms: DEFAULT_WAIT_TRUST_TIMEOUT_MS,
            heartbeat_precision_ms: DEFAULT_HEARTBEAT_PRECISION_MS,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
        }
    }
}

impl ProtocolConfig {
    /// The trust token as raw bytes.
    pub fn trust_token_bytes(&self) -> &[u8] {
        self.trust_token.as_bytes()
    }

    /// How long the handshake may take.
    pub fn wait_trust_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_trust_timeout_ms)
    }

    /// Heartbeat clock tick.
    pub fn heartbeat_precision(&self) -> Duration {
        Duration::from_millis(self.heartbeat_precision_ms)
    }

    /// Reject values the protocol cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.trust_token.is_empty() {
            return Err(ConfigError::Invalid {
                field: "protocol.trust_token",
                reason: "must not be empty".into(),
            });
        }
        if self.wait_trust_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "protocol.wait_trust_timeout_ms",
                reason: "must be greater than zero".into(),
            });
        }
        if self.heartbeat_precision_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "protocol.heartbeat_precision_ms",
                reason: "must be greater than zero".into(),
            });
        }
        if self.max_frame_size == 0 {
            return Err(ConfigError::Invalid {
                field: "protocol.max_frame_size",
                reason: "must be greater than zero".into(),
            });
        }
        if self.read_chunk_size == 0 {
            return Err(ConfigError::Invalid {
                field: "protocol.read_chunk_size",
                reason: "must be greater than zero".into(),
            });
        }
        Ok(())
    }
}

/// Configuration for a single endpoint (typically a dialing client).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Idle time after which the heartbeat fires.
    pub heartbeat_interval_ms: u64,
    /// Shared protocol settings.
    pub protocol: ProtocolConfig,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            protocol: ProtocolConfig::default(),
        }
    }
}

impl EndpointConfig {
    /// Idle time before the heartbeat action fires.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Reject values an endpoint cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "endpoint.heartbeat_interval_ms",
                reason: "must be greater than zero".into(),
            });
        }
        self.protocol.validate()
    }
}

/// Configuration for a listener and the passive endpoints it spawns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Interface to bind.
    pub bind_address: String,
    /// Port to bind; 0 lets the OS pick.
    pub bind_port: u16,
    /// Registry pre-allocation.
    pub initial_capacity: usize,
    /// Idle time after which an accepted connection is dropped.
    pub heartbeat_check_interval_ms: u64,
    /// Shared protocol settings.
    pub protocol: ProtocolConfig,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            bind_port: 0,
            initial_capacity: DEFAULT_INITIAL_CAPACITY,
            heartbeat_check_interval_ms: DEFAULT_HEARTBEAT_CHECK_INTERVAL_MS,
            protocol: ProtocolConfig::default(),
        }
    }
}

impl ListenerConfig {
    /// Idle time before an accepted connection is closed.
    pub fn heartbeat_check_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_check_interval_ms)
    }

    /// `bind_address:bind_port`, suitable for `TcpListener::bind`.
    pub fn bind_target(&self) -> String {
        format!("{}:{}", self.bind_address, self.bind_port)
    }

    /// The endpoint configuration handed to each accepted connection.
    pub fn endpoint_config(&self) -> EndpointConfig {
        EndpointConfig {
            heartbeat_interval_ms: self.heartbeat_check_interval_ms,
            protocol: self.protocol.clone(),
        }
    }

    /// Reject values a listener cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bind_address.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "listener.bind_address",
                reason: "must not be empty".into(),
            });
        }
        if self.heartbeat_check_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "listener.heartbeat_check_interval_ms",
                reason: "must be greater than zero".into(),
            });
        }
        self.protocol.validate()
    }
}

/// A whole configuration document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WireConfig {
    pub endpoint: EndpointConfig,
    pub listener: ListenerConfig,
}

impl WireConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: WireConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate both sections.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.endpoint.validate()?;
        self.listener.validate()
    }
}

/// Load and validate a configuration file.
pub fn load_config(path: &Path) -> Result<WireConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    WireConfig::from_toml_str(&contents)
}
