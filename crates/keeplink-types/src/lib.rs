//! Core types for the keeplink protocol.
//!
//! This crate defines the data shared between the wire engine and its
//! embedders: connection and listener status, roles, and configuration.
//! It contains no I/O.

pub mod config;
pub mod error;
pub mod status;

pub use config::{load_config, EndpointConfig, ListenerConfig, ProtocolConfig, WireConfig};
pub use error::ConfigError;
pub use status::{ConnectionStatus, ListenerStatus, Role};
