//! keeplink wire protocol — framed TCP connections with a trust handshake.
//!
//! Frames are a 4-byte big-endian length followed by an opaque payload; a
//! zero length is a keepalive. Before any frame flows, the two sides swap a
//! shared trust token and the passive side assigns a connection ID.
//!
//! ## Architecture
//!
//! - **Endpoint**: one connection, active (dialed) or passive (accepted)
//! - **HeartbeatMonitor**: per-connection idle clock driving keepalives and idle closes
//! - **Listener**: accepts sockets and spawns passive endpoints
//! - **Registry**: connection ID to endpoint map with `send_all`/`close_all` fan-out
//! - **Observers**: connect, close, send and receive callbacks

pub mod codec;
pub mod endpoint;
pub mod error;
pub mod handshake;
pub mod heartbeat;
pub mod id;
pub mod listener;
pub mod observer;
pub mod registry;

pub use codec::FrameCodec;
pub use endpoint::{Endpoint, EndpointBuilder};
pub use error::{ErrorKind, WireError};
pub use heartbeat::HeartbeatMonitor;
pub use id::IdGenerator;
pub use listener::{Listener, ListenerBuilder};
pub use observer::Observers;
pub use registry::{FanOut, Registry, RegistryEntry};

pub use keeplink_types::{
    ConnectionStatus, EndpointConfig, ListenerConfig, ListenerStatus, ProtocolConfig, Role,
};
