//! Endpoint — one connection's lifecycle, send path and receive loop.
//!
//! An [`Endpoint`] is built either actively (dial out to an address) or
//! passively (wrap a socket a listener accepted). Both paths run the trust
//! handshake, then start a heartbeat monitor and a receive loop:
//!
//! ```text
//! Connecting ──dial ok──▶ WaitTrust ──handshake ok──▶ Connected ──▶ Closed
//!      └─dial failed──▶ Closed   └─handshake failed/timeout──▶ Closed
//! ```
//!
//! Status lives in a single atomic. Forward transitions are compare-and-swap;
//! entering `Closed` is one atomic swap, so close observers fire exactly once
//! no matter how many tasks race to close.
//!
//! On heartbeat timeout a passive endpoint closes the connection, while an
//! active endpoint sends a zero-length keepalive frame.

use crate::codec::{self, FrameCodec};
use crate::error::WireError;
use crate::handshake::{self, HandshakeSide};
use crate::heartbeat::HeartbeatMonitor;
use crate::id::IdGenerator;
use crate::observer::Observers;

use keeplink_types::{ConfigError, ConnectionStatus, EndpointConfig, Role};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// Parameters for an outbound connection.
#[derive(Debug)]
struct DialTarget {
    address: String,
    bind_port: Option<u16>,
    deadline: Option<Duration>,
    cancel: Option<watch::Receiver<bool>>,
}

/// Builder for [`Endpoint`].
///
/// Exactly one of [`passive`](Self::passive) or [`dial`](Self::dial) must be
/// set before [`build`](Self::build).
#[derive(Debug, Default)]
pub struct EndpointBuilder {
    config: EndpointConfig,
    observers: Observers,
    passive: Option<(TcpStream, Arc<IdGenerator>)>,
    dial_address: Option<String>,
    bind_port: Option<u16>,
    dial_deadline: Option<Duration>,
    cancel: Option<watch::Receiver<bool>>,
}

impl EndpointBuilder {
    /// Create a builder with default config and no observers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Heartbeat interval and protocol settings.
    pub fn config(mut self, config: EndpointConfig) -> Self {
        self.config = config;
        self
    }

    /// Observers notified over the endpoint's lifetime.
    pub fn observers(mut self, observers: Observers) -> Self {
        self.observers = observers;
        self
    }

    /// Wrap an accepted socket; connection IDs are drawn from `ids`.
    pub fn passive(mut self, stream: TcpStream, ids: Arc<IdGenerator>) -> Self {
        self.passive = Some((stream, ids));
        self
    }

    /// Dial `address` (anything `tokio::net::lookup_host` accepts).
    pub fn dial(mut self, address: impl Into<String>) -> Self {
        self.dial_address = Some(address.into());
        self
    }

    /// Bind the outbound socket to this local port before dialing.
    pub fn bind_port(mut self, port: u16) -> Self {
        self.bind_port = Some(port);
        self
    }

    /// Give up dialing after `deadline`.
    pub fn dial_deadline(mut self, deadline: Duration) -> Self {
        self.dial_deadline = Some(deadline);
        self
    }

    /// Abort the dial once `cancel` observes `true`.
    pub fn cancel_on(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Create the endpoint and start its lifecycle in the background.
    ///
    /// Must be called inside a tokio runtime. The returned endpoint is in
    /// `Connecting` (active) or `WaitTrust` (passive).
    pub fn build(self) -> Result<Arc<Endpoint>, WireError> {
        self.config.validate()?;

        match (self.passive, self.dial_address) {
            (Some(_), Some(_)) => Err(ConfigError::Invalid {
                field: "endpoint.target",
                reason: "set either an accepted socket or a dial address, not both".into(),
            }
            .into()),
            (None, None) => Err(ConfigError::MissingTarget.into()),
            (Some((stream, ids)), None) => {
                let endpoint = Arc::new(Endpoint::new(
                    Role::Passive,
                    ConnectionStatus::WaitTrust,
                    self.config,
                    self.observers,
                ));
                endpoint.record_addresses(&stream);
                tokio::spawn(Arc::clone(&endpoint).establish(stream, Some(ids)));
                Ok(endpoint)
            }
            (None, Some(address)) => {
                let endpoint = Arc::new(Endpoint::new(
                    Role::Active,
                    ConnectionStatus::Connecting,
                    self.config,
                    self.observers,
                ));
                let target = DialTarget {
                    address,
                    bind_port: self.bind_port,
                    deadline: self.dial_deadline,
                    cancel: self.cancel,
                };
                tokio::spawn(Arc::clone(&endpoint).dial(target));
                Ok(endpoint)
            }
        }
    }
}

/// One side of a connection.
pub struct Endpoint {
    /// Zero until the handshake completes, then fixed.
    id: AtomicU64,
    status: AtomicU8,
    role: Role,
    config: EndpointConfig,
    codec: FrameCodec,
    observers: Observers,
    /// Send lock; `None` before the handshake and after close.
    writer: Mutex<Option<OwnedWriteHalf>>,
    /// (local, remote), recorded once the socket exists.
    addresses: OnceLock<(SocketAddr, SocketAddr)>,
    heartbeat: OnceLock<HeartbeatMonitor>,
    /// Flipped to `true` exactly once, when the endpoint closes.
    shutdown: watch::Sender<bool>,
    /// Held while lifecycle observers run; connect observers finish before
    /// close observers start.
    notify: std::sync::Mutex<()>,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.id())
            .field("role", &self.role)
            .field("status", &self.status())
            .field("remote", &self.remote_address())
            .finish()
    }
}

impl Endpoint {
    /// Start building an endpoint.
    pub fn builder() -> EndpointBuilder {
        EndpointBuilder::new()
    }

    /// Dial `address` with the given config and observers.
    pub fn connect(
        address: impl Into<String>,
        config: EndpointConfig,
        observers: Observers,
    ) -> Result<Arc<Self>, WireError> {
        EndpointBuilder::new()
            .config(config)
            .observers(observers)
            .dial(address)
            .build()
    }

    fn new(
        role: Role,
        status: ConnectionStatus,
        config: EndpointConfig,
        observers: Observers,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            id: AtomicU64::new(0),
            status: AtomicU8::new(status as u8),
            role,
            codec: FrameCodec::from_config(&config.protocol),
            config,
            observers,
            writer: Mutex::new(None),
            addresses: OnceLock::new(),
            heartbeat: OnceLock::new(),
            shutdown,
            notify: std::sync::Mutex::new(()),
        }
    }

    /// An endpoint with no socket behind it, for exercising bookkeeping.
    #[cfg(test)]
    pub(crate) fn detached(id: u64, status: ConnectionStatus) -> Arc<Self> {
        let endpoint =
            Self::new(Role::Passive, status, EndpointConfig::default(), Observers::new());
        endpoint.id.store(id, Ordering::Release);
        Arc::new(endpoint)
    }

    /// Connection ID assigned by the handshake, or 0 before it completes.
    pub fn id(&self) -> u64 {
        self.id.load(Ordering::Acquire)
    }

    /// Whether this side dialed out or was accepted.
    pub fn role(&self) -> Role {
        self.role
    }

    /// The configuration this endpoint was built with.
    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    /// Current lifecycle status.
    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Whether the endpoint has reached `Closed`.
    pub fn is_closed(&self) -> bool {
        self.status().is_terminal()
    }

    /// Whether the handshake completed and the endpoint is still open.
    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Local socket address, once a socket exists.
    pub fn local_address(&self) -> Option<SocketAddr> {
        self.addresses.get().map(|(local, _)| *local)
    }

    /// Peer socket address, once a socket exists.
    pub fn remote_address(&self) -> Option<SocketAddr> {
        self.addresses.get().map(|(_, remote)| *remote)
    }

    /// Wait until the endpoint reaches `Closed`.
    pub async fn closed(&self) {
        let mut rx = self.shutdown.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Send one frame.
    ///
    /// Fails with [`WireError::NotReady`] unless `Connected`; an empty payload
    /// is a successful no-op. Header and payload are written under the send
    /// lock so concurrent senders never interleave. Write failures are
    /// returned without closing the endpoint; the receive loop notices a dead
    /// socket on its own.
    pub async fn send(self: &Arc<Self>, payload: &[u8]) -> Result<(), WireError> {
        let status = self.status();
        if status != ConnectionStatus::Connected {
            return Err(WireError::NotReady { status });
        }
        if payload.is_empty() {
            return Ok(());
        }
        let len = self.codec.check_len(payload)?;

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| WireError::NotReady {
            status: self.status(),
        })?;

        self.observers.notify_send(self, payload);

        writer.write_all(&codec::encode_length(len)).await?;
        self.ref_heartbeat();
        writer.write_all(payload).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Close the connection. Idempotent; only the first call notifies close
    /// observers.
    pub async fn close(self: &Arc<Self>) -> Result<(), WireError> {
        self.closed_handler(None).await;
        Ok(())
    }

    fn ref_heartbeat(&self) {
        if let Some(monitor) = self.heartbeat.get() {
            monitor.ref_heartbeat();
        }
    }

    fn record_addresses(&self, stream: &TcpStream) {
        if let (Ok(local), Ok(remote)) = (stream.local_addr(), stream.peer_addr()) {
            let _ = self.addresses.set((local, remote));
        }
    }

    fn transition(&self, from: ConnectionStatus, to: ConnectionStatus) -> bool {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Enter `Closed`; a no-op if the endpoint was already closed.
    async fn closed_handler(self: &Arc<Self>, cause: Option<&WireError>) {
        let previous = self.status.swap(ConnectionStatus::Closed as u8, Ordering::AcqRel);
        let previous = ConnectionStatus::from_u8(previous);
        if previous.is_terminal() {
            return;
        }

        if let Some(monitor) = self.heartbeat.get() {
            monitor.stop();
        }
        self.shutdown.send_replace(true);
        self.release_writer().await;

        match cause {
            Some(e) => debug!(id = self.id(), from = %previous, error = %e, "endpoint closed"),
            None => debug!(id = self.id(), from = %previous, "endpoint closed"),
        }
        let _notify = self.notify.lock().unwrap_or_else(|e| e.into_inner());
        self.observers.notify_close(self, cause);
    }

    /// Drop the write half, sending FIN. If a sender holds the lock the
    /// release happens once it finishes.
    async fn release_writer(self: &Arc<Self>) {
        let writer = match self.writer.try_lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => {
                let endpoint = Arc::clone(self);
                tokio::spawn(async move {
                    if let Some(mut writer) = endpoint.writer.lock().await.take() {
                        let _ = writer.shutdown().await;
                    }
                });
                None
            }
        };
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                debug!(id = self.id(), error = %e, "socket shutdown failed");
            }
        }
    }

    async fn dial(self: Arc<Self>, mut target: DialTarget) {
        let mut shutdown_rx = self.shutdown.subscribe();
        debug!(address = %target.address, "dialing");

        let result = tokio::select! {
            biased;
            _ = shutdown_rx.wait_for(|closed| *closed) => return,
            _ = cancelled(&mut target.cancel) => Err(WireError::DialCancelled {
                address: target.address.clone(),
            }),
            r = connect_with_deadline(&target.address, target.bind_port, target.deadline) => r,
        };

        match result {
            Ok(stream) => {
                self.record_addresses(&stream);
                if !self.transition(ConnectionStatus::Connecting, ConnectionStatus::WaitTrust) {
                    // Closed while the dial was completing.
                    return;
                }
                self.establish(stream, None).await;
            }
            Err(e) => {
                warn!(address = %target.address, error = %e, "dial failed");
                self.closed_handler(Some(&e)).await;
            }
        }
    }

    /// Handshake, then run the connection until it closes.
    async fn establish(self: Arc<Self>, stream: TcpStream, ids: Option<Arc<IdGenerator>>) {
        let (mut reader, mut writer) = stream.into_split();
        let mut shutdown_rx = self.shutdown.subscribe();

        let side = match &ids {
            Some(ids) => HandshakeSide::Passive { ids },
            None => HandshakeSide::Active,
        };

        let outcome = tokio::select! {
            r = handshake::perform(side, &mut reader, &mut writer, &self.config.protocol) => r,
            _ = shutdown_rx.wait_for(|closed| *closed) => return,
        };

        let id = match outcome {
            Ok(id) => id,
            Err(e) => {
                warn!(role = %self.role, remote = ?self.remote_address(), error = %e, "handshake failed");
                self.closed_handler(Some(&e)).await;
                return;
            }
        };

        self.id.store(id, Ordering::Release);
        *self.writer.lock().await = Some(writer);
        let _ = self.heartbeat.set(self.start_heartbeat());

        let connected = {
            let _notify = self.notify.lock().unwrap_or_else(|e| e.into_inner());
            let connected =
                self.transition(ConnectionStatus::WaitTrust, ConnectionStatus::Connected);
            if connected {
                info!(
                    id,
                    role = %self.role,
                    remote = ?self.remote_address(),
                    "handshake complete"
                );
                self.observers.notify_connect(&self);
            }
            connected
        };

        if !connected {
            // Closed during the handshake tail; closed_handler may have run
            // before the writer and monitor were installed.
            if let Some(monitor) = self.heartbeat.get() {
                monitor.stop();
            }
            self.release_writer().await;
            return;
        }
        self.receive_loop(reader).await;
    }

    fn start_heartbeat(self: &Arc<Self>) -> HeartbeatMonitor {
        let weak: Weak<Endpoint> = Arc::downgrade(self);
        let monitor = HeartbeatMonitor::start(
            self.config.heartbeat_interval(),
            self.config.protocol.heartbeat_precision(),
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(endpoint) = weak.upgrade() {
                        endpoint.on_heartbeat_timeout().await;
                    }
                }
            },
        );
        debug!(
            id = self.id(),
            interval = ?monitor.target(),
            precision = ?monitor.precision(),
            "heartbeat started"
        );
        monitor
    }

    async fn on_heartbeat_timeout(self: &Arc<Self>) {
        match self.role {
            Role::Passive => {
                debug!(id = self.id(), "heartbeat timeout, closing idle connection");
                let _ = self.close().await;
            }
            Role::Active => {
                let mut guard = self.writer.lock().await;
                if let Some(writer) = guard.as_mut() {
                    match codec::write_keepalive(writer).await {
                        Ok(()) => debug!(id = self.id(), "keepalive sent"),
                        Err(e) => debug!(id = self.id(), error = %e, "keepalive failed"),
                    }
                }
            }
        }
    }

    async fn receive_loop(self: &Arc<Self>, mut reader: OwnedReadHalf) {
        let mut shutdown_rx = self.shutdown.subscribe();

        while self.is_connected() {
            let frame = tokio::select! {
                r = self.codec.read_frame(&mut reader) => r,
                _ = shutdown_rx.wait_for(|closed| *closed) => break,
            };

            match frame {
                Ok(frame) => {
                    self.ref_heartbeat();
                    if !frame.is_empty() {
                        self.observers.notify_receive(self, &frame);
                    }
                }
                Err(e) if e.is_protocol_violation() => {
                    warn!(id = self.id(), error = %e, "protocol violation, closing");
                    self.closed_handler(Some(&e)).await;
                    break;
                }
                Err(e) => {
                    debug!(id = self.id(), error = %e, "connection ended");
                    self.closed_handler(None).await;
                    break;
                }
            }
        }
    }
}

/// Resolves once `cancel` observes `true`; never resolves without a signal.
async fn cancelled(cancel: &mut Option<watch::Receiver<bool>>) {
    if let Some(rx) = cancel {
        if rx.wait_for(|cancelled| *cancelled).await.is_ok() {
            return;
        }
    }
    std::future::pending::<()>().await
}

async fn connect_with_deadline(
    address: &str,
    bind_port: Option<u16>,
    deadline: Option<Duration>,
) -> Result<TcpStream, WireError> {
    match deadline {
        Some(deadline) => tokio::time::timeout(deadline, connect(address, bind_port))
            .await
            .unwrap_or_else(|_| {
                Err(WireError::DialTimeout {
                    address: address.to_string(),
                    elapsed: deadline,
                })
            }),
        None => connect(address, bind_port).await,
    }
}

async fn connect(address: &str, bind_port: Option<u16>) -> Result<TcpStream, WireError> {
    let Some(port) = bind_port else {
        return Ok(TcpStream::connect(address).await?);
    };

    let mut last_err = None;
    for remote in tokio::net::lookup_host(address).await? {
        let (socket, local) = if remote.is_ipv4() {
            (TcpSocket::new_v4()?, SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
        } else {
            (TcpSocket::new_v6()?, SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)))
        };
        socket.set_reuseaddr(true)?;
        socket.bind(local)?;
        match socket.connect(remote).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }

    Err(WireError::Io(last_err.unwrap_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("{address} did not resolve to any address"),
        )
    })))
}
