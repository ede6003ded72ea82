//! Connection listener — accepts sockets and spawns passive endpoints.
//!
//! Every accepted socket becomes a passive [`Endpoint`] that inherits the
//! listener's heartbeat check interval and observers. Two observers are
//! prepended ahead of the caller's: connect inserts the endpoint into the
//! [`Registry`], close removes it. Both run synchronously, so by the time any
//! caller observer sees a connect the endpoint is already registered.
//!
//! Connection IDs come from the registry's own generator, so several
//! listeners sharing one registry never hand out the same ID.

use crate::endpoint::{Endpoint, EndpointBuilder};
use crate::error::WireError;
use crate::observer::Observers;
use crate::id::IdGenerator;
use crate::registry::{FanOut, Registry};

use bytes::Bytes;
use keeplink_types::{EndpointConfig, ListenerConfig, ListenerStatus};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Builder for [`Listener`].
#[derive(Debug, Default)]
pub struct ListenerBuilder {
    config: ListenerConfig,
    observers: Observers,
    registry: Option<Registry>,
}

impl ListenerBuilder {
    /// Create a builder with default config and no observers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind address, heartbeat check interval and protocol settings.
    pub fn config(mut self, config: ListenerConfig) -> Self {
        self.config = config;
        self
    }

    /// Observers handed to every accepted endpoint.
    pub fn observers(mut self, observers: Observers) -> Self {
        self.observers = observers;
        self
    }

    /// Share a registry, and with it the registry's ID generator. Defaults
    /// to an empty one sized by `initial_capacity`.
    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Bind the socket and start accepting.
    pub async fn bind(self) -> Result<Listener, WireError> {
        self.config.validate()?;

        let socket = TcpListener::bind(self.config.bind_target()).await?;
        let local_addr = socket.local_addr()?;
        info!("listening on {}", local_addr);

        let registry = self
            .registry
            .unwrap_or_else(|| Registry::with_capacity(self.config.initial_capacity));
        let observers = registry_observers(&registry, &self.observers);
        let (stop_tx, stop_rx) = watch::channel(false);

        let accept = AcceptLoop {
            socket,
            endpoint_config: self.config.endpoint_config(),
            observers,
            registry: registry.clone(),
            stop: stop_rx,
        };
        let handle = tokio::spawn(accept.run());

        Ok(Listener {
            config: self.config,
            local_addr,
            status: AtomicU8::new(ListenerStatus::Listening as u8),
            registry,
            stop: stop_tx,
            accept_handle: Mutex::new(Some(handle)),
        })
    }
}

fn registry_observers(registry: &Registry, user: &Observers) -> Observers {
    let on_connect = registry.clone();
    let on_close = registry.clone();
    let mut observers = Observers::new()
        .on_connect(move |endpoint| {
            on_connect.insert(Arc::clone(endpoint));
        })
        .on_close(move |endpoint, _| {
            on_close.remove_endpoint(endpoint);
        });
    observers.extend(user);
    observers
}

struct AcceptLoop {
    socket: TcpListener,
    endpoint_config: EndpointConfig,
    observers: Observers,
    registry: Registry,
    stop: watch::Receiver<bool>,
}

impl AcceptLoop {
    async fn run(mut self) {
        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.stop.wait_for(|stop| *stop) => break,
                r = self.socket.accept() => r,
            };

            match accepted {
                Ok((stream, addr)) => {
                    debug!("accepted connection from {}", addr);
                    let built = EndpointBuilder::new()
                        .config(self.endpoint_config.clone())
                        .observers(self.observers.clone())
                        .passive(stream, Arc::clone(self.registry.id_generator()))
                        .build();
                    if let Err(e) = built {
                        error!("failed to start endpoint for {}: {}", addr, e);
                    }
                }
                Err(e) => {
                    error!("accept error: {}", e);
                    tokio::select! {
                        _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => {}
                        _ = self.stop.wait_for(|stop| *stop) => break,
                    }
                }
            }
        }
        debug!("accept loop stopped");
    }
}

/// A bound listener. Dropping it stops accepting; established endpoints are
/// left running.
#[derive(Debug)]
pub struct Listener {
    config: ListenerConfig,
    local_addr: SocketAddr,
    status: AtomicU8,
    registry: Registry,
    stop: watch::Sender<bool>,
    accept_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Listener {
    /// Start building a listener.
    pub fn builder() -> ListenerBuilder {
        ListenerBuilder::new()
    }

    /// Bind with `config` and `observers`, using a fresh generator and
    /// registry.
    pub async fn bind(config: ListenerConfig, observers: Observers) -> Result<Self, WireError> {
        ListenerBuilder::new()
            .config(config)
            .observers(observers)
            .bind()
            .await
    }

    /// The bound address (with the real port when bound to port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The configuration this listener was bound with.
    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }

    /// The registry accepted endpoints are recorded in.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The generator connection IDs are drawn from (the registry's).
    pub fn ids(&self) -> &Arc<IdGenerator> {
        self.registry.id_generator()
    }

    /// Current lifecycle status.
    pub fn status(&self) -> ListenerStatus {
        ListenerStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Whether the accept loop is still running.
    pub fn is_listening(&self) -> bool {
        self.status() == ListenerStatus::Listening
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.status() == ListenerStatus::Closed
    }

    /// Broadcast `payload` to every registered endpoint.
    ///
    /// Refused with [`WireError::ListenerClosed`] once the listener is closed.
    pub fn send_all(&self, payload: impl Into<Bytes>) -> Result<FanOut, WireError> {
        if self.is_closed() {
            return Err(WireError::ListenerClosed);
        }
        Ok(self.registry.send_all(payload))
    }

    /// Close every registered endpoint. Still allowed after
    /// [`close`](Self::close).
    pub fn close_all(&self) -> FanOut {
        self.registry.close_all()
    }

    /// Look up a registered endpoint by connection ID.
    pub fn endpoint(&self, id: u64) -> Option<Arc<Endpoint>> {
        self.registry.get(id)
    }

    /// Stop accepting and release the socket. Idempotent. Registered
    /// endpoints stay open; use [`close_all`](Self::close_all) for those.
    pub async fn close(&self) -> Result<(), WireError> {
        let previous = self
            .status
            .swap(ListenerStatus::Closed as u8, Ordering::AcqRel);
        if ListenerStatus::from_u8(previous) == ListenerStatus::Closed {
            return Ok(());
        }

        self.stop.send_replace(true);
        let handle = self
            .accept_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("accept loop ended abnormally: {}", e);
            }
        }
        info!("listener on {} closed", self.local_addr);
        Ok(())
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop.send_replace(true);
    }
}
