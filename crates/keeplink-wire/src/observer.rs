//! Lifecycle and data observers attached to endpoints.
//!
//! Observers run inline on the task that raised the event (the handshake,
//! receive loop, or sender) and should return quickly.

use crate::endpoint::Endpoint;
use crate::error::WireError;
use std::sync::Arc;

/// Called once when an endpoint reaches `Connected`.
pub type ConnectObserver = Arc<dyn Fn(&Arc<Endpoint>) + Send + Sync>;
/// Called once when an endpoint reaches `Closed`. The cause is present for
/// dial, handshake and protocol failures.
pub type CloseObserver = Arc<dyn Fn(&Arc<Endpoint>, Option<&WireError>) + Send + Sync>;
/// Called with each non-empty payload before it is written.
pub type SendObserver = Arc<dyn Fn(&Arc<Endpoint>, &[u8]) + Send + Sync>;
/// Called with each non-empty frame received, in arrival order.
pub type ReceiveObserver = Arc<dyn Fn(&Arc<Endpoint>, &[u8]) + Send + Sync>;

/// The observer lists of one endpoint.
#[derive(Clone, Default)]
pub struct Observers {
    pub on_connect: Vec<ConnectObserver>,
    pub on_close: Vec<CloseObserver>,
    pub on_send: Vec<SendObserver>,
    pub on_receive: Vec<ReceiveObserver>,
}

impl std::fmt::Debug for Observers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observers")
            .field("on_connect", &self.on_connect.len())
            .field("on_close", &self.on_close.len())
            .field("on_send", &self.on_send.len())
            .field("on_receive", &self.on_receive.len())
            .finish()
    }
}

impl Observers {
    /// Create empty observer lists.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connect observer.
    pub fn on_connect(mut self, f: impl Fn(&Arc<Endpoint>) + Send + Sync + 'static) -> Self {
        self.on_connect.push(Arc::new(f));
        self
    }

    /// Add a close observer.
    pub fn on_close(
        mut self,
        f: impl Fn(&Arc<Endpoint>, Option<&WireError>) + Send + Sync + 'static,
    ) -> Self {
        self.on_close.push(Arc::new(f));
        self
    }

    /// Add a send observer.
    pub fn on_send(mut self, f: impl Fn(&Arc<Endpoint>, &[u8]) + Send + Sync + 'static) -> Self {
        self.on_send.push(Arc::new(f));
        self
    }

    /// Add a receive observer.
    pub fn on_receive(
        mut self,
        f: impl Fn(&Arc<Endpoint>, &[u8]) + Send + Sync + 'static,
    ) -> Self {
        self.on_receive.push(Arc::new(f));
        self
    }

    /// Append every observer from `other` after the existing ones.
    pub fn extend(&mut self, other: &Observers) {
        self.on_connect.extend(other.on_connect.iter().cloned());
        self.on_close.extend(other.on_close.iter().cloned());
        self.on_send.extend(other.on_send.iter().cloned());
        self.on_receive.extend(other.on_receive.iter().cloned());
    }

    pub(crate) fn notify_connect(&self, endpoint: &Arc<Endpoint>) {
        for f in &self.on_connect {
            f(endpoint);
        }
    }

    pub(crate) fn notify_close(&self, endpoint: &Arc<Endpoint>, cause: Option<&WireError>) {
        for f in &self.on_close {
            f(endpoint, cause);
        }
    }

    pub(crate) fn notify_send(&self, endpoint: &Arc<Endpoint>, payload: &[u8]) {
        for f in &self.on_send {
            f(endpoint, payload);
        }
    }

    pub(crate) fn notify_receive(&self, endpoint: &Arc<Endpoint>, payload: &[u8]) {
        for f in &self.on_receive {
            f(endpoint, payload);
        }
    }
}
