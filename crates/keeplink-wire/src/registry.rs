//! Connection registry — tracks connected endpoints by connection ID.
//!
//! The [`Registry`] is a cloneable handle over a shared map. Mutations and
//! snapshots hold the lock only for the map operation itself; fan-out
//! operations copy the map and release the lock before any network I/O.
//!
//! Each registry owns the [`IdGenerator`] that numbers its connections, so
//! every listener sharing a registry draws from the same counter and IDs
//! stay unique within it.

use crate::endpoint::Endpoint;
use crate::error::WireError;
use crate::id::IdGenerator;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

/// A registered endpoint.
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    /// The live endpoint.
    pub endpoint: Arc<Endpoint>,
    /// When the endpoint was registered.
    pub connected_at: DateTime<Utc>,
}

/// Thread-safe mapping of connection ID to endpoint.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    entries: Arc<Mutex<HashMap<u64, RegistryEntry>>>,
    id_generator: Arc<IdGenerator>,
}

impl Registry {
    /// Create a new empty registry with a fresh ID counter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty registry with room for `capacity` endpoints.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_id_generator(capacity, Arc::new(IdGenerator::new()))
    }

    /// Create an empty registry whose connections are numbered by `ids`.
    pub fn with_id_generator(capacity: usize, ids: Arc<IdGenerator>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::with_capacity(capacity))),
            id_generator: ids,
        }
    }

    /// The counter passive endpoints draw their connection IDs from.
    pub fn id_generator(&self) -> &Arc<IdGenerator> {
        &self.id_generator
    }

    /// Register an endpoint under its current ID, replacing any previous
    /// entry for that ID.
    pub fn insert(&self, endpoint: Arc<Endpoint>) -> Option<Arc<Endpoint>> {
        let id = endpoint.id();
        let entry = RegistryEntry {
            endpoint,
            connected_at: Utc::now(),
        };
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(id, entry).map(|old| old.endpoint)
    }

    /// Remove whatever is registered under `id`.
    pub fn remove(&self, id: u64) -> Option<Arc<Endpoint>> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(&id).map(|entry| entry.endpoint)
    }

    /// Remove `endpoint` only if it is the one registered under its ID.
    pub fn remove_endpoint(&self, endpoint: &Arc<Endpoint>) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let id = endpoint.id();
        match entries.get(&id) {
            Some(entry) if Arc::ptr_eq(&entry.endpoint, endpoint) => {
                entries.remove(&id);
                true
            }
            _ => false,
        }
    }

    /// Look up an endpoint by connection ID.
    pub fn get(&self, id: u64) -> Option<Arc<Endpoint>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(&id).map(|entry| Arc::clone(&entry.endpoint))
    }

    /// Number of registered endpoints.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether no endpoint is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered IDs in ascending order.
    pub fn ids(&self) -> Vec<u64> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<u64> = entries.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Point-in-time copy of every entry, ordered by ID.
    pub fn entries(&self) -> Vec<(u64, RegistryEntry)> {
        let mut entries: Vec<(u64, RegistryEntry)> = {
            let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries.iter().map(|(id, e)| (*id, e.clone())).collect()
        };
        entries.sort_unstable_by_key(|(id, _)| *id);
        entries
    }

    fn snapshot(&self) -> Vec<(u64, Arc<Endpoint>)> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .iter()
            .map(|(id, entry)| (*id, Arc::clone(&entry.endpoint)))
            .collect()
    }

    /// Send `payload` to every registered endpoint, one task per endpoint.
    ///
    /// Runs against a snapshot: endpoints registered or removed while the
    /// broadcast is in flight may or may not be included.
    pub fn send_all(&self, payload: impl Into<Bytes>) -> FanOut {
        let payload = payload.into();
        let handles = self
            .snapshot()
            .into_iter()
            .map(|(id, endpoint)| {
                let payload = payload.clone();
                let handle = tokio::spawn(async move { endpoint.send(&payload).await });
                (id, handle)
            })
            .collect();
        FanOut { handles }
    }

    /// Close every registered endpoint, one task per endpoint.
    pub fn close_all(&self) -> FanOut {
        let handles = self
            .snapshot()
            .into_iter()
            .map(|(id, endpoint)| (id, tokio::spawn(async move { endpoint.close().await })))
            .collect();
        FanOut { handles }
    }
}

/// In-flight fan-out. Dropping it detaches the tasks; they still run.
#[derive(Debug)]
pub struct FanOut {
    handles: Vec<(u64, JoinHandle<Result<(), WireError>>)>,
}

impl FanOut {
    /// Number of endpoints targeted.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether the fan-out targeted nothing.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every task and collect per-endpoint results, ordered by ID.
    pub async fn wait(self) -> Vec<(u64, Result<(), WireError>)> {
        let mut results = Vec::with_capacity(self.handles.len());
        for (id, handle) in self.handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => {
                    debug!(id, error = %e, "fan-out task failed");
                    Err(WireError::Io(std::io::Error::other(e)))
                }
            };
            results.push((id, result));
        }
        results.sort_unstable_by_key(|(id, _)| *id);
        results
    }
}
