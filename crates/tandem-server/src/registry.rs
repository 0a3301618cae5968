//! Connection registry.
//!
//! Tracks every accepted connection by a server-assigned id together with
//! its "exit requested" flag. All reads and writes go through one lock.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::debug;

/// Server-assigned connection identifier.
pub type ConnectionId = u64;

/// A live connection.
#[derive(Debug, Clone)]
pub struct ConnectionEntry {
    /// Server-assigned id.
    pub id: ConnectionId,
    /// Remote address of the client (or of the proxy in front of it).
    pub peer: SocketAddr,
    /// When the connection was accepted.
    pub accepted_at: Instant,
    /// Set once the exit handshake has been acknowledged.
    pub exit_requested: bool,
}

/// Registry of connections currently served by a dispatcher.
#[derive(Debug)]
pub struct ConnectionRegistry {
    entries: Mutex<HashMap<ConnectionId, ConnectionEntry>>,
    /// Monotonic connection ID counter.
    next_id: AtomicU64,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a freshly accepted connection with its exit flag cleared.
    pub async fn register(&self, peer: SocketAddr) -> ConnectionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = ConnectionEntry {
            id,
            peer,
            accepted_at: Instant::now(),
            exit_requested: false,
        };
        self.entries.lock().await.insert(id, entry);
        debug!(conn_id = id, peer = %peer, "connection registered");
        id
    }

    /// Mark a connection as exiting. Returns `false` if it is unknown.
    pub async fn request_exit(&self, id: ConnectionId) -> bool {
        match self.entries.lock().await.get_mut(&id) {
            Some(entry) => {
                entry.exit_requested = true;
                true
            }
            None => false,
        }
    }

    /// Whether the connection has asked to exit. Unknown ids count as exiting.
    pub async fn exit_requested(&self, id: ConnectionId) -> bool {
        self.entries
            .lock()
            .await
            .get(&id)
            .map_or(true, |entry| entry.exit_requested)
    }

    /// Remove a connection at teardown.
    pub async fn remove(&self, id: ConnectionId) -> Option<ConnectionEntry> {
        let removed = self.entries.lock().await.remove(&id);
        if removed.is_some() {
            debug!(conn_id = id, "connection unregistered");
        }
        removed
    }

    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.entries.lock().await.contains_key(&id)
    }

    /// List all live connections.
    pub async fn list(&self) -> Vec<ConnectionEntry> {
        let mut entries: Vec<_> = self.entries.lock().await.values().cloned().collect();
        entries.sort_by_key(|e| e.id);
        entries
    }

    /// Number of live connections.
    pub async fn count(&self) -> usize {
        self.entries.lock().await.len()
    }
}
