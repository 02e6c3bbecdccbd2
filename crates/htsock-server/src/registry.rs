//! The live-session registry.
//!
//! Maps session ids to sessions for the poll and close dispatchers. A
//! session is present exactly while it is open or closing; termination
//! removes it. The registry is an explicit collaborator owned by the server
//! and handed to every session, never process-global state.

use crate::session::ServerSocket;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<String, Arc<ServerSocket>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session under its id.
    pub async fn insert(&self, socket: Arc<ServerSocket>) {
        let id = socket.id().to_string();
        self.sessions.lock().await.insert(id.clone(), socket);
        debug!(session_id = %id, "session registered");
    }

    /// Look up a live session.
    pub async fn get(&self, id: &str) -> Option<Arc<ServerSocket>> {
        self.sessions.lock().await.get(id).cloned()
    }

    /// Remove a session. No-op if it is already gone.
    pub async fn remove(&self, id: &str) {
        if self.sessions.lock().await.remove(id).is_some() {
            debug!(session_id = %id, "session removed");
        }
    }

    /// Take every live session out of the registry (used by server shutdown).
    pub async fn drain(&self) -> Vec<Arc<ServerSocket>> {
        self.sessions.lock().await.drain().map(|(_, s)| s).collect()
    }

    /// Snapshot of all live sessions.
    pub async fn snapshot(&self) -> Vec<Arc<ServerSocket>> {
        self.sessions.lock().await.values().cloned().collect()
    }

    /// Number of live sessions.
    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }
}
