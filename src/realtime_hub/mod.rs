//! RealtimeHub - socket client registry and fan-out
//!
//! ## Responsibilities
//!
//! - Socket connection management with a hard client cap
//! - Status broadcast to every connected client
//! - Command replies routed back to the originating client
//! - Binary frame fan-out while streaming
//!
//! The hub never talks to a socket directly; each client owns a channel
//! drained by its connection task in web_api.

use crate::error::{Error, Result};
use crate::models::CommandResult;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Concurrent socket clients allowed
pub const MAX_CLIENTS: usize = 5;

/// One frame queued for a client, text or binary
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    Text(String),
    Binary(Vec<u8>),
}

/// Hub message types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum HubMessage {
    Status(crate::device_state::StatusSnapshot),
    CommandResult(CommandReplyMessage),
}

/// Command outcome echoed to the sender
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandReplyMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub command: String,
    #[serde(flatten)]
    pub result: CommandResult,
}

/// Client connection
struct ClientConnection {
    id: Uuid,
    tx: mpsc::UnboundedSender<OutboundFrame>,
}

/// RealtimeHub instance
pub struct RealtimeHub {
    connections: RwLock<HashMap<Uuid, ClientConnection>>,
    connection_count: AtomicU64,
}

impl RealtimeHub {
    /// Create new RealtimeHub
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            connection_count: AtomicU64::new(0),
        }
    }

    /// Register a new client. Rejects once the cap is reached; the
    /// caller closes the socket with a reason.
    pub async fn register(&self) -> Result<(Uuid, mpsc::UnboundedReceiver<OutboundFrame>)> {
        let mut connections = self.connections.write().await;
        if connections.len() >= MAX_CLIENTS {
            tracing::warn!(max_clients = MAX_CLIENTS, "Socket client limit reached");
            return Err(Error::Busy("socket client limit reached".to_string()));
        }

        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        connections.insert(id, ClientConnection { id, tx });
        self.connection_count.fetch_add(1, Ordering::Relaxed);

        tracing::info!(connection_id = %id, clients = connections.len(), "Client connected");
        Ok((id, rx))
    }

    /// Unregister a client
    pub async fn unregister(&self, id: &Uuid) {
        let mut connections = self.connections.write().await;
        if connections.remove(id).is_some() {
            self.connection_count.fetch_sub(1, Ordering::Relaxed);
            tracing::info!(connection_id = %id, clients = connections.len(), "Client disconnected");
        }
    }

    /// Broadcast a message to all clients
    pub async fn broadcast(&self, message: HubMessage) {
        let json = match serde_json::to_string(&message) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize message");
                return;
            }
        };

        let connections = self.connections.read().await;
        for conn in connections.values() {
            if let Err(e) = conn.tx.send(OutboundFrame::Text(json.clone())) {
                tracing::warn!(connection_id = %conn.id, error = %e, "Failed to send message");
            }
        }
    }

    /// Send a message to one client
    pub async fn send_to(&self, id: &Uuid, message: HubMessage) {
        let json = match serde_json::to_string(&message) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize message");
                return;
            }
        };

        let connections = self.connections.read().await;
        if let Some(conn) = connections.get(id) {
            if let Err(e) = conn.tx.send(OutboundFrame::Text(json)) {
                tracing::warn!(connection_id = %conn.id, error = %e, "Failed to send message");
            }
        }
    }

    /// Fan a binary frame out to every client. Returns how many
    /// accepted it, so the caller can count delivered frames.
    pub async fn broadcast_frame(&self, frame: Vec<u8>) -> usize {
        let connections = self.connections.read().await;
        let mut sent = 0;
        for conn in connections.values() {
            if conn.tx.send(OutboundFrame::Binary(frame.clone())).is_ok() {
                sent += 1;
            }
        }
        sent
    }

    /// Get connection count
    pub fn connection_count(&self) -> u64 {
        self.connection_count.load(Ordering::Relaxed)
    }

    /// Anyone watching right now
    pub fn has_clients(&self) -> bool {
        self.connection_count() > 0
    }
}

impl Default for RealtimeHub {
    fn default() -> Self {
        Self::new()
    }
}
