//! Live connection registry
//!
//! Maps an authenticated client name to the sending half of its connection.
//! A reconnect under the same name replaces the previous entry.

use std::collections::HashMap;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;
use yyspider_common::{Error, Message, Result};

/// Outbound channel to one connection task
#[derive(Debug, Clone)]
pub struct PeerHandle {
    pub name: String,
    pub conn_id: Uuid,
    pub peer_addr: String,
    pub connected_at: chrono::DateTime<chrono::Utc>,
    sender: mpsc::Sender<Message>,
}

impl PeerHandle {
    pub fn new(name: String, peer_addr: String, sender: mpsc::Sender<Message>) -> Self {
        Self {
            name,
            conn_id: Uuid::new_v4(),
            peer_addr,
            connected_at: chrono::Utc::now(),
            sender,
        }
    }

    /// Queue a message for the connection's writer
    pub async fn send(&self, message: Message) -> Result<()> {
        self.sender
            .send(message)
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    peers: RwLock<HashMap<String, PeerHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handle` under its name, returning the entry it displaced
    pub async fn register(&self, handle: PeerHandle) -> Option<PeerHandle> {
        self.peers.write().await.insert(handle.name.clone(), handle)
    }

    /// Remove `name` only if it still belongs to connection `conn_id`
    pub async fn unregister(&self, name: &str, conn_id: Uuid) -> bool {
        let mut peers = self.peers.write().await;
        match peers.get(name) {
            Some(current) if current.conn_id == conn_id => {
                peers.remove(name);
                true
            }
            _ => false,
        }
    }

    pub async fn lookup(&self, name: &str) -> Option<PeerHandle> {
        self.peers.read().await.get(name).cloned()
    }

    /// All live handles, sorted by name
    pub async fn snapshot(&self) -> Vec<PeerHandle> {
        let mut peers: Vec<PeerHandle> = self.peers.read().await.values().cloned().collect();
        peers.sort_by(|a, b| a.name.cmp(&b.name));
        peers
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }
}
