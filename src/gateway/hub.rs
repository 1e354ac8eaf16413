//! Client registry and broadcast.
//!
//! Every transport connection registers an outbox here and is given a
//! sequential username (`User1`, `User2`, ...). Replies go to a single
//! client's outbox; notices fan out to all of them.

use super::messages::Response;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// Identifies one connected client.
pub type ClientId = Uuid;

/// Where messages for one client are queued.
pub type Outbox = mpsc::UnboundedSender<Response>;

/// Public view of a registered client.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    /// Unique id for the connection.
    pub id: ClientId,
    /// Sequential display name, `User1`, `User2`, ...
    pub username: String,
    /// When the client registered.
    pub connected_at: DateTime<Utc>,
}

struct ClientEntry {
    info: ClientInfo,
    outbox: Outbox,
}

/// Registry of connected clients.
#[derive(Clone, Default)]
pub struct SessionHub {
    clients: Arc<RwLock<HashMap<ClientId, ClientEntry>>>,
    user_counter: Arc<AtomicU64>,
}

impl SessionHub {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client and announce it to everyone else.
    pub async fn register(&self, outbox: Outbox) -> ClientInfo {
        let number = self.user_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let info = ClientInfo {
            id: Uuid::new_v4(),
            username: format!("User{}", number),
            connected_at: Utc::now(),
        };

        self.broadcast(format!("{} joined", info.username)).await;
        self.clients.write().await.insert(
            info.id,
            ClientEntry {
                info: info.clone(),
                outbox,
            },
        );
        tracing::info!(client = %info.id, username = %info.username, "Client registered");
        info
    }

    /// Remove a client and announce its departure.
    pub async fn unregister(&self, id: ClientId) -> Option<ClientInfo> {
        let entry = self.clients.write().await.remove(&id)?;
        tracing::info!(client = %id, username = %entry.info.username, "Client left");
        self.broadcast(format!("{} left", entry.info.username)).await;
        Some(entry.info)
    }

    /// Queue `response` for one client. `false` if it is gone.
    pub async fn send(&self, id: ClientId, response: Response) -> bool {
        match self.clients.read().await.get(&id) {
            Some(entry) => entry.outbox.send(response).is_ok(),
            None => false,
        }
    }

    /// Send a server notice to every client. Returns how many received it.
    pub async fn broadcast(&self, message: impl Into<String>) -> usize {
        let notice = Response::notice(message);
        let delivered = self
            .clients
            .read()
            .await
            .values()
            .filter(|entry| entry.outbox.send(notice.clone()).is_ok())
            .count();
        tracing::debug!(delivered, message = %notice.message, "Broadcast notice");
        delivered
    }

    /// Currently registered clients.
    pub async fn clients(&self) -> Vec<ClientInfo> {
        let mut clients: Vec<ClientInfo> = self
            .clients
            .read()
            .await
            .values()
            .map(|entry| entry.info.clone())
            .collect();
        clients.sort_by_key(|c| c.connected_at);
        clients
    }
}
