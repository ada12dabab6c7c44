//! Live connections per user.
//!
//! A user may hold several connections at once (tabs, devices). The registry
//! holds shared handles only; the transport owns the socket and is closed
//! through [`Connection::close`] when a connection is evicted.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::model::UserId;
use crate::protocol::Event;

pub type ConnectionId = Uuid;

/// Per-connection delivery failure. Handled by evicting the connection.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,
    #[error("send timed out")]
    Timeout,
    #[error("could not serialize event: {0}")]
    Serialization(String),
}

/// A duplex channel to one authenticated client.
#[async_trait]
pub trait Connection: Send + Sync {
    fn id(&self) -> ConnectionId;

    /// Deliver one event. Implementations bound the wait themselves.
    async fn send(&self, event: &Event) -> Result<(), TransportError>;

    /// Close the underlying transport. Safe to call more than once.
    async fn close(&self);
}

/// Thread-safe multimap from user id to that user's live connections.
///
/// Mutations take the write lock, lookups the read lock.
#[derive(Default)]
pub struct ConnectionRegistry {
    conns: RwLock<HashMap<UserId, Vec<Arc<dyn Connection>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `conn` under `user`. Connections keep insertion order.
    pub async fn register(&self, user: UserId, conn: Arc<dyn Connection>) {
        let conn_id = conn.id();
        self.conns.write().await.entry(user).or_default().push(conn);
        log::debug!("Registered connection {conn_id} for user {user}");
    }

    /// Remove a connection. Drops the user entry once it has none left.
    ///
    /// Returns the removed handle; `None` if it was already gone.
    pub async fn deregister(
        &self,
        conn_id: ConnectionId,
        user: UserId,
    ) -> Option<Arc<dyn Connection>> {
        let mut conns = self.conns.write().await;
        let list = conns.get_mut(&user)?;
        let removed = list
            .iter()
            .position(|c| c.id() == conn_id)
            .map(|idx| list.remove(idx));
        if list.is_empty() {
            conns.remove(&user);
        }
        if removed.is_some() {
            log::debug!("Deregistered connection {conn_id} for user {user}");
        }
        removed
    }

    /// Snapshot of `user`'s connections. Safe to use after the lock is gone.
    pub async fn connections_for(&self, user: UserId) -> Vec<Arc<dyn Connection>> {
        self.conns
            .read()
            .await
            .get(&user)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of users with at least one connection.
    pub async fn user_count(&self) -> usize {
        self.conns.read().await.len()
    }

    pub async fn connection_count(&self) -> usize {
        self.conns.read().await.values().map(Vec::len).sum()
    }

    pub async fn is_connected(&self, user: UserId) -> bool {
        self.conns.read().await.contains_key(&user)
    }
}
