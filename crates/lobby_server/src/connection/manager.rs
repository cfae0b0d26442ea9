//! Connection manager for tracking and managing client connections.
//!
//! This module provides the process-local registry of live connections and
//! of which user each one is bound to. Nothing here is shared with other
//! lobby instances; they reach this instance's users only through the
//! broadcaster.

use super::client::ClientConnection;
use crate::error::LobbyError;
use crate::messaging::ServerEvent;
use crate::types::{ConnectionId, UserId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, trace};

#[derive(Debug, Default)]
struct Registry {
    connections: HashMap<ConnectionId, ClientConnection>,
    by_user: HashMap<UserId, ConnectionId>,
}

impl Registry {
    fn remove(&mut self, connection_id: ConnectionId) -> Option<ClientConnection> {
        let connection = self.connections.remove(&connection_id)?;
        if let Some(user_id) = &connection.user_id {
            if self.by_user.get(user_id) == Some(&connection_id) {
                self.by_user.remove(user_id);
            }
        }
        Some(connection)
    }
}

/// Central manager for all client connections held by this process.
///
/// The `ConnectionManager` tracks active connections, assigns unique IDs,
/// binds authenticated users to connections (one connection per user) and
/// delivers outbound events.
///
/// # Architecture
///
/// * Uses `RwLock` around both maps so a binding change is a single step
/// * Implements atomic connection ID generation
/// * Each connection owns an unbounded queue drained by its writer task
#[derive(Debug)]
pub struct ConnectionManager {
    registry: Arc<RwLock<Registry>>,

    /// Atomic counter for generating unique connection IDs
    next_id: Arc<AtomicUsize>,
}

impl ConnectionManager {
    /// Creates a new, empty connection manager.
    pub fn new() -> Self {
        Self {
            registry: Arc::new(RwLock::new(Registry::default())),
            next_id: Arc::new(AtomicUsize::new(1)),
        }
    }

    /// Adds a new connection and returns its unique ID.
    ///
    /// # Arguments
    ///
    /// * `remote_addr` - The network address of the connecting client
    /// * `outbound` - Queue the connection's writer task drains
    ///
    /// # Returns
    ///
    /// A unique `ConnectionId` assigned to this connection.
    pub async fn add_connection(
        &self,
        remote_addr: SocketAddr,
        outbound: mpsc::UnboundedSender<Message>,
    ) -> ConnectionId {
        let connection_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let connection = ClientConnection::new(remote_addr, outbound);
        self.registry
            .write()
            .await
            .connections
            .insert(connection_id, connection);
        info!("🔗 Connection {} from {}", connection_id, remote_addr);
        connection_id
    }

    /// Binds an authenticated user to a connection.
    ///
    /// A user has at most one live connection per instance; binding a new
    /// one displaces the old.
    ///
    /// # Returns
    ///
    /// The connection previously bound to this user, if any. The caller
    /// decides what to do with it (usually close it).
    pub async fn bind_user(
        &self,
        connection_id: ConnectionId,
        user_id: UserId,
    ) -> Option<ConnectionId> {
        let mut registry = self.registry.write().await;
        if let Some(connection) = registry.connections.get_mut(&connection_id) {
            connection.user_id = Some(user_id.clone());
        }
        let previous = registry.by_user.insert(user_id.clone(), connection_id);
        if let Some(old) = previous.filter(|old| *old != connection_id) {
            if let Some(connection) = registry.connections.get_mut(&old) {
                connection.user_id = None;
            }
            debug!("🔀 {} moved from connection {} to {}", user_id, old, connection_id);
            return Some(old);
        }
        None
    }

    /// Removes a connection from the manager.
    ///
    /// `authenticated` is the user the connection's handler authenticated,
    /// if any. It is needed because a failed send may already have dropped
    /// the connection's record and binding.
    ///
    /// # Returns
    ///
    /// The user whose departure must be cleaned up, unless a newer
    /// connection on this instance has taken that user over. A displaced
    /// connection returns `None`, so its cleanup does not undo the newer
    /// session's state.
    pub async fn remove_connection(
        &self,
        connection_id: ConnectionId,
        authenticated: Option<&UserId>,
    ) -> Option<UserId> {
        let mut registry = self.registry.write().await;
        let user_id = authenticated.cloned().or_else(|| {
            registry
                .connections
                .get(&connection_id)
                .and_then(|c| c.user_id.clone())
        });
        if let Some(connection) = registry.remove(connection_id) {
            info!(
                "❌ Connection {} from {} disconnected",
                connection_id, connection.remote_addr
            );
        }

        let user_id = user_id?;
        if let Some(newer) = registry.by_user.get(&user_id) {
            debug!("{} is now served by connection {}", user_id, newer);
            return None;
        }
        Some(user_id)
    }

    pub async fn connection_of(&self, user_id: &UserId) -> Option<ConnectionId> {
        self.registry.read().await.by_user.get(user_id).copied()
    }

    pub async fn is_user_connected(&self, user_id: &UserId) -> bool {
        self.registry.read().await.by_user.contains_key(user_id)
    }

    pub async fn connection_count(&self) -> usize {
        self.registry.read().await.connections.len()
    }

    /// Sends an event to a specific connection.
    ///
    /// A dead connection is dropped from the registry and reported as
    /// `TRANSPORT_FAILURE`.
    pub async fn send_to_connection(
        &self,
        connection_id: ConnectionId,
        event: &ServerEvent,
    ) -> Result<(), LobbyError> {
        let text = event.to_text()?;
        self.send_text(connection_id, text).await
    }

    async fn send_text(&self, connection_id: ConnectionId, text: String) -> Result<(), LobbyError> {
        let delivered = {
            let registry = self.registry.read().await;
            match registry.connections.get(&connection_id) {
                Some(connection) => connection.send(Message::Text(text.into())).is_ok(),
                None => {
                    return Err(LobbyError::TransportFailure(format!(
                        "connection {connection_id} is gone"
                    )))
                }
            }
        };
        if delivered {
            return Ok(());
        }
        self.registry.write().await.remove(connection_id);
        Err(LobbyError::TransportFailure(format!(
            "connection {connection_id} is closed"
        )))
    }

    /// Sends an event to the user's connection on this instance.
    pub async fn send_to_user(&self, user_id: &UserId, event: &ServerEvent) -> Result<(), LobbyError> {
        let connection_id = self
            .connection_of(user_id)
            .await
            .ok_or_else(|| LobbyError::TransportFailure(format!("{user_id} is not connected here")))?;
        self.send_to_connection(connection_id, event).await
    }

    /// Pushes an event to every listed user that is connected here.
    ///
    /// Users connected to other instances are skipped silently. Dead
    /// connections are removed without interrupting delivery to the rest.
    ///
    /// # Returns
    ///
    /// The number of connections the event was queued for.
    pub async fn deliver(&self, recipients: &[UserId], event: &ServerEvent) -> usize {
        let text = match event.to_text() {
            Ok(text) => text,
            Err(e) => {
                tracing::error!("Dropping {} event: {}", event.kind(), e);
                return 0;
            }
        };

        let mut delivered = 0;
        let mut dead = Vec::new();
        {
            let registry = self.registry.read().await;
            for user_id in recipients {
                let Some(connection_id) = registry.by_user.get(user_id) else {
                    continue;
                };
                let Some(connection) = registry.connections.get(connection_id) else {
                    continue;
                };
                match connection.send(Message::Text(text.clone().into())) {
                    Ok(()) => delivered += 1,
                    Err(_) => dead.push(*connection_id),
                }
            }
        }

        if !dead.is_empty() {
            let mut registry = self.registry.write().await;
            for connection_id in dead {
                if registry.remove(connection_id).is_some() {
                    debug!("🪦 Dropped dead connection {} during delivery", connection_id);
                }
            }
        }

        trace!("📡 Delivered {} to {} local connections", event.kind(), delivered);
        delivered
    }

    /// Kick (disconnect) a connection by ID, sending a close frame.
    pub async fn kick_connection(&self, connection_id: ConnectionId, reason: Option<String>) {
        let registry = self.registry.read().await;
        if let Some(connection) = registry.connections.get(&connection_id) {
            let close = Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: reason.unwrap_or_else(|| "Kicked by server".into()).into(),
            }));
            let _ = connection.send(close);
        }
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RoomId;

    fn addr() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    fn ping_event() -> ServerEvent {
        ServerEvent::RoomLeft {
            room_id: RoomId::new("ROOM01"),
        }
    }

    #[tokio::test]
    async fn deliver_skips_dead_connections_and_removes_them() {
        let manager = ConnectionManager::new();
        let (alive_tx, mut alive_rx) = mpsc::unbounded_channel();
        let (dead_tx, dead_rx) = mpsc::unbounded_channel();

        let alive = manager.add_connection(addr(), alive_tx).await;
        let dead = manager.add_connection(addr(), dead_tx).await;
        manager.bind_user(alive, UserId::new("a")).await;
        manager.bind_user(dead, UserId::new("d")).await;
        drop(dead_rx);

        let delivered = manager
            .deliver(
                &[UserId::new("d"), UserId::new("a"), UserId::new("elsewhere")],
                &ping_event(),
            )
            .await;
        assert_eq!(delivered, 1);
        assert!(matches!(alive_rx.recv().await, Some(Message::Text(_))));
        assert_eq!(manager.connection_count().await, 1);
        assert!(!manager.is_user_connected(&UserId::new("d")).await);
    }

    #[tokio::test]
    async fn sending_to_a_dead_connection_is_a_transport_failure() {
        let manager = ConnectionManager::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let id = manager.add_connection(addr(), tx).await;
        drop(rx);
        let err = manager.send_to_connection(id, &ping_event()).await.unwrap_err();
        assert_eq!(err.code(), "TRANSPORT_FAILURE");
        assert_eq!(manager.connection_count().await, 0);
    }

    #[tokio::test]
    async fn rebinding_displaces_the_old_connection() {
        let manager = ConnectionManager::new();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        let first = manager.add_connection(addr(), tx1).await;
        let second = manager.add_connection(addr(), tx2).await;
        let user = UserId::new("u");

        assert_eq!(manager.bind_user(first, user.clone()).await, None);
        assert_eq!(manager.bind_user(second, user.clone()).await, Some(first));
        assert_eq!(manager.connection_of(&user).await, Some(second));

        // The displaced connection no longer speaks for the user.
        assert_eq!(manager.remove_connection(first, Some(&user)).await, None);
        assert!(manager.is_user_connected(&user).await);
        assert_eq!(manager.remove_connection(second, Some(&user)).await, Some(user.clone()));
        assert!(!manager.is_user_connected(&user).await);
    }

    #[tokio::test]
    async fn connection_dropped_by_delivery_still_reports_its_user() {
        let manager = ConnectionManager::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let id = manager.add_connection(addr(), tx).await;
        let user = UserId::new("b");
        manager.bind_user(id, user.clone()).await;
        drop(rx);

        assert_eq!(manager.deliver(&[user.clone()], &ping_event()).await, 0);
        assert!(!manager.is_user_connected(&user).await);

        assert_eq!(manager.remove_connection(id, Some(&user)).await, Some(user));
    }

    #[tokio::test]
    async fn unauthenticated_connection_has_no_user_to_clean_up() {
        let manager = ConnectionManager::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = manager.add_connection(addr(), tx).await;
        assert_eq!(manager.remove_connection(id, None).await, None);
        assert_eq!(manager.connection_count().await, 0);
    }

    #[tokio::test]
    async fn kick_sends_a_close_frame() {
        let manager = ConnectionManager::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = manager.add_connection(addr(), tx).await;
        manager.kick_connection(id, Some("bye".into())).await;
        assert!(matches!(rx.recv().await, Some(Message::Close(Some(_)))));
    }
}
