//! Client connection representation.
//!
//! This module defines the per-connection record kept by the
//! [`ConnectionManager`](super::ConnectionManager).

use crate::types::UserId;
use std::net::SocketAddr;
use std::time::SystemTime;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

/// Represents an individual client connection to this lobby instance.
///
/// # Fields
///
/// * `user_id` - Set once the connection has authenticated
/// * `remote_addr` - The network address of the connected client
/// * `connected_at` - Timestamp when the connection was established
/// * `outbound` - Queue drained by the connection's writer task
#[derive(Debug)]
pub struct ClientConnection {
    /// The user bound to this connection (None until authenticated)
    pub user_id: Option<UserId>,

    /// The remote network address of the client
    pub remote_addr: SocketAddr,

    /// When this connection was established
    pub connected_at: SystemTime,

    outbound: mpsc::UnboundedSender<Message>,
}

impl ClientConnection {
    /// Creates a new, not yet authenticated connection record.
    ///
    /// # Arguments
    ///
    /// * `remote_addr` - The network address of the connecting client
    /// * `outbound` - Sender half of the connection's writer queue
    pub fn new(remote_addr: SocketAddr, outbound: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            user_id: None,
            remote_addr,
            connected_at: SystemTime::now(),
            outbound,
        }
    }

    /// Queues a frame for the writer task.
    ///
    /// Fails only when the writer is gone, which means the socket is dead.
    pub fn send(&self, message: Message) -> Result<(), Message> {
        self.outbound.send(message).map_err(|e| e.0)
    }
}
