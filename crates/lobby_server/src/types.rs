//! Identifier and status types shared across the lobby.
//!
//! User and room ids are opaque strings: user ids come from the session
//! store (the excluded auth service mints them), room ids are short
//! human-friendly codes minted by the room registry.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

/// Stable identity of an authenticated user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a room, six characters from `A-Z0-9`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Process-local identifier of a transport connection.
///
/// Connection ids are never shared with other instances; they only key
/// the local [`ConnectionManager`](crate::connection::ConnectionManager).
pub type ConnectionId = usize;

/// Kind of account behind a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountKind {
    Registered,
    Guest,
}

/// Which broad area of the system a session is currently associated with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    #[default]
    Initial,
    InLobby,
    InWaitingRoom,
    InGame,
    Offline,
}

/// The identity resolved from a session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: UserId,
    pub username: String,
    pub account_kind: AccountKind,
}

/// Current Unix time in milliseconds.
pub fn current_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Shared shutdown state for coordinating graceful shutdown across the
/// accept loop and the background tasks.
#[derive(Debug, Clone)]
pub struct ShutdownState {
    /// Set once shutdown starts; loops stop picking up new work
    shutdown_initiated: Arc<AtomicBool>,
    /// Set once in-flight work has drained
    shutdown_complete: Arc<AtomicBool>,
}

impl ShutdownState {
    pub fn new() -> Self {
        Self {
            shutdown_initiated: Arc::new(AtomicBool::new(false)),
            shutdown_complete: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_shutdown_initiated(&self) -> bool {
        self.shutdown_initiated.load(Ordering::Acquire)
    }

    pub fn is_shutdown_complete(&self) -> bool {
        self.shutdown_complete.load(Ordering::Acquire)
    }

    pub fn initiate_shutdown(&self) {
        self.shutdown_initiated.store(true, Ordering::Release);
        info!("🛑 Shutdown initiated - no new connections will be accepted");
    }

    pub fn complete_shutdown(&self) {
        self.shutdown_complete.store(true, Ordering::Release);
        info!("✅ Lobby drained - ready for final cleanup");
    }
}

impl Default for ShutdownState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_serialize_as_plain_strings() {
        let user = UserId::new("42");
        let room = RoomId::new("AB12CD");
        assert_eq!(serde_json::to_string(&user).unwrap(), "\"42\"");
        assert_eq!(serde_json::to_string(&room).unwrap(), "\"AB12CD\"");
    }

    #[test]
    fn presence_status_wire_names() {
        assert_eq!(
            serde_json::to_string(&PresenceStatus::InWaitingRoom).unwrap(),
            "\"in_waiting_room\""
        );
        assert_eq!(
            serde_json::from_str::<AccountKind>("\"guest\"").unwrap(),
            AccountKind::Guest
        );
    }

    #[test]
    fn shutdown_state_flags() {
        let state = ShutdownState::new();
        let observer = state.clone();
        assert!(!observer.is_shutdown_initiated());
        state.initiate_shutdown();
        assert!(observer.is_shutdown_initiated());
        assert!(!observer.is_shutdown_complete());
        state.complete_shutdown();
        assert!(observer.is_shutdown_complete());
    }
}
