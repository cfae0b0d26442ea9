//! Error types and handling for the lobby server.
//!
//! Three layers of failure are kept apart:
//!
//! * [`LobbyError`] - recoverable failures of a single request. Each variant
//!   carries a stable wire code and is reported to the originating client as
//!   one `error` message; it never tears down the handling task (except for
//!   the authentication variants, which close the connection).
//! * [`StoreError`] - failures of a shared-store backend. Surfaced to clients
//!   as `STORE_UNAVAILABLE`.
//! * [`ServerError`] - infrastructure failures of the accept loop and the
//!   WebSocket handshake.

use crate::rooms::RoomState;
use crate::types::RoomId;

/// Enumeration of possible server errors.
///
/// Categorizes errors into network-related and internal server errors
/// to help with debugging and error handling.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Network-related errors such as binding failures or connection issues
    #[error("Network error: {0}")]
    Network(String),

    /// Internal server errors including store outages at startup
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failure of a shared-store backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Recoverable, client-visible failure of a lobby request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LobbyError {
    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("session expired, please authenticate again")]
    SessionExpired,

    #[error("room {0} not found")]
    RoomNotFound(RoomId),

    #[error("room {0} is full")]
    RoomFull(RoomId),

    #[error("already in room {0}")]
    AlreadyInRoom(RoomId),

    #[error("not in that room")]
    NotInRoom,

    #[error("room is {0}, request is only valid while WAITING")]
    WrongRoomState(RoomState),

    #[error("only the host may do that")]
    NotHost,

    #[error("cannot start game: {0}")]
    CannotStart(String),

    #[error("invalid room settings: {0}")]
    InvalidSettings(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("message of {0} bytes exceeds the size limit")]
    MessageTooLarge(usize),

    #[error("transport failure: {0}")]
    TransportFailure(String),

    #[error("shared store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl LobbyError {
    /// Stable machine-readable code sent with every `error` message.
    pub fn code(&self) -> &'static str {
        match self {
            LobbyError::AuthenticationFailed => "AUTHENTICATION_FAILED",
            LobbyError::SessionExpired => "SESSION_EXPIRED",
            LobbyError::RoomNotFound(_) => "ROOM_NOT_FOUND",
            LobbyError::RoomFull(_) => "ROOM_FULL",
            LobbyError::AlreadyInRoom(_) => "ALREADY_IN_ROOM",
            LobbyError::NotInRoom => "NOT_IN_ROOM",
            LobbyError::WrongRoomState(_) => "WRONG_ROOM_STATE",
            LobbyError::NotHost => "NOT_HOST",
            LobbyError::CannotStart(_) => "CANNOT_START",
            LobbyError::InvalidSettings(_) => "INVALID_SETTINGS",
            LobbyError::InvalidMessage(_) => "INVALID_MESSAGE",
            LobbyError::MessageTooLarge(_) => "MESSAGE_TOO_LARGE",
            LobbyError::TransportFailure(_) => "TRANSPORT_FAILURE",
            LobbyError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            LobbyError::Internal(_) => "INTERNAL",
        }
    }

    /// Whether the connection must be closed after reporting this error.
    pub fn closes_connection(&self) -> bool {
        matches!(
            self,
            LobbyError::AuthenticationFailed | LobbyError::SessionExpired
        )
    }
}

impl From<StoreError> for LobbyError {
    fn from(err: StoreError) -> Self {
        LobbyError::StoreUnavailable(err.to_string())
    }
}
