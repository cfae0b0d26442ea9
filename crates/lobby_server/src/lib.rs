//! # Lobby Server - Room and Session Coordination
//!
//! The pre-game lobby for Kingsmaker: authenticates live WebSocket
//! connections, tracks which room each player occupies, enforces capacity
//! and readiness rules, and hands a room to the game engine with a
//! deterministic turn order.
//!
//! ## Design Philosophy
//!
//! Lobby instances are stateless apart from their sockets. Everything that
//! must agree across instances lives in a shared store behind a port:
//!
//! * **Sessions** - [`session::SessionStore`] over a [`session::SessionRepository`]
//! * **Rooms** - [`rooms::RoomRegistry`] over a [`rooms::RoomRepository`] with
//!   compare-and-set commits, so concurrent joins cannot overfill a room
//! * **Events** - [`broadcast::Broadcaster`], fanned out by every instance to
//!   the connections it holds
//!
//! Each port has an in-memory adapter for tests and single-node use and a
//! Redis adapter for multi-instance deployments.
//!
//! ## Message Flow
//!
//! 1. Client connects and sends `auth{token}` within the handshake window
//! 2. The connection is bound to the user in the local [`connection::ConnectionManager`]
//! 3. Each request runs one guarded room transition through the registry
//! 4. Resulting events are published through the broadcaster
//! 5. Every instance delivers them to its locally connected room members
//!
//! ## Wire Format
//!
//! ```json
//! { "type": "join-room", "data": { "roomId": "K3X9QZ" } }
//! ```
//!
//! Rejected requests are answered with exactly one `error` message carrying
//! a stable code and the type of the request that caused it.
//!
//! ## Error Handling
//!
//! * [`LobbyError`] - per-request failures reported to the client
//! * [`error::StoreError`] - shared store failures
//! * [`ServerError`] - accept loop and startup failures

// Re-export core types and functions for easy access
pub use broadcast::{Broadcaster, LocalBroadcaster, RedisBroadcaster, RoomBroadcast};
pub use config::{LobbyTimings, ServerConfig, StoreBackend, StoreConfig};
pub use error::{LobbyError, ServerError};
pub use messaging::{ClientRequest, ServerEvent};
pub use server::LobbyServer;
pub use services::LobbyServices;
pub use types::ShutdownState;
pub use utils::{create_server, create_server_with_config};

// Public module declarations
pub mod broadcast;
pub mod collaborators;
pub mod config;
pub mod connection;
pub mod error;
pub mod messaging;
pub mod presence;
pub mod rooms;
pub mod server;
pub mod services;
pub mod session;
pub mod turn_order;
pub mod types;
pub mod utils;

mod tests;
