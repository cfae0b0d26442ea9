//! Server configuration types and defaults.
//!
//! This module contains the server configuration structure and default values
//! used to initialize and customize the lobby server behavior.

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Configuration structure for the lobby server.
///
/// Contains all necessary parameters to configure server behavior including
/// network settings, the shared store backend, and lobby timings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// The socket address to bind the server to
    pub bind_address: SocketAddr,

    /// Maximum number of concurrent connections allowed
    pub max_connections: usize,

    /// Maximum inbound message size in bytes
    pub max_message_size: usize,

    /// Buffer size of the local broadcast channel
    pub broadcast_capacity: usize,

    /// Where rooms, sessions and broadcasts live
    pub store: StoreConfig,

    /// Timeouts and intervals of the lobby protocol
    pub timings: LobbyTimings,
}

/// Shared store backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Single process; nothing is shared with other instances
    #[default]
    Memory,
    /// Redis, shared by every instance pointed at it
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub redis_url: String,
}

/// Lobby timings. Durations are stored as plain numbers so they read
/// naturally in configuration files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LobbyTimings {
    /// Lifetime of a session record, refreshed on every presence change
    pub session_ttl_secs: u64,

    /// Age after which a WAITING room is swept
    pub room_max_age_secs: u64,

    /// How often the sweeper runs
    pub sweep_interval_secs: u64,

    /// Window for the `auth` message after connecting
    pub auth_timeout_ms: u64,

    /// Window for answering a presence challenge
    pub presence_timeout_ms: u64,

    /// Interval of the periodic presence cycle (0 disables it)
    pub presence_interval_secs: u64,

    /// Pause between `game-starting` and the game handoff
    pub game_start_delay_ms: u64,
}

impl LobbyTimings {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn room_max_age(&self) -> Duration {
        Duration::from_secs(self.room_max_age_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }

    pub fn presence_timeout(&self) -> Duration {
        Duration::from_millis(self.presence_timeout_ms)
    }

    /// `None` when the periodic cycle is disabled.
    pub fn presence_interval(&self) -> Option<Duration> {
        (self.presence_interval_secs > 0).then(|| Duration::from_secs(self.presence_interval_secs))
    }

    /// How long a room member may go untouched by any instance before the
    /// presence cycle treats them as abandoned: three missed cycles plus one
    /// challenge window.
    pub fn orphan_grace(&self) -> Duration {
        Duration::from_secs(self.presence_interval_secs.saturating_mul(3)) + self.presence_timeout()
    }

    pub fn game_start_delay(&self) -> Duration {
        Duration::from_millis(self.game_start_delay_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from((Ipv4Addr::LOCALHOST, 8080)),
            max_connections: 1000,
            max_message_size: 64 * 1024, // 64KB
            broadcast_capacity: 1024,
            store: StoreConfig::default(),
            timings: LobbyTimings::default(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            redis_url: "redis://127.0.0.1:6379/".to_string(),
        }
    }
}

impl Default for LobbyTimings {
    fn default() -> Self {
        Self {
            session_ttl_secs: 24 * 60 * 60,
            room_max_age_secs: 24 * 60 * 60,
            sweep_interval_secs: 5 * 60,
            auth_timeout_ms: 10_000,
            presence_timeout_ms: 5_000,
            presence_interval_secs: 60,
            game_start_delay_ms: 2_000,
        }
    }
}
