//! Configuration management for the Kingsmaker lobby.
//!
//! This module handles loading, validation, and conversion of lobby
//! configuration from TOML files, `LOBBY_*` environment variables and
//! command-line arguments.

use lobby_server::{LobbyTimings, ServerConfig, StoreBackend, StoreConfig};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;

/// Application configuration loaded from TOML file.
///
/// This is the main configuration structure that encompasses the network
/// listener, the shared store, lobby timings and logging.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// Listener configuration settings
    #[serde(default)]
    pub server: ServerSettings,
    /// Shared store configuration settings
    #[serde(default)]
    pub store: StoreSettings,
    /// Lobby protocol timings
    #[serde(default)]
    pub lobby: LobbySettings,
    /// Logging configuration settings
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Listener settings.
///
/// Controls network binding, connection limits and frame sizes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Network address to bind the server to (e.g., "127.0.0.1:8080")
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Maximum number of concurrent client connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Largest accepted inbound frame in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// Buffer size of the local broadcast channel
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
}

fn default_bind_address() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_max_connections() -> usize {
    1000
}

fn default_max_message_size() -> usize {
    64 * 1024
}

fn default_broadcast_capacity() -> usize {
    1024
}

/// Shared store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    /// `memory` for a single instance, `redis` to share state between instances
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

/// Lobby timings. Every field falls back to the lobby default when omitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LobbySettings {
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
    #[serde(default = "default_room_max_age_secs")]
    pub room_max_age_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_auth_timeout_ms")]
    pub auth_timeout_ms: u64,
    #[serde(default = "default_presence_timeout_ms")]
    pub presence_timeout_ms: u64,
    /// 0 disables the periodic presence cycle
    #[serde(default = "default_presence_interval_secs")]
    pub presence_interval_secs: u64,
    #[serde(default = "default_game_start_delay_ms")]
    pub game_start_delay_ms: u64,
}

fn default_session_ttl_secs() -> u64 {
    LobbyTimings::default().session_ttl_secs
}

fn default_room_max_age_secs() -> u64 {
    LobbyTimings::default().room_max_age_secs
}

fn default_sweep_interval_secs() -> u64 {
    LobbyTimings::default().sweep_interval_secs
}

fn default_auth_timeout_ms() -> u64 {
    LobbyTimings::default().auth_timeout_ms
}

fn default_presence_timeout_ms() -> u64 {
    LobbyTimings::default().presence_timeout_ms
}

fn default_presence_interval_secs() -> u64 {
    LobbyTimings::default().presence_interval_secs
}

fn default_game_start_delay_ms() -> u64 {
    LobbyTimings::default().game_start_delay_ms
}

/// Logging configuration settings.
///
/// Controls log level, output format, and optional file output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level: "trace", "debug", "info", "warn", or "error"
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Whether to output logs in JSON format
    #[serde(default)]
    pub json_format: bool,
    /// Optional file path for log output
    #[serde(default)]
    pub file_path: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            max_connections: default_max_connections(),
            max_message_size: default_max_message_size(),
            broadcast_capacity: default_broadcast_capacity(),
        }
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            redis_url: default_redis_url(),
        }
    }
}

impl Default for LobbySettings {
    fn default() -> Self {
        let timings = LobbyTimings::default();
        Self {
            session_ttl_secs: timings.session_ttl_secs,
            room_max_age_secs: timings.room_max_age_secs,
            sweep_interval_secs: timings.sweep_interval_secs,
            auth_timeout_ms: timings.auth_timeout_ms,
            presence_timeout_ms: timings.presence_timeout_ms,
            presence_interval_secs: timings.presence_interval_secs,
            game_start_delay_ms: timings.game_start_delay_ms,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
            file_path: None,
        }
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file.
    ///
    /// If the file doesn't exist, creates a default configuration file at the specified path
    /// and returns the default configuration.
    pub async fn load_from_file(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            let config: AppConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content).await?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    /// Applies `LOBBY_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<(), String> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Applies `LOBBY_*` overrides read through `lookup`.
    ///
    /// Numeric variables that do not parse are reported instead of ignored.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<(), String>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("LOBBY_REDIS_URL") {
            self.store.redis_url = url;
        }

        let numeric = |key: &str| -> Result<Option<u64>, String> {
            lookup(key)
                .map(|raw| {
                    raw.trim()
                        .parse::<u64>()
                        .map_err(|_| format!("{key} must be a non-negative integer, got {raw:?}"))
                })
                .transpose()
        };

        if let Some(secs) = numeric("LOBBY_SESSION_TTL_SECS")? {
            self.lobby.session_ttl_secs = secs;
        }
        if let Some(secs) = numeric("LOBBY_ROOM_MAX_AGE_SECS")? {
            self.lobby.room_max_age_secs = secs;
        }
        if let Some(ms) = numeric("LOBBY_AUTH_TIMEOUT_MS")? {
            self.lobby.auth_timeout_ms = ms;
        }
        if let Some(ms) = numeric("LOBBY_PRESENCE_TIMEOUT_MS")? {
            self.lobby.presence_timeout_ms = ms;
        }
        Ok(())
    }

    /// Converts the application configuration to a lobby server configuration.
    ///
    /// # Returns
    ///
    /// A `ServerConfig` instance ready for use with the lobby server, or an
    /// error if the bind address does not parse.
    pub fn to_server_config(&self) -> Result<ServerConfig, Box<dyn std::error::Error>> {
        let lobby = &self.lobby;
        Ok(ServerConfig {
            bind_address: self.server.bind_address.parse()?,
            max_connections: self.server.max_connections,
            max_message_size: self.server.max_message_size,
            broadcast_capacity: self.server.broadcast_capacity,
            store: StoreConfig {
                backend: self.store.backend,
                redis_url: self.store.redis_url.clone(),
            },
            timings: LobbyTimings {
                session_ttl_secs: lobby.session_ttl_secs,
                room_max_age_secs: lobby.room_max_age_secs,
                sweep_interval_secs: lobby.sweep_interval_secs,
                auth_timeout_ms: lobby.auth_timeout_ms,
                presence_timeout_ms: lobby.presence_timeout_ms,
                presence_interval_secs: lobby.presence_interval_secs,
                game_start_delay_ms: lobby.game_start_delay_ms,
            },
        })
    }

    /// Validates the configuration for consistency and correctness.
    ///
    /// # Returns
    ///
    /// `Ok(())` if the configuration is valid, or an error string describing the issue.
    pub fn validate(&self) -> Result<(), String> {
        if self.server.bind_address.parse::<std::net::SocketAddr>().is_err() {
            return Err(format!(
                "Invalid bind address: {}",
                &self.server.bind_address
            ));
        }

        if self.server.max_connections == 0 {
            return Err("server.max_connections must be greater than 0".to_string());
        }
        if self.server.max_message_size == 0 {
            return Err("server.max_message_size must be greater than 0".to_string());
        }
        if self.server.broadcast_capacity == 0 {
            return Err("server.broadcast_capacity must be greater than 0".to_string());
        }

        if self.store.backend == StoreBackend::Redis && self.store.redis_url.trim().is_empty() {
            return Err("store.redis_url is required for the redis backend".to_string());
        }

        let lobby = &self.lobby;
        if lobby.session_ttl_secs == 0 {
            return Err("lobby.session_ttl_secs must be greater than 0".to_string());
        }
        if lobby.room_max_age_secs == 0 {
            return Err("lobby.room_max_age_secs must be greater than 0".to_string());
        }
        if lobby.sweep_interval_secs == 0 {
            return Err("lobby.sweep_interval_secs must be greater than 0".to_string());
        }
        if lobby.auth_timeout_ms == 0 {
            return Err("lobby.auth_timeout_ms must be greater than 0".to_string());
        }
        if lobby.presence_timeout_ms == 0 {
            return Err("lobby.presence_timeout_ms must be greater than 0".to_string());
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Must be one of: {valid_levels:?}",
                &self.logging.level
            ));
        }

        Ok(())
    }
}
