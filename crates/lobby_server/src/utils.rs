//! Utility functions and helper methods for the lobby server.
//!
//! This module provides convenient factory functions for creating server
//! instances with different configurations.

use crate::{config::ServerConfig, error::ServerError, server::LobbyServer};

/// Creates a new lobby server with default configuration.
///
/// The default configuration keeps all state in memory, so this cannot
/// fail in practice; the `Result` matches [`create_server_with_config`].
///
/// # Example
///
/// ```rust
/// use lobby_server::create_server;
///
/// let server = create_server().expect("in-memory server");
/// assert_eq!(server.config().max_connections, 1000);
/// ```
pub fn create_server() -> Result<LobbyServer, ServerError> {
    LobbyServer::new(ServerConfig::default())
}

/// Creates a new lobby server with custom configuration.
///
/// # Example
///
/// ```rust
/// use lobby_server::{create_server_with_config, ServerConfig};
///
/// let config = ServerConfig {
///     bind_address: "0.0.0.0:9000".parse().unwrap(),
///     max_connections: 5000,
///     ..Default::default()
/// };
///
/// let server = create_server_with_config(config).unwrap();
/// ```
pub fn create_server_with_config(config: ServerConfig) -> Result<LobbyServer, ServerError> {
    LobbyServer::new(config)
}
