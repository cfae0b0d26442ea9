//! Connection management for client connections.
//!
//! This module handles the lifecycle of client connections on one lobby
//! instance: connection tracking, binding authenticated users, and pushing
//! outbound events to the right sockets.

pub mod client;
pub mod manager;

pub use client::ClientConnection;
pub use manager::ConnectionManager;
pub use crate::types::ConnectionId;
