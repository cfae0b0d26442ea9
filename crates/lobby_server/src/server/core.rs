//! Core lobby server implementation.
//!
//! This module contains the `LobbyServer` struct, which owns the lobby
//! services, runs the accept loop and supervises the background tasks
//! every instance needs: the broadcast relay and fan-out, the room
//! sweeper and the periodic presence cycle.

use crate::broadcast::spawn_fanout;
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::rooms::sweeper::spawn_room_sweeper;
use crate::server::handlers::handle_connection;
use crate::services::LobbyServices;
use crate::types::ShutdownState;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{error, info, warn};

/// How often a blocked accept loop re-checks the shutdown state.
const SHUTDOWN_POLL: Duration = Duration::from_millis(250);

/// The lobby server.
///
/// `LobbyServer` owns one instance's [`LobbyServices`] and serves them
/// over WebSocket. Any number of instances may run against the same
/// shared store; they coordinate only through it and the broadcaster.
pub struct LobbyServer {
    services: LobbyServices,

    /// Channel for coordinating server shutdown
    shutdown_sender: broadcast::Sender<()>,
}

impl LobbyServer {
    /// Creates a lobby server with the store backend named in `config`.
    ///
    /// # Returns
    ///
    /// The server, or a `ServerError` if a store client could not be
    /// created (for example an unparsable Redis URL).
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let services = LobbyServices::from_config(config)
            .map_err(|e| ServerError::Internal(format!("Failed to create store clients: {e}")))?;
        Ok(Self::with_services(services))
    }

    /// Creates a lobby server over already constructed services.
    pub fn with_services(services: LobbyServices) -> Self {
        let (shutdown_sender, _) = broadcast::channel(1);
        Self {
            services,
            shutdown_sender,
        }
    }

    pub fn services(&self) -> &LobbyServices {
        &self.services
    }

    pub fn config(&self) -> &ServerConfig {
        &self.services.config
    }

    /// Starts the server and runs until shutdown is requested through
    /// `shutdown_state` or [`shutdown`](Self::shutdown).
    pub async fn start_with_shutdown_state(&self, shutdown_state: ShutdownState) -> Result<(), ServerError> {
        self.start_internal(Some(shutdown_state)).await
    }

    /// Starts the server and runs until [`shutdown`](Self::shutdown).
    pub async fn start(&self) -> Result<(), ServerError> {
        self.start_internal(None).await
    }

    async fn start_internal(&self, shutdown_state: Option<ShutdownState>) -> Result<(), ServerError> {
        let bind_address = self.config().bind_address;
        let listener = TcpListener::bind(bind_address)
            .await
            .map_err(|e| ServerError::Network(format!("Failed to bind {bind_address}: {e}")))?;
        self.serve(listener, shutdown_state).await
    }

    /// Serves lobby connections accepted from `listener`.
    ///
    /// # Startup Sequence
    ///
    /// 1. Check that the shared store answers; refuse to serve otherwise
    /// 2. Start the broadcast relay and the local fan-out
    /// 3. Start the room sweeper and the presence cycle
    /// 4. Accept connections until shutdown
    /// 5. Stop the background tasks
    pub async fn serve(
        &self,
        listener: TcpListener,
        shutdown_state: Option<ShutdownState>,
    ) -> Result<(), ServerError> {
        let local_addr = listener
            .local_addr()
            .map_err(|e| ServerError::Network(e.to_string()))?;
        info!("🚀 Starting lobby server on {}", local_addr);

        if let Err(e) = self.services.health_check().await {
            error!("💥 Shared store is unreachable: {}", e);
            return Err(ServerError::Internal(format!("Shared store unreachable: {e}")));
        }
        info!("🗄️ Shared store is reachable");

        let background = self.spawn_background_tasks(shutdown_state.clone());
        let mut shutdown_receiver = self.shutdown_sender.subscribe();

        loop {
            if shutdown_state.as_ref().is_some_and(|s| s.is_shutdown_initiated()) {
                info!("🛑 Accept loop stopping - shutdown initiated");
                break;
            }

            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let services = self.services.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, addr, services).await {
                                error!("Connection error: {:?}", e);
                            }
                        });
                    }
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                    }
                },
                _ = shutdown_receiver.recv() => {
                    info!("Internal shutdown signal received");
                    break;
                }
                _ = tokio::time::sleep(SHUTDOWN_POLL) => {}
            }
        }

        info!("🧹 Stopping background tasks...");
        for task in background {
            task.abort();
        }
        info!("Server stopped");
        Ok(())
    }

    fn spawn_background_tasks(&self, shutdown_state: Option<ShutdownState>) -> Vec<JoinHandle<()>> {
        let services = &self.services;
        let timings = &services.config.timings;
        let mut tasks = Vec::new();

        // Subscribe before relaying so nothing published in between is lost.
        tasks.push(spawn_fanout(
            services.broadcaster.as_ref(),
            Arc::clone(&services.connections),
        ));
        if let Some(relay) = services.broadcaster.spawn_relay(shutdown_state.clone()) {
            tasks.push(relay);
        }

        tasks.push(spawn_room_sweeper(
            Arc::clone(&services.rooms),
            Arc::clone(&services.sessions),
            Arc::clone(&services.broadcaster),
            timings.sweep_interval(),
            timings.room_max_age(),
            shutdown_state.clone(),
        ));
        info!(
            "🧹 Room sweeper every {:?}, max room age {:?}",
            timings.sweep_interval(),
            timings.room_max_age()
        );

        match timings.presence_interval() {
            Some(interval) => {
                tasks.push(services.presence.spawn_periodic(interval, shutdown_state));
                info!("🔎 Presence cycle every {:?}", interval);
            }
            None => info!("⏸️ Presence cycle disabled"),
        }
        tasks
    }

    /// Initiates server shutdown.
    ///
    /// # Returns
    ///
    /// `Ok(())` if the shutdown signal was sent successfully.
    pub async fn shutdown(&self) -> Result<(), ServerError> {
        info!("🛑 Shutting down server...");
        let _ = self.shutdown_sender.send(());
        Ok(())
    }
}
