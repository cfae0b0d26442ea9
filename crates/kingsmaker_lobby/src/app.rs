//! Main application logic and lifecycle management.
//!
//! This module contains the `Application` struct that orchestrates lobby
//! startup, signal handling and the graceful drain on shutdown.

use crate::{
    cli::CliArgs,
    config::AppConfig,
    logging::display_banner,
    signals::drain_on_signal,
};
use lobby_server::{LobbyServer, ShutdownState, StoreBackend};
use tracing::{error, info, warn};

/// How long the accept loop gets to notice the shutdown before it is aborted.
const SERVER_STOP_TIMEOUT: tokio::time::Duration = tokio::time::Duration::from_secs(8);

/// Main application struct.
///
/// The `Application` struct manages the complete lifecycle of one lobby
/// instance: configuration merging, server creation, and shutdown.
pub struct Application {
    /// Merged application configuration
    config: AppConfig,
    /// Lobby server instance
    server: LobbyServer,
}

impl Application {
    /// Creates a new application instance.
    ///
    /// # Process
    ///
    /// 1. Load configuration from file (creating default if missing)
    /// 2. Apply `LOBBY_*` environment overrides
    /// 3. Apply command-line argument overrides
    /// 4. Validate merged configuration
    /// 5. Display startup banner
    /// 6. Create the lobby server and its store clients
    pub async fn new(args: CliArgs) -> Result<Self, Box<dyn std::error::Error>> {
        info!("🔧 Loading configuration from: {}", args.config_path.display());
        let mut config = AppConfig::load_from_file(&args.config_path).await?;
        config.apply_env_overrides()?;
        Self::apply_cli_overrides(&mut config, &args)?;

        if let Err(e) = config.validate() {
            return Err(format!("Configuration validation failed: {e}").into());
        }
        info!("✅ Configuration loaded and validated successfully");

        display_banner();

        let server_config = config.to_server_config()?;
        let server = LobbyServer::new(server_config)?;

        info!(
            "📂 Config: {} | Store: {:?}",
            args.config_path.display(),
            config.store.backend
        );

        Ok(Self { config, server })
    }

    fn apply_cli_overrides(config: &mut AppConfig, args: &CliArgs) -> Result<(), String> {
        if let Some(bind_address) = &args.bind_address {
            config.server.bind_address = bind_address.clone();
        }

        if let Some(log_level) = &args.log_level {
            config.logging.level = log_level.clone();
        }

        if args.json_logs {
            config.logging.json_format = true;
        }

        if let Some(store) = &args.store {
            config.store.backend = match store.as_str() {
                "memory" => StoreBackend::Memory,
                "redis" => StoreBackend::Redis,
                other => return Err(format!("Unknown store backend: {other}")),
            };
        }

        if let Some(redis_url) = &args.redis_url {
            config.store.redis_url = redis_url.clone();
        }
        Ok(())
    }

    /// Runs the lobby until a termination signal arrives.
    ///
    /// # Shutdown Phases
    ///
    /// 1. Mark the shared shutdown state; the accept loop and the
    ///    background tasks stop picking up work
    /// 2. Wait for the server task to return
    /// 3. Give open connections a moment to close
    ///
    /// A second signal during the drain exits the process at once.
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        info!("🌟 Starting Kingsmaker lobby");
        self.log_configuration_summary();

        let config = self.config.clone();
        let shutdown_state = ShutdownState::new();
        let shutdown_state_for_server = shutdown_state.clone();

        let server_handle = {
            let server = self.server;
            tokio::spawn(async move {
                match server.start_with_shutdown_state(shutdown_state_for_server).await {
                    Ok(()) => {
                        info!("✅ Server completed successfully");
                    }
                    Err(e) => {
                        error!("❌ Server error: {:?}", e);
                        std::process::exit(1);
                    }
                }
            })
        };

        info!("✅ Kingsmaker lobby is now running!");
        info!(
            "🎮 Ready to accept connections on {}",
            config.server.bind_address
        );
        info!("🛑 Press Ctrl+C to gracefully shutdown");

        drain_on_signal(&shutdown_state).await?;

        info!("📡 Phase 1: Stopping the accept loop and background tasks...");

        match tokio::time::timeout(SERVER_STOP_TIMEOUT, server_handle).await {
            Ok(Ok(())) => info!("✅ Server task completed gracefully"),
            Ok(Err(e)) => warn!("⚠️ Server task ended abnormally: {}", e),
            Err(_) => warn!("⏰ Server task did not complete within {:?}", SERVER_STOP_TIMEOUT),
        }

        info!("⏳ Phase 2: Waiting for connections to close...");
        tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
        shutdown_state.complete_shutdown();

        info!("✅ Kingsmaker lobby shutdown complete");
        Ok(())
    }

    /// Logs the configuration summary at startup.
    fn log_configuration_summary(&self) {
        let lobby = &self.config.lobby;
        info!("📋 Configuration Summary:");
        info!("  🌐 Bind address: {}", self.config.server.bind_address);
        info!("  🗄️ Store: {:?}", self.config.store.backend);
        if self.config.store.backend == StoreBackend::Redis {
            info!("  🔗 Redis: {}", self.config.store.redis_url);
        }
        info!("  👥 Max connections: {}", self.config.server.max_connections);
        info!("  📦 Max message size: {} bytes", self.config.server.max_message_size);
        info!(
            "  ⏱️ Auth window: {}ms | Presence window: {}ms",
            lobby.auth_timeout_ms, lobby.presence_timeout_ms
        );
        info!(
            "  🧹 Rooms swept after {}s (every {}s)",
            lobby.room_max_age_secs, lobby.sweep_interval_secs
        );
    }
}
