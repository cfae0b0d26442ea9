//! # Kingsmaker Lobby - Main Entry Point
//!
//! Runs one lobby instance: parses the command line, loads the TOML
//! configuration, sets up logging and serves the lobby until a termination
//! signal arrives.
//!
//! ## Quick Start
//!
//! ```bash
//! # Run with default configuration (in-memory store)
//! kingsmaker-lobby
//!
//! # Specify custom configuration
//! kingsmaker-lobby --config production.toml
//!
//! # Share state with other instances through Redis
//! kingsmaker-lobby --store redis --redis-url redis://cache:6379/
//!
//! # JSON logging for production
//! kingsmaker-lobby --json-logs
//! ```
//!
//! ## Configuration
//!
//! The lobby loads configuration from a TOML file (default: `config.toml`).
//! If the file doesn't exist, a default configuration will be created.
//! `LOBBY_REDIS_URL`, `LOBBY_SESSION_TTL_SECS`, `LOBBY_ROOM_MAX_AGE_SECS`,
//! `LOBBY_AUTH_TIMEOUT_MS` and `LOBBY_PRESENCE_TIMEOUT_MS` override the file;
//! command-line options override both.
//!
//! ## Signal Handling
//!
//! The lobby handles graceful shutdown on:
//! - SIGINT (Ctrl+C)
//! - SIGTERM (Unix systems)

use tracing::error;

pub mod app;
pub mod cli;
pub mod config;
pub mod logging;
pub mod signals;

use app::Application;
use cli::CliArgs;
use config::AppConfig;

/// Main entry point for the Kingsmaker lobby.
///
/// # Exit Codes
///
/// * **0**: Successful execution and shutdown
/// * **1**: Error during startup, configuration, or runtime
///
/// Called from `main` inside the tokio runtime.
pub async fn init() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    // Load configuration to get logging settings
    let mut config = AppConfig::load_from_file(&args.config_path)
        .await
        .unwrap_or_default();
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }

    // Setup logging before anything else
    if let Err(e) = logging::setup_logging(&config.logging, args.json_logs) {
        eprintln!("❌ Failed to setup logging: {e}");
        std::process::exit(1);
    }

    match Application::new(args).await {
        Ok(app) => {
            if let Err(e) = app.run().await {
                error!("❌ Application error: {:?}", e);
                std::process::exit(1);
            }
        }
        Err(e) => {
            error!("❌ Failed to start application: {e:?}");
            std::process::exit(1);
        }
    }

    Ok(())
}

// Re-export main types for potential library usage
pub use config::{LobbySettings, LoggingSettings, ServerSettings, StoreSettings};
