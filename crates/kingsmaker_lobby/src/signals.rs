//! Termination signals for one lobby instance.
//!
//! The first SIGINT or SIGTERM (Ctrl+C on Windows) marks the shared
//! [`ShutdownState`] so the lobby starts draining. A signal that arrives
//! while the drain is still running ends the process at once.

use lobby_server::ShutdownState;
use tokio::signal;
use tracing::{error, info, warn};

/// Waits for the first termination signal, starts the drain and arms the
/// forced exit for any later one.
pub async fn drain_on_signal(shutdown: &ShutdownState) -> std::io::Result<()> {
    termination().await?;
    info!("📡 Received shutdown signal - draining the lobby");
    shutdown.initiate_shutdown();

    let shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = termination().await {
            error!("Failed to listen for a second shutdown signal: {e}");
            return;
        }
        if let Some(code) = forced_exit_code(&shutdown) {
            warn!("⚡ Shutdown signal received again, exiting without draining");
            std::process::exit(code);
        }
    });
    Ok(())
}

/// Exit code for a repeated signal, or `None` once the drain has finished.
fn forced_exit_code(shutdown: &ShutdownState) -> Option<i32> {
    (!shutdown.is_shutdown_complete()).then_some(1)
}

async fn termination() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = sigint.recv() => (),
            _ = sigterm.recv() => (),
        }
    }

    #[cfg(windows)]
    signal::ctrl_c().await?;

    Ok(())
}
