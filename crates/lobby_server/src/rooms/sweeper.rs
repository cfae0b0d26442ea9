//! Background removal of abandoned WAITING rooms.

use super::registry::RoomRegistry;
use crate::broadcast::{Broadcaster, RoomBroadcast};
use crate::error::LobbyError;
use crate::messaging::ServerEvent;
use crate::session::SessionStore;
use crate::types::{PresenceStatus, ShutdownState};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Sweeps once and tells the former members their room is gone.
///
/// # Returns
///
/// How many rooms were deleted.
pub async fn sweep_once(
    rooms: &RoomRegistry,
    sessions: &SessionStore,
    broadcaster: &dyn Broadcaster,
    max_age: Duration,
) -> Result<usize, LobbyError> {
    let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
    let swept = rooms.sweep(Utc::now(), max_age).await?;

    for room in &swept {
        let players = room.player_ids();
        for user_id in &players {
            if let Err(e) = sessions.set_presence(user_id, PresenceStatus::InLobby).await {
                warn!("Failed to update presence of {}: {}", user_id, e);
            }
        }
        let notice = RoomBroadcast::to_users(
            room.id.clone(),
            players,
            ServerEvent::RoomLeft {
                room_id: room.id.clone(),
            },
        );
        if let Err(e) = broadcaster.publish(notice).await {
            warn!("Failed to announce sweep of room {}: {}", room.id, e);
        }
    }
    Ok(swept.len())
}

/// Runs [`sweep_once`] every `interval` until shutdown.
///
/// Failures are logged and retried on the next tick.
pub fn spawn_room_sweeper(
    rooms: Arc<RoomRegistry>,
    sessions: Arc<SessionStore>,
    broadcaster: Arc<dyn Broadcaster>,
    interval: Duration,
    max_age: Duration,
    shutdown: Option<ShutdownState>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if shutdown.as_ref().is_some_and(|s| s.is_shutdown_initiated()) {
                break;
            }
            match sweep_once(&rooms, &sessions, broadcaster.as_ref(), max_age).await {
                Ok(0) => {}
                Ok(count) => debug!("🧹 Sweeper removed {} stale rooms", count),
                Err(e) => warn!("Room sweep failed, retrying next tick: {}", e),
            }
        }
        debug!("📴 Room sweeper stopped");
    })
}
