//! Cross-instance fan-out of room events.
//!
//! Connections live on exactly one lobby instance, so room events are never
//! sent to sockets directly by the code that caused them. They are
//! published as [`RoomBroadcast`]s; every instance (including the
//! publisher) receives each one and delivers it to whichever recipients
//! are connected locally.
//!
//! Events produced from a committed room snapshot carry that snapshot's
//! version. The fan-out task remembers the newest version it delivered per
//! room and drops `room-updated` snapshots older than that, so a client
//! never ends on a stale room view even when two instances publish out of
//! commit order.

pub mod local;
pub mod redis;

use crate::connection::ConnectionManager;
use crate::error::StoreError;
use crate::messaging::ServerEvent;
use crate::rooms::{Departure, Room};
use crate::types::{RoomId, ShutdownState, UserId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

pub use local::LocalBroadcaster;
pub use self::redis::RedisBroadcaster;

/// Versions older than this are forgotten once the table grows large.
const VERSION_MEMORY: Duration = Duration::from_secs(600);
const VERSION_TABLE_SOFT_LIMIT: usize = 4096;

/// One event addressed to a set of users of a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomBroadcast {
    pub room_id: RoomId,
    /// Version of the committed room the event was derived from.
    #[serde(default)]
    pub room_version: Option<u64>,
    pub recipients: Vec<UserId>,
    pub event: ServerEvent,
}

impl RoomBroadcast {
    /// Addressed to every current member of `room`.
    pub fn to_members(room: &Room, event: ServerEvent) -> Self {
        Self {
            room_id: room.id.clone(),
            room_version: Some(room.version),
            recipients: room.player_ids(),
            event,
        }
    }

    /// Addressed to explicit users, outside the room's version sequence.
    pub fn to_users(room_id: RoomId, recipients: Vec<UserId>, event: ServerEvent) -> Self {
        Self {
            room_id,
            room_version: None,
            recipients,
            event,
        }
    }

    fn is_snapshot(&self) -> bool {
        matches!(self.event, ServerEvent::RoomUpdated { .. })
    }
}

/// Publish/subscribe channel shared by every lobby instance.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    /// Sends `message` to every subscribed instance, this one included.
    async fn publish(&self, message: RoomBroadcast) -> Result<(), StoreError>;

    /// A new receiver of everything published from now on.
    fn subscribe(&self) -> broadcast::Receiver<RoomBroadcast>;

    /// Starts whatever background task feeds [`subscribe`](Self::subscribe)
    /// from the shared channel. In-process broadcasters need none.
    fn spawn_relay(&self, _shutdown: Option<ShutdownState>) -> Option<JoinHandle<()>> {
        None
    }
}

/// Tells the remaining members of a room that someone left.
///
/// Nothing is sent when the room was deleted; nobody is left to tell.
pub async fn announce_departure(
    broadcaster: &dyn Broadcaster,
    departure: &Departure,
) -> Result<(), StoreError> {
    let Some(room) = &departure.room else {
        return Ok(());
    };
    broadcaster
        .publish(RoomBroadcast::to_members(
            room,
            ServerEvent::PlayerLeft {
                room_id: departure.room_id.clone(),
                user_id: departure.user_id.clone(),
                new_host_user_id: departure.new_host.clone(),
            },
        ))
        .await?;
    broadcaster
        .publish(RoomBroadcast::to_members(
            room,
            ServerEvent::RoomUpdated { room: room.clone() },
        ))
        .await
}

/// Tracks the newest room version delivered by this instance.
#[derive(Debug, Default)]
struct VersionGuard {
    latest: HashMap<RoomId, (u64, Instant)>,
}

impl VersionGuard {
    /// Whether `message` should be delivered, recording its version.
    fn admit(&mut self, message: &RoomBroadcast) -> bool {
        let Some(version) = message.room_version else {
            return true;
        };
        let now = Instant::now();
        let entry = self
            .latest
            .entry(message.room_id.clone())
            .or_insert((version, now));
        if version < entry.0 {
            return !message.is_snapshot();
        }
        *entry = (version, now);

        if self.latest.len() > VERSION_TABLE_SOFT_LIMIT {
            self.latest
                .retain(|_, (_, seen)| now.duration_since(*seen) < VERSION_MEMORY);
        }
        true
    }
}

/// Delivers every received broadcast to this instance's connections.
///
/// The receiver is created before this returns, so anything published
/// afterwards is seen by the task.
pub fn spawn_fanout(
    broadcaster: &dyn Broadcaster,
    connections: Arc<ConnectionManager>,
) -> JoinHandle<()> {
    let mut receiver = broadcaster.subscribe();
    tokio::spawn(async move {
        let mut versions = VersionGuard::default();
        loop {
            match receiver.recv().await {
                Ok(message) => {
                    if !versions.admit(&message) {
                        trace!(
                            "⏭️ Skipping stale snapshot of room {} (v{:?})",
                            message.room_id,
                            message.room_version
                        );
                        continue;
                    }
                    connections
                        .deliver(&message.recipients, &message.event)
                        .await;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("🐌 Broadcast fan-out lagged, {} events skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("📴 Broadcast channel closed, fan-out stopping");
                    break;
                }
            }
        }
    })
}
