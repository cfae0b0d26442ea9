//! Redis-backed room repository for multi-instance deployments.
//!
//! Rooms are stored as JSON under `{prefix}:room:{roomId}`, the user index
//! as plain strings under `{prefix}:user-room:{userId}`, and the set of
//! live room ids under `{prefix}:rooms`. Commits run as
//! WATCH / read / MULTI / EXEC, so a concurrent write to the room or to
//! any affected index key aborts the transaction and is reported as a
//! conflict.

use super::model::Room;
use super::repository::{CommitOutcome, RoomCommit, RoomRepository};
use crate::error::StoreError;
use crate::types::{RoomId, UserId};
use async_trait::async_trait;
use tracing::trace;

pub const DEFAULT_KEY_PREFIX: &str = "lobby";

#[derive(Debug, Clone)]
pub struct RedisRoomRepository {
    client: redis::Client,
    prefix: String,
}

impl RedisRoomRepository {
    pub fn new(redis_url: &str) -> Result<Self, StoreError> {
        Self::with_prefix(redis_url, DEFAULT_KEY_PREFIX)
    }

    /// Uses a custom key prefix, so several lobbies (or test runs) can
    /// share one Redis database.
    pub fn with_prefix(redis_url: &str, prefix: &str) -> Result<Self, StoreError> {
        Ok(Self {
            client: redis::Client::open(redis_url)?,
            prefix: prefix.to_string(),
        })
    }

    fn room_key(&self, room_id: &RoomId) -> String {
        format!("{}:room:{}", self.prefix, room_id)
    }

    fn user_room_key(&self, user_id: &UserId) -> String {
        format!("{}:user-room:{}", self.prefix, user_id)
    }

    fn rooms_set_key(&self) -> String {
        format!("{}:rooms", self.prefix)
    }

    async fn connection(&self) -> Result<redis::aio::Connection, StoreError> {
        Ok(self.client.get_async_connection().await?)
    }
}

async fn unwatch(conn: &mut redis::aio::Connection) -> Result<(), StoreError> {
    redis::cmd("UNWATCH").query_async::<_, ()>(conn).await?;
    Ok(())
}

#[async_trait]
impl RoomRepository for RedisRoomRepository {
    async fn load(&self, room_id: &RoomId) -> Result<Option<Room>, StoreError> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.room_key(room_id))
            .query_async(&mut conn)
            .await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn room_of(&self, user_id: &UserId) -> Result<Option<RoomId>, StoreError> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.user_room_key(user_id))
            .query_async(&mut conn)
            .await?;
        Ok(raw.map(RoomId))
    }

    async fn list(&self) -> Result<Vec<Room>, StoreError> {
        let mut conn = self.connection().await?;
        let ids: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.rooms_set_key())
            .query_async(&mut conn)
            .await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut mget = redis::cmd("MGET");
        for id in &ids {
            mget.arg(self.room_key(&RoomId::new(id.as_str())));
        }
        let raw: Vec<Option<String>> = mget.query_async(&mut conn).await?;

        let mut rooms = Vec::with_capacity(raw.len());
        for value in raw.into_iter().flatten() {
            rooms.push(serde_json::from_str(&value)?);
        }
        Ok(rooms)
    }

    async fn commit(&self, commit: RoomCommit) -> Result<CommitOutcome, StoreError> {
        let mut conn = self.connection().await?;
        let room_key = self.room_key(&commit.room_id);

        let mut watch = redis::cmd("WATCH");
        watch.arg(&room_key);
        for user_id in commit.claim.iter().chain(commit.release.iter()) {
            watch.arg(self.user_room_key(user_id));
        }
        watch.query_async::<_, ()>(&mut conn).await?;

        let current: Option<String> = redis::cmd("GET")
            .arg(&room_key)
            .query_async(&mut conn)
            .await?;
        let current_version = match current {
            Some(raw) => Some(serde_json::from_str::<Room>(&raw)?.version),
            None => None,
        };
        if current_version != commit.expected_version
            || (current_version.is_none() && commit.next.is_none())
        {
            unwatch(&mut conn).await?;
            return Ok(CommitOutcome::Conflict);
        }

        for user_id in &commit.claim {
            let holder: Option<String> = redis::cmd("GET")
                .arg(self.user_room_key(user_id))
                .query_async(&mut conn)
                .await?;
            if let Some(holder) = holder {
                if holder != commit.room_id.as_str() {
                    unwatch(&mut conn).await?;
                    return Ok(CommitOutcome::Claimed {
                        user_id: user_id.clone(),
                        room_id: RoomId(holder),
                    });
                }
            }
        }

        let mut releasable = Vec::new();
        for user_id in &commit.release {
            let holder: Option<String> = redis::cmd("GET")
                .arg(self.user_room_key(user_id))
                .query_async(&mut conn)
                .await?;
            if holder.as_deref() == Some(commit.room_id.as_str()) {
                releasable.push(user_id);
            }
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        match &commit.next {
            Some(room) => {
                pipe.cmd("SET")
                    .arg(&room_key)
                    .arg(serde_json::to_string(room)?)
                    .ignore();
                pipe.cmd("SADD")
                    .arg(self.rooms_set_key())
                    .arg(commit.room_id.as_str())
                    .ignore();
            }
            None => {
                pipe.cmd("DEL").arg(&room_key).ignore();
                pipe.cmd("SREM")
                    .arg(self.rooms_set_key())
                    .arg(commit.room_id.as_str())
                    .ignore();
            }
        }
        for user_id in &commit.claim {
            pipe.cmd("SET")
                .arg(self.user_room_key(user_id))
                .arg(commit.room_id.as_str())
                .ignore();
        }
        for user_id in releasable {
            pipe.cmd("DEL").arg(self.user_room_key(user_id)).ignore();
        }

        // EXEC answers nil when a watched key changed.
        let executed: Option<()> = pipe.query_async(&mut conn).await?;
        match executed {
            Some(()) => Ok(CommitOutcome::Committed),
            None => {
                trace!("🔁 Room {} commit lost a race", commit.room_id);
                Ok(CommitOutcome::Conflict)
            }
        }
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let reply: String = redis::cmd("PING").query_async(&mut conn).await?;
        if reply == "PONG" {
            Ok(())
        } else {
            Err(StoreError::Unavailable(format!("unexpected PING reply {reply}")))
        }
    }
}
