//! Redis-backed session repository.
//!
//! Records are JSON under `{prefix}:session:{token}` and the user's current
//! token under `{prefix}:user-session:{userId}`, both written with `EX` so
//! Redis expires them on its own.

use super::{SessionRecord, SessionRepository};
use crate::error::StoreError;
use crate::rooms::redis::DEFAULT_KEY_PREFIX;
use crate::types::UserId;
use async_trait::async_trait;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RedisSessionRepository {
    client: redis::Client,
    prefix: String,
}

impl RedisSessionRepository {
    pub fn new(redis_url: &str) -> Result<Self, StoreError> {
        Self::with_prefix(redis_url, DEFAULT_KEY_PREFIX)
    }

    pub fn with_prefix(redis_url: &str, prefix: &str) -> Result<Self, StoreError> {
        Ok(Self {
            client: redis::Client::open(redis_url)?,
            prefix: prefix.to_string(),
        })
    }

    fn session_key(&self, token: &str) -> String {
        format!("{}:session:{}", self.prefix, token)
    }

    fn user_key(&self, user_id: &UserId) -> String {
        format!("{}:user-session:{}", self.prefix, user_id)
    }

    async fn connection(&self) -> Result<redis::aio::Connection, StoreError> {
        Ok(self.client.get_async_connection().await?)
    }
}

#[async_trait]
impl SessionRepository for RedisSessionRepository {
    async fn put(&self, record: &SessionRecord, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let seconds = ttl.as_secs().max(1);
        let payload = serde_json::to_string(record)?;

        redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(self.session_key(&record.session_token))
            .arg(payload)
            .arg("EX")
            .arg(seconds)
            .ignore()
            .cmd("SET")
            .arg(self.user_key(&record.user_id))
            .arg(&record.session_token)
            .arg("EX")
            .arg(seconds)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn update(&self, record: &SessionRecord, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let seconds = ttl.as_secs().max(1);
        let payload = serde_json::to_string(record)?;
        let user_key = self.user_key(&record.user_id);

        redis::cmd("WATCH")
            .arg(&user_key)
            .query_async::<_, ()>(&mut conn)
            .await?;
        let current: Option<String> = redis::cmd("GET")
            .arg(&user_key)
            .query_async(&mut conn)
            .await?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("SET")
            .arg(self.session_key(&record.session_token))
            .arg(payload)
            .arg("EX")
            .arg(seconds)
            .arg("XX");
        if current.as_deref() == Some(record.session_token.as_str()) {
            pipe.cmd("EXPIRE").arg(&user_key).arg(seconds).ignore();
        }

        // The user pointer only moves when this token is removed or replaced,
        // so an aborted EXEC means the session is gone.
        let written: Option<(Option<String>,)> = pipe.query_async(&mut conn).await?;
        Ok(matches!(written, Some((Some(_),))))
    }

    async fn get(&self, token: &str) -> Result<Option<SessionRecord>, StoreError> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.session_key(token))
            .query_async(&mut conn)
            .await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn token_for_user(&self, user_id: &UserId) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection().await?;
        Ok(redis::cmd("GET")
            .arg(self.user_key(user_id))
            .query_async(&mut conn)
            .await?)
    }

    async fn remove(&self, token: &str) -> Result<(), StoreError> {
        let Some(record) = self.get(token).await? else {
            return Ok(());
        };
        let mut conn = self.connection().await?;
        redis::cmd("DEL")
            .arg(self.session_key(token))
            .query_async::<_, ()>(&mut conn)
            .await?;

        let current: Option<String> = redis::cmd("GET")
            .arg(self.user_key(&record.user_id))
            .query_async(&mut conn)
            .await?;
        if current.as_deref() == Some(token) {
            redis::cmd("DEL")
                .arg(self.user_key(&record.user_id))
                .query_async::<_, ()>(&mut conn)
                .await?;
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING").query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }
}
