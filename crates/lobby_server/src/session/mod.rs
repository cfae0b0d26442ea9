//! Session tokens, the identities behind them and their presence status.
//!
//! [`SessionStore`] is the service the protocol handler talks to. Records
//! live in a [`SessionRepository`] so that every lobby instance resolves the
//! same token to the same identity; [`memory`] serves a single process and
//! tests, [`redis`] serves a fleet.

pub mod memory;
pub mod redis;

use crate::error::StoreError;
use crate::types::{AccountKind, Identity, PresenceStatus, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub use memory::InMemorySessionRepository;
pub use self::redis::RedisSessionRepository;

/// A live session as stored in the shared store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_token: String,
    pub user_id: UserId,
    pub username: String,
    pub account_kind: AccountKind,
    pub presence_status: PresenceStatus,
    pub expires_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn identity(&self) -> Identity {
        Identity {
            user_id: self.user_id.clone(),
            username: self.username.clone(),
            account_kind: self.account_kind,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Storage port for session records.
///
/// A user holds at most one session; `put` records the token as the user's
/// current one and `remove` clears that pointer only if it still names the
/// removed token. `update` never resurrects a token that was removed after
/// the caller read it.
#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn put(&self, record: &SessionRecord, ttl: Duration) -> Result<(), StoreError>;

    /// Overwrites the stored record for `record.session_token` if it is still
    /// there. Returns `false`, writing nothing, when it is gone.
    async fn update(&self, record: &SessionRecord, ttl: Duration) -> Result<bool, StoreError>;

    /// The record for `token`, or `None` if unknown or expired.
    async fn get(&self, token: &str) -> Result<Option<SessionRecord>, StoreError>;

    async fn token_for_user(&self, user_id: &UserId) -> Result<Option<String>, StoreError>;

    async fn remove(&self, token: &str) -> Result<(), StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;
}

/// Resolves tokens and tracks presence for every session.
pub struct SessionStore {
    repo: Arc<dyn SessionRepository>,
    ttl: Duration,
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl SessionStore {
    pub fn new(repo: Arc<dyn SessionRepository>, ttl: Duration) -> Self {
        Self { repo, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn expiry_from_now(&self) -> DateTime<Utc> {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX);
        Utc::now()
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Starts a new session for `identity`, replacing any session it had.
    ///
    /// This is the hook the login service uses; the lobby itself only
    /// validates tokens.
    pub async fn issue(&self, identity: &Identity) -> Result<SessionRecord, StoreError> {
        if let Some(previous) = self.repo.token_for_user(&identity.user_id).await? {
            self.repo.remove(&previous).await?;
        }
        let record = SessionRecord {
            session_token: uuid::Uuid::new_v4().to_string(),
            user_id: identity.user_id.clone(),
            username: identity.username.clone(),
            account_kind: identity.account_kind,
            presence_status: PresenceStatus::Initial,
            expires_at: self.expiry_from_now(),
        };
        self.repo.put(&record, self.ttl).await?;
        info!("🎫 Session issued for {} ({})", record.username, record.user_id);
        Ok(record)
    }

    /// Resolves a token. Unknown and expired tokens both yield `None`.
    pub async fn validate(&self, token: &str) -> Result<Option<SessionRecord>, StoreError> {
        let record = self.repo.get(token).await?;
        Ok(record.filter(|record| !record.is_expired_at(Utc::now())))
    }

    /// The live session of `user_id`, if any.
    pub async fn session_of(&self, user_id: &UserId) -> Result<Option<SessionRecord>, StoreError> {
        match self.repo.token_for_user(user_id).await? {
            Some(token) => self.validate(&token).await,
            None => Ok(None),
        }
    }

    /// When `record` was last written by an issue, presence change or refresh.
    pub fn last_touched(&self, record: &SessionRecord) -> DateTime<Utc> {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX);
        record
            .expires_at
            .checked_sub_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Records where the user currently is and pushes the expiry out.
    ///
    /// Users without a live session are ignored.
    pub async fn set_presence(
        &self,
        user_id: &UserId,
        status: PresenceStatus,
    ) -> Result<(), StoreError> {
        let Some(mut record) = self.session_of(user_id).await? else {
            debug!("No session for {} while setting presence {:?}", user_id, status);
            return Ok(());
        };
        record.presence_status = status;
        record.expires_at = self.expiry_from_now();
        if !self.repo.update(&record, self.ttl).await? {
            debug!("Session for {} ended while setting presence {:?}", user_id, status);
            return Ok(());
        }
        debug!("📍 {} is now {:?}", user_id, status);
        Ok(())
    }

    /// Extends a session's lifetime without changing anything else.
    pub async fn refresh(&self, token: &str) -> Result<Option<SessionRecord>, StoreError> {
        let Some(mut record) = self.validate(token).await? else {
            return Ok(None);
        };
        record.expires_at = self.expiry_from_now();
        if !self.repo.update(&record, self.ttl).await? {
            return Ok(None);
        }
        Ok(Some(record))
    }

    /// Ends a session (logout). Unknown tokens are not an error.
    pub async fn invalidate(&self, token: &str) -> Result<(), StoreError> {
        self.repo.remove(token).await
    }

    pub async fn health_check(&self) -> Result<(), StoreError> {
        self.repo.health_check().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(ttl: Duration) -> SessionStore {
        SessionStore::new(Arc::new(InMemorySessionRepository::new()), ttl)
    }

    fn alice() -> Identity {
        Identity {
            user_id: UserId::new("1"),
            username: "alice".into(),
            account_kind: AccountKind::Registered,
        }
    }

    #[tokio::test]
    async fn issued_tokens_validate() {
        let store = store(Duration::from_secs(60));
        let record = store.issue(&alice()).await.unwrap();
        let resolved = store.validate(&record.session_token).await.unwrap().unwrap();
        assert_eq!(resolved.identity(), alice());
        assert_eq!(resolved.presence_status, PresenceStatus::Initial);
        assert!(store.validate("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reissue_replaces_the_old_token() {
        let store = store(Duration::from_secs(60));
        let first = store.issue(&alice()).await.unwrap();
        let second = store.issue(&alice()).await.unwrap();
        assert!(store.validate(&first.session_token).await.unwrap().is_none());
        assert!(store.validate(&second.session_token).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_sessions_do_not_validate() {
        let store = store(Duration::from_millis(30));
        let record = store.issue(&alice()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(store.validate(&record.session_token).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn presence_updates_refresh_expiry() {
        let store = store(Duration::from_secs(60));
        let record = store.issue(&alice()).await.unwrap();
        store
            .set_presence(&record.user_id, PresenceStatus::InWaitingRoom)
            .await
            .unwrap();
        let updated = store.validate(&record.session_token).await.unwrap().unwrap();
        assert_eq!(updated.presence_status, PresenceStatus::InWaitingRoom);
        assert!(updated.expires_at >= record.expires_at);
    }

    #[tokio::test]
    async fn refresh_extends_only_live_sessions() {
        let store = store(Duration::from_millis(200));
        let record = store.issue(&alice()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;

        let refreshed = store.refresh(&record.session_token).await.unwrap().unwrap();
        assert!(refreshed.expires_at > record.expires_at);
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(store.validate(&record.session_token).await.unwrap().is_some());

        assert!(store.refresh("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn last_touched_tracks_the_latest_write() {
        let store = store(Duration::from_secs(60));
        let before = Utc::now();
        let record = store.issue(&alice()).await.unwrap();
        let touched = store.last_touched(&record);
        assert!(touched >= before && touched <= Utc::now());

        tokio::time::sleep(Duration::from_millis(20)).await;
        let refreshed = store.refresh(&record.session_token).await.unwrap().unwrap();
        assert!(store.last_touched(&refreshed) > touched);
        let found = store.session_of(&record.user_id).await.unwrap().unwrap();
        assert_eq!(found.expires_at, refreshed.expires_at);
    }

    #[tokio::test]
    async fn presence_for_unknown_user_is_ignored() {
        let store = store(Duration::from_secs(60));
        store
            .set_presence(&UserId::new("ghost"), PresenceStatus::InLobby)
            .await
            .unwrap();
    }

    /// Holds every read back so a logout can land between read and write.
    struct SlowReads {
        inner: InMemorySessionRepository,
        delay: Duration,
    }

    #[async_trait]
    impl SessionRepository for SlowReads {
        async fn put(&self, record: &SessionRecord, ttl: Duration) -> Result<(), StoreError> {
            self.inner.put(record, ttl).await
        }

        async fn update(&self, record: &SessionRecord, ttl: Duration) -> Result<bool, StoreError> {
            self.inner.update(record, ttl).await
        }

        async fn get(&self, token: &str) -> Result<Option<SessionRecord>, StoreError> {
            let record = self.inner.get(token).await;
            tokio::time::sleep(self.delay).await;
            record
        }

        async fn token_for_user(&self, user_id: &UserId) -> Result<Option<String>, StoreError> {
            self.inner.token_for_user(user_id).await
        }

        async fn remove(&self, token: &str) -> Result<(), StoreError> {
            self.inner.remove(token).await
        }

        async fn health_check(&self) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn logout_during_refresh_stays_logged_out() {
        let store = Arc::new(SessionStore::new(
            Arc::new(SlowReads {
                inner: InMemorySessionRepository::new(),
                delay: Duration::from_millis(100),
            }),
            Duration::from_secs(60),
        ));
        let record = store.issue(&alice()).await.unwrap();
        let token = record.session_token.clone();

        let refresh = tokio::spawn({
            let store = store.clone();
            let token = token.clone();
            async move { store.refresh(&token).await }
        });
        let presence = tokio::spawn({
            let store = store.clone();
            async move {
                store
                    .set_presence(&UserId::new("1"), PresenceStatus::InLobby)
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        store.invalidate(&token).await.unwrap();

        assert!(refresh.await.unwrap().unwrap().is_none());
        presence.await.unwrap().unwrap();
        assert!(store.validate(&token).await.unwrap().is_none());
        assert!(store.repo.token_for_user(&UserId::new("1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn invalidate_is_idempotent() {
        let store = store(Duration::from_secs(60));
        let record = store.issue(&alice()).await.unwrap();
        store.invalidate(&record.session_token).await.unwrap();
        store.invalidate(&record.session_token).await.unwrap();
        assert!(store.validate(&record.session_token).await.unwrap().is_none());
    }
}
