//! Single-process session repository.

use super::{SessionRecord, SessionRepository};
use crate::error::StoreError;
use crate::types::UserId;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::time::Duration;

/// Sessions held in memory. Expiry is checked on read using the record's
/// own `expires_at`.
#[derive(Debug, Default)]
pub struct InMemorySessionRepository {
    sessions: DashMap<String, SessionRecord>,
    by_user: DashMap<UserId, String>,
}

impl InMemorySessionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[async_trait]
impl SessionRepository for InMemorySessionRepository {
    async fn put(&self, record: &SessionRecord, _ttl: Duration) -> Result<(), StoreError> {
        self.sessions
            .insert(record.session_token.clone(), record.clone());
        self.by_user
            .insert(record.user_id.clone(), record.session_token.clone());
        Ok(())
    }

    async fn update(&self, record: &SessionRecord, _ttl: Duration) -> Result<bool, StoreError> {
        match self.sessions.get_mut(&record.session_token) {
            Some(mut stored) if !stored.is_expired_at(Utc::now()) => {
                *stored = record.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, token: &str) -> Result<Option<SessionRecord>, StoreError> {
        let now = Utc::now();
        let expired = match self.sessions.get(token) {
            Some(record) if !record.is_expired_at(now) => return Ok(Some(record.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.sessions.remove_if(token, |_, record| record.is_expired_at(now));
        }
        Ok(None)
    }

    async fn token_for_user(&self, user_id: &UserId) -> Result<Option<String>, StoreError> {
        Ok(self.by_user.get(user_id).map(|token| token.value().clone()))
    }

    async fn remove(&self, token: &str) -> Result<(), StoreError> {
        if let Some((_, record)) = self.sessions.remove(token) {
            self.by_user
                .remove_if(&record.user_id, |_, current| current == token);
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
