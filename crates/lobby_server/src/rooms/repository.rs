//! Storage port for rooms and the user to room index.
//!
//! A repository never applies room rules itself. It stores whole room values
//! and accepts a [`RoomCommit`] only when the stored version still matches
//! the version the caller read, so every rule check in
//! [`transitions`](super::transitions) is followed by an atomic
//! compare-and-set. Index claims and releases are part of the same atomic
//! step, which is what keeps a user in at most one room.

use super::model::Room;
use crate::error::StoreError;
use crate::types::{RoomId, UserId};
use async_trait::async_trait;

/// One atomic write against a single room and the index entries it affects.
#[derive(Debug, Clone)]
pub struct RoomCommit {
    pub room_id: RoomId,
    /// Version the caller read. `None` means the room must not exist yet.
    pub expected_version: Option<u64>,
    /// Value to store. `None` deletes the room.
    pub next: Option<Room>,
    /// Users whose index entry must be absent (or already point here) and
    /// is set to this room.
    pub claim: Vec<UserId>,
    /// Users whose index entry is removed if it still points to this room.
    pub release: Vec<UserId>,
}

impl RoomCommit {
    /// Inserts a brand-new room, claiming its host.
    pub fn create(room: Room, host: UserId) -> Self {
        Self {
            room_id: room.id.clone(),
            expected_version: None,
            next: Some(room),
            claim: vec![host],
            release: Vec::new(),
        }
    }

    /// Replaces the room read at `expected_version`.
    pub fn update(room_id: RoomId, expected_version: u64, next: Room) -> Self {
        Self {
            room_id,
            expected_version: Some(expected_version),
            next: Some(next),
            claim: Vec::new(),
            release: Vec::new(),
        }
    }

    /// Deletes the room read at `expected_version`.
    pub fn delete(room_id: RoomId, expected_version: u64) -> Self {
        Self {
            room_id,
            expected_version: Some(expected_version),
            next: None,
            claim: Vec::new(),
            release: Vec::new(),
        }
    }

    pub fn claiming(mut self, user_id: UserId) -> Self {
        self.claim.push(user_id);
        self
    }

    pub fn releasing(mut self, users: impl IntoIterator<Item = UserId>) -> Self {
        self.release.extend(users);
        self
    }
}

/// Result of a [`RoomCommit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// The room changed (or appeared, or vanished) since it was read.
    Conflict,
    /// A claimed user is already indexed to another room.
    Claimed { user_id: UserId, room_id: RoomId },
}

/// Backend holding rooms and the user to room index.
///
/// Implementations must make [`commit`](RoomRepository::commit) atomic with
/// respect to every other commit touching the same room or index entries.
/// Commits on unrelated rooms must not wait on each other beyond the
/// backend's own short critical sections.
#[async_trait]
pub trait RoomRepository: Send + Sync {
    async fn load(&self, room_id: &RoomId) -> Result<Option<Room>, StoreError>;

    async fn room_of(&self, user_id: &UserId) -> Result<Option<RoomId>, StoreError>;

    /// Every stored room, in no particular order.
    async fn list(&self) -> Result<Vec<Room>, StoreError>;

    async fn commit(&self, commit: RoomCommit) -> Result<CommitOutcome, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;
}
