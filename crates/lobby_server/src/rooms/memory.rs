//! Single-process room repository.

use super::model::Room;
use super::repository::{CommitOutcome, RoomCommit, RoomRepository};
use crate::error::StoreError;
use crate::types::{RoomId, UserId};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// Rooms and the user index held in concurrent maps.
///
/// A commit holds the room's map entry for its whole duration and only
/// then touches index entries, one at a time. Nothing here awaits while a
/// guard is held.
#[derive(Debug, Default)]
pub struct InMemoryRoomRepository {
    rooms: DashMap<RoomId, Room>,
    index: DashMap<UserId, RoomId>,
}

impl InMemoryRoomRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets every claimed index entry or none of them.
    fn claim_all(&self, room_id: &RoomId, users: &[UserId]) -> Result<(), CommitOutcome> {
        let mut claimed = Vec::new();
        for user_id in users {
            match self.index.entry(user_id.clone()) {
                Entry::Occupied(entry) if entry.get() != room_id => {
                    let holder = entry.get().clone();
                    drop(entry);
                    self.release_all(room_id, &claimed);
                    return Err(CommitOutcome::Claimed {
                        user_id: user_id.clone(),
                        room_id: holder,
                    });
                }
                Entry::Occupied(_) => {}
                Entry::Vacant(entry) => {
                    entry.insert(room_id.clone());
                    claimed.push(user_id.clone());
                }
            }
        }
        Ok(())
    }

    fn release_all(&self, room_id: &RoomId, users: &[UserId]) {
        for user_id in users {
            self.index.remove_if(user_id, |_, held| held == room_id);
        }
    }
}

#[async_trait]
impl RoomRepository for InMemoryRoomRepository {
    async fn load(&self, room_id: &RoomId) -> Result<Option<Room>, StoreError> {
        Ok(self.rooms.get(room_id).map(|room| room.value().clone()))
    }

    async fn room_of(&self, user_id: &UserId) -> Result<Option<RoomId>, StoreError> {
        Ok(self.index.get(user_id).map(|room_id| room_id.value().clone()))
    }

    async fn list(&self) -> Result<Vec<Room>, StoreError> {
        Ok(self.rooms.iter().map(|room| room.value().clone()).collect())
    }

    async fn commit(&self, commit: RoomCommit) -> Result<CommitOutcome, StoreError> {
        let RoomCommit {
            room_id,
            expected_version,
            next,
            claim,
            release,
        } = commit;

        match self.rooms.entry(room_id.clone()) {
            Entry::Occupied(mut entry) => {
                if expected_version != Some(entry.get().version) {
                    return Ok(CommitOutcome::Conflict);
                }
                if let Err(outcome) = self.claim_all(&room_id, &claim) {
                    return Ok(outcome);
                }
                self.release_all(&room_id, &release);
                match next {
                    Some(room) => {
                        entry.insert(room);
                    }
                    None => {
                        entry.remove();
                    }
                }
            }
            Entry::Vacant(entry) => {
                let Some(room) = next else {
                    return Ok(CommitOutcome::Conflict);
                };
                if expected_version.is_some() {
                    return Ok(CommitOutcome::Conflict);
                }
                if let Err(outcome) = self.claim_all(&room_id, &claim) {
                    return Ok(outcome);
                }
                self.release_all(&room_id, &release);
                entry.insert(room);
            }
        }
        Ok(CommitOutcome::Committed)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
