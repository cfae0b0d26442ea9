//! The room registry: every room operation the lobby performs.
//!
//! Each mutating call loads the room, applies one guarded transition to a
//! copy, bumps the version and commits with compare-and-set. A lost race
//! reloads and re-checks the guard, so two joins competing for the last
//! slot cannot both pass the capacity check.

use super::model::{
    generate_map_seed, generate_room_id, normalize_room_name, CharacterUpdate, MapSize,
    PlayerSlot, Room, RoomSettings, RoomState,
};
use super::repository::{CommitOutcome, RoomCommit, RoomRepository};
use super::transitions;
use crate::error::{LobbyError, StoreError};
use crate::turn_order::TurnOrder;
use crate::types::{Identity, RoomId, UserId};
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Attempts per operation before giving up on a heavily contended room.
const MAX_COMMIT_ATTEMPTS: usize = 32;

/// How a mutation changes the user index alongside the room.
enum IndexChange {
    None,
    Claim(UserId),
    Release(UserId),
}

/// A player's exit from a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub room_id: RoomId,
    pub user_id: UserId,
    /// The room after the removal, `None` if it was deleted.
    pub room: Option<Room>,
    pub new_host: Option<UserId>,
}

/// Shared room state and the operations allowed on it.
pub struct RoomRegistry {
    repo: Arc<dyn RoomRepository>,
    rng: Mutex<StdRng>,
}

impl std::fmt::Debug for RoomRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomRegistry").finish_non_exhaustive()
    }
}

impl RoomRegistry {
    pub fn new(repo: Arc<dyn RoomRepository>) -> Self {
        Self {
            repo,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Uses a seeded generator for room ids, map seeds and initiative rolls.
    pub fn with_rng_seed(repo: Arc<dyn RoomRepository>, seed: u64) -> Self {
        Self {
            repo,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    fn rng(&self) -> MutexGuard<'_, StdRng> {
        self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub async fn health_check(&self) -> Result<(), StoreError> {
        self.repo.health_check().await
    }

    /// Load, apply, commit; retried on conflict.
    async fn mutate<T, F>(
        &self,
        room_id: &RoomId,
        index: IndexChange,
        mut apply: F,
    ) -> Result<(Option<Room>, T), LobbyError>
    where
        F: FnMut(&mut Room) -> Result<T, LobbyError> + Send,
        T: Send,
    {
        for attempt in 1..=MAX_COMMIT_ATTEMPTS {
            let current = self
                .repo
                .load(room_id)
                .await?
                .ok_or_else(|| LobbyError::RoomNotFound(room_id.clone()))?;

            let mut next = current.clone();
            let value = apply(&mut next)?;
            next.version = current.version + 1;

            let mut commit = if next.players.is_empty() {
                RoomCommit::delete(room_id.clone(), current.version)
            } else {
                RoomCommit::update(room_id.clone(), current.version, next.clone())
            };
            match &index {
                IndexChange::None => {}
                IndexChange::Claim(user_id) => commit = commit.claiming(user_id.clone()),
                IndexChange::Release(user_id) => commit = commit.releasing([user_id.clone()]),
            }

            match self.repo.commit(commit).await? {
                CommitOutcome::Committed => {
                    let room = (!next.players.is_empty()).then_some(next);
                    return Ok((room, value));
                }
                CommitOutcome::Conflict => {
                    debug!("🔁 Room {} changed underneath us (attempt {})", room_id, attempt);
                }
                CommitOutcome::Claimed { room_id, .. } => {
                    return Err(LobbyError::AlreadyInRoom(room_id));
                }
            }
        }

        warn!("⚠️ Giving up on room {} after {} conflicting commits", room_id, MAX_COMMIT_ATTEMPTS);
        Err(LobbyError::Internal(format!(
            "room {room_id} is too busy, try again"
        )))
    }

    /// Like [`mutate`](Self::mutate) for transitions that never remove players.
    async fn update<T, F>(&self, room_id: &RoomId, apply: F) -> Result<(Room, T), LobbyError>
    where
        F: FnMut(&mut Room) -> Result<T, LobbyError> + Send,
        T: Send,
    {
        match self.mutate(room_id, IndexChange::None, apply).await? {
            (Some(room), value) => Ok((room, value)),
            (None, _) => Err(LobbyError::RoomNotFound(room_id.clone())),
        }
    }

    async fn indexed_room(&self, user_id: &UserId) -> Result<RoomId, LobbyError> {
        self.repo.room_of(user_id).await?.ok_or(LobbyError::NotInRoom)
    }

    /// Creates a WAITING room with `host` as its only player.
    ///
    /// # Arguments
    ///
    /// * `host` - The creating user; must not be in any room
    /// * `name` - Room name, trimmed, 1 to 32 characters
    /// * `settings` - Requested settings, validated before anything is stored
    pub async fn create(
        &self,
        host: &Identity,
        name: &str,
        settings: RoomSettings,
    ) -> Result<Room, LobbyError> {
        let name = normalize_room_name(name).map_err(LobbyError::InvalidSettings)?;
        settings.validate().map_err(LobbyError::InvalidSettings)?;
        if let Some(existing) = self.repo.room_of(&host.user_id).await? {
            return Err(LobbyError::AlreadyInRoom(existing));
        }

        for _ in 0..MAX_COMMIT_ATTEMPTS {
            let (room_id, map_seed) = {
                let mut rng = self.rng();
                (generate_room_id(&mut *rng), generate_map_seed(&mut *rng))
            };
            let room = Room::new(
                room_id.clone(),
                name.clone(),
                host,
                settings.clone(),
                map_seed,
                Utc::now(),
            );

            match self
                .repo
                .commit(RoomCommit::create(room.clone(), host.user_id.clone()))
                .await?
            {
                CommitOutcome::Committed => {
                    info!("🏠 Room {} '{}' created by {}", room.id, room.name, host.user_id);
                    return Ok(room);
                }
                CommitOutcome::Conflict => {
                    debug!("🎲 Room id {} already taken, drawing another", room_id);
                }
                CommitOutcome::Claimed { room_id, .. } => {
                    return Err(LobbyError::AlreadyInRoom(room_id));
                }
            }
        }
        Err(LobbyError::Internal("could not allocate a room id".to_string()))
    }

    /// Adds `identity` to a WAITING room that has a free slot.
    pub async fn join(
        &self,
        identity: &Identity,
        room_id: &RoomId,
    ) -> Result<(Room, PlayerSlot), LobbyError> {
        if let Some(existing) = self.repo.room_of(&identity.user_id).await? {
            return Err(LobbyError::AlreadyInRoom(existing));
        }
        let (room, slot) = self
            .mutate(
                room_id,
                IndexChange::Claim(identity.user_id.clone()),
                |room| transitions::join(room, identity),
            )
            .await?;
        let room = room.ok_or_else(|| LobbyError::RoomNotFound(room_id.clone()))?;
        info!(
            "🚪 {} joined room {} ({}/{})",
            identity.user_id,
            room.id,
            room.players.len(),
            room.settings.max_players
        );
        Ok((room, slot))
    }

    /// Removes `user_id` from the room it is indexed to.
    ///
    /// When `room_id` is given it must name that room. The room is deleted
    /// together with the index entry once the last player is gone.
    pub async fn leave(
        &self,
        user_id: &UserId,
        room_id: Option<&RoomId>,
    ) -> Result<Departure, LobbyError> {
        let indexed = self.indexed_room(user_id).await?;
        if let Some(requested) = room_id {
            if requested != &indexed {
                return Err(LobbyError::NotInRoom);
            }
        }

        let (room, removal) = self
            .mutate(&indexed, IndexChange::Release(user_id.clone()), |room| {
                transitions::remove_player(room, user_id)
            })
            .await?;

        match (&room, &removal.new_host) {
            (None, _) => info!("🧹 Room {} closed, {} was the last player", indexed, user_id),
            (Some(_), Some(host)) => info!(
                "👑 {} left room {}, host passed to {}",
                user_id, indexed, host
            ),
            (Some(_), None) => info!("👋 {} left room {}", user_id, indexed),
        }

        Ok(Departure {
            room_id: indexed,
            user_id: user_id.clone(),
            room,
            new_host: removal.new_host,
        })
    }

    /// Flips the caller's readiness.
    pub async fn toggle_ready(
        &self,
        user_id: &UserId,
        room_id: &RoomId,
    ) -> Result<(Room, bool), LobbyError> {
        self.update(room_id, |room| transitions::toggle_ready(room, user_id))
            .await
    }

    /// Merges a character update into the caller's slot in their current room.
    pub async fn update_character(
        &self,
        user_id: &UserId,
        update: &CharacterUpdate,
    ) -> Result<(Room, PlayerSlot), LobbyError> {
        let room_id = self.indexed_room(user_id).await?;
        self.update(&room_id, |room| {
            transitions::update_character(room, user_id, update)
        })
        .await
    }

    /// WAITING to STARTING; rolls the turn order exactly once.
    pub async fn start_game(
        &self,
        user_id: &UserId,
        room_id: &RoomId,
    ) -> Result<(Room, TurnOrder), LobbyError> {
        let (room, order) = self
            .update(room_id, |room| {
                let mut rng = self.rng();
                transitions::start(room, user_id, &mut *rng, Utc::now())
            })
            .await?;
        info!(
            "🎬 Room {} starting with turn order {:?}",
            room.id,
            order.order.iter().map(UserId::as_str).collect::<Vec<_>>()
        );
        Ok((room, order))
    }

    /// Draws a new map seed; keeps the current size unless one is given.
    pub async fn regenerate_map(
        &self,
        user_id: &UserId,
        room_id: &RoomId,
        size: Option<MapSize>,
    ) -> Result<Room, LobbyError> {
        let (room, ()) = self
            .update(room_id, |room| {
                let seed = generate_map_seed(&mut *self.rng());
                let size = size.unwrap_or(room.map_size);
                transitions::regenerate_map(room, user_id, seed, size)
            })
            .await?;
        debug!("🗺️ Room {} map regenerated ({:?})", room.id, room.map_size);
        Ok(room)
    }

    /// STARTING to IN_PROGRESS after the game engine accepted the match.
    pub async fn mark_in_progress(&self, room_id: &RoomId) -> Result<Room, LobbyError> {
        let (room, ()) = self.update(room_id, transitions::mark_in_progress).await?;
        Ok(room)
    }

    pub async fn get(&self, room_id: &RoomId) -> Result<Room, LobbyError> {
        self.repo
            .load(room_id)
            .await?
            .ok_or_else(|| LobbyError::RoomNotFound(room_id.clone()))
    }

    pub async fn room_of(&self, user_id: &UserId) -> Result<Option<RoomId>, LobbyError> {
        Ok(self.repo.room_of(user_id).await?)
    }

    /// Snapshot of every WAITING room, oldest first.
    pub async fn waiting_rooms(&self) -> Result<Vec<Room>, LobbyError> {
        let mut rooms: Vec<Room> = self
            .repo
            .list()
            .await?
            .into_iter()
            .filter(|room| room.state == RoomState::Waiting)
            .collect();
        rooms.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(rooms)
    }

    pub async fn list_all(&self) -> Result<Vec<Room>, LobbyError> {
        Ok(self.repo.list().await?)
    }

    /// Deletes WAITING rooms created more than `max_age` before `now`.
    ///
    /// Rooms that change while being swept are skipped and picked up again
    /// on a later pass. Rooms in any other state are never touched.
    ///
    /// # Returns
    ///
    /// The rooms that were deleted, as they were just before deletion.
    pub async fn sweep(
        &self,
        now: DateTime<Utc>,
        max_age: chrono::Duration,
    ) -> Result<Vec<Room>, LobbyError> {
        let mut swept = Vec::new();
        for room in self.repo.list().await? {
            if room.state != RoomState::Waiting || now - room.created_at <= max_age {
                continue;
            }
            let commit = RoomCommit::delete(room.id.clone(), room.version)
                .releasing(room.player_ids());
            match self.repo.commit(commit).await? {
                CommitOutcome::Committed => {
                    info!("🧹 Swept stale room {} ({} players)", room.id, room.players.len());
                    swept.push(room);
                }
                outcome => {
                    debug!("Room {} not swept this pass: {:?}", room.id, outcome);
                }
            }
        }
        Ok(swept)
    }
}
