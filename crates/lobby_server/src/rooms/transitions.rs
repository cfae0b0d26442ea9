//! Guarded state transitions applied to a room value.
//!
//! Each function checks its guard and mutates the room it is handed. None of
//! them touch storage: the registry loads a room, applies one of these, and
//! commits the result with a compare-and-set on the room's version. A
//! rejected guard leaves the room untouched.

use super::model::{CharacterUpdate, MapSize, PlayerSlot, Room, RoomState};
use crate::error::LobbyError;
use crate::turn_order::{TurnOrder, TurnOrderResolver};
use crate::types::{Identity, UserId};
use chrono::{DateTime, Utc};
use rand::Rng;

/// What happened to the room when a player was removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Removal {
    /// Set when the departing player was host and someone else took over.
    pub new_host: Option<UserId>,
    /// The room has no players left and must be deleted.
    pub emptied: bool,
}

fn require_waiting(room: &Room) -> Result<(), LobbyError> {
    if room.state != RoomState::Waiting {
        return Err(LobbyError::WrongRoomState(room.state));
    }
    Ok(())
}

fn require_host(room: &Room, user_id: &UserId) -> Result<(), LobbyError> {
    if &room.host_user_id != user_id {
        return Err(LobbyError::NotHost);
    }
    Ok(())
}

/// Appends a fresh slot for `identity`.
pub fn join(room: &mut Room, identity: &Identity) -> Result<PlayerSlot, LobbyError> {
    require_waiting(room)?;
    if room.is_member(&identity.user_id) {
        return Err(LobbyError::AlreadyInRoom(room.id.clone()));
    }
    if room.is_full() {
        return Err(LobbyError::RoomFull(room.id.clone()));
    }
    let slot = PlayerSlot::new(identity);
    room.players.push(slot.clone());
    Ok(slot)
}

/// Removes `user_id` from the room, handing host rights to the earliest
/// remaining player in the same step.
///
/// Leaving is allowed in every state so players can always get out of a
/// room that has already started.
pub fn remove_player(room: &mut Room, user_id: &UserId) -> Result<Removal, LobbyError> {
    let index = room
        .players
        .iter()
        .position(|p| &p.user_id == user_id)
        .ok_or(LobbyError::NotInRoom)?;
    room.players.remove(index);

    let mut new_host = None;
    if &room.host_user_id == user_id {
        if let Some(first) = room.players.first() {
            room.host_user_id = first.user_id.clone();
            new_host = Some(first.user_id.clone());
        }
    }

    Ok(Removal {
        new_host,
        emptied: room.players.is_empty(),
    })
}

/// Flips the caller's readiness and returns the new value.
pub fn toggle_ready(room: &mut Room, user_id: &UserId) -> Result<bool, LobbyError> {
    require_waiting(room)?;
    let slot = room.player_mut(user_id).ok_or(LobbyError::NotInRoom)?;
    slot.is_ready = !slot.is_ready;
    Ok(slot.is_ready)
}

/// Merges a partial character into the caller's own slot.
pub fn update_character(
    room: &mut Room,
    user_id: &UserId,
    update: &CharacterUpdate,
) -> Result<PlayerSlot, LobbyError> {
    require_waiting(room)?;
    if let Some(name) = &update.name {
        if name.trim().is_empty() {
            return Err(LobbyError::InvalidMessage(
                "character name must not be empty".to_string(),
            ));
        }
    }
    let slot = room.player_mut(user_id).ok_or(LobbyError::NotInRoom)?;
    slot.character.apply(update);
    Ok(slot.clone())
}

/// Moves a WAITING room to STARTING, fixing its turn order and positions.
///
/// # Arguments
///
/// * `room` - The room to start
/// * `caller` - Must be the host
/// * `rng` - Source for the initiative rolls
/// * `now` - Recorded as `startedAt`
pub fn start<R: Rng + ?Sized>(
    room: &mut Room,
    caller: &UserId,
    rng: &mut R,
    now: DateTime<Utc>,
) -> Result<TurnOrder, LobbyError> {
    require_host(room, caller)?;
    require_waiting(room)?;
    if room.players.len() < 2 {
        return Err(LobbyError::CannotStart(
            "at least two players are required".to_string(),
        ));
    }
    if let Some(waiting_on) = room.players.iter().find(|p| !p.is_ready) {
        return Err(LobbyError::CannotStart(format!(
            "{} is not ready",
            waiting_on.username
        )));
    }

    let resolved = TurnOrderResolver::resolve(&room.player_ids(), rng);
    for slot in room.players.iter_mut() {
        slot.start_position = resolved.positions.get(&slot.user_id).copied();
    }
    room.turn_order = Some(resolved.order.clone());
    room.state = RoomState::Starting;
    room.started_at = Some(now);
    Ok(resolved)
}

/// Assigns a new map seed and size. Host only, WAITING only.
pub fn regenerate_map(
    room: &mut Room,
    caller: &UserId,
    seed: String,
    size: MapSize,
) -> Result<(), LobbyError> {
    require_host(room, caller)?;
    require_waiting(room)?;
    room.map_seed = seed;
    room.map_size = size;
    Ok(())
}

/// STARTING to IN_PROGRESS, once the game engine has accepted the match.
pub fn mark_in_progress(room: &mut Room) -> Result<(), LobbyError> {
    if room.state != RoomState::Starting {
        return Err(LobbyError::WrongRoomState(room.state));
    }
    room.state = RoomState::InProgress;
    Ok(())
}
