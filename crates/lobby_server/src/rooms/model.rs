//! Room, slot and settings records.
//!
//! These are the values stored in the room repository and sent to clients
//! as snapshots. Field names are camelCase on the wire.

use crate::types::{AccountKind, Identity, RoomId, UserId};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Alphabet used for room ids.
const ROOM_ID_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const ROOM_ID_LEN: usize = 6;
const MAP_SEED_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const MAP_SEED_LEN: usize = 26;

pub const MAX_ROOM_NAME_LEN: usize = 32;
pub const MIN_TURN_TIME_LIMIT_SECS: u32 = 10;
pub const MAX_TURN_TIME_LIMIT_SECS: u32 = 600;

/// Lifecycle state of a room. Only ever advances forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoomState {
    Waiting,
    Starting,
    InProgress,
}

impl fmt::Display for RoomState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RoomState::Waiting => "WAITING",
            RoomState::Starting => "STARTING",
            RoomState::InProgress => "IN_PROGRESS",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MapSize {
    Small,
    #[default]
    Medium,
    Large,
}

impl MapSize {
    /// Tile grid dimensions as `(width, height)`.
    pub fn dimensions(self) -> (u32, u32) {
        match self {
            MapSize::Small => (4, 6),
            MapSize::Medium => (6, 8),
            MapSize::Large => (8, 10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSettings {
    pub max_players: u8,
    #[serde(default)]
    pub spectator_mode: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_time_limit_seconds: Option<u32>,
}

impl RoomSettings {
    pub fn validate(&self) -> Result<(), String> {
        if !(2..=4).contains(&self.max_players) {
            return Err(format!(
                "maxPlayers must be 2, 3 or 4 (got {})",
                self.max_players
            ));
        }
        if let Some(limit) = self.turn_time_limit_seconds {
            if !(MIN_TURN_TIME_LIMIT_SECS..=MAX_TURN_TIME_LIMIT_SECS).contains(&limit) {
                return Err(format!(
                    "turnTimeLimitSeconds must be between {MIN_TURN_TIME_LIMIT_SECS} and {MAX_TURN_TIME_LIMIT_SECS}"
                ));
            }
        }
        Ok(())
    }
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            max_players: 4,
            spectator_mode: false,
            turn_time_limit_seconds: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CharacterStats {
    pub might: i32,
    pub intelligence: i32,
    pub dexterity: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CharacterSetup {
    pub name: String,
    pub portrait_id: String,
    pub stats: CharacterStats,
}

impl CharacterSetup {
    /// The character every player starts with: named after the player.
    pub fn default_for(username: &str) -> Self {
        Self {
            name: username.to_string(),
            portrait_id: "default".to_string(),
            stats: CharacterStats::default(),
        }
    }

    /// Merges the fields present in `update` into this character.
    pub fn apply(&mut self, update: &CharacterUpdate) {
        if let Some(name) = &update.name {
            self.name = name.clone();
        }
        if let Some(portrait_id) = &update.portrait_id {
            self.portrait_id = portrait_id.clone();
        }
        if let Some(stats) = update.stats {
            self.stats = stats;
        }
    }
}

/// Partial character sent by `update-character`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CharacterUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub portrait_id: Option<String>,
    #[serde(default)]
    pub stats: Option<CharacterStats>,
}

/// A single player's membership record within a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerSlot {
    pub user_id: UserId,
    pub username: String,
    pub account_kind: AccountKind,
    pub is_ready: bool,
    pub character: CharacterSetup,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_position: Option<u8>,
}

impl PlayerSlot {
    pub fn new(identity: &Identity) -> Self {
        Self {
            user_id: identity.user_id.clone(),
            username: identity.username.clone(),
            account_kind: identity.account_kind,
            is_ready: false,
            character: CharacterSetup::default_for(&identity.username),
            start_position: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub id: RoomId,
    pub name: String,
    pub host_user_id: UserId,
    pub state: RoomState,
    pub settings: RoomSettings,
    pub players: Vec<PlayerSlot>,
    pub map_seed: String,
    pub map_size: MapSize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_order: Option<Vec<UserId>>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Bumped on every committed mutation; the compare-and-set token.
    #[serde(default)]
    pub version: u64,
}

impl Room {
    /// A fresh WAITING room with `host` as its only player.
    pub fn new(
        id: RoomId,
        name: String,
        host: &Identity,
        settings: RoomSettings,
        map_seed: String,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            name,
            host_user_id: host.user_id.clone(),
            state: RoomState::Waiting,
            settings,
            players: vec![PlayerSlot::new(host)],
            map_seed,
            map_size: MapSize::default(),
            turn_order: None,
            created_at,
            started_at: None,
            version: 1,
        }
    }

    pub fn player(&self, user_id: &UserId) -> Option<&PlayerSlot> {
        self.players.iter().find(|p| &p.user_id == user_id)
    }

    pub fn player_mut(&mut self, user_id: &UserId) -> Option<&mut PlayerSlot> {
        self.players.iter_mut().find(|p| &p.user_id == user_id)
    }

    pub fn is_member(&self, user_id: &UserId) -> bool {
        self.player(user_id).is_some()
    }

    pub fn is_full(&self) -> bool {
        self.players.len() >= self.settings.max_players as usize
    }

    pub fn player_ids(&self) -> Vec<UserId> {
        self.players.iter().map(|p| p.user_id.clone()).collect()
    }
}

/// Generates a six-character room id.
pub fn generate_room_id<R: Rng + ?Sized>(rng: &mut R) -> RoomId {
    RoomId(random_string(rng, ROOM_ID_ALPHABET, ROOM_ID_LEN))
}

/// Generates a base-36 map seed shared by every client of a room.
pub fn generate_map_seed<R: Rng + ?Sized>(rng: &mut R) -> String {
    random_string(rng, MAP_SEED_ALPHABET, MAP_SEED_LEN)
}

fn random_string<R: Rng + ?Sized>(rng: &mut R, alphabet: &[u8], len: usize) -> String {
    (0..len)
        .map(|_| alphabet[rng.gen_range(0..alphabet.len())] as char)
        .collect()
}

/// Trims and checks a requested room name.
pub fn normalize_room_name(name: &str) -> Result<String, String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err("room name must not be empty".to_string());
    }
    if trimmed.chars().count() > MAX_ROOM_NAME_LEN {
        return Err(format!(
            "room name must be at most {MAX_ROOM_NAME_LEN} characters"
        ));
    }
    Ok(trimmed.to_string())
}
