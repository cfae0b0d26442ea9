//! Ports to the systems a room hands over to once it starts.
//!
//! Map generation and gameplay live outside the lobby. The lobby only needs
//! a map built from the room's seed and size, and a game id from the engine
//! that took the match. The stand-ins here are what a standalone lobby runs
//! with.

use crate::error::LobbyError;
use crate::rooms::{MapSize, PlayerSlot};
use crate::types::{RoomId, UserId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A generated map as handed to the game engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameMap {
    pub seed: String,
    pub size: MapSize,
    pub width: u32,
    pub height: u32,
    pub player_count: usize,
}

/// Deterministic map generation from a seed.
pub trait MapGenerator: Send + Sync {
    fn generate(&self, seed: &str, size: MapSize, player_count: usize) -> GameMap;
}

/// Produces map metadata only, sized from the standard dimensions.
#[derive(Debug, Default, Clone, Copy)]
pub struct DimensionMapGenerator;

impl MapGenerator for DimensionMapGenerator {
    fn generate(&self, seed: &str, size: MapSize, player_count: usize) -> GameMap {
        let (width, height) = size.dimensions();
        GameMap {
            seed: seed.to_string(),
            size,
            width,
            height,
            player_count,
        }
    }
}

/// Handoff of a started room to the gameplay engine.
#[async_trait]
pub trait GameEngine: Send + Sync {
    /// Starts a match and returns its game id.
    async fn start(
        &self,
        room_id: &RoomId,
        turn_order: &[UserId],
        players: &[PlayerSlot],
        map: &GameMap,
    ) -> Result<String, LobbyError>;
}

/// Accepts every match and names it after the room.
#[derive(Debug, Default, Clone, Copy)]
pub struct PendingGameEngine;

#[async_trait]
impl GameEngine for PendingGameEngine {
    async fn start(
        &self,
        room_id: &RoomId,
        _turn_order: &[UserId],
        _players: &[PlayerSlot],
        _map: &GameMap,
    ) -> Result<String, LobbyError> {
        Ok(format!("game-{room_id}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_use_standard_dimensions() {
        let map = DimensionMapGenerator.generate("seed", MapSize::Large, 3);
        assert_eq!((map.width, map.height), (8, 10));
        assert_eq!(map.player_count, 3);
        assert_eq!(DimensionMapGenerator.generate("seed", MapSize::Large, 3), map);
    }

    #[tokio::test]
    async fn default_engine_names_games_after_rooms() {
        let map = DimensionMapGenerator.generate("s", MapSize::Small, 2);
        let id = PendingGameEngine
            .start(&RoomId::new("ABC123"), &[], &[], &map)
            .await
            .unwrap();
        assert_eq!(id, "game-ABC123");
    }
}
