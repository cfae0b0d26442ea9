//! The constructed services a lobby instance runs on.
//!
//! Nothing in the lobby is a global. Everything a connection handler needs
//! is built here once and handed to each handler as a cheap clone.

use crate::broadcast::{Broadcaster, LocalBroadcaster, RedisBroadcaster};
use crate::collaborators::{DimensionMapGenerator, GameEngine, MapGenerator, PendingGameEngine};
use crate::config::{ServerConfig, StoreBackend};
use crate::connection::ConnectionManager;
use crate::error::StoreError;
use crate::presence::PresenceReconciler;
use crate::rooms::{InMemoryRoomRepository, RedisRoomRepository, RoomRegistry, RoomRepository};
use crate::session::{
    InMemorySessionRepository, RedisSessionRepository, SessionRepository, SessionStore,
};
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
pub struct LobbyServices {
    pub config: Arc<ServerConfig>,
    pub sessions: Arc<SessionStore>,
    pub rooms: Arc<RoomRegistry>,
    pub connections: Arc<ConnectionManager>,
    pub broadcaster: Arc<dyn Broadcaster>,
    pub presence: Arc<PresenceReconciler>,
    pub map_generator: Arc<dyn MapGenerator>,
    pub game_engine: Arc<dyn GameEngine>,
}

impl std::fmt::Debug for LobbyServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LobbyServices")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl LobbyServices {
    /// Builds the services for the backend named in `config.store`.
    ///
    /// No connection is opened here; Redis is first contacted by the
    /// startup health check.
    pub fn from_config(config: ServerConfig) -> Result<Self, StoreError> {
        match config.store.backend {
            StoreBackend::Memory => Ok(Self::in_memory(config)),
            StoreBackend::Redis => {
                let url = config.store.redis_url.clone();
                info!("🗄️ Using Redis store at {}", url);
                let sessions = Arc::new(RedisSessionRepository::new(&url)?);
                let rooms = Arc::new(RedisRoomRepository::new(&url)?);
                let broadcaster = Arc::new(RedisBroadcaster::new(&url, config.broadcast_capacity)?);
                Ok(Self::from_parts(config, sessions, rooms, broadcaster))
            }
        }
    }

    /// Single-process services; nothing is shared with other instances.
    pub fn in_memory(config: ServerConfig) -> Self {
        let broadcaster = Arc::new(LocalBroadcaster::new(config.broadcast_capacity));
        Self::from_parts(
            config,
            Arc::new(InMemorySessionRepository::new()),
            Arc::new(InMemoryRoomRepository::new()),
            broadcaster,
        )
    }

    /// Wires services over explicit repositories and broadcaster.
    pub fn from_parts(
        config: ServerConfig,
        session_repository: Arc<dyn SessionRepository>,
        room_repository: Arc<dyn RoomRepository>,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> Self {
        let sessions = Arc::new(SessionStore::new(
            session_repository,
            config.timings.session_ttl(),
        ));
        let rooms = Arc::new(RoomRegistry::new(room_repository));
        Self::assemble(config, sessions, rooms, broadcaster)
    }

    fn assemble(
        config: ServerConfig,
        sessions: Arc<SessionStore>,
        rooms: Arc<RoomRegistry>,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> Self {
        let connections = Arc::new(ConnectionManager::new());
        let presence = Arc::new(
            PresenceReconciler::new(
                rooms.clone(),
                sessions.clone(),
                connections.clone(),
                broadcaster.clone(),
                config.timings.presence_timeout(),
            )
            .with_orphan_grace(config.timings.orphan_grace()),
        );
        Self {
            config: Arc::new(config),
            sessions,
            rooms,
            connections,
            broadcaster,
            presence,
            map_generator: Arc::new(DimensionMapGenerator),
            game_engine: Arc::new(PendingGameEngine),
        }
    }

    pub fn with_game_engine(mut self, engine: Arc<dyn GameEngine>) -> Self {
        self.game_engine = engine;
        self
    }

    /// Checks that both stores answer.
    pub async fn health_check(&self) -> Result<(), StoreError> {
        self.sessions.health_check().await?;
        self.rooms.health_check().await
    }
}
