//! Rooms: the shared record of every pre-game waiting area.
//!
//! * [`model`] - the stored values (`Room`, `PlayerSlot`, settings).
//! * [`transitions`] - guarded, storage-free state changes.
//! * [`repository`] - the storage port, with [`memory`] and [`redis`] adapters.
//! * [`registry`] - the service running every room operation.
//! * [`sweeper`] - background removal of abandoned WAITING rooms.

pub mod memory;
pub mod model;
pub mod redis;
pub mod registry;
pub mod repository;
pub mod sweeper;
pub mod transitions;

pub use memory::InMemoryRoomRepository;
pub use model::{
    CharacterSetup, CharacterStats, CharacterUpdate, MapSize, PlayerSlot, Room, RoomSettings,
    RoomState,
};
pub use self::redis::RedisRoomRepository;
pub use registry::{Departure, RoomRegistry};
pub use repository::{CommitOutcome, RoomCommit, RoomRepository};
