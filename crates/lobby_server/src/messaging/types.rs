//! Message type definitions for client-server communication.
//!
//! Every frame is a JSON text message with a kebab-case `type` and a
//! camelCase payload under `data`:
//!
//! ```json
//! { "type": "join-room", "data": { "roomId": "K3X9QZ" } }
//! ```
//!
//! Both directions are closed enums, so the protocol handler matches on
//! every request the lobby understands and the compiler checks that none is
//! forgotten.

use crate::error::LobbyError;
use crate::rooms::{CharacterSetup, CharacterUpdate, MapSize, PlayerSlot, Room, RoomSettings};
use crate::types::{AccountKind, RoomId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The outer shape of an inbound frame, before the payload is interpreted.
///
/// Kept separate from [`ClientRequest`] so a request with a bad payload can
/// still be answered with an error that names its type.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientEnvelope {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub data: Value,
}

impl ClientEnvelope {
    pub fn parse(text: &str) -> Result<Self, LobbyError> {
        serde_json::from_str(text)
            .map_err(|e| LobbyError::InvalidMessage(format!("malformed message: {e}")))
    }

    /// Interprets the payload according to `type`.
    pub fn into_request(self) -> Result<ClientRequest, LobbyError> {
        let data = match self.data {
            Value::Null => Value::Object(serde_json::Map::new()),
            other => other,
        };
        let tagged = serde_json::json!({ "type": self.kind, "data": data });
        serde_json::from_value(tagged)
            .map_err(|e| LobbyError::InvalidMessage(format!("bad '{}' request: {e}", self.kind)))
    }
}

/// A request sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum ClientRequest {
    Auth {
        token: String,
    },
    CreateRoom {
        name: String,
        #[serde(default)]
        settings: RoomSettings,
    },
    #[serde(rename_all = "camelCase")]
    JoinRoom {
        room_id: RoomId,
    },
    #[serde(rename_all = "camelCase")]
    LeaveRoom {
        #[serde(default)]
        room_id: Option<RoomId>,
    },
    #[serde(rename_all = "camelCase")]
    ToggleReady {
        room_id: RoomId,
    },
    UpdateCharacter {
        character: CharacterUpdate,
    },
    #[serde(rename_all = "camelCase")]
    StartGame {
        room_id: RoomId,
    },
    GetRoomList {},
    #[serde(rename_all = "camelCase")]
    GetRoomInfo {
        room_id: RoomId,
    },
    #[serde(rename_all = "camelCase")]
    RegenerateMap {
        room_id: RoomId,
        #[serde(default)]
        map_size: Option<MapSize>,
    },
    /// Answer to a [`ServerEvent::PresenceChallenge`].
    #[serde(rename_all = "camelCase")]
    PresenceResponse {
        room_id: RoomId,
        nonce: String,
        token: String,
        #[serde(default = "default_in_room")]
        in_room: bool,
    },
    Ping {},
}

fn default_in_room() -> bool {
    true
}

impl ClientRequest {
    /// The wire name of this request, used to correlate errors.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientRequest::Auth { .. } => "auth",
            ClientRequest::CreateRoom { .. } => "create-room",
            ClientRequest::JoinRoom { .. } => "join-room",
            ClientRequest::LeaveRoom { .. } => "leave-room",
            ClientRequest::ToggleReady { .. } => "toggle-ready",
            ClientRequest::UpdateCharacter { .. } => "update-character",
            ClientRequest::StartGame { .. } => "start-game",
            ClientRequest::GetRoomList {} => "get-room-list",
            ClientRequest::GetRoomInfo { .. } => "get-room-info",
            ClientRequest::RegenerateMap { .. } => "regenerate-map",
            ClientRequest::PresenceResponse { .. } => "presence-response",
            ClientRequest::Ping {} => "ping",
        }
    }
}

/// A message pushed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    AuthOk {
        user_id: UserId,
        username: String,
        account_kind: AccountKind,
        /// Set when the user reconnects while still indexed to a room.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<RoomId>,
    },
    RoomCreated {
        room: Room,
    },
    RoomJoined {
        room: Room,
    },
    #[serde(rename_all = "camelCase")]
    RoomLeft {
        room_id: RoomId,
    },
    RoomUpdated {
        room: Room,
    },
    RoomInfo {
        room: Room,
    },
    #[serde(rename_all = "camelCase")]
    PlayerJoined {
        room_id: RoomId,
        player: PlayerSlot,
    },
    #[serde(rename_all = "camelCase")]
    PlayerLeft {
        room_id: RoomId,
        user_id: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        new_host_user_id: Option<UserId>,
    },
    #[serde(rename_all = "camelCase")]
    CharacterUpdated {
        room_id: RoomId,
        user_id: UserId,
        character: CharacterSetup,
    },
    #[serde(rename_all = "camelCase")]
    GameStarting {
        room_id: RoomId,
        turn_order: Vec<UserId>,
    },
    #[serde(rename_all = "camelCase")]
    GameStarted {
        room_id: RoomId,
        game_id: String,
    },
    #[serde(rename_all = "camelCase")]
    MapRegenerated {
        room_id: RoomId,
        map_seed: String,
        map_size: MapSize,
    },
    RoomList {
        rooms: Vec<Room>,
    },
    #[serde(rename_all = "camelCase")]
    PresenceChallenge {
        room_id: RoomId,
        nonce: String,
    },
    Pong {
        timestamp: u64,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        code: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_type: Option<String>,
    },
}

impl ServerEvent {
    /// The single error reply for a rejected request.
    pub fn error(err: &LobbyError, request_type: Option<&str>) -> Self {
        ServerEvent::Error {
            code: err.code().to_string(),
            message: err.to_string(),
            request_type: request_type.map(str::to_string),
        }
    }

    pub fn to_text(&self) -> Result<String, LobbyError> {
        serde_json::to_string(self)
            .map_err(|e| LobbyError::Internal(format!("failed to encode event: {e}")))
    }

    /// The wire name of this event, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::AuthOk { .. } => "auth-ok",
            ServerEvent::RoomCreated { .. } => "room-created",
            ServerEvent::RoomJoined { .. } => "room-joined",
            ServerEvent::RoomLeft { .. } => "room-left",
            ServerEvent::RoomUpdated { .. } => "room-updated",
            ServerEvent::RoomInfo { .. } => "room-info",
            ServerEvent::PlayerJoined { .. } => "player-joined",
            ServerEvent::PlayerLeft { .. } => "player-left",
            ServerEvent::CharacterUpdated { .. } => "character-updated",
            ServerEvent::GameStarting { .. } => "game-starting",
            ServerEvent::GameStarted { .. } => "game-started",
            ServerEvent::MapRegenerated { .. } => "map-regenerated",
            ServerEvent::RoomList { .. } => "room-list",
            ServerEvent::PresenceChallenge { .. } => "presence-challenge",
            ServerEvent::Pong { .. } => "pong",
            ServerEvent::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(text: &str) -> Result<ClientRequest, LobbyError> {
        ClientEnvelope::parse(text)?.into_request()
    }

    #[test]
    fn parses_room_requests() {
        assert_eq!(
            parse(r#"{"type":"join-room","data":{"roomId":"ABC123"}}"#).unwrap(),
            ClientRequest::JoinRoom {
                room_id: RoomId::new("ABC123")
            }
        );
        assert_eq!(
            parse(r#"{"type":"create-room","data":{"name":"Foo","settings":{"maxPlayers":2}}}"#)
                .unwrap(),
            ClientRequest::CreateRoom {
                name: "Foo".into(),
                settings: RoomSettings {
                    max_players: 2,
                    ..Default::default()
                },
            }
        );
        assert_eq!(
            parse(r#"{"type":"regenerate-map","data":{"roomId":"ABC123","mapSize":"large"}}"#)
                .unwrap(),
            ClientRequest::RegenerateMap {
                room_id: RoomId::new("ABC123"),
                map_size: Some(MapSize::Large),
            }
        );
    }

    #[test]
    fn payload_may_be_missing_for_empty_requests() {
        assert_eq!(
            parse(r#"{"type":"get-room-list"}"#).unwrap(),
            ClientRequest::GetRoomList {}
        );
        assert_eq!(
            parse(r#"{"type":"ping","data":{}}"#).unwrap(),
            ClientRequest::Ping {}
        );
        assert_eq!(
            parse(r#"{"type":"leave-room"}"#).unwrap(),
            ClientRequest::LeaveRoom { room_id: None }
        );
    }

    #[test]
    fn presence_response_defaults_to_in_room() {
        let request = parse(
            r#"{"type":"presence-response","data":{"roomId":"ABC123","nonce":"n","token":"t"}}"#,
        )
        .unwrap();
        assert!(matches!(
            request,
            ClientRequest::PresenceResponse { in_room: true, .. }
        ));
    }

    #[test]
    fn bad_input_is_an_invalid_message() {
        assert_eq!(parse("not json").unwrap_err().code(), "INVALID_MESSAGE");
        assert_eq!(
            parse(r#"{"type":"teleport","data":{}}"#).unwrap_err().code(),
            "INVALID_MESSAGE"
        );
        let envelope = ClientEnvelope::parse(r#"{"type":"join-room","data":{}}"#).unwrap();
        assert_eq!(envelope.kind, "join-room");
        assert_eq!(envelope.into_request().unwrap_err().code(), "INVALID_MESSAGE");
    }

    #[test]
    fn events_use_type_and_data() {
        let event = ServerEvent::PlayerLeft {
            room_id: RoomId::new("ABC123"),
            user_id: UserId::new("7"),
            new_host_user_id: None,
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"type": "player-left", "data": {"roomId": "ABC123", "userId": "7"}})
        );
        assert_eq!(event.kind(), "player-left");
    }

    #[test]
    fn errors_carry_code_and_request_type() {
        let event = ServerEvent::error(&LobbyError::RoomFull(RoomId::new("ABC123")), Some("join-room"));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["data"]["code"], "ROOM_FULL");
        assert_eq!(value["data"]["requestType"], "join-room");
        assert!(value["data"]["message"].as_str().unwrap().contains("ABC123"));
    }

    #[test]
    fn request_kind_matches_wire_name() {
        let request = parse(r#"{"type":"toggle-ready","data":{"roomId":"R"}}"#).unwrap();
        assert_eq!(request.kind(), "toggle-ready");
    }
}
