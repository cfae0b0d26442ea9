//! Request dispatch for authenticated connections.
//!
//! Each inbound request runs one operation against the room registry or
//! session store, answers the requester directly where the protocol calls
//! for a reply, and publishes whatever the other room members need to see
//! through the broadcaster. Failures are returned to the caller, which
//! turns them into the single `error` reply for the request.

use crate::broadcast::{announce_departure, RoomBroadcast};
use crate::connection::ConnectionId;
use crate::error::LobbyError;
use crate::messaging::{ClientRequest, ServerEvent};
use crate::rooms::{MapSize, Room};
use crate::services::LobbyServices;
use crate::types::{current_timestamp, Identity, PresenceStatus, UserId};
use tracing::{debug, error, info, warn};

/// Who sent a request, as established by the auth handshake.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub connection_id: ConnectionId,
    pub identity: Identity,
    pub session_token: String,
}

impl RequestContext {
    fn user_id(&self) -> &UserId {
        &self.identity.user_id
    }
}

/// Runs one client request to completion.
///
/// # Returns
///
/// `Ok(())` once every reply and broadcast for the request has been sent,
/// or the error the requester should be told about.
pub async fn route_client_request(
    request: ClientRequest,
    ctx: &RequestContext,
    services: &LobbyServices,
) -> Result<(), LobbyError> {
    debug!(
        "📨 {} from {} on connection {}",
        request.kind(),
        ctx.user_id(),
        ctx.connection_id
    );

    match request {
        ClientRequest::Auth { .. } => Err(LobbyError::InvalidMessage(
            "connection is already authenticated".to_string(),
        )),
        ClientRequest::CreateRoom { name, settings } => {
            let room = services.rooms.create(&ctx.identity, &name, settings).await?;
            set_presence(services, ctx.user_id(), PresenceStatus::InWaitingRoom).await;
            reply(services, ctx, ServerEvent::RoomCreated { room }).await
        }
        ClientRequest::JoinRoom { room_id } => {
            let (room, player) = services.rooms.join(&ctx.identity, &room_id).await?;
            set_presence(services, ctx.user_id(), PresenceStatus::InWaitingRoom).await;
            // The join is committed; the members hear of it even if the joiner is gone.
            let replied = reply(services, ctx, ServerEvent::RoomJoined { room: room.clone() }).await;

            let mut joined = RoomBroadcast::to_members(
                &room,
                ServerEvent::PlayerJoined {
                    room_id: room.id.clone(),
                    player,
                },
            );
            joined.recipients.retain(|id| id != ctx.user_id());
            services.broadcaster.publish(joined).await?;
            publish_snapshot(services, &room).await?;
            replied
        }
        ClientRequest::LeaveRoom { room_id } => {
            let departure = services.rooms.leave(ctx.user_id(), room_id.as_ref()).await?;
            set_presence(services, ctx.user_id(), PresenceStatus::InLobby).await;
            let replied = reply(
                services,
                ctx,
                ServerEvent::RoomLeft {
                    room_id: departure.room_id.clone(),
                },
            )
            .await;
            announce_departure(services.broadcaster.as_ref(), &departure).await?;
            replied
        }
        ClientRequest::ToggleReady { room_id } => {
            let (room, ready) = services.rooms.toggle_ready(ctx.user_id(), &room_id).await?;
            debug!("🙋 {} is {} in room {}", ctx.user_id(), if ready { "ready" } else { "not ready" }, room.id);
            publish_snapshot(services, &room).await
        }
        ClientRequest::UpdateCharacter { character } => {
            let (room, slot) = services
                .rooms
                .update_character(ctx.user_id(), &character)
                .await?;
            services
                .broadcaster
                .publish(RoomBroadcast::to_members(
                    &room,
                    ServerEvent::CharacterUpdated {
                        room_id: room.id.clone(),
                        user_id: slot.user_id,
                        character: slot.character,
                    },
                ))
                .await?;
            publish_snapshot(services, &room).await
        }
        ClientRequest::StartGame { room_id } => {
            let (room, order) = services.rooms.start_game(ctx.user_id(), &room_id).await?;
            services
                .broadcaster
                .publish(RoomBroadcast::to_members(
                    &room,
                    ServerEvent::GameStarting {
                        room_id: room.id.clone(),
                        turn_order: order.order,
                    },
                ))
                .await?;
            publish_snapshot(services, &room).await?;
            spawn_game_handoff(services.clone(), room);
            Ok(())
        }
        ClientRequest::GetRoomList {} => {
            let rooms = services.rooms.waiting_rooms().await?;
            reply(services, ctx, ServerEvent::RoomList { rooms }).await
        }
        ClientRequest::GetRoomInfo { room_id } => {
            let room = services.rooms.get(&room_id).await?;
            reply(services, ctx, ServerEvent::RoomInfo { room }).await
        }
        ClientRequest::RegenerateMap { room_id, map_size } => {
            let room = services
                .rooms
                .regenerate_map(ctx.user_id(), &room_id, map_size)
                .await?;
            publish_map(services, &room, room.map_size).await?;
            publish_snapshot(services, &room).await
        }
        ClientRequest::PresenceResponse {
            room_id,
            nonce,
            token,
            in_room,
        } => {
            services
                .presence
                .respond(ctx.user_id(), &room_id, &nonce, &token, in_room)
                .await
        }
        ClientRequest::Ping {} => {
            reply(
                services,
                ctx,
                ServerEvent::Pong {
                    timestamp: current_timestamp(),
                },
            )
            .await
        }
    }
}

async fn reply(
    services: &LobbyServices,
    ctx: &RequestContext,
    event: ServerEvent,
) -> Result<(), LobbyError> {
    services
        .connections
        .send_to_connection(ctx.connection_id, &event)
        .await
}

async fn publish_snapshot(services: &LobbyServices, room: &Room) -> Result<(), LobbyError> {
    services
        .broadcaster
        .publish(RoomBroadcast::to_members(
            room,
            ServerEvent::RoomUpdated { room: room.clone() },
        ))
        .await?;
    Ok(())
}

async fn publish_map(services: &LobbyServices, room: &Room, size: MapSize) -> Result<(), LobbyError> {
    services
        .broadcaster
        .publish(RoomBroadcast::to_members(
            room,
            ServerEvent::MapRegenerated {
                room_id: room.id.clone(),
                map_seed: room.map_seed.clone(),
                map_size: size,
            },
        ))
        .await?;
    Ok(())
}

/// Presence is advisory; a failed update never fails the request.
async fn set_presence(services: &LobbyServices, user_id: &UserId, status: PresenceStatus) {
    if let Err(e) = services.sessions.set_presence(user_id, status).await {
        warn!("Failed to set presence of {} to {:?}: {}", user_id, status, e);
    }
}

/// Hands a STARTING room to the game engine after the configured delay.
fn spawn_game_handoff(services: LobbyServices, room: Room) {
    tokio::spawn(async move {
        tokio::time::sleep(services.config.timings.game_start_delay()).await;
        let room_id = room.id.clone();
        if let Err(e) = hand_off(&services, room).await {
            error!("❌ Game handoff for room {} failed: {}", room_id, e);
        }
    });
}

async fn hand_off(services: &LobbyServices, room: Room) -> Result<(), LobbyError> {
    let turn_order = room.turn_order.clone().unwrap_or_default();
    let map = services
        .map_generator
        .generate(&room.map_seed, room.map_size, room.players.len());
    let game_id = services
        .game_engine
        .start(&room.id, &turn_order, &room.players, &map)
        .await?;

    let room = services.rooms.mark_in_progress(&room.id).await?;
    for user_id in room.player_ids() {
        set_presence(services, &user_id, PresenceStatus::InGame).await;
    }
    info!("🎮 Room {} handed to game {}", room.id, game_id);

    services
        .broadcaster
        .publish(RoomBroadcast::to_members(
            &room,
            ServerEvent::GameStarted {
                room_id: room.id.clone(),
                game_id,
            },
        ))
        .await?;
    publish_snapshot(services, &room).await
}
