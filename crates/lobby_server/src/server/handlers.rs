//! Connection handling logic for WebSocket clients.
//!
//! This module contains the lifecycle of a single lobby connection: the
//! WebSocket handshake, the `auth` handshake, request processing and the
//! implicit leave when the socket goes away.

use crate::broadcast::announce_departure;
use crate::connection::ConnectionId;
use crate::error::{LobbyError, ServerError};
use crate::messaging::{route_client_request, ClientEnvelope, ClientRequest, RequestContext, ServerEvent};
use crate::services::LobbyServices;
use crate::session::SessionRecord;
use crate::types::{PresenceStatus, UserId};
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, error, info, trace, warn};

type Inbound = SplitStream<WebSocketStream<TcpStream>>;

/// How long the writer may take to flush a closing connection.
const WRITER_DRAIN: Duration = Duration::from_secs(1);

/// Handles a single client connection from establishment to cleanup.
///
/// # Connection Flow
///
/// 1. Perform the WebSocket handshake and enforce the connection limit
/// 2. Register the connection and start its writer task
/// 3. Wait for `auth{token}` within the handshake window
/// 4. Bind the user, displacing any older connection of theirs
/// 5. Acknowledge with `auth-ok` and challenge an existing room membership
/// 6. Route requests until the socket closes
/// 7. Unregister, leave any room and mark the session offline
///
/// # Returns
///
/// `Ok(())` when the connection ended normally, including rejected auth,
/// or a `ServerError` if the WebSocket handshake failed.
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    services: LobbyServices,
) -> Result<(), ServerError> {
    let ws_stream = accept_async(stream)
        .await
        .map_err(|e| ServerError::Network(format!("WebSocket handshake failed: {e}")))?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    if services.connections.connection_count().await >= services.config.max_connections {
        warn!("🚫 Rejecting {}: connection limit reached", addr);
        let _ = ws_sender
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::Again,
                reason: "Server is full".into(),
            })))
            .await;
        return Ok(());
    }

    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
    let connection_id = services.connections.add_connection(addr, outbound.clone()).await;

    // Outgoing message task
    let mut writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if let Err(e) = ws_sender.send(message).await {
                debug!("Failed to send to connection {}: {}", connection_id, e);
                break;
            }
            if closing {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    let auth_window = services.config.timings.auth_timeout();
    let handshake = tokio::time::timeout(auth_window, authenticate(&mut ws_receiver, &services)).await;
    let record = match handshake {
        Ok(Ok(Some(record))) => Some(record),
        Ok(Ok(None)) => {
            debug!("🔌 Connection {} closed before authenticating", connection_id);
            None
        }
        Ok(Err(err)) => {
            reject(&services, connection_id, &err, Some("auth")).await;
            None
        }
        Err(_) => {
            info!("⏰ Connection {} did not authenticate within {:?}", connection_id, auth_window);
            reject(&services, connection_id, &LobbyError::AuthenticationFailed, Some("auth")).await;
            None
        }
    };

    let authenticated = record.as_ref().map(|record| record.user_id.clone());
    if let Some(record) = record {
        match on_authenticated(&services, connection_id, &record).await {
            Ok(()) => {
                let ctx = RequestContext {
                    connection_id,
                    identity: record.identity(),
                    session_token: record.session_token,
                };
                serve_requests(&mut ws_receiver, &ctx, &services, &outbound).await;
            }
            Err(err) => reject(&services, connection_id, &err, Some("auth")).await,
        }
    }

    drop(outbound);
    let departed = services
        .connections
        .remove_connection(connection_id, authenticated.as_ref())
        .await;
    if tokio::time::timeout(WRITER_DRAIN, &mut writer).await.is_err() {
        writer.abort();
    }
    if let Some(user_id) = departed {
        disconnect_cleanup(&services, &user_id).await;
    }
    debug!("🔌 Connection {} from {} finished", connection_id, addr);
    Ok(())
}

/// Reads frames until the client sends `auth`.
///
/// # Returns
///
/// The resolved session, `None` if the socket closed first, or the
/// error to report before closing.
async fn authenticate(
    ws_receiver: &mut Inbound,
    services: &LobbyServices,
) -> Result<Option<SessionRecord>, LobbyError> {
    while let Some(frame) = ws_receiver.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => return Ok(None),
            Ok(Message::Binary(_)) => return Err(LobbyError::AuthenticationFailed),
            Ok(_) => continue,
            Err(e) => {
                debug!("WebSocket error during auth: {}", e);
                return Ok(None);
            }
        };
        if text.len() > services.config.max_message_size {
            return Err(LobbyError::AuthenticationFailed);
        }
        let request = ClientEnvelope::parse(text.as_str())
            .and_then(ClientEnvelope::into_request)
            .map_err(|_| LobbyError::AuthenticationFailed)?;
        let ClientRequest::Auth { token } = request else {
            return Err(LobbyError::AuthenticationFailed);
        };
        return services
            .sessions
            .validate(&token)
            .await?
            .map(Some)
            .ok_or(LobbyError::AuthenticationFailed);
    }
    Ok(None)
}

async fn on_authenticated(
    services: &LobbyServices,
    connection_id: ConnectionId,
    record: &SessionRecord,
) -> Result<(), LobbyError> {
    let user_id = record.user_id.clone();
    if let Some(previous) = services
        .connections
        .bind_user(connection_id, user_id.clone())
        .await
    {
        services
            .connections
            .kick_connection(previous, Some("Signed in elsewhere".to_string()))
            .await;
    }

    let room_id = services.rooms.room_of(&user_id).await?;
    let status = if room_id.is_some() {
        PresenceStatus::InWaitingRoom
    } else {
        PresenceStatus::InLobby
    };
    services.sessions.set_presence(&user_id, status).await?;

    services
        .connections
        .send_to_connection(
            connection_id,
            &ServerEvent::AuthOk {
                user_id: user_id.clone(),
                username: record.username.clone(),
                account_kind: record.account_kind,
                room_id: room_id.clone(),
            },
        )
        .await?;
    info!("🔐 {} ({}) authenticated on connection {}", record.username, user_id, connection_id);

    if let Some(room_id) = room_id {
        services.presence.challenge(room_id, user_id);
    }
    Ok(())
}

async fn serve_requests(
    ws_receiver: &mut Inbound,
    ctx: &RequestContext,
    services: &LobbyServices,
    outbound: &mpsc::UnboundedSender<Message>,
) {
    while let Some(frame) = ws_receiver.next().await {
        let result = match frame {
            Ok(Message::Text(text)) => handle_text(text.as_str(), ctx, services).await,
            Ok(Message::Binary(data)) if data.len() > services.config.max_message_size => {
                Err((LobbyError::MessageTooLarge(data.len()), None))
            }
            Ok(Message::Binary(_)) => Err((
                LobbyError::InvalidMessage("binary frames are not supported".to_string()),
                None,
            )),
            Ok(Message::Ping(data)) => {
                let _ = outbound.send(Message::Pong(data));
                Ok(())
            }
            Ok(Message::Close(_)) => {
                debug!("🔌 Client {} requested close", ctx.connection_id);
                break;
            }
            Ok(_) => Ok(()),
            Err(e) => {
                error!("WebSocket error for connection {}: {}", ctx.connection_id, e);
                break;
            }
        };

        if let Err((err, request_type)) = result {
            trace!("❌ Request from {} rejected: {}", ctx.identity.user_id, err);
            let closes = err.closes_connection();
            reject_or_report(services, ctx.connection_id, &err, request_type.as_deref(), closes).await;
            if closes {
                break;
            }
        }
    }
}

/// Parses, re-validates the session and routes one text frame.
///
/// Every accepted request extends the session's lifetime.
///
/// Errors carry the request type when it could be read.
async fn handle_text(
    text: &str,
    ctx: &RequestContext,
    services: &LobbyServices,
) -> Result<(), (LobbyError, Option<String>)> {
    if text.len() > services.config.max_message_size {
        return Err((LobbyError::MessageTooLarge(text.len()), None));
    }
    let envelope = ClientEnvelope::parse(text).map_err(|e| (e, None))?;
    let kind = envelope.kind.clone();
    let tag = |e: LobbyError| (e, Some(kind.clone()));

    match services.sessions.refresh(&ctx.session_token).await {
        Ok(Some(_)) => {}
        Ok(None) => return Err(tag(LobbyError::SessionExpired)),
        Err(e) => return Err(tag(e.into())),
    }

    let request = envelope.into_request().map_err(tag)?;
    route_client_request(request, ctx, services)
        .await
        .map_err(tag)
}

async fn reject(
    services: &LobbyServices,
    connection_id: ConnectionId,
    err: &LobbyError,
    request_type: Option<&str>,
) {
    reject_or_report(services, connection_id, err, request_type, true).await;
}

/// Sends the single `error` reply, closing the connection if asked to.
async fn reject_or_report(
    services: &LobbyServices,
    connection_id: ConnectionId,
    err: &LobbyError,
    request_type: Option<&str>,
    close: bool,
) {
    let event = ServerEvent::error(err, request_type);
    if let Err(e) = services.connections.send_to_connection(connection_id, &event).await {
        debug!("Could not report error to connection {}: {}", connection_id, e);
        return;
    }
    if close {
        services
            .connections
            .kick_connection(connection_id, Some(err.to_string()))
            .await;
    }
}

/// Implicit leave and presence update for a user whose socket closed.
async fn disconnect_cleanup(services: &LobbyServices, user_id: &UserId) {
    match services.rooms.leave(user_id, None).await {
        Ok(departure) => {
            if let Err(e) = announce_departure(services.broadcaster.as_ref(), &departure).await {
                warn!("Failed to announce departure of {}: {}", user_id, e);
            }
        }
        Err(LobbyError::NotInRoom) | Err(LobbyError::RoomNotFound(_)) => {}
        Err(e) => warn!("Implicit leave for {} failed: {}", user_id, e),
    }
    if let Err(e) = services.sessions.set_presence(user_id, PresenceStatus::Offline).await {
        warn!("Failed to mark {} offline: {}", user_id, e);
    }
    info!("👋 {} disconnected", user_id);
}
