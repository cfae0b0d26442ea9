// End-to-end tests over real loopback WebSocket connections.
#[cfg(test)]
mod tests {
    use crate::rooms::{InMemoryRoomRepository, RedisRoomRepository, RoomState};
    use crate::session::InMemorySessionRepository;
    use crate::types::{AccountKind, Identity, PresenceStatus, RoomId, UserId};
    use crate::*;
    use futures::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::JoinHandle;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

    struct Running {
        services: LobbyServices,
        addr: SocketAddr,
        shutdown: ShutdownState,
        task: JoinHandle<Result<(), ServerError>>,
    }

    impl Running {
        async fn stop(self) {
            self.shutdown.initiate_shutdown();
            let _ = tokio::time::timeout(Duration::from_secs(2), self.task).await;
        }
    }

    fn test_config() -> ServerConfig {
        let mut config = ServerConfig::default();
        config.timings.auth_timeout_ms = 500;
        config.timings.presence_timeout_ms = 500;
        config.timings.presence_interval_secs = 0;
        config.timings.game_start_delay_ms = 10;
        config
    }

    async fn start(config: ServerConfig) -> Running {
        start_with(LobbyServices::in_memory(config)).await
    }

    async fn start_with(services: LobbyServices) -> Running {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = LobbyServer::with_services(services.clone());
        let shutdown = ShutdownState::new();
        let state = shutdown.clone();
        let task = tokio::spawn(async move { server.serve(listener, Some(state)).await });
        Running {
            services,
            addr,
            shutdown,
            task,
        }
    }

    async fn issue(services: &LobbyServices, id: &str) -> String {
        let identity = Identity {
            user_id: UserId::new(id),
            username: format!("user-{id}"),
            account_kind: AccountKind::Registered,
        };
        services.sessions.issue(&identity).await.unwrap().session_token
    }

    async fn open(addr: SocketAddr) -> Socket {
        let (socket, _) = connect_async(format!("ws://{addr}")).await.unwrap();
        socket
    }

    async fn send(socket: &mut Socket, kind: &str, data: Value) {
        let frame = json!({ "type": kind, "data": data }).to_string();
        socket.send(Message::Text(frame.into())).await.unwrap();
    }

    /// Next text frame as JSON; a close frame reads as `{"type":"closed"}`.
    async fn next(socket: &mut Socket) -> Value {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(3), socket.next())
                .await
                .expect("timed out waiting for a frame");
            match frame {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(text.as_str()).unwrap(),
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return json!({ "type": "closed" }),
                Some(Ok(_)) => continue,
            }
        }
    }

    async fn next_of(socket: &mut Socket, kind: &str) -> Value {
        loop {
            let event = next(socket).await;
            if event["type"] == kind {
                return event;
            }
            assert_ne!(event["type"], "closed", "connection closed while waiting for {kind}");
        }
    }

    async fn login(running: &Running, id: &str) -> (Socket, String) {
        let token = issue(&running.services, id).await;
        let mut socket = open(running.addr).await;
        send(&mut socket, "auth", json!({ "token": token })).await;
        let ok = next(&mut socket).await;
        assert_eq!(ok["type"], "auth-ok", "unexpected auth reply {ok}");
        (socket, token)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn auth_ok_then_ping() {
        let running = start(test_config()).await;
        let token = issue(&running.services, "alice").await;
        let mut socket = open(running.addr).await;

        send(&mut socket, "auth", json!({ "token": token })).await;
        let ok = next(&mut socket).await;
        assert_eq!(ok["type"], "auth-ok");
        assert_eq!(ok["data"]["userId"], "alice");
        assert_eq!(ok["data"]["username"], "user-alice");
        assert_eq!(ok["data"]["accountKind"], "registered");
        assert!(ok["data"].get("roomId").is_none());

        send(&mut socket, "ping", json!({})).await;
        assert_eq!(next(&mut socket).await["type"], "pong");

        let record = running.services.sessions.validate(&token).await.unwrap().unwrap();
        assert_eq!(record.presence_status, PresenceStatus::InLobby);
        running.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bad_token_is_rejected_and_closed() {
        let running = start(test_config()).await;
        let mut socket = open(running.addr).await;

        send(&mut socket, "auth", json!({ "token": "not-a-session" })).await;
        let err = next(&mut socket).await;
        assert_eq!(err["type"], "error");
        assert_eq!(err["data"]["code"], "AUTHENTICATION_FAILED");
        assert_eq!(err["data"]["requestType"], "auth");
        assert_eq!(next(&mut socket).await["type"], "closed");
        running.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn requests_before_auth_close_the_connection() {
        let running = start(test_config()).await;
        let mut socket = open(running.addr).await;

        send(&mut socket, "get-room-list", json!({})).await;
        let err = next(&mut socket).await;
        assert_eq!(err["data"]["code"], "AUTHENTICATION_FAILED");
        assert_eq!(next(&mut socket).await["type"], "closed");
        running.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn silent_client_is_dropped_after_handshake_window() {
        let running = start(test_config()).await;
        let mut socket = open(running.addr).await;

        let err = next(&mut socket).await;
        assert_eq!(err["data"]["code"], "AUTHENTICATION_FAILED");
        assert_eq!(next(&mut socket).await["type"], "closed");
        running.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn scenario_a_create_join_ready_start() {
        let running = start(test_config()).await;
        let (mut a, _) = login(&running, "a").await;
        let (mut b, _) = login(&running, "b").await;

        send(&mut a, "create-room", json!({ "name": "Foo", "settings": { "maxPlayers": 2 } })).await;
        let created = next_of(&mut a, "room-created").await;
        let room = &created["data"]["room"];
        assert_eq!(room["state"], "WAITING");
        assert_eq!(room["hostUserId"], "a");
        assert_eq!(room["players"].as_array().unwrap().len(), 1);
        let room_id = room["id"].as_str().unwrap().to_string();

        send(&mut b, "join-room", json!({ "roomId": room_id })).await;
        let joined = next_of(&mut b, "room-joined").await;
        assert_eq!(joined["data"]["room"]["players"].as_array().unwrap().len(), 2);
        assert_eq!(next_of(&mut a, "player-joined").await["data"]["player"]["userId"], "b");

        send(&mut b, "toggle-ready", json!({ "roomId": room_id })).await;
        send(&mut a, "toggle-ready", json!({ "roomId": room_id })).await;
        loop {
            let updated = next_of(&mut a, "room-updated").await;
            let players = updated["data"]["room"]["players"].as_array().unwrap().clone();
            if players.iter().all(|p| p["isReady"] == true) {
                break;
            }
        }

        send(&mut a, "start-game", json!({ "roomId": room_id })).await;
        for socket in [&mut a, &mut b] {
            let starting = next_of(socket, "game-starting").await;
            let order: Vec<String> = starting["data"]["turnOrder"]
                .as_array()
                .unwrap()
                .iter()
                .map(|id| id.as_str().unwrap().to_string())
                .collect();
            assert_eq!(order.len(), 2);
            assert!(order.contains(&"a".to_string()) && order.contains(&"b".to_string()));
        }
        assert_eq!(
            next_of(&mut b, "game-started").await["data"]["gameId"],
            format!("game-{room_id}")
        );

        let stored = running.services.rooms.get(&RoomId::new(&room_id)).await.unwrap();
        assert_eq!(stored.state, RoomState::InProgress);
        assert_eq!(stored.turn_order.map(|order| order.len()), Some(2));
        running.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rejected_request_yields_one_correlated_error() {
        let running = start(test_config()).await;
        let (mut a, _) = login(&running, "a").await;

        send(&mut a, "join-room", json!({ "roomId": "NOPE00" })).await;
        let err = next(&mut a).await;
        assert_eq!(err["type"], "error");
        assert_eq!(err["data"]["code"], "ROOM_NOT_FOUND");
        assert_eq!(err["data"]["requestType"], "join-room");

        send(&mut a, "dance", json!({})).await;
        let err = next(&mut a).await;
        assert_eq!(err["data"]["code"], "INVALID_MESSAGE");
        assert_eq!(err["data"]["requestType"], "dance");

        a.send(Message::Text("{not json".into())).await.unwrap();
        let err = next(&mut a).await;
        assert_eq!(err["data"]["code"], "INVALID_MESSAGE");
        assert!(err["data"].get("requestType").is_none());

        send(&mut a, "ping", json!({})).await;
        assert_eq!(next(&mut a).await["type"], "pong");
        running.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn oversized_frames_are_rejected() {
        let mut config = test_config();
        config.max_message_size = 128;
        let running = start(config).await;
        let (mut a, _) = login(&running, "a").await;

        send(&mut a, "create-room", json!({ "name": "x".repeat(200) })).await;
        let err = next(&mut a).await;
        assert_eq!(err["data"]["code"], "MESSAGE_TOO_LARGE");
        running.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn disconnect_leaves_the_room() {
        let running = start(test_config()).await;
        let (mut a, _) = login(&running, "a").await;
        let (mut b, b_token) = login(&running, "b").await;

        send(&mut a, "create-room", json!({ "name": "Foo" })).await;
        let room_id = next_of(&mut a, "room-created").await["data"]["room"]["id"]
            .as_str()
            .unwrap()
            .to_string();
        send(&mut b, "join-room", json!({ "roomId": room_id })).await;
        next_of(&mut b, "room-joined").await;

        b.close(None).await.unwrap();
        drop(b);

        let left = next_of(&mut a, "player-left").await;
        assert_eq!(left["data"]["userId"], "b");
        assert!(running
            .services
            .rooms
            .room_of(&UserId::new("b"))
            .await
            .unwrap()
            .is_none());
        let record = running.services.sessions.validate(&b_token).await.unwrap().unwrap();
        assert_eq!(record.presence_status, PresenceStatus::Offline);
        running.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn connection_dropped_during_broadcast_still_leaves_the_room() {
        let running = start(test_config()).await;
        let (mut a, _) = login(&running, "a").await;
        let (mut b, _) = login(&running, "b").await;

        send(&mut a, "create-room", json!({ "name": "Foo" })).await;
        let room_id = next_of(&mut a, "room-created").await["data"]["room"]["id"]
            .as_str()
            .unwrap()
            .to_string();
        send(&mut b, "join-room", json!({ "roomId": room_id })).await;
        next_of(&mut b, "room-joined").await;
        next_of(&mut a, "player-joined").await;

        // Stop b's writer without reading the close frame, so b's handler
        // stays in its read loop while broadcasts hit the closed queue.
        let b_user = UserId::new("b");
        let b_conn = running.services.connections.connection_of(&b_user).await.unwrap();
        running.services.connections.kick_connection(b_conn, None).await;
        let mut attempts = 0;
        while running.services.connections.is_user_connected(&b_user).await {
            assert!(attempts < 40, "b's connection was never dropped by a broadcast");
            attempts += 1;
            send(&mut a, "toggle-ready", json!({ "roomId": room_id })).await;
            next_of(&mut a, "room-updated").await;
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        drop(b);

        let left = next_of(&mut a, "player-left").await;
        assert_eq!(left["data"]["userId"], "b");
        assert!(running.services.rooms.room_of(&b_user).await.unwrap().is_none());
        let room = running.services.rooms.get(&RoomId::new(&room_id)).await.unwrap();
        assert_eq!(room.player_ids(), vec![UserId::new("a")]);
        running.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn room_events_cross_instances() {
        let sessions = Arc::new(InMemorySessionRepository::new());
        let rooms = Arc::new(InMemoryRoomRepository::new());
        let broadcaster = Arc::new(LocalBroadcaster::new(64));
        let instance = || {
            LobbyServices::from_parts(
                test_config(),
                sessions.clone(),
                rooms.clone(),
                broadcaster.clone(),
            )
        };
        let first = start_with(instance()).await;
        let second = start_with(instance()).await;

        let (mut a, _) = login(&first, "a").await;
        let (mut b, _) = login(&second, "b").await;

        send(&mut a, "create-room", json!({ "name": "Foo" })).await;
        let room_id = next_of(&mut a, "room-created").await["data"]["room"]["id"]
            .as_str()
            .unwrap()
            .to_string();
        send(&mut b, "join-room", json!({ "roomId": room_id })).await;
        let joined = next_of(&mut b, "room-joined").await;
        assert_eq!(joined["data"]["room"]["id"], room_id.as_str());

        let arrived = next_of(&mut a, "player-joined").await;
        assert_eq!(arrived["data"]["player"]["userId"], "b");
        assert!(!first.services.connections.is_user_connected(&UserId::new("b")).await);

        b.close(None).await.unwrap();
        drop(b);

        let left = next_of(&mut a, "player-left").await;
        assert_eq!(left["data"]["userId"], "b");
        let room = first.services.rooms.get(&RoomId::new(&room_id)).await.unwrap();
        assert_eq!(room.player_ids(), vec![UserId::new("a")]);

        first.stop().await;
        second.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reconnect_reports_room_and_challenges_presence() {
        let running = start(test_config()).await;
        let (mut a, _) = login(&running, "a").await;
        send(&mut a, "create-room", json!({ "name": "Foo" })).await;
        let room_id = next_of(&mut a, "room-created").await["data"]["room"]["id"]
            .as_str()
            .unwrap()
            .to_string();
        let (mut b, b_token) = login(&running, "b").await;
        send(&mut b, "join-room", json!({ "roomId": room_id })).await;
        next_of(&mut b, "room-joined").await;

        // A second login displaces the first connection without a leave.
        let mut b2 = open(running.addr).await;
        send(&mut b2, "auth", json!({ "token": b_token })).await;
        let ok = next(&mut b2).await;
        assert_eq!(ok["type"], "auth-ok");
        assert_eq!(ok["data"]["roomId"], room_id.as_str());
        assert_eq!(next_of(&mut b, "closed").await["type"], "closed");

        let challenge = next_of(&mut b2, "presence-challenge").await;
        assert_eq!(challenge["data"]["roomId"], room_id.as_str());
        send(
            &mut b2,
            "presence-response",
            json!({
                "roomId": room_id,
                "nonce": challenge["data"]["nonce"],
                "token": b_token,
            }),
        )
        .await;

        tokio::time::sleep(Duration::from_millis(800)).await;
        let room = running.services.rooms.get(&RoomId::new(&room_id)).await.unwrap();
        assert!(room.is_member(&UserId::new("b")));
        running.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unreachable_store_is_fatal_at_startup() {
        let config = test_config();
        let rooms = RedisRoomRepository::new("redis://127.0.0.1:1/").unwrap();
        let services = LobbyServices::from_parts(
            config.clone(),
            Arc::new(InMemorySessionRepository::new()),
            Arc::new(rooms),
            Arc::new(LocalBroadcaster::new(16)),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = LobbyServer::with_services(services);

        let result = server.serve(listener, None).await;
        assert!(matches!(result, Err(ServerError::Internal(_))));
    }
}
