//! Presence challenges: making sure a room's members are really there.
//!
//! After a reconnect, and periodically for every WAITING room, the lobby
//! sends `presence-challenge{roomId, nonce}` to the connection it believes
//! belongs to a room member. The client has a short window to answer with
//! `presence-response` carrying the same nonce and its session token. A
//! missing answer, a failed send, or an answer saying the client is not in
//! the room removes the user through the normal leave path.
//!
//! Outstanding challenges are process-local: the challenge goes to a local
//! connection, so the answer arrives on the same instance.
//!
//! A member no instance holds (their instance died) is never challenged.
//! Every confirmed challenge touches the member's session, so each cycle
//! also evicts members with no local connection whose session is gone or
//! has not been touched within the orphan grace. This relies on every
//! instance running the periodic cycle.

use crate::broadcast::{announce_departure, Broadcaster};
use crate::connection::ConnectionManager;
use crate::error::LobbyError;
use crate::messaging::ServerEvent;
use crate::rooms::{RoomRegistry, RoomState};
use crate::session::SessionStore;
use crate::types::{PresenceStatus, RoomId, ShutdownState, UserId};
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct PendingChallenge {
    nonce: String,
    reply: oneshot::Sender<bool>,
}

/// How a single challenge ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeOutcome {
    Confirmed,
    /// The user was removed from the room.
    Revoked,
    /// A newer challenge for the same user and room took over.
    Superseded,
}

pub struct PresenceReconciler {
    rooms: Arc<RoomRegistry>,
    sessions: Arc<SessionStore>,
    connections: Arc<ConnectionManager>,
    broadcaster: Arc<dyn Broadcaster>,
    timeout: Duration,
    orphan_grace: Duration,
    pending: DashMap<(RoomId, UserId), PendingChallenge>,
}

impl std::fmt::Debug for PresenceReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceReconciler")
            .field("timeout", &self.timeout)
            .field("orphan_grace", &self.orphan_grace)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl PresenceReconciler {
    pub fn new(
        rooms: Arc<RoomRegistry>,
        sessions: Arc<SessionStore>,
        connections: Arc<ConnectionManager>,
        broadcaster: Arc<dyn Broadcaster>,
        timeout: Duration,
    ) -> Self {
        Self {
            rooms,
            sessions,
            connections,
            broadcaster,
            timeout,
            orphan_grace: timeout * 3,
            pending: DashMap::new(),
        }
    }

    /// How long a member with no local connection may go without a session
    /// write before a cycle evicts them.
    pub fn with_orphan_grace(mut self, grace: Duration) -> Self {
        self.orphan_grace = grace;
        self
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Challenges `user_id` about membership of `room_id` in the background.
    ///
    /// The returned handle resolves once the challenge is answered, times
    /// out or is superseded.
    pub fn challenge(self: &Arc<Self>, room_id: RoomId, user_id: UserId) -> JoinHandle<ChallengeOutcome> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run_challenge(room_id, user_id).await })
    }

    async fn run_challenge(&self, room_id: RoomId, user_id: UserId) -> ChallengeOutcome {
        let nonce = uuid::Uuid::new_v4().to_string();
        let (reply, answer) = oneshot::channel();
        let key = (room_id.clone(), user_id.clone());
        self.pending.insert(
            key.clone(),
            PendingChallenge {
                nonce: nonce.clone(),
                reply,
            },
        );

        let challenge = ServerEvent::PresenceChallenge {
            room_id: room_id.clone(),
            nonce: nonce.clone(),
        };
        if let Err(e) = self.connections.send_to_user(&user_id, &challenge).await {
            debug!("📭 Could not challenge {} for room {}: {}", user_id, room_id, e);
            self.pending.remove_if(&key, |_, p| p.nonce == nonce);
            self.revoke(&room_id, &user_id).await;
            return ChallengeOutcome::Revoked;
        }
        debug!("❓ Challenged {} about room {}", user_id, room_id);

        match tokio::time::timeout(self.timeout, answer).await {
            Ok(Ok(true)) => {
                debug!("✅ {} confirmed presence in room {}", user_id, room_id);
                ChallengeOutcome::Confirmed
            }
            Ok(Ok(false)) => {
                info!("🙈 {} says it is no longer in room {}", user_id, room_id);
                self.revoke(&room_id, &user_id).await;
                ChallengeOutcome::Revoked
            }
            Ok(Err(_)) => ChallengeOutcome::Superseded,
            Err(_) => {
                if self
                    .pending
                    .remove_if(&key, |_, p| p.nonce == nonce)
                    .is_none()
                {
                    return ChallengeOutcome::Superseded;
                }
                info!("⏰ {} did not answer the presence challenge for room {}", user_id, room_id);
                self.revoke(&room_id, &user_id).await;
                ChallengeOutcome::Revoked
            }
        }
    }

    /// Matches a client's answer to its outstanding challenge.
    ///
    /// # Arguments
    ///
    /// * `user_id` - The user bound to the answering connection
    /// * `room_id` / `nonce` - Must match the outstanding challenge
    /// * `token` - The client's session token; must belong to `user_id`
    /// * `in_room` - `false` when the client no longer considers itself a member
    pub async fn respond(
        &self,
        user_id: &UserId,
        room_id: &RoomId,
        nonce: &str,
        token: &str,
        in_room: bool,
    ) -> Result<(), LobbyError> {
        let record = self
            .sessions
            .validate(token)
            .await?
            .ok_or(LobbyError::SessionExpired)?;
        if &record.user_id != user_id {
            return Err(LobbyError::InvalidMessage(
                "presence token belongs to another user".to_string(),
            ));
        }

        let key = (room_id.clone(), user_id.clone());
        let (_, pending) = self
            .pending
            .remove_if(&key, |_, p| p.nonce == nonce)
            .ok_or_else(|| {
                LobbyError::InvalidMessage("no outstanding challenge with that nonce".to_string())
            })?;
        let _ = pending.reply.send(in_room);
        if in_room {
            // Keeps the member visibly held for the other instances' cycles.
            self.sessions.refresh(token).await?;
        }
        Ok(())
    }

    /// Removes a user who failed a challenge and tells everyone involved.
    async fn revoke(&self, room_id: &RoomId, user_id: &UserId) {
        if !self.evict(room_id, user_id).await {
            return;
        }
        if let Err(e) = self.sessions.set_presence(user_id, PresenceStatus::InLobby).await {
            warn!("Failed to update presence of {}: {}", user_id, e);
        }
        let _ = self
            .connections
            .send_to_user(
                user_id,
                &ServerEvent::RoomLeft {
                    room_id: room_id.clone(),
                },
            )
            .await;
        info!("🚷 Removed {} from room {} after failed presence check", user_id, room_id);
    }

    /// Takes `user_id` out of `room_id` and announces it to the members.
    /// `false` when they were no longer there.
    async fn evict(&self, room_id: &RoomId, user_id: &UserId) -> bool {
        match self.rooms.leave(user_id, Some(room_id)).await {
            Ok(departure) => {
                if let Err(e) = announce_departure(self.broadcaster.as_ref(), &departure).await {
                    warn!("Failed to announce removal of {} from {}: {}", user_id, room_id, e);
                }
                true
            }
            Err(LobbyError::NotInRoom) | Err(LobbyError::RoomNotFound(_)) => {
                debug!("{} already left room {}", user_id, room_id);
                false
            }
            Err(e) => {
                warn!("Could not remove {} from room {}: {}", user_id, room_id, e);
                false
            }
        }
    }

    /// Whether a member with no local connection looks abandoned: no live
    /// session, or none written within the orphan grace.
    async fn is_orphaned(&self, user_id: &UserId) -> Result<bool, LobbyError> {
        let Some(record) = self.sessions.session_of(user_id).await? else {
            return Ok(true);
        };
        let idle = Utc::now() - self.sessions.last_touched(&record);
        Ok(idle.to_std().is_ok_and(|idle| idle > self.orphan_grace))
    }

    /// Challenges every locally connected member of every WAITING room and
    /// evicts the orphaned ones nobody else holds.
    ///
    /// # Returns
    ///
    /// Handles for the challenges that were started.
    pub async fn run_cycle(self: &Arc<Self>) -> Result<Vec<JoinHandle<ChallengeOutcome>>, LobbyError> {
        let mut started = Vec::new();
        for room in self.rooms.list_all().await? {
            if room.state != RoomState::Waiting {
                continue;
            }
            for user_id in room.player_ids() {
                if !self.connections.is_user_connected(&user_id).await {
                    if self.is_orphaned(&user_id).await? && self.evict(&room.id, &user_id).await {
                        info!("👻 Evicted {} from room {}: no instance holds them", user_id, room.id);
                    }
                    continue;
                }
                if self.pending.contains_key(&(room.id.clone(), user_id.clone())) {
                    continue;
                }
                started.push(self.challenge(room.id.clone(), user_id));
            }
        }
        Ok(started)
    }

    /// Runs [`run_cycle`](Self::run_cycle) every `interval` until shutdown.
    pub fn spawn_periodic(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: Option<ShutdownState>,
    ) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if shutdown.as_ref().is_some_and(|s| s.is_shutdown_initiated()) {
                    break;
                }
                match this.run_cycle().await {
                    Ok(started) if !started.is_empty() => {
                        debug!("🔎 Presence cycle challenged {} members", started.len());
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Presence cycle failed, retrying next tick: {}", e),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::{spawn_fanout, LocalBroadcaster};
    use crate::rooms::{InMemoryRoomRepository, RoomSettings};
    use crate::session::InMemorySessionRepository;
    use crate::types::{AccountKind, Identity};
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::Message;

    struct Fixture {
        rooms: Arc<RoomRegistry>,
        sessions: Arc<SessionStore>,
        connections: Arc<ConnectionManager>,
        presence: Arc<PresenceReconciler>,
        _fanout: JoinHandle<()>,
    }

    fn fixture(timeout: Duration) -> Fixture {
        fixture_with_grace(timeout, Duration::from_secs(60))
    }

    fn fixture_with_grace(timeout: Duration, orphan_grace: Duration) -> Fixture {
        let rooms = Arc::new(RoomRegistry::new(Arc::new(InMemoryRoomRepository::new())));
        let sessions = Arc::new(SessionStore::new(
            Arc::new(InMemorySessionRepository::new()),
            Duration::from_secs(60),
        ));
        let connections = Arc::new(ConnectionManager::new());
        let broadcaster: Arc<dyn Broadcaster> = Arc::new(LocalBroadcaster::new(64));
        let fanout = spawn_fanout(broadcaster.as_ref(), connections.clone());
        let presence = Arc::new(
            PresenceReconciler::new(
                rooms.clone(),
                sessions.clone(),
                connections.clone(),
                broadcaster,
                timeout,
            )
            .with_orphan_grace(orphan_grace),
        );
        Fixture {
            rooms,
            sessions,
            connections,
            presence,
            _fanout: fanout,
        }
    }

    fn identity(id: &str) -> Identity {
        Identity {
            user_id: UserId::new(id),
            username: id.to_string(),
            account_kind: AccountKind::Guest,
        }
    }

    async fn connect(
        fixture: &Fixture,
        user: &Identity,
    ) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = fixture
            .connections
            .add_connection("127.0.0.1:1".parse().unwrap(), tx)
            .await;
        fixture.connections.bind_user(id, user.user_id.clone()).await;
        rx
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<Message>) -> serde_json::Value {
        let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match frame {
            Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    async fn two_player_room(fixture: &Fixture) -> RoomId {
        let room = fixture
            .rooms
            .create(&identity("a"), "Foo", RoomSettings::default())
            .await
            .unwrap();
        fixture.rooms.join(&identity("b"), &room.id).await.unwrap();
        room.id
    }

    #[tokio::test]
    async fn unanswered_challenge_removes_the_member() {
        let fixture = fixture(Duration::from_millis(50));
        let room_id = two_player_room(&fixture).await;
        let mut a_rx = connect(&fixture, &identity("a")).await;
        // b's socket is silently dead: nobody reads it and nobody answers.
        let _b_rx = connect(&fixture, &identity("b")).await;

        let outcome = fixture
            .presence
            .challenge(room_id.clone(), UserId::new("b"))
            .await
            .unwrap();
        assert_eq!(outcome, ChallengeOutcome::Revoked);

        let room = fixture.rooms.get(&room_id).await.unwrap();
        assert_eq!(room.players.len(), 1);
        assert!(fixture.rooms.room_of(&UserId::new("b")).await.unwrap().is_none());

        let event = next_event(&mut a_rx).await;
        assert_eq!(event["type"], "player-left");
        assert_eq!(event["data"]["userId"], "b");
    }

    #[tokio::test]
    async fn answered_challenge_keeps_the_member() {
        let fixture = fixture(Duration::from_secs(2));
        let room_id = two_player_room(&fixture).await;
        let b = identity("b");
        let session = fixture.sessions.issue(&b).await.unwrap();
        let mut b_rx = connect(&fixture, &b).await;

        let handle = fixture.presence.challenge(room_id.clone(), b.user_id.clone());
        let challenge = next_event(&mut b_rx).await;
        assert_eq!(challenge["type"], "presence-challenge");
        let nonce = challenge["data"]["nonce"].as_str().unwrap().to_string();

        fixture
            .presence
            .respond(&b.user_id, &room_id, &nonce, &session.session_token, true)
            .await
            .unwrap();
        assert_eq!(handle.await.unwrap(), ChallengeOutcome::Confirmed);
        assert!(fixture.rooms.get(&room_id).await.unwrap().is_member(&b.user_id));
        assert_eq!(fixture.presence.pending_count(), 0);
    }

    #[tokio::test]
    async fn answering_not_in_room_removes_the_member() {
        let fixture = fixture(Duration::from_secs(2));
        let room_id = two_player_room(&fixture).await;
        let b = identity("b");
        let session = fixture.sessions.issue(&b).await.unwrap();
        let mut b_rx = connect(&fixture, &b).await;

        let handle = fixture.presence.challenge(room_id.clone(), b.user_id.clone());
        let challenge = next_event(&mut b_rx).await;
        let nonce = challenge["data"]["nonce"].as_str().unwrap().to_string();
        fixture
            .presence
            .respond(&b.user_id, &room_id, &nonce, &session.session_token, false)
            .await
            .unwrap();

        assert_eq!(handle.await.unwrap(), ChallengeOutcome::Revoked);
        assert!(!fixture.rooms.get(&room_id).await.unwrap().is_member(&b.user_id));
        let left = next_event(&mut b_rx).await;
        assert_eq!(left["type"], "room-left");
    }

    #[tokio::test]
    async fn wrong_nonce_is_rejected() {
        let fixture = fixture(Duration::from_secs(2));
        let room_id = two_player_room(&fixture).await;
        let b = identity("b");
        let session = fixture.sessions.issue(&b).await.unwrap();
        let _b_rx = connect(&fixture, &b).await;

        let _handle = fixture.presence.challenge(room_id.clone(), b.user_id.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;
        let err = fixture
            .presence
            .respond(&b.user_id, &room_id, "guess", &session.session_token, true)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_MESSAGE");
    }

    #[tokio::test]
    async fn disconnected_member_is_removed_immediately() {
        let fixture = fixture(Duration::from_secs(5));
        let room_id = two_player_room(&fixture).await;

        let outcome = fixture
            .presence
            .challenge(room_id.clone(), UserId::new("b"))
            .await
            .unwrap();
        assert_eq!(outcome, ChallengeOutcome::Revoked);
        assert_eq!(fixture.rooms.get(&room_id).await.unwrap().players.len(), 1);
    }

    #[tokio::test]
    async fn cycle_only_challenges_local_members_of_waiting_rooms() {
        let fixture = fixture(Duration::from_secs(5));
        two_player_room(&fixture).await;
        let _a_rx = connect(&fixture, &identity("a")).await;

        let started = fixture.presence.run_cycle().await.unwrap();
        assert_eq!(started.len(), 1);
        for handle in started {
            handle.abort();
        }
    }

    #[tokio::test]
    async fn cycle_evicts_members_no_instance_holds() {
        let fixture = fixture_with_grace(Duration::from_secs(5), Duration::from_millis(100));
        let room_id = two_player_room(&fixture).await;
        fixture.rooms.join(&identity("c"), &room_id).await.unwrap();
        fixture.rooms.join(&identity("d"), &room_id).await.unwrap();
        let mut a_rx = connect(&fixture, &identity("a")).await;

        // c's instance went away long ago; b is still held elsewhere; d never
        // had a live session at all.
        fixture.sessions.issue(&identity("c")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        fixture.sessions.issue(&identity("b")).await.unwrap();

        let started = fixture.presence.run_cycle().await.unwrap();
        assert_eq!(started.len(), 1);
        for handle in started {
            handle.abort();
        }

        let room = fixture.rooms.get(&room_id).await.unwrap();
        assert_eq!(room.player_ids(), vec![UserId::new("a"), UserId::new("b")]);
        assert!(fixture.rooms.room_of(&UserId::new("c")).await.unwrap().is_none());

        let mut left = Vec::new();
        while left.len() < 2 {
            let event = next_event(&mut a_rx).await;
            if event["type"] == "player-left" {
                left.push(event["data"]["userId"].as_str().unwrap().to_string());
            }
        }
        left.sort();
        assert_eq!(left, vec!["c", "d"]);
    }

    #[tokio::test]
    async fn confirming_presence_touches_the_session() {
        let fixture = fixture(Duration::from_secs(2));
        let room_id = two_player_room(&fixture).await;
        let b = identity("b");
        let session = fixture.sessions.issue(&b).await.unwrap();
        let mut b_rx = connect(&fixture, &b).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let handle = fixture.presence.challenge(room_id.clone(), b.user_id.clone());
        let challenge = next_event(&mut b_rx).await;
        let nonce = challenge["data"]["nonce"].as_str().unwrap().to_string();
        fixture
            .presence
            .respond(&b.user_id, &room_id, &nonce, &session.session_token, true)
            .await
            .unwrap();
        assert_eq!(handle.await.unwrap(), ChallengeOutcome::Confirmed);

        let touched = fixture.sessions.session_of(&b.user_id).await.unwrap().unwrap();
        assert!(touched.expires_at > session.expires_at);
    }
}
