//! Redis PUBLISH/SUBSCRIBE broadcaster for multi-instance deployments.
//!
//! Publishing goes straight to Redis. A subscriber task holds a dedicated
//! pub/sub connection and re-emits every message on a local channel, which
//! is what [`Broadcaster::subscribe`] hands out. The task reconnects on its
//! own when the connection drops.

use super::{Broadcaster, RoomBroadcast};
use crate::error::StoreError;
use crate::rooms::redis::DEFAULT_KEY_PREFIX;
use crate::types::ShutdownState;
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct RedisBroadcaster {
    client: redis::Client,
    publisher: Arc<OnceCell<redis::aio::MultiplexedConnection>>,
    channel: String,
    local: broadcast::Sender<RoomBroadcast>,
}

impl std::fmt::Debug for RedisBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBroadcaster")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

impl RedisBroadcaster {
    /// Creates the broadcaster. The publishing connection is opened on
    /// first use; call [`Broadcaster::spawn_relay`] to start receiving.
    pub fn new(redis_url: &str, capacity: usize) -> Result<Self, StoreError> {
        Self::with_prefix(redis_url, DEFAULT_KEY_PREFIX, capacity)
    }

    pub fn with_prefix(redis_url: &str, prefix: &str, capacity: usize) -> Result<Self, StoreError> {
        let (local, _) = broadcast::channel(capacity.max(1));
        Ok(Self {
            client: redis::Client::open(redis_url)?,
            publisher: Arc::new(OnceCell::new()),
            channel: format!("{prefix}:events"),
            local,
        })
    }

    async fn publisher(&self) -> Result<redis::aio::MultiplexedConnection, StoreError> {
        let conn = self
            .publisher
            .get_or_try_init(|| self.client.get_multiplexed_async_connection())
            .await?;
        Ok(conn.clone())
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

async fn relay(
    client: &redis::Client,
    channel: &str,
    local: &broadcast::Sender<RoomBroadcast>,
) -> Result<(), StoreError> {
    let mut pubsub = client.get_async_connection().await?.into_pubsub();
    pubsub.subscribe(channel).await?;
    info!("📡 Subscribed to {}", channel);

    let mut messages = pubsub.on_message();
    while let Some(message) = messages.next().await {
        let payload: String = match message.get_payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Ignoring unreadable broadcast payload: {}", e);
                continue;
            }
        };
        match serde_json::from_str::<RoomBroadcast>(&payload) {
            Ok(broadcast) => {
                let _ = local.send(broadcast);
            }
            Err(e) => warn!("Ignoring malformed broadcast: {}", e),
        }
    }
    Ok(())
}

#[async_trait]
impl Broadcaster for RedisBroadcaster {
    async fn publish(&self, message: RoomBroadcast) -> Result<(), StoreError> {
        let payload = serde_json::to_string(&message)?;
        let mut conn = self.publisher().await?;
        redis::cmd("PUBLISH")
            .arg(&self.channel)
            .arg(payload)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<RoomBroadcast> {
        self.local.subscribe()
    }

    /// Relays the Redis channel onto the local one until shutdown.
    fn spawn_relay(&self, shutdown: Option<ShutdownState>) -> Option<JoinHandle<()>> {
        let client = self.client.clone();
        let channel = self.channel.clone();
        let local = self.local.clone();

        Some(tokio::spawn(async move {
            loop {
                if shutdown.as_ref().is_some_and(|s| s.is_shutdown_initiated()) {
                    break;
                }
                match relay(&client, &channel, &local).await {
                    Ok(()) => warn!("📡 Subscription to {} ended, reconnecting", channel),
                    Err(e) => error!("📡 Subscription to {} failed: {}", channel, e),
                }
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
            debug!("📴 Redis subscriber for {} stopped", channel);
        }))
    }
}
