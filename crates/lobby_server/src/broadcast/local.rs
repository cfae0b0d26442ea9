//! In-process broadcaster for single-instance deployments and tests.

use super::{Broadcaster, RoomBroadcast};
use crate::error::StoreError;
use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::trace;

#[derive(Debug, Clone)]
pub struct LocalBroadcaster {
    sender: broadcast::Sender<RoomBroadcast>,
}

impl LocalBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }
}

#[async_trait]
impl Broadcaster for LocalBroadcaster {
    async fn publish(&self, message: RoomBroadcast) -> Result<(), StoreError> {
        // No subscribers just means nobody is listening yet.
        if self.sender.send(message).is_err() {
            trace!("Broadcast published with no subscribers");
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<RoomBroadcast> {
        self.sender.subscribe()
    }
}
