//! In-process pub/sub over a tokio broadcast channel.

use std::sync::Arc;

use aira_common::StoreError;
use aira_common::store::PubSub;
use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

/// Frames buffered per subscriber before slow ones start lagging.
const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct PubSubFrame {
    pub tenant_id: Uuid,
    pub channel: String,
    pub payload: Arc<[u8]>,
}

impl PubSubFrame {
    /// Whether a subscriber scoped to `tenant_id` (and optionally one
    /// channel) should see this frame.
    pub fn visible_to(&self, tenant_id: Uuid, channel: Option<&str>) -> bool {
        self.tenant_id == tenant_id && channel.is_none_or(|c| c == self.channel)
    }
}

#[derive(Clone)]
pub struct BroadcastPubSub {
    tx: broadcast::Sender<PubSubFrame>,
}

impl Default for BroadcastPubSub {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastPubSub {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PubSubFrame> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl PubSub for BroadcastPubSub {
    async fn publish(
        &self,
        tenant_id: Uuid,
        channel: &str,
        payload: Vec<u8>,
    ) -> Result<(), StoreError> {
        let frame = PubSubFrame {
            tenant_id,
            channel: channel.to_string(),
            payload: payload.into(),
        };
        // No subscribers is not an error.
        if self.tx.send(frame).is_err() {
            trace!(channel, "published with no subscribers");
        }
        Ok(())
    }
}
