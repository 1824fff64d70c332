//! In-process notify bus on tokio broadcast channels

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::trace;

use super::{NotifyBus, NotifyError, NotifyPayload, NotifySubscription, SubscriptionInner};

/// Per-channel capacity; a slow subscriber past this sees `Lagged` and
/// falls back to the backlog sweep.
const CHANNEL_CAPACITY: usize = 256;

/// Broadcast-based bus for single-process deployments and tests.
///
/// Matches the delivery contract of the Postgres bus: at-most-once, no
/// persistence, subscribers may miss messages while away.
#[derive(Default)]
pub struct InProcessNotifyBus {
    channels: DashMap<String, broadcast::Sender<NotifyPayload>>,
}

impl InProcessNotifyBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<NotifyPayload> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl NotifyBus for InProcessNotifyBus {
    async fn publish(&self, channel: &str, payload: &NotifyPayload) -> Result<(), NotifyError> {
        // A send error only means nobody is listening, which is fine for a
        // fire-and-forget bus.
        let receivers = self.sender(channel).send(payload.clone()).unwrap_or(0);
        trace!(channel, receivers, event_id = %payload.event_id, "published");
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<NotifySubscription, NotifyError> {
        Ok(NotifySubscription {
            inner: SubscriptionInner::Broadcast(self.sender(channel).subscribe()),
        })
    }
}
