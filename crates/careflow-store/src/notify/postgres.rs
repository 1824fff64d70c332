//! Postgres LISTEN/NOTIFY bus

use async_trait::async_trait;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tracing::{debug, instrument};

use super::{NotifyBus, NotifyError, NotifyPayload, NotifySubscription, SubscriptionInner};

/// `pg_notify` rejects payloads near 8000 bytes; stay under with headroom
/// and degrade to an id-only reference beyond it.
const MAX_PAYLOAD_BYTES: usize = 7500;

/// Notify bus on Postgres LISTEN/NOTIFY.
///
/// Delivery happens on transaction commit on the publishing side and only
/// reaches currently-connected listeners. Anything missed is picked up by
/// the backlog sweep.
#[derive(Clone)]
pub struct PgNotifyBus {
    pool: PgPool,
}

impl PgNotifyBus {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotifyBus for PgNotifyBus {
    #[instrument(skip(self, payload), fields(event_id = %payload.event_id))]
    async fn publish(&self, channel: &str, payload: &NotifyPayload) -> Result<(), NotifyError> {
        let mut encoded = serde_json::to_string(payload)
            .map_err(|e| NotifyError::Serialization(e.to_string()))?;

        if encoded.len() > MAX_PAYLOAD_BYTES {
            debug!(
                channel,
                size = encoded.len(),
                "payload too large for pg_notify, sending reference"
            );
            encoded = serde_json::to_string(&NotifyPayload::reference(payload.event_id))
                .map_err(|e| NotifyError::Serialization(e.to_string()))?;
        }

        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel)
            .bind(&encoded)
            .execute(&self.pool)
            .await
            .map_err(|e| NotifyError::Connection(e.to_string()))?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn subscribe(&self, channel: &str) -> Result<NotifySubscription, NotifyError> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| NotifyError::Connection(e.to_string()))?;

        listener
            .listen(channel)
            .await
            .map_err(|e| NotifyError::Connection(e.to_string()))?;

        debug!(channel, "listening");
        Ok(NotifySubscription {
            inner: SubscriptionInner::Postgres(listener),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use careflow_core::event::EventRecord;
    use careflow_core::metadata::EventMetadata;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn test_large_payload_detection() {
        let record = EventRecord {
            event_id: Uuid::now_v7(),
            stream_id: Uuid::now_v7(),
            stream_type: "organization".to_string(),
            stream_version: 1,
            event_type: "organization.created".to_string(),
            event_data: json!({ "blob": "x".repeat(10_000) }),
            event_metadata: EventMetadata::default(),
            created_at: Utc::now(),
            processed_at: None,
            processing_error: None,
            retry_count: 0,
        };

        let full = serde_json::to_string(&NotifyPayload::full(&record)).unwrap();
        assert!(full.len() > MAX_PAYLOAD_BYTES);

        let reference =
            serde_json::to_string(&NotifyPayload::reference(record.event_id)).unwrap();
        assert!(reference.len() < MAX_PAYLOAD_BYTES);
    }
}
