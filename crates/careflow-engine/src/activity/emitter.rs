//! Provenance-stamped event emission from activities
//!
//! Activities append domain events through this emitter; the engine
//! injects `{workflow_id, workflow_run_id, workflow_type, activity_id,
//! timestamp}` into the event metadata so projectors and auditors can
//! trace every event back to its execution.

use std::sync::Arc;

use tracing::debug;

use careflow_core::event::{AppendEvent, AppendedEvent};
use careflow_core::metadata::WorkflowProvenance;
use careflow_store::{append_with_retry, EventStore};

use super::ActivityError;

/// How many times an append is retried around `VersionConflict` before
/// the conflict surfaces to the activity.
const APPEND_ATTEMPTS: u32 = 5;

/// What `emit_once` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitOutcome {
    Emitted(AppendedEvent),

    /// An equivalent event from this activity already exists; nothing was
    /// appended
    AlreadyEmitted(AppendedEvent),
}

impl EmitOutcome {
    pub fn appended(&self) -> AppendedEvent {
        match self {
            Self::Emitted(e) | Self::AlreadyEmitted(e) => *e,
        }
    }
}

/// Emits domain events on behalf of workflow activities.
#[derive(Clone)]
pub struct EventEmitter {
    store: Arc<dyn EventStore>,
}

impl EventEmitter {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    /// Append an event with the given provenance stamped into its
    /// metadata. Version conflicts are retried inline.
    pub async fn emit(
        &self,
        provenance: &WorkflowProvenance,
        mut event: AppendEvent,
    ) -> Result<AppendedEvent, ActivityError> {
        event.event_metadata.attach_provenance(provenance);
        let appended = append_with_retry(self.store.as_ref(), event, APPEND_ATTEMPTS).await?;
        debug!(
            workflow_id = %provenance.workflow_id,
            activity_id = ?provenance.activity_id,
            event_id = %appended.event_id,
            "emitted event"
        );
        Ok(appended)
    }

    /// Append at most once per `(workflow_id, activity_id, event_type,
    /// stream_id)`.
    ///
    /// A retried activity whose previous attempt already emitted (but
    /// whose completion report was lost) finds the earlier event and
    /// returns it instead of appending a duplicate.
    pub async fn emit_once(
        &self,
        provenance: &WorkflowProvenance,
        event: AppendEvent,
    ) -> Result<EmitOutcome, ActivityError> {
        let prior = self
            .store
            .events_for_workflow(&provenance.workflow_id, None)
            .await?;

        if let Some(existing) = prior.iter().find(|e| {
            e.event_type == event.event_type
                && e.stream_id == event.stream_id
                && e.event_metadata.activity_id == provenance.activity_id
        }) {
            debug!(
                workflow_id = %provenance.workflow_id,
                activity_id = ?provenance.activity_id,
                event_id = %existing.event_id,
                "event already emitted, skipping"
            );
            return Ok(EmitOutcome::AlreadyEmitted(AppendedEvent {
                event_id: existing.event_id,
                stream_version: existing.stream_version,
            }));
        }

        self.emit(provenance, event)
            .await
            .map(EmitOutcome::Emitted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use careflow_core::registry::EventTypeRegistry;
    use careflow_store::InMemoryEventStore;
    use serde_json::json;
    use uuid::Uuid;

    fn emitter() -> EventEmitter {
        let store = InMemoryEventStore::new(Arc::new(EventTypeRegistry::standard()));
        EventEmitter::new(Arc::new(store))
    }

    fn provenance(activity_id: &str) -> WorkflowProvenance {
        WorkflowProvenance::new("org-bootstrap-test", Uuid::now_v7(), "org_bootstrap")
            .with_activity(activity_id)
    }

    #[tokio::test]
    async fn test_emit_stamps_provenance() {
        let emitter = emitter();
        let provenance = provenance("create-org");
        let org_id = Uuid::now_v7();

        let appended = emitter
            .emit(
                &provenance,
                AppendEvent::new(
                    org_id,
                    "organization",
                    "organization.created",
                    json!({"name": "Acme", "subdomain": "acme"}),
                ),
            )
            .await
            .unwrap();

        let event = emitter.store().get_event(appended.event_id).await.unwrap();
        assert_eq!(
            event.event_metadata.workflow_id.as_deref(),
            Some("org-bootstrap-test")
        );
        assert_eq!(
            event.event_metadata.activity_id.as_deref(),
            Some("create-org")
        );
    }

    #[tokio::test]
    async fn test_emit_once_deduplicates_retries() {
        let emitter = emitter();
        let provenance = provenance("configure-dns");
        let org_id = Uuid::now_v7();
        let event = AppendEvent::new(
            org_id,
            "organization",
            "dns.configured",
            json!({"subdomain": "acme", "record": {"kind": "CNAME"}}),
        );

        let first = emitter
            .emit_once(&provenance, event.clone())
            .await
            .unwrap();
        assert!(matches!(first, EmitOutcome::Emitted(_)));

        // The "retry" finds the prior event.
        let second = emitter.emit_once(&provenance, event).await.unwrap();
        assert!(matches!(second, EmitOutcome::AlreadyEmitted(_)));
        assert_eq!(first.appended(), second.appended());

        let events = emitter
            .store()
            .events_for_workflow("org-bootstrap-test", None)
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_emit_once_distinguishes_activities() {
        let emitter = emitter();
        let org_id = Uuid::now_v7();
        let event = AppendEvent::new(
            org_id,
            "organization",
            "organization.updated",
            json!({"note": "x"}),
        );

        emitter
            .emit_once(&provenance("step-1"), event.clone())
            .await
            .unwrap();
        let second = emitter.emit_once(&provenance("step-2"), event).await.unwrap();
        assert!(matches!(second, EmitOutcome::Emitted(_)));
    }
}
