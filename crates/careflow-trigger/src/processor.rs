//! The per-event trigger dispatch path
//!
//! Shared by the live listener and the backlog sweep so both arrive at
//! the workflow engine through exactly the same steps. Exactly-once is
//! the deterministic workflow id (`"<trigger-name>-<stream_id>"`) plus
//! the engine's `AlreadyExists`; the `processed_at` stamp is sweep
//! bookkeeping, not a correctness guard.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use careflow_core::event::EventRecord;
use careflow_core::metadata::WorkflowProvenance;
use careflow_core::registry::EventTypeRegistry;
use careflow_engine::{EngineError, StartOptions, StartedRun, WorkflowStarter};
use careflow_store::{EventStore, EventStoreError, NotifiedEvent};

/// Errors from trigger dispatch bookkeeping.
#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    #[error("event store error: {0}")]
    Store(#[from] EventStoreError),
}

/// The slice of an event the dispatch path needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerMessage {
    pub event_id: Uuid,
    pub event_type: String,
    pub stream_id: Uuid,
    pub stream_type: String,
    pub event_data: serde_json::Value,
}

impl From<&EventRecord> for TriggerMessage {
    fn from(record: &EventRecord) -> Self {
        Self {
            event_id: record.event_id,
            event_type: record.event_type.clone(),
            stream_id: record.stream_id,
            stream_type: record.stream_type.clone(),
            event_data: record.event_data.clone(),
        }
    }
}

impl TriggerMessage {
    pub fn from_notified(event_id: Uuid, event: NotifiedEvent) -> Self {
        Self {
            event_id,
            event_type: event.event_type,
            stream_id: event.stream_id,
            stream_type: event.stream_type,
            event_data: event.event_data,
        }
    }
}

/// What dispatching one message did.
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerOutcome {
    /// Workflow started; provenance written back
    Started(StartedRun),

    /// Another dispatch won the race; provenance of the winning run
    /// written back
    Deduplicated(StartedRun),

    /// Not a trigger event
    Rejected,

    /// Engine start failed; retry_count bumped, left for the backlog
    Failed { retry_count: i32 },
}

/// Turns trigger events into workflow starts.
pub struct TriggerProcessor {
    store: Arc<dyn EventStore>,
    starter: Arc<dyn WorkflowStarter>,
    registry: Arc<EventTypeRegistry>,
}

impl TriggerProcessor {
    pub fn new(
        store: Arc<dyn EventStore>,
        starter: Arc<dyn WorkflowStarter>,
        registry: Arc<EventTypeRegistry>,
    ) -> Self {
        Self {
            store,
            starter,
            registry,
        }
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<EventTypeRegistry> {
        &self.registry
    }

    /// The deterministic workflow id for a trigger: the single source of
    /// start idempotency.
    pub fn workflow_id(trigger_name: &str, stream_id: Uuid) -> String {
        format!("{trigger_name}-{stream_id}")
    }

    /// Dispatch one message.
    #[instrument(skip(self, message), fields(event_id = %message.event_id, event_type = %message.event_type))]
    pub async fn process(&self, message: &TriggerMessage) -> Result<TriggerOutcome, TriggerError> {
        let Some(spec) = self.registry.trigger_spec(&message.event_type) else {
            debug!(event_type = %message.event_type, "not a trigger event, rejecting");
            return Ok(TriggerOutcome::Rejected);
        };

        let workflow_id = Self::workflow_id(&spec.trigger_name, message.stream_id);

        // The workflow decides where emissions go; the trigger context
        // tells it which aggregate it is provisioning.
        let params = json!({
            "event_id": message.event_id,
            "stream_id": message.stream_id,
            "stream_type": message.stream_type,
            "data": message.event_data,
        });

        let options =
            StartOptions::new(workflow_id.clone()).with_task_queue(spec.task_queue.clone());

        let (started, deduplicated) =
            match self.starter.start(&spec.workflow_type, params, options).await {
                Ok(run) => {
                    info!(%workflow_id, run_id = %run.run_id, "workflow started");
                    (run, false)
                }
                Err(EngineError::AlreadyExists {
                    workflow_id,
                    run_id,
                }) => {
                    // The first start wins; this dispatch still records
                    // provenance and completes.
                    debug!(%workflow_id, %run_id, "workflow already running, treating as success");
                    (
                        StartedRun {
                            workflow_id,
                            run_id,
                        },
                        true,
                    )
                }
                Err(error) => {
                    warn!(%workflow_id, %error, "workflow start failed");
                    let retry_count = self
                        .store
                        .record_dispatch_failure(message.event_id, &error.to_string())
                        .await?;
                    return Ok(TriggerOutcome::Failed { retry_count });
                }
            };

        let provenance = WorkflowProvenance::new(
            started.workflow_id.clone(),
            started.run_id,
            spec.workflow_type.clone(),
        );
        self.store
            .attach_provenance(message.event_id, &provenance, true)
            .await?;

        Ok(if deduplicated {
            TriggerOutcome::Deduplicated(started)
        } else {
            TriggerOutcome::Started(started)
        })
    }
}
