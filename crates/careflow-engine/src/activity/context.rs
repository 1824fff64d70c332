//! Activity execution context

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use careflow_core::event::{AppendEvent, AppendedEvent};
use careflow_core::metadata::WorkflowProvenance;

use super::{ActivityError, EmitOutcome, EventEmitter};

/// Context handed to every activity execution.
///
/// Carries the identity of the owning execution (which becomes event
/// provenance), the attempt counters, and the emitter for appending
/// domain events.
#[derive(Clone)]
pub struct ActivityContext {
    pub workflow_id: String,
    pub workflow_run_id: Uuid,
    pub workflow_type: String,
    pub activity_id: String,

    /// Current attempt, 1-based
    pub attempt: u32,
    pub max_attempts: u32,

    emitter: Option<Arc<EventEmitter>>,
}

impl ActivityContext {
    pub fn new(
        workflow_id: impl Into<String>,
        workflow_run_id: Uuid,
        workflow_type: impl Into<String>,
        activity_id: impl Into<String>,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            workflow_run_id,
            workflow_type: workflow_type.into(),
            activity_id: activity_id.into(),
            attempt: 1,
            max_attempts: 1,
            emitter: None,
        }
    }

    pub fn with_attempt(mut self, attempt: u32, max_attempts: u32) -> Self {
        self.attempt = attempt;
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_emitter(mut self, emitter: Arc<EventEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    /// Whether this is the final attempt before the failure surfaces to
    /// the workflow.
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// The provenance stamped onto every event this activity emits.
    pub fn provenance(&self) -> WorkflowProvenance {
        WorkflowProvenance {
            workflow_id: self.workflow_id.clone(),
            workflow_run_id: self.workflow_run_id,
            workflow_type: self.workflow_type.clone(),
            activity_id: Some(self.activity_id.clone()),
            timestamp: Utc::now(),
        }
    }

    /// Append a domain event carrying this activity's provenance.
    pub async fn emit_event(&self, event: AppendEvent) -> Result<AppendedEvent, ActivityError> {
        self.emitter()?.emit(&self.provenance(), event).await
    }

    /// Append a domain event at most once per
    /// `(workflow, activity, event_type, stream)`; safe across retries.
    pub async fn emit_event_once(
        &self,
        event: AppendEvent,
    ) -> Result<AppendedEvent, ActivityError> {
        self.emitter()?
            .emit_once(&self.provenance(), event)
            .await
            .map(|outcome| outcome.appended())
    }

    fn emitter(&self) -> Result<&Arc<EventEmitter>, ActivityError> {
        self.emitter.as_ref().ok_or_else(|| {
            ActivityError::validation("activity context has no event emitter wired")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provenance_carries_activity_id() {
        let run_id = Uuid::now_v7();
        let ctx = ActivityContext::new("org-bootstrap-x", run_id, "org_bootstrap", "send-email");

        let provenance = ctx.provenance();
        assert_eq!(provenance.workflow_id, "org-bootstrap-x");
        assert_eq!(provenance.workflow_run_id, run_id);
        assert_eq!(provenance.activity_id.as_deref(), Some("send-email"));
    }

    #[test]
    fn test_last_attempt() {
        let ctx = ActivityContext::new("w", Uuid::now_v7(), "t", "a").with_attempt(2, 3);
        assert!(!ctx.is_last_attempt());

        let ctx = ctx.with_attempt(3, 3);
        assert!(ctx.is_last_attempt());
    }

    #[tokio::test]
    async fn test_emit_without_emitter_fails_cleanly() {
        let ctx = ActivityContext::new("w", Uuid::now_v7(), "t", "a");
        let result = ctx
            .emit_event(AppendEvent::new(
                Uuid::now_v7(),
                "organization",
                "organization.updated",
                serde_json::json!({}),
            ))
            .await;
        assert!(result.is_err());
    }
}
