//! Event metadata and workflow provenance
//!
//! Metadata is an open JSON object: the fields the core understands are
//! typed, everything else round-trips through `extra` untouched so
//! producers can stamp tenant- or domain-specific context.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Workflow identifiers copied into event metadata so every event can be
/// traced back to the execution that produced (or dispatched) it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowProvenance {
    /// Deterministic workflow identity (`"<trigger-name>-<stream_id>"`)
    pub workflow_id: String,

    /// Engine execution instance
    pub workflow_run_id: Uuid,

    pub workflow_type: String,

    /// Present when the event was emitted by an activity
    pub activity_id: Option<String>,

    /// When the engine stamped the provenance
    pub timestamp: DateTime<Utc>,
}

impl WorkflowProvenance {
    pub fn new(
        workflow_id: impl Into<String>,
        workflow_run_id: Uuid,
        workflow_type: impl Into<String>,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            workflow_run_id,
            workflow_type: workflow_type.into(),
            activity_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_activity(mut self, activity_id: impl Into<String>) -> Self {
        self.activity_id = Some(activity_id.into());
        self
    }
}

/// Metadata attached to every event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Who caused the event (user id, service name, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,

    /// Tenant the event was produced in; stamped by producers, never by
    /// the core
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<Uuid>,

    /// Free-form reason recorded by the producer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Correlation id; failure paths set this to the originating event id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,

    // Workflow provenance, flattened into the metadata object. Attached at
    // most once, first writer wins.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_run_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_timestamp: Option<DateTime<Utc>>,

    /// Producer-specific keys the core does not interpret
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl EventMetadata {
    pub fn with_actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    pub fn with_tenant(mut self, tenant_id: Uuid) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// The assembled provenance view, if all required fields are present.
    pub fn provenance(&self) -> Option<WorkflowProvenance> {
        Some(WorkflowProvenance {
            workflow_id: self.workflow_id.clone()?,
            workflow_run_id: self.workflow_run_id?,
            workflow_type: self.workflow_type.clone()?,
            activity_id: self.activity_id.clone(),
            timestamp: self.workflow_timestamp.unwrap_or(DateTime::UNIX_EPOCH),
        })
    }

    /// Attach workflow provenance. Returns false (and leaves the metadata
    /// untouched) if provenance was already present: the first writer wins.
    pub fn attach_provenance(&mut self, provenance: &WorkflowProvenance) -> bool {
        if self.workflow_id.is_some() {
            return false;
        }
        self.workflow_id = Some(provenance.workflow_id.clone());
        self.workflow_run_id = Some(provenance.workflow_run_id);
        self.workflow_type = Some(provenance.workflow_type.clone());
        self.activity_id = provenance.activity_id.clone();
        self.workflow_timestamp = Some(provenance.timestamp);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_attach_provenance_first_writer_wins() {
        let mut metadata = EventMetadata::default();
        let first = WorkflowProvenance::new("org-bootstrap-abc", Uuid::now_v7(), "org_bootstrap");
        let second =
            WorkflowProvenance::new("org-bootstrap-other", Uuid::now_v7(), "org_bootstrap");

        assert!(metadata.attach_provenance(&first));
        assert!(!metadata.attach_provenance(&second));
        assert_eq!(metadata.workflow_id.as_deref(), Some("org-bootstrap-abc"));
    }

    #[test]
    fn test_unknown_keys_roundtrip() {
        let raw = json!({
            "actor_id": "svc-intake",
            "tenant_id": "018f3c6e-1111-7000-8000-000000000000",
            "custom_flag": true,
            "nested": {"a": 1}
        });

        let metadata: EventMetadata = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(metadata.actor_id.as_deref(), Some("svc-intake"));
        assert_eq!(metadata.extra.get("custom_flag"), Some(&json!(true)));

        let back = serde_json::to_value(&metadata).unwrap();
        assert_eq!(back, raw);
    }

    #[test]
    fn test_provenance_view() {
        let mut metadata = EventMetadata::default();
        assert!(metadata.provenance().is_none());

        let run_id = Uuid::now_v7();
        let provenance = WorkflowProvenance::new("org-bootstrap-x", run_id, "org_bootstrap")
            .with_activity("configure-dns");
        metadata.attach_provenance(&provenance);

        let view = metadata.provenance().expect("provenance should be set");
        assert_eq!(view.workflow_run_id, run_id);
        assert_eq!(view.activity_id.as_deref(), Some("configure-dns"));
    }
}
