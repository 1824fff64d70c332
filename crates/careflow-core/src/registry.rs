//! Event-type registry
//!
//! The registry is the human-editable catalog mapping every event type to
//! its stream type, payload schema, and trigger wiring. Producers and
//! consumers that name a type the registry does not know are rejected at
//! the store boundary.
//!
//! Junction events are not enumerated: any `<name>.linked` /
//! `<name>.unlinked` pair on a `junction.<name>` stream is structurally
//! valid and carries `{left_id, right_id}`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::schema::{FieldKind, PayloadSchema, SchemaViolation};

/// Wiring for event types that start a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerSpec {
    /// Prefix of the deterministic workflow id (`"<trigger-name>-<stream_id>"`)
    pub trigger_name: String,

    /// Workflow type registered with the engine
    pub workflow_type: String,

    /// Task queue the workflow's activities run on
    pub task_queue: String,
}

/// Catalog entry for one event type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventTypeSpec {
    pub event_type: String,

    /// Stream type this event may be appended to. `None` means any stream
    /// (used by operational alert events that attach to the stream they
    /// concern).
    pub stream_type: Option<String>,

    pub payload: PayloadSchema,

    /// Whether appending this type publishes on the workflow channel
    pub is_trigger: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<TriggerSpec>,
}

/// Rejection reasons when validating an append against the catalog.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    #[error("event type {event_type} belongs to stream type {expected}, not {actual}")]
    StreamTypeMismatch {
        event_type: String,
        expected: String,
        actual: String,
    },

    #[error("junction events require a junction.<name> stream, got {0}")]
    NotAJunctionStream(String),

    #[error("invalid payload for {event_type}: {violation}")]
    InvalidPayload {
        event_type: String,
        violation: SchemaViolation,
    },
}

/// The event-type catalog.
#[derive(Debug, Clone, Default)]
pub struct EventTypeRegistry {
    specs: HashMap<String, EventTypeSpec>,
}

impl EventTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard catalog for the platform's stream types.
    pub fn standard() -> Self {
        let mut registry = Self::new();

        // Onboarding trigger. The stream id of the trigger event is the id
        // of the organization being bootstrapped.
        registry.register(EventTypeSpec {
            event_type: "organization.bootstrap.initiated".to_string(),
            stream_type: Some("organization".to_string()),
            payload: PayloadSchema::any()
                .required("subdomain", FieldKind::String)
                .required("org_data", FieldKind::Object)
                .required("users", FieldKind::Array),
            is_trigger: true,
            trigger: Some(TriggerSpec {
                trigger_name: "org-bootstrap".to_string(),
                workflow_type: "org_bootstrap".to_string(),
                task_queue: "careflow-onboarding".to_string(),
            }),
        });

        // Organization lifecycle, including the DNS side effects the
        // onboarding workflow records on the organization stream.
        registry.register_plain(
            "organization",
            "organization.created",
            PayloadSchema::any()
                .required("name", FieldKind::String)
                .required("subdomain", FieldKind::String),
        );
        registry.register_plain("organization", "organization.updated", PayloadSchema::any());
        registry.register_plain(
            "organization",
            "organization.activated",
            PayloadSchema::any(),
        );
        registry.register_plain(
            "organization",
            "organization.deactivated",
            PayloadSchema::any().optional("reason", FieldKind::String),
        );
        registry.register_plain(
            "organization",
            "dns.configured",
            PayloadSchema::any()
                .required("subdomain", FieldKind::String)
                .required("record", FieldKind::Object),
        );
        registry.register_plain(
            "organization",
            "dns.removed",
            PayloadSchema::any().required("subdomain", FieldKind::String),
        );

        // Invitations
        registry.register_plain(
            "invitation",
            "invitation.created",
            PayloadSchema::any()
                .required("email", FieldKind::String)
                .required("organization_id", FieldKind::Uuid)
                .optional("role", FieldKind::String),
        );
        registry.register_plain(
            "invitation",
            "invitation.email.sent",
            PayloadSchema::any()
                .required("email", FieldKind::String)
                .optional("message_id", FieldKind::String),
        );
        registry.register_plain("invitation", "invitation.accepted", PayloadSchema::any());
        registry.register_plain(
            "invitation",
            "invitation.cancelled",
            PayloadSchema::any().optional("reason", FieldKind::String),
        );
        registry.register_plain("invitation", "invitation.expired", PayloadSchema::any());

        // Roles and permissions
        registry.register_plain(
            "role",
            "role.created",
            PayloadSchema::any().required("name", FieldKind::String),
        );
        registry.register_plain("role", "role.updated", PayloadSchema::any());
        registry.register_plain("role", "role.deleted", PayloadSchema::any());
        registry.register_plain(
            "role",
            "role.permission.granted",
            PayloadSchema::any().required("permission", FieldKind::String),
        );
        registry.register_plain(
            "role",
            "role.permission.revoked",
            PayloadSchema::any().required("permission", FieldKind::String),
        );
        registry.register_plain(
            "permission",
            "permission.created",
            PayloadSchema::any().required("name", FieldKind::String),
        );
        registry.register_plain("permission", "permission.updated", PayloadSchema::any());
        registry.register_plain("permission", "permission.deleted", PayloadSchema::any());

        // Directory entities
        for stream in ["contact", "address", "phone", "organization_unit", "dosage"] {
            registry.register_plain(stream, format!("{stream}.created"), PayloadSchema::any());
            registry.register_plain(stream, format!("{stream}.updated"), PayloadSchema::any());
            registry.register_plain(stream, format!("{stream}.deleted"), PayloadSchema::any());
        }

        registry.register_plain(
            "user",
            "user.created",
            PayloadSchema::any().required("email", FieldKind::String),
        );
        registry.register_plain("user", "user.updated", PayloadSchema::any());
        registry.register_plain("user", "user.deactivated", PayloadSchema::any());

        registry.register_plain("client", "client.created", PayloadSchema::any());
        registry.register_plain("client", "client.updated", PayloadSchema::any());
        registry.register_plain("client", "client.deleted", PayloadSchema::any());

        registry.register_plain(
            "impersonation",
            "impersonation.started",
            PayloadSchema::any()
                .required("impersonator_id", FieldKind::Uuid)
                .required("subject_id", FieldKind::Uuid),
        );
        registry.register_plain("impersonation", "impersonation.ended", PayloadSchema::any());

        registry.register_plain(
            "medication",
            "medication.created",
            PayloadSchema::any().required("name", FieldKind::String),
        );
        registry.register_plain("medication", "medication.updated", PayloadSchema::any());
        registry.register_plain(
            "medication",
            "medication.discontinued",
            PayloadSchema::any(),
        );
        registry.register_plain(
            "medication_history",
            "medication_history.recorded",
            PayloadSchema::any().required("medication_id", FieldKind::Uuid),
        );

        registry.register_plain(
            "access_grant",
            "access_grant.created",
            PayloadSchema::any()
                .required("grantee_id", FieldKind::Uuid)
                .required("scope", FieldKind::String),
        );
        registry.register_plain("access_grant", "access_grant.revoked", PayloadSchema::any());

        // Operational alert emitted when the backlog sweep abandons a
        // trigger event. Attaches to the stream of the abandoned event.
        registry.register(EventTypeSpec {
            event_type: "workflow.trigger.abandoned".to_string(),
            stream_type: None,
            payload: PayloadSchema::any()
                .required("event_id", FieldKind::Uuid)
                .required("retry_count", FieldKind::Integer)
                .optional("error", FieldKind::String),
            is_trigger: false,
            trigger: None,
        });

        registry
    }

    /// Register (or replace) a catalog entry.
    pub fn register(&mut self, spec: EventTypeSpec) {
        self.specs.insert(spec.event_type.clone(), spec);
    }

    /// Extend the catalog from a JSON array of entries, the format the
    /// operator-maintained catalog file uses. Later entries replace
    /// earlier ones with the same event type. Returns how many entries
    /// were loaded.
    pub fn extend_from_json(&mut self, json: &str) -> Result<usize, serde_json::Error> {
        let specs: Vec<EventTypeSpec> = serde_json::from_str(json)?;
        let count = specs.len();
        for spec in specs {
            self.register(spec);
        }
        Ok(count)
    }

    fn register_plain(
        &mut self,
        stream_type: &str,
        event_type: impl Into<String>,
        payload: PayloadSchema,
    ) {
        let event_type = event_type.into();
        self.register(EventTypeSpec {
            event_type,
            stream_type: Some(stream_type.to_string()),
            payload,
            is_trigger: false,
            trigger: None,
        });
    }

    pub fn get(&self, event_type: &str) -> Option<&EventTypeSpec> {
        self.specs.get(event_type)
    }

    /// All trigger event types, for the backlog sweep.
    pub fn trigger_event_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .specs
            .values()
            .filter(|s| s.is_trigger)
            .map(|s| s.event_type.clone())
            .collect();
        types.sort();
        types
    }

    /// Whether this event type publishes on the workflow channel.
    pub fn is_trigger(&self, event_type: &str) -> bool {
        self.specs.get(event_type).is_some_and(|s| s.is_trigger)
    }

    /// Trigger wiring for an event type, if it has any.
    pub fn trigger_spec(&self, event_type: &str) -> Option<&TriggerSpec> {
        self.specs.get(event_type).and_then(|s| s.trigger.as_ref())
    }

    /// Whether this is a junction event (`*.linked` / `*.unlinked`).
    pub fn is_junction_event(event_type: &str) -> bool {
        event_type.ends_with(".linked") || event_type.ends_with(".unlinked")
    }

    /// Validate an append request against the catalog.
    pub fn validate(
        &self,
        stream_type: &str,
        event_type: &str,
        event_data: &serde_json::Value,
    ) -> Result<(), RegistryError> {
        if Self::is_junction_event(event_type) {
            if !stream_type.starts_with("junction.") {
                return Err(RegistryError::NotAJunctionStream(stream_type.to_string()));
            }
            return junction_schema().validate(event_data).map_err(|violation| {
                RegistryError::InvalidPayload {
                    event_type: event_type.to_string(),
                    violation,
                }
            });
        }

        let spec = self
            .specs
            .get(event_type)
            .ok_or_else(|| RegistryError::UnknownEventType(event_type.to_string()))?;

        if let Some(expected) = &spec.stream_type {
            if expected != stream_type {
                return Err(RegistryError::StreamTypeMismatch {
                    event_type: event_type.to_string(),
                    expected: expected.clone(),
                    actual: stream_type.to_string(),
                });
            }
        }

        spec.payload
            .validate(event_data)
            .map_err(|violation| RegistryError::InvalidPayload {
                event_type: event_type.to_string(),
                violation,
            })
    }
}

fn junction_schema() -> PayloadSchema {
    PayloadSchema::any()
        .required("left_id", FieldKind::Uuid)
        .required("right_id", FieldKind::Uuid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn test_standard_catalog_has_trigger() {
        let registry = EventTypeRegistry::standard();
        assert!(registry.is_trigger("organization.bootstrap.initiated"));
        assert!(!registry.is_trigger("organization.created"));

        let trigger = registry
            .trigger_spec("organization.bootstrap.initiated")
            .expect("trigger spec");
        assert_eq!(trigger.trigger_name, "org-bootstrap");
        assert_eq!(trigger.workflow_type, "org_bootstrap");
    }

    #[test]
    fn test_unknown_event_type() {
        let registry = EventTypeRegistry::standard();
        let result = registry.validate("organization", "organization.exploded", &json!({}));
        assert!(matches!(result, Err(RegistryError::UnknownEventType(_))));
    }

    #[test]
    fn test_stream_type_mismatch() {
        let registry = EventTypeRegistry::standard();
        let result = registry.validate(
            "role",
            "invitation.created",
            &json!({"email": "a@x.com", "organization_id": Uuid::now_v7().to_string()}),
        );
        assert!(matches!(
            result,
            Err(RegistryError::StreamTypeMismatch { .. })
        ));
    }

    #[test]
    fn test_payload_validation() {
        let registry = EventTypeRegistry::standard();
        let result = registry.validate(
            "organization",
            "organization.bootstrap.initiated",
            &json!({"subdomain": "acme"}),
        );
        assert!(matches!(result, Err(RegistryError::InvalidPayload { .. })));

        let ok = registry.validate(
            "organization",
            "organization.bootstrap.initiated",
            &json!({"subdomain": "acme", "org_data": {"name": "Acme"}, "users": []}),
        );
        assert!(ok.is_ok());
    }

    #[test]
    fn test_junction_events() {
        let registry = EventTypeRegistry::standard();
        let payload = json!({
            "left_id": Uuid::now_v7().to_string(),
            "right_id": Uuid::now_v7().to_string(),
        });

        assert!(registry
            .validate("junction.user_roles", "user_role.linked", &payload)
            .is_ok());
        assert!(matches!(
            registry.validate("role", "user_role.linked", &payload),
            Err(RegistryError::NotAJunctionStream(_))
        ));
        assert!(registry
            .validate("junction.user_roles", "user_role.unlinked", &json!({}))
            .is_err());
    }

    #[test]
    fn test_wildcard_stream_alert() {
        let registry = EventTypeRegistry::standard();
        let ok = registry.validate(
            "organization",
            "workflow.trigger.abandoned",
            &json!({"event_id": Uuid::now_v7().to_string(), "retry_count": 11}),
        );
        assert!(ok.is_ok());
    }

    #[test]
    fn test_trigger_event_types_sorted() {
        let registry = EventTypeRegistry::standard();
        let types = registry.trigger_event_types();
        assert_eq!(types, vec!["organization.bootstrap.initiated"]);
    }

    #[test]
    fn test_extend_from_json_catalog() {
        let mut registry = EventTypeRegistry::standard();
        let catalog = r#"[
            {
                "event_type": "client.admission.requested",
                "stream_type": "client",
                "payload": {"fields": [
                    {"name": "client_id", "kind": "uuid", "required": true}
                ]},
                "is_trigger": true,
                "trigger": {
                    "trigger_name": "client-admission",
                    "workflow_type": "client_admission",
                    "task_queue": "careflow-admissions"
                }
            }
        ]"#;

        let loaded = registry.extend_from_json(catalog).unwrap();
        assert_eq!(loaded, 1);
        assert!(registry.is_trigger("client.admission.requested"));
        assert!(registry
            .validate(
                "client",
                "client.admission.requested",
                &json!({"client_id": Uuid::now_v7().to_string()}),
            )
            .is_ok());

        assert!(registry.extend_from_json("not json").is_err());
    }
}
