//! Declarative payload schemas
//!
//! Each registered event type carries a schema describing the shape its
//! `event_data` must have. Schemas are open: unknown keys are allowed,
//! declared keys are checked for presence and kind.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind a payload field must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    String,
    Uuid,
    Bool,
    Integer,
    Number,
    Object,
    Array,
    Any,
}

impl FieldKind {
    fn matches(self, value: &serde_json::Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Uuid => value
                .as_str()
                .map(|s| Uuid::parse_str(s).is_ok())
                .unwrap_or(false),
            Self::Bool => value.is_boolean(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
            Self::Any => true,
        }
    }
}

/// A single declared field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    pub required: bool,
}

/// Schema for one event type's payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PayloadSchema {
    fields: Vec<FieldSpec>,
}

/// A payload's failure to satisfy its schema.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchemaViolation {
    #[error("event_data must be an object")]
    NotAnObject,

    #[error("missing required field `{0}`")]
    MissingField(String),

    #[error("field `{name}` must be a {expected:?}")]
    WrongKind { name: String, expected: FieldKind },
}

impl PayloadSchema {
    /// An empty schema: any object is accepted.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn required(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            kind,
            required: true,
        });
        self
    }

    pub fn optional(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            kind,
            required: false,
        });
        self
    }

    /// Check `data` against this schema.
    pub fn validate(&self, data: &serde_json::Value) -> Result<(), SchemaViolation> {
        let object = data.as_object().ok_or(SchemaViolation::NotAnObject)?;

        for field in &self.fields {
            match object.get(&field.name) {
                None | Some(serde_json::Value::Null) => {
                    if field.required {
                        return Err(SchemaViolation::MissingField(field.name.clone()));
                    }
                }
                Some(value) => {
                    if !field.kind.matches(value) {
                        return Err(SchemaViolation::WrongKind {
                            name: field.name.clone(),
                            expected: field.kind,
                        });
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn invitation_schema() -> PayloadSchema {
        PayloadSchema::any()
            .required("email", FieldKind::String)
            .required("organization_id", FieldKind::Uuid)
            .optional("role", FieldKind::String)
    }

    #[test]
    fn test_valid_payload() {
        let schema = invitation_schema();
        let data = json!({
            "email": "a@example.com",
            "organization_id": Uuid::now_v7().to_string(),
            "role": "nurse",
            "unknown_key": 42
        });

        assert!(schema.validate(&data).is_ok());
    }

    #[test]
    fn test_missing_required_field() {
        let schema = invitation_schema();
        let data = json!({"email": "a@example.com"});

        assert_eq!(
            schema.validate(&data),
            Err(SchemaViolation::MissingField("organization_id".to_string()))
        );
    }

    #[test]
    fn test_wrong_kind() {
        let schema = invitation_schema();
        let data = json!({
            "email": 5,
            "organization_id": Uuid::now_v7().to_string()
        });

        assert!(matches!(
            schema.validate(&data),
            Err(SchemaViolation::WrongKind { name, .. }) if name == "email"
        ));
    }

    #[test]
    fn test_uuid_kind_rejects_garbage() {
        let schema = PayloadSchema::any().required("id", FieldKind::Uuid);
        assert!(schema.validate(&json!({"id": "not-a-uuid"})).is_err());
    }

    #[test]
    fn test_not_an_object() {
        let schema = PayloadSchema::any();
        assert_eq!(
            schema.validate(&json!([1, 2, 3])),
            Err(SchemaViolation::NotAnObject)
        );
    }

    #[test]
    fn test_optional_null_is_absent() {
        let schema = PayloadSchema::any().optional("role", FieldKind::String);
        assert!(schema.validate(&json!({"role": null})).is_ok());
    }
}
