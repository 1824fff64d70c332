//! Bootstrap workflow inputs and results

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What the trigger bridge hands to the workflow: the originating event
/// plus its payload. The stream id doubles as the new organization's id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapInput {
    /// Originating trigger event; used as the correlation id on failures
    pub event_id: Uuid,

    /// The organization being bootstrapped
    pub stream_id: Uuid,

    #[serde(default)]
    pub stream_type: String,

    pub data: BootstrapRequest,
}

/// Payload of `organization.bootstrap.initiated`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapRequest {
    pub subdomain: String,

    #[serde(default)]
    pub org_data: serde_json::Value,

    #[serde(default)]
    pub users: Vec<UserSeed>,
}

/// A user to invite during onboarding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSeed {
    pub email: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

/// Per-user outcome reported in the workflow result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvitationOutcome {
    pub email: String,
    pub invitation_id: Uuid,
    pub email_sent: bool,

    /// Why the email was not sent, when it was not
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

/// Workflow result for a completed bootstrap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootstrapResult {
    pub organization_id: Uuid,
    pub subdomain: String,
    pub dns_configured: bool,
    pub invitations: Vec<InvitationOutcome>,
}

impl BootstrapResult {
    /// Emails that could not be delivered.
    pub fn email_failures(&self) -> Vec<&InvitationOutcome> {
        self.invitations.iter().filter(|i| !i.email_sent).collect()
    }
}

/// Deterministic invitation identity: the same organization and email
/// always yield the same id, so retried invitation steps cannot fork.
pub fn invitation_id(organization_id: Uuid, email: &str) -> Uuid {
    Uuid::new_v5(&organization_id, email.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_input_parses_trigger_params() {
        let params = json!({
            "event_id": Uuid::now_v7(),
            "stream_id": Uuid::now_v7(),
            "stream_type": "organization",
            "data": {
                "subdomain": "acme",
                "org_data": {"name": "Acme Health"},
                "users": [
                    {"email": "a@acme.test", "role": "admin"},
                    {"email": "b@acme.test"}
                ]
            }
        });

        let input: BootstrapInput = serde_json::from_value(params).unwrap();
        assert_eq!(input.data.subdomain, "acme");
        assert_eq!(input.data.users.len(), 2);
        assert_eq!(input.data.users[0].role.as_deref(), Some("admin"));
    }

    #[test]
    fn test_invitation_id_is_deterministic() {
        let org = Uuid::now_v7();
        assert_eq!(
            invitation_id(org, "a@acme.test"),
            invitation_id(org, "a@acme.test")
        );
        assert_ne!(
            invitation_id(org, "a@acme.test"),
            invitation_id(org, "b@acme.test")
        );
        assert_ne!(
            invitation_id(org, "a@acme.test"),
            invitation_id(Uuid::now_v7(), "a@acme.test")
        );
    }

    #[test]
    fn test_email_failures() {
        let org = Uuid::now_v7();
        let result = BootstrapResult {
            organization_id: org,
            subdomain: "acme".to_string(),
            dns_configured: true,
            invitations: vec![
                InvitationOutcome {
                    email: "ok@acme.test".to_string(),
                    invitation_id: invitation_id(org, "ok@acme.test"),
                    email_sent: true,
                    failure: None,
                },
                InvitationOutcome {
                    email: "bad@acme.test".to_string(),
                    invitation_id: invitation_id(org, "bad@acme.test"),
                    email_sent: false,
                    failure: Some("mailbox rejected".to_string()),
                },
            ],
        };

        assert_eq!(result.email_failures().len(), 1);
        assert_eq!(result.email_failures()[0].email, "bad@acme.test");
    }
}
