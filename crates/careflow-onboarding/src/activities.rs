//! Onboarding activities
//!
//! The only I/O in the bootstrap saga lives here. Every activity is
//! idempotent: domain events go through `emit_event_once`, invitation
//! identity is deterministic, and provider calls are safe to repeat.
//! Each emission targets a single stream (the organization's or one
//! invitation's); nothing here relies on cross-stream ordering.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use careflow_core::event::AppendEvent;
use careflow_engine::{Activity, ActivityContext, ActivityError, ActivityOptions, RetryPolicy};

use crate::providers::{DnsProvider, DnsRecord, EmailSender};

/// DNS work is slow to converge; back off harder and try longer.
pub fn dns_activity_options() -> ActivityOptions {
    ActivityOptions::default().with_retry(
        RetryPolicy::exponential()
            .with_initial_interval(Duration::from_secs(5))
            .with_max_interval(Duration::from_secs(120))
            .with_max_attempts(5),
    )
}

/// Email either goes through quickly or not at all.
pub fn email_activity_options() -> ActivityOptions {
    ActivityOptions::default().with_retry(
        RetryPolicy::exponential()
            .with_initial_interval(Duration::from_millis(500))
            .with_max_interval(Duration::from_secs(10))
            .with_max_attempts(2),
    )
}

// =============================================================================
// create_organization
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateOrganizationInput {
    pub organization_id: Uuid,
    pub subdomain: String,
    #[serde(default)]
    pub org_data: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateOrganizationOutput {
    pub organization_id: Uuid,
}

pub struct CreateOrganization;

#[async_trait]
impl Activity for CreateOrganization {
    const TYPE: &'static str = "create_organization";
    type Input = CreateOrganizationInput;
    type Output = CreateOrganizationOutput;

    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        let mut payload = input
            .org_data
            .as_object()
            .cloned()
            .unwrap_or_default();
        payload
            .entry("name".to_string())
            .or_insert_with(|| json!(input.subdomain));
        payload.insert("subdomain".to_string(), json!(input.subdomain));

        ctx.emit_event_once(AppendEvent::new(
            input.organization_id,
            "organization",
            "organization.created",
            serde_json::Value::Object(payload),
        ))
        .await?;

        Ok(CreateOrganizationOutput {
            organization_id: input.organization_id,
        })
    }
}

// =============================================================================
// configure_dns / remove_dns
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigureDnsInput {
    pub organization_id: Uuid,
    pub subdomain: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigureDnsOutput {
    pub record: DnsRecord,
}

pub struct ConfigureDns {
    pub provider: Arc<dyn DnsProvider>,
}

#[async_trait]
impl Activity for ConfigureDns {
    const TYPE: &'static str = "configure_dns";
    type Input = ConfigureDnsInput;
    type Output = ConfigureDnsOutput;

    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        let record = self
            .provider
            .configure(&input.subdomain, input.organization_id)
            .await?;

        ctx.emit_event_once(AppendEvent::new(
            input.organization_id,
            "organization",
            "dns.configured",
            json!({"subdomain": input.subdomain, "record": record}),
        ))
        .await?;

        Ok(ConfigureDnsOutput { record })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveDnsInput {
    pub organization_id: Uuid,
    pub subdomain: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RemoveDnsOutput {}

/// Compensation for `configure_dns`; also safe when nothing was ever
/// configured (partial provider state gets cleaned either way).
pub struct RemoveDns {
    pub provider: Arc<dyn DnsProvider>,
}

#[async_trait]
impl Activity for RemoveDns {
    const TYPE: &'static str = "remove_dns";
    type Input = RemoveDnsInput;
    type Output = RemoveDnsOutput;

    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        self.provider.remove(&input.subdomain).await?;

        ctx.emit_event_once(AppendEvent::new(
            input.organization_id,
            "organization",
            "dns.removed",
            json!({"subdomain": input.subdomain}),
        ))
        .await?;

        Ok(RemoveDnsOutput {})
    }
}

// =============================================================================
// create_invitation / cancel_invitation
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateInvitationInput {
    pub invitation_id: Uuid,
    pub organization_id: Uuid,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateInvitationOutput {
    pub invitation_id: Uuid,
}

pub struct CreateInvitation;

#[async_trait]
impl Activity for CreateInvitation {
    const TYPE: &'static str = "create_invitation";
    type Input = CreateInvitationInput;
    type Output = CreateInvitationOutput;

    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        ctx.emit_event_once(AppendEvent::new(
            input.invitation_id,
            "invitation",
            "invitation.created",
            json!({
                "email": input.email,
                "organization_id": input.organization_id,
                "role": input.role,
            }),
        ))
        .await?;

        Ok(CreateInvitationOutput {
            invitation_id: input.invitation_id,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelInvitationInput {
    pub invitation_id: Uuid,
    pub organization_id: Uuid,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelInvitationOutput {}

/// Compensation for `create_invitation`. A sent email cannot be
/// unsent; cancelling the invitation is the semantic undo.
pub struct CancelInvitation;

#[async_trait]
impl Activity for CancelInvitation {
    const TYPE: &'static str = "cancel_invitation";
    type Input = CancelInvitationInput;
    type Output = CancelInvitationOutput;

    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        ctx.emit_event_once(AppendEvent::new(
            input.invitation_id,
            "invitation",
            "invitation.cancelled",
            json!({"reason": input.reason}),
        ))
        .await?;

        Ok(CancelInvitationOutput {})
    }
}

// =============================================================================
// send_invitation_email
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendInvitationEmailInput {
    pub invitation_id: Uuid,
    pub organization_id: Uuid,
    pub email: String,
    pub subdomain: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SendInvitationEmailOutput {
    pub message_id: String,
}

pub struct SendInvitationEmail {
    pub sender: Arc<dyn EmailSender>,
}

#[async_trait]
impl Activity for SendInvitationEmail {
    const TYPE: &'static str = "send_invitation_email";
    type Input = SendInvitationEmailInput;
    type Output = SendInvitationEmailOutput;

    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        let message_id = self
            .sender
            .send_invitation(&input.email, input.invitation_id, &input.subdomain)
            .await?;

        ctx.emit_event_once(AppendEvent::new(
            input.invitation_id,
            "invitation",
            "invitation.email.sent",
            json!({"email": input.email, "message_id": message_id}),
        ))
        .await?;

        Ok(SendInvitationEmailOutput { message_id })
    }
}

// =============================================================================
// activate_organization / deactivate_organization
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivateOrganizationInput {
    pub organization_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ActivateOrganizationOutput {}

pub struct ActivateOrganization;

#[async_trait]
impl Activity for ActivateOrganization {
    const TYPE: &'static str = "activate_organization";
    type Input = ActivateOrganizationInput;
    type Output = ActivateOrganizationOutput;

    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        ctx.emit_event_once(AppendEvent::new(
            input.organization_id,
            "organization",
            "organization.activated",
            json!({}),
        ))
        .await?;

        Ok(ActivateOrganizationOutput {})
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeactivateOrganizationInput {
    pub organization_id: Uuid,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeactivateOrganizationOutput {}

/// Compensation for `create_organization`: organizations are marked
/// inactive, never deleted.
pub struct DeactivateOrganization;

#[async_trait]
impl Activity for DeactivateOrganization {
    const TYPE: &'static str = "deactivate_organization";
    type Input = DeactivateOrganizationInput;
    type Output = DeactivateOrganizationOutput;

    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        ctx.emit_event_once(AppendEvent::new(
            input.organization_id,
            "organization",
            "organization.deactivated",
            json!({"reason": input.reason}),
        ))
        .await?;

        Ok(DeactivateOrganizationOutput {})
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::FlakyDns;
    use crate::types::invitation_id;
    use careflow_core::registry::EventTypeRegistry;
    use careflow_engine::EventEmitter;
    use careflow_store::{EventStore, InMemoryEventStore};

    fn ctx(store: &Arc<InMemoryEventStore>, activity_id: &str) -> ActivityContext {
        let emitter = Arc::new(EventEmitter::new(
            Arc::clone(store) as Arc<dyn EventStore>
        ));
        ActivityContext::new("org-bootstrap-test", Uuid::now_v7(), "org_bootstrap", activity_id)
            .with_emitter(emitter)
    }

    fn store() -> Arc<InMemoryEventStore> {
        Arc::new(InMemoryEventStore::new(Arc::new(
            EventTypeRegistry::standard(),
        )))
    }

    #[tokio::test]
    async fn test_create_organization_emits_with_provenance() {
        let store = store();
        let org_id = Uuid::now_v7();

        CreateOrganization
            .execute(
                &ctx(&store, "create-org"),
                CreateOrganizationInput {
                    organization_id: org_id,
                    subdomain: "acme".to_string(),
                    org_data: json!({"name": "Acme Health"}),
                },
            )
            .await
            .unwrap();

        let events = store.load_stream(org_id, "organization").await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "organization.created");
        assert_eq!(events[0].event_data["name"], json!("Acme Health"));
        assert_eq!(events[0].event_data["subdomain"], json!("acme"));
        assert_eq!(
            events[0].event_metadata.activity_id.as_deref(),
            Some("create-org")
        );
    }

    #[tokio::test]
    async fn test_create_organization_retry_does_not_duplicate() {
        let store = store();
        let org_id = Uuid::now_v7();
        let input = CreateOrganizationInput {
            organization_id: org_id,
            subdomain: "acme".to_string(),
            org_data: json!({}),
        };

        let context = ctx(&store, "create-org");
        CreateOrganization
            .execute(&context, input.clone())
            .await
            .unwrap();
        CreateOrganization.execute(&context, input).await.unwrap();

        let events = store.load_stream(org_id, "organization").await.unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_configure_dns_emits_record() {
        let store = store();
        let org_id = Uuid::now_v7();
        let activity = ConfigureDns {
            provider: Arc::new(FlakyDns::reliable()),
        };

        let output = activity
            .execute(
                &ctx(&store, "configure-dns"),
                ConfigureDnsInput {
                    organization_id: org_id,
                    subdomain: "acme".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(output.record.kind, "CNAME");

        let events = store.load_stream(org_id, "organization").await.unwrap();
        assert_eq!(events[0].event_type, "dns.configured");
    }

    #[tokio::test]
    async fn test_invitation_roundtrip() {
        let store = store();
        let org_id = Uuid::now_v7();
        let invitation = invitation_id(org_id, "a@acme.test");

        CreateInvitation
            .execute(
                &ctx(&store, "invite-0"),
                CreateInvitationInput {
                    invitation_id: invitation,
                    organization_id: org_id,
                    email: "a@acme.test".to_string(),
                    role: Some("nurse".to_string()),
                },
            )
            .await
            .unwrap();

        CancelInvitation
            .execute(
                &ctx(&store, "undo-invite-0"),
                CancelInvitationInput {
                    invitation_id: invitation,
                    organization_id: org_id,
                    reason: "bootstrap rolled back".to_string(),
                },
            )
            .await
            .unwrap();

        let events = store.load_stream(invitation, "invitation").await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].event_type, "invitation.cancelled");

        // The projection reflects the cancellation.
        let row = store
            .projection_row("invitations", &invitation.to_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.data["status"], json!("cancelled"));
    }

    #[test]
    fn test_retry_profiles_match_contract() {
        let dns = dns_activity_options();
        assert_eq!(dns.retry_policy.max_attempts, 5);
        assert_eq!(dns.retry_policy.initial_interval, Duration::from_secs(5));
        assert_eq!(dns.retry_policy.max_interval, Duration::from_secs(120));

        let email = email_activity_options();
        assert_eq!(email.retry_policy.max_attempts, 2);
        assert_eq!(
            email.retry_policy.initial_interval,
            Duration::from_millis(500)
        );
        assert_eq!(email.retry_policy.max_interval, Duration::from_secs(10));
    }
}
