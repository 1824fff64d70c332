//! Deployment provider stubs
//!
//! The core deliberately ships no DNS or email backend; deployments
//! replace these with their infrastructure of choice. The stubs log the
//! requested action and succeed, which keeps a fresh install runnable
//! end to end.

use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use careflow_engine::ActivityError;
use careflow_onboarding::{DnsProvider, DnsRecord, EmailSender};

pub struct LogOnlyDns;

#[async_trait]
impl DnsProvider for LogOnlyDns {
    async fn configure(
        &self,
        subdomain: &str,
        organization_id: Uuid,
    ) -> Result<DnsRecord, ActivityError> {
        info!(subdomain, %organization_id, "dns configure requested (log-only provider)");
        Ok(DnsRecord {
            kind: "CNAME".to_string(),
            name: format!("{subdomain}.careflow.health"),
            target: format!("tenants.careflow.health/{organization_id}"),
        })
    }

    async fn remove(&self, subdomain: &str) -> Result<(), ActivityError> {
        info!(subdomain, "dns removal requested (log-only provider)");
        Ok(())
    }
}

pub struct LogOnlyMailer;

#[async_trait]
impl EmailSender for LogOnlyMailer {
    async fn send_invitation(
        &self,
        email: &str,
        invitation_id: Uuid,
        subdomain: &str,
    ) -> Result<String, ActivityError> {
        info!(email, %invitation_id, subdomain, "invitation email requested (log-only provider)");
        Ok(format!("log-{invitation_id}"))
    }
}
