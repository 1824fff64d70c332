//! Side-effect provider seams
//!
//! The core does not pick a DNS or email backend; activities talk to
//! these traits and deployments wire real providers in. The in-process
//! doubles below are used by tests and local development.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use careflow_engine::ActivityError;

/// A provisioned DNS record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnsRecord {
    pub kind: String,
    pub name: String,
    pub target: String,
}

/// Subdomain provisioning backend.
#[async_trait]
pub trait DnsProvider: Send + Sync + 'static {
    async fn configure(
        &self,
        subdomain: &str,
        organization_id: Uuid,
    ) -> Result<DnsRecord, ActivityError>;

    async fn remove(&self, subdomain: &str) -> Result<(), ActivityError>;
}

/// Invitation email backend. Returns a provider message id.
#[async_trait]
pub trait EmailSender: Send + Sync + 'static {
    async fn send_invitation(
        &self,
        email: &str,
        invitation_id: Uuid,
        subdomain: &str,
    ) -> Result<String, ActivityError>;
}

/// In-process DNS double: succeeds after a configurable number of
/// transient failures (0 = always succeed, `u32::MAX` = never succeed).
pub struct FlakyDns {
    failures_before_success: u32,
    attempts: AtomicU32,
    removed: Mutex<Vec<String>>,
}

impl FlakyDns {
    pub fn reliable() -> Self {
        Self::failing(0)
    }

    pub fn failing(failures_before_success: u32) -> Self {
        Self {
            failures_before_success,
            attempts: AtomicU32::new(0),
            removed: Mutex::new(vec![]),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().clone()
    }
}

#[async_trait]
impl DnsProvider for FlakyDns {
    async fn configure(
        &self,
        subdomain: &str,
        organization_id: Uuid,
    ) -> Result<DnsRecord, ActivityError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.failures_before_success {
            return Err(ActivityError::transient(format!(
                "dns upstream unavailable (attempt {attempt})"
            )));
        }
        Ok(DnsRecord {
            kind: "CNAME".to_string(),
            name: format!("{subdomain}.careflow.health"),
            target: format!("tenants.careflow.health/{organization_id}"),
        })
    }

    async fn remove(&self, subdomain: &str) -> Result<(), ActivityError> {
        self.removed.lock().push(subdomain.to_string());
        Ok(())
    }
}

/// In-process email double: rejects configured addresses permanently,
/// records everything it sent.
#[derive(Default)]
pub struct RecordingMailer {
    rejects: HashMap<String, String>,
    sent: Mutex<Vec<String>>,
}

impl RecordingMailer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Permanently reject an address with the given reason.
    pub fn rejecting(mut self, email: impl Into<String>, reason: impl Into<String>) -> Self {
        self.rejects.insert(email.into(), reason.into());
        self
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl EmailSender for RecordingMailer {
    async fn send_invitation(
        &self,
        email: &str,
        invitation_id: Uuid,
        _subdomain: &str,
    ) -> Result<String, ActivityError> {
        if let Some(reason) = self.rejects.get(email) {
            return Err(ActivityError::validation(reason.clone()));
        }
        self.sent.lock().push(email.to_string());
        Ok(format!("msg-{invitation_id}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_flaky_dns_recovers() {
        let dns = FlakyDns::failing(2);
        let org = Uuid::now_v7();

        assert!(dns.configure("acme", org).await.is_err());
        assert!(dns.configure("acme", org).await.is_err());
        let record = dns.configure("acme", org).await.unwrap();
        assert_eq!(record.name, "acme.careflow.health");
        assert_eq!(dns.attempts(), 3);
    }

    #[tokio::test]
    async fn test_recording_mailer_rejects() {
        let mailer = RecordingMailer::new().rejecting("bad@x.test", "mailbox rejected");

        let ok = mailer
            .send_invitation("good@x.test", Uuid::now_v7(), "acme")
            .await;
        assert!(ok.is_ok());

        let err = mailer
            .send_invitation("bad@x.test", Uuid::now_v7(), "acme")
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(mailer.sent(), vec!["good@x.test".to_string()]);
    }
}
