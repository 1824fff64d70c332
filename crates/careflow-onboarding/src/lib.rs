//! # Careflow Onboarding
//!
//! The organization bootstrap workflow: triggered by
//! `organization.bootstrap.initiated`, it creates the organization,
//! configures its subdomain, invites the seed users and activates the
//! tenant. Every side-effecting step registers a compensation before it
//! runs, so failures unwind in reverse order and leave an auditable
//! trail of `*.cancelled` / `*.removed` / `*.deactivated` events.

pub mod activities;
pub mod providers;
pub mod types;
pub mod workflow;

use std::sync::Arc;

use careflow_engine::{ActivityRegistry, EngineStore, WorkflowExecutor};

pub use activities::{dns_activity_options, email_activity_options};
pub use providers::{DnsProvider, DnsRecord, EmailSender, FlakyDns, RecordingMailer};
pub use types::{
    invitation_id, BootstrapInput, BootstrapRequest, BootstrapResult, InvitationOutcome, UserSeed,
};
pub use workflow::OrgBootstrapWorkflow;

/// The task queue the onboarding activities run on. Matches the trigger
/// wiring in the event-type registry.
pub const TASK_QUEUE: &str = "careflow-onboarding";

/// Register the bootstrap workflow and its activities.
pub fn register<S: EngineStore>(
    executor: &mut WorkflowExecutor<S>,
    activities: &mut ActivityRegistry,
    dns: Arc<dyn DnsProvider>,
    mailer: Arc<dyn EmailSender>,
) {
    executor.register::<OrgBootstrapWorkflow>();

    activities.register(activities::CreateOrganization);
    activities.register(activities::ConfigureDns {
        provider: Arc::clone(&dns),
    });
    activities.register(activities::RemoveDns { provider: dns });
    activities.register(activities::CreateInvitation);
    activities.register(activities::CancelInvitation);
    activities.register(activities::SendInvitationEmail { sender: mailer });
    activities.register(activities::ActivateOrganization);
    activities.register(activities::DeactivateOrganization);
}
