//! The organization bootstrap state machine
//!
//! create organization -> configure DNS -> (invite + email) per user ->
//! activate. Compensations are registered before each side-effecting
//! step, so a failure unwinds in reverse: cancel invitations, remove
//! DNS, deactivate the organization.
//!
//! A permanently failed invitation email does not fail the bootstrap;
//! the per-user failure is reported in the workflow result instead.

use serde_json::json;
use tracing::debug;

use careflow_engine::{ActivityError, Workflow, WorkflowAction, WorkflowError};

use crate::activities::{dns_activity_options, email_activity_options};
use crate::types::{invitation_id, BootstrapInput, BootstrapResult, InvitationOutcome};

const CREATE_ORG: &str = "create-org";
const CONFIGURE_DNS: &str = "configure-dns";
const ACTIVATE_ORG: &str = "activate-org";
const UNDO_CREATE_ORG: &str = "undo-create-org";
const UNDO_CONFIGURE_DNS: &str = "undo-configure-dns";

fn invite_step(index: usize) -> String {
    format!("invite-{index}")
}

fn email_step(index: usize) -> String {
    format!("email-{index}")
}

fn undo_invite_step(index: usize) -> String {
    format!("undo-invite-{index}")
}

fn step_index(activity_id: &str, prefix: &str) -> Option<usize> {
    activity_id.strip_prefix(prefix)?.parse().ok()
}

/// The bootstrap workflow.
pub struct OrgBootstrapWorkflow {
    input: BootstrapInput,
    dns_configured: bool,
    invitations: Vec<InvitationOutcome>,
    completed: bool,
    failed: Option<WorkflowError>,
}

impl OrgBootstrapWorkflow {
    /// Invite the next user, or activate once everyone is processed.
    /// `invitations.len()` is always the next user index.
    fn next_step(&self) -> Vec<WorkflowAction> {
        let index = self.invitations.len();

        match self.input.data.users.get(index) {
            Some(user) => {
                let invitation = invitation_id(self.input.stream_id, &user.email);
                vec![
                    WorkflowAction::compensation(
                        undo_invite_step(index),
                        "cancel_invitation",
                        json!({
                            "invitation_id": invitation,
                            "organization_id": self.input.stream_id,
                            "reason": "organization bootstrap rolled back",
                        }),
                    ),
                    WorkflowAction::schedule_activity(
                        invite_step(index),
                        "create_invitation",
                        json!({
                            "invitation_id": invitation,
                            "organization_id": self.input.stream_id,
                            "email": user.email,
                            "role": user.role,
                        }),
                    ),
                ]
            }
            None => vec![WorkflowAction::schedule_activity(
                ACTIVATE_ORG,
                "activate_organization",
                json!({"organization_id": self.input.stream_id}),
            )],
        }
    }

    fn fail(&mut self, error: &ActivityError) -> Vec<WorkflowAction> {
        let error = WorkflowError::from(error).with_correlation(self.input.event_id);
        self.failed = Some(error.clone());
        vec![WorkflowAction::fail(error)]
    }
}

impl Workflow for OrgBootstrapWorkflow {
    const TYPE: &'static str = "org_bootstrap";
    type Input = BootstrapInput;
    type Output = BootstrapResult;

    fn new(input: Self::Input) -> Self {
        Self {
            input,
            dns_configured: false,
            invitations: vec![],
            completed: false,
            failed: None,
        }
    }

    fn on_start(&mut self) -> Vec<WorkflowAction> {
        vec![
            WorkflowAction::compensation(
                UNDO_CREATE_ORG,
                "deactivate_organization",
                json!({
                    "organization_id": self.input.stream_id,
                    "reason": "organization bootstrap rolled back",
                }),
            ),
            WorkflowAction::schedule_activity(
                CREATE_ORG,
                "create_organization",
                json!({
                    "organization_id": self.input.stream_id,
                    "subdomain": self.input.data.subdomain,
                    "org_data": self.input.data.org_data,
                }),
            ),
        ]
    }

    fn on_activity_completed(
        &mut self,
        activity_id: &str,
        result: serde_json::Value,
    ) -> Vec<WorkflowAction> {
        match activity_id {
            CREATE_ORG => vec![
                WorkflowAction::compensation(
                    UNDO_CONFIGURE_DNS,
                    "remove_dns",
                    json!({
                        "organization_id": self.input.stream_id,
                        "subdomain": self.input.data.subdomain,
                    }),
                ),
                WorkflowAction::schedule_activity_with(
                    CONFIGURE_DNS,
                    "configure_dns",
                    json!({
                        "organization_id": self.input.stream_id,
                        "subdomain": self.input.data.subdomain,
                    }),
                    dns_activity_options(),
                ),
            ],

            CONFIGURE_DNS => {
                self.dns_configured = true;
                self.next_step()
            }

            ACTIVATE_ORG => {
                self.completed = true;
                match self.result() {
                    Some(result) => vec![WorkflowAction::complete(
                        serde_json::to_value(result).unwrap_or(serde_json::Value::Null),
                    )],
                    None => vec![],
                }
            }

            other => {
                if let Some(index) = step_index(other, "invite-") {
                    let Some(email) = self.input.data.users.get(index).map(|u| u.email.clone())
                    else {
                        debug!(activity_id = other, "invitation step without a user");
                        return vec![];
                    };
                    let invitation = result
                        .get("invitation_id")
                        .and_then(|v| v.as_str())
                        .and_then(|s| s.parse().ok())
                        .unwrap_or_else(|| invitation_id(self.input.stream_id, &email));

                    self.invitations.push(InvitationOutcome {
                        email: email.clone(),
                        invitation_id: invitation,
                        email_sent: false,
                        failure: None,
                    });

                    vec![WorkflowAction::schedule_activity_with(
                        email_step(index),
                        "send_invitation_email",
                        json!({
                            "invitation_id": invitation,
                            "organization_id": self.input.stream_id,
                            "email": email,
                            "subdomain": self.input.data.subdomain,
                        }),
                        email_activity_options(),
                    )]
                } else if let Some(index) = step_index(other, "email-") {
                    if let Some(outcome) = self.invitations.get_mut(index) {
                        outcome.email_sent = true;
                    }
                    self.next_step()
                } else {
                    debug!(activity_id = other, "ignoring unknown activity completion");
                    vec![]
                }
            }
        }
    }

    fn on_activity_failed(
        &mut self,
        activity_id: &str,
        error: &ActivityError,
    ) -> Vec<WorkflowAction> {
        // One undeliverable email is a per-user failure, not a bootstrap
        // failure.
        if let Some(index) = step_index(activity_id, "email-") {
            if let Some(outcome) = self.invitations.get_mut(index) {
                outcome.failure = Some(error.message.clone());
            }
            return self.next_step();
        }

        self.fail(error)
    }

    fn is_completed(&self) -> bool {
        self.completed || self.failed.is_some()
    }

    fn result(&self) -> Option<Self::Output> {
        (self.completed && self.failed.is_none()).then(|| BootstrapResult {
            organization_id: self.input.stream_id,
            subdomain: self.input.data.subdomain.clone(),
            dns_configured: self.dns_configured,
            invitations: self.invitations.clone(),
        })
    }

    fn error(&self) -> Option<WorkflowError> {
        self.failed.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BootstrapRequest, UserSeed};
    use uuid::Uuid;

    fn input(users: &[&str]) -> BootstrapInput {
        BootstrapInput {
            event_id: Uuid::now_v7(),
            stream_id: Uuid::now_v7(),
            stream_type: "organization".to_string(),
            data: BootstrapRequest {
                subdomain: "acme".to_string(),
                org_data: json!({"name": "Acme Health"}),
                users: users
                    .iter()
                    .map(|email| UserSeed {
                        email: email.to_string(),
                        name: None,
                        role: None,
                    })
                    .collect(),
            },
        }
    }

    #[test]
    fn test_start_registers_compensation_first() {
        let mut workflow = OrgBootstrapWorkflow::new(input(&[]));
        let actions = workflow.on_start();

        assert!(matches!(
            &actions[0],
            WorkflowAction::RegisterCompensation { compensation_id, .. }
                if compensation_id == UNDO_CREATE_ORG
        ));
        assert!(matches!(
            &actions[1],
            WorkflowAction::ScheduleActivity { activity_id, .. } if activity_id == CREATE_ORG
        ));
    }

    #[test]
    fn test_dns_uses_its_retry_profile() {
        let mut workflow = OrgBootstrapWorkflow::new(input(&[]));
        workflow.on_start();

        let actions = workflow.on_activity_completed(CREATE_ORG, json!({}));
        match &actions[1] {
            WorkflowAction::ScheduleActivity {
                activity_id,
                options,
                ..
            } => {
                assert_eq!(activity_id, CONFIGURE_DNS);
                assert_eq!(options.retry_policy.max_attempts, 5);
            }
            other => panic!("expected ScheduleActivity, got {other:?}"),
        }
    }

    #[test]
    fn test_no_users_goes_straight_to_activation() {
        let mut workflow = OrgBootstrapWorkflow::new(input(&[]));
        workflow.on_start();
        workflow.on_activity_completed(CREATE_ORG, json!({}));

        let actions = workflow.on_activity_completed(CONFIGURE_DNS, json!({}));
        assert!(matches!(
            &actions[0],
            WorkflowAction::ScheduleActivity { activity_id, .. } if activity_id == ACTIVATE_ORG
        ));
    }

    #[test]
    fn test_full_run_produces_result() {
        let mut workflow = OrgBootstrapWorkflow::new(input(&["a@x.test", "b@x.test"]));
        workflow.on_start();
        workflow.on_activity_completed(CREATE_ORG, json!({}));
        workflow.on_activity_completed(CONFIGURE_DNS, json!({}));
        workflow.on_activity_completed("invite-0", json!({}));
        workflow.on_activity_completed("email-0", json!({}));
        workflow.on_activity_completed("invite-1", json!({}));
        workflow.on_activity_completed("email-1", json!({}));
        let actions = workflow.on_activity_completed(ACTIVATE_ORG, json!({}));

        assert!(matches!(&actions[0], WorkflowAction::CompleteWorkflow { .. }));
        let result = workflow.result().unwrap();
        assert!(result.dns_configured);
        assert_eq!(result.invitations.len(), 2);
        assert!(result.invitations.iter().all(|i| i.email_sent));
    }

    #[test]
    fn test_email_failure_is_tolerated() {
        let mut workflow = OrgBootstrapWorkflow::new(input(&["a@x.test", "b@x.test"]));
        workflow.on_start();
        workflow.on_activity_completed(CREATE_ORG, json!({}));
        workflow.on_activity_completed(CONFIGURE_DNS, json!({}));
        workflow.on_activity_completed("invite-0", json!({}));

        let actions =
            workflow.on_activity_failed("email-0", &ActivityError::validation("bad mailbox"));
        // Moves on to the next user instead of failing.
        assert!(matches!(
            &actions[1],
            WorkflowAction::ScheduleActivity { activity_id, .. } if activity_id == "invite-1"
        ));

        workflow.on_activity_completed("invite-1", json!({}));
        workflow.on_activity_completed("email-1", json!({}));
        workflow.on_activity_completed(ACTIVATE_ORG, json!({}));

        let result = workflow.result().unwrap();
        assert_eq!(result.email_failures().len(), 1);
        assert_eq!(result.email_failures()[0].email, "a@x.test");
    }

    #[test]
    fn test_dns_failure_fails_workflow_with_correlation() {
        let event_id;
        let mut workflow = {
            let input = input(&["a@x.test"]);
            event_id = input.event_id;
            OrgBootstrapWorkflow::new(input)
        };
        workflow.on_start();
        workflow.on_activity_completed(CREATE_ORG, json!({}));

        let actions = workflow
            .on_activity_failed(CONFIGURE_DNS, &ActivityError::transient("dns dead"));
        assert!(matches!(&actions[0], WorkflowAction::FailWorkflow { .. }));

        let error = workflow.error().unwrap();
        assert_eq!(error.correlation_id, Some(event_id));
    }
}
