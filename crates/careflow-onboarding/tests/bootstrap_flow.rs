//! End-to-end bootstrap scenarios
//!
//! Each test runs the full in-process stack: domain-event store with
//! synchronous projections, trigger dispatch, the workflow engine, and
//! the onboarding activities, driven deterministically by the local
//! runner. DNS and email go through in-process provider doubles.

use std::sync::Arc;

use serde_json::json;
use uuid::Uuid;

use careflow_core::config::{BacklogConfig, WorkflowDefaults};
use careflow_core::event::AppendEvent;
use careflow_core::registry::EventTypeRegistry;
use careflow_engine::{
    ActivityRegistry, Engine, EventEmitter, InMemoryEngineStore, LocalRunner, WorkflowExecutor,
    WorkflowStarter, WorkflowStatus,
};
use careflow_onboarding::{
    register, BootstrapResult, DnsProvider, EmailSender, FlakyDns, RecordingMailer,
};
use careflow_store::{EventStore, InMemoryEventStore};
use careflow_trigger::{BacklogReprocessor, TriggerMessage, TriggerOutcome, TriggerProcessor};

struct Harness {
    event_store: Arc<InMemoryEventStore>,
    engine: Arc<Engine<InMemoryEngineStore>>,
    runner: LocalRunner,
    processor: Arc<TriggerProcessor>,
    backlog: BacklogReprocessor,
    dns: Arc<FlakyDns>,
    mailer: Arc<RecordingMailer>,
}

impl Harness {
    fn new(dns: FlakyDns, mailer: RecordingMailer) -> Self {
        let registry = Arc::new(EventTypeRegistry::standard());
        let event_store = Arc::new(InMemoryEventStore::new(Arc::clone(&registry)));
        let engine_store = Arc::new(InMemoryEngineStore::new());

        let dns = Arc::new(dns);
        let mailer = Arc::new(mailer);

        let mut executor = WorkflowExecutor::new(Arc::clone(&engine_store));
        let mut activities = ActivityRegistry::new();
        register(
            &mut executor,
            &mut activities,
            Arc::clone(&dns) as Arc<dyn DnsProvider>,
            Arc::clone(&mailer) as Arc<dyn EmailSender>,
        );
        let executor = Arc::new(executor);

        let emitter = Arc::new(EventEmitter::new(
            Arc::clone(&event_store) as Arc<dyn EventStore>
        ));
        let engine = Arc::new(Engine::new(
            Arc::clone(&executor),
            WorkflowDefaults::default(),
        ));
        let runner = LocalRunner::new(
            Arc::clone(&engine_store),
            executor,
            Arc::new(activities),
        )
        .with_emitter(emitter);

        let processor = Arc::new(TriggerProcessor::new(
            Arc::clone(&event_store) as Arc<dyn EventStore>,
            Arc::clone(&engine) as Arc<dyn WorkflowStarter>,
            registry,
        ));
        let backlog = BacklogReprocessor::new(Arc::clone(&processor), BacklogConfig::default());

        Self {
            event_store,
            engine,
            runner,
            processor,
            backlog,
            dns,
            mailer,
        }
    }

    /// Append the bootstrap trigger event; returns (organization id,
    /// trigger event id).
    async fn append_trigger(&self, users: serde_json::Value) -> (Uuid, Uuid) {
        let org_id = Uuid::now_v7();
        let appended = self
            .event_store
            .append(AppendEvent::new(
                org_id,
                "organization",
                "organization.bootstrap.initiated",
                json!({
                    "subdomain": "acme",
                    "org_data": {"name": "Acme Health"},
                    "users": users,
                }),
            ))
            .await
            .expect("trigger append");
        (org_id, appended.event_id)
    }

    fn workflow_id(org_id: Uuid) -> String {
        format!("org-bootstrap-{org_id}")
    }

    /// Dispatch the backlog (stands in for the notify listener) and run
    /// the workflow to rest.
    async fn dispatch_and_drive(&self, org_id: Uuid) -> WorkflowStatus {
        self.backlog.run_once().await.expect("backlog sweep");
        self.runner
            .drive(&Self::workflow_id(org_id))
            .await
            .expect("drive")
            .status
    }

    async fn workflow_event_types(&self, org_id: Uuid) -> Vec<String> {
        self.event_store
            .events_for_workflow(&Self::workflow_id(org_id), None)
            .await
            .expect("events_for_workflow")
            .into_iter()
            .map(|e| e.event_type)
            .collect()
    }

    async fn result(&self, org_id: Uuid) -> BootstrapResult {
        let record = self
            .runner
            .drive(&Self::workflow_id(org_id))
            .await
            .expect("drive");
        serde_json::from_value(record.result.expect("workflow result")).expect("decode result")
    }

    async fn org_row(&self, org_id: Uuid) -> serde_json::Value {
        self.event_store
            .projection_row("organizations", &org_id.to_string())
            .await
            .expect("projection query")
            .expect("organization row")
            .data
    }
}

fn two_users() -> serde_json::Value {
    json!([
        {"email": "u1@acme.test", "role": "admin"},
        {"email": "u2@acme.test"}
    ])
}

#[tokio::test]
async fn test_happy_path_onboarding() {
    let harness = Harness::new(FlakyDns::reliable(), RecordingMailer::new());
    let (org_id, event_id) = harness.append_trigger(two_users()).await;

    let status = harness.dispatch_and_drive(org_id).await;
    assert_eq!(status, WorkflowStatus::Completed);

    // The trigger event got its provenance and dispatch stamp.
    let trigger = harness.event_store.get_event(event_id).await.unwrap();
    assert!(trigger.processed_at.is_some());
    assert_eq!(
        trigger.event_metadata.workflow_id.as_deref(),
        Some(Harness::workflow_id(org_id).as_str())
    );

    // Every expected domain event is present and carries the workflow id.
    let types = harness.workflow_event_types(org_id).await;
    let count = |t: &str| types.iter().filter(|x| x.as_str() == t).count();
    assert_eq!(count("organization.created"), 1);
    assert_eq!(count("dns.configured"), 1);
    assert_eq!(count("invitation.created"), 2);
    assert_eq!(count("invitation.email.sent"), 2);
    assert_eq!(count("organization.activated"), 1);

    // Result and read models agree.
    let result = harness.result(org_id).await;
    assert_eq!(result.organization_id, org_id);
    assert!(result.email_failures().is_empty());
    assert_eq!(harness.mailer.sent().len(), 2);

    let row = harness.org_row(org_id).await;
    assert_eq!(row["status"], json!("active"));
    assert_eq!(row["dns_status"], json!("configured"));

    // Lineage reconstructs end to end from the aggregate.
    let lineage = harness
        .event_store
        .lineage_for_aggregate(org_id)
        .await
        .unwrap()
        .expect("lineage");
    assert_eq!(lineage.root.event_id, event_id);
    assert!(lineage
        .events
        .iter()
        .any(|e| e.event_type == "organization.activated"));

    // Replaying the whole log reproduces the live projections.
    assert_eq!(
        harness.event_store.projections_snapshot(),
        harness.event_store.rebuild_projections()
    );
}

#[tokio::test]
async fn test_dns_retries_then_succeeds() {
    let harness = Harness::new(FlakyDns::failing(2), RecordingMailer::new());
    let (org_id, _) = harness.append_trigger(json!([])).await;

    let status = harness.dispatch_and_drive(org_id).await;
    assert_eq!(status, WorkflowStatus::Completed);

    // Retries happened at the provider...
    assert_eq!(harness.dns.attempts(), 3);

    // ...are visible in the engine, and did not duplicate domain events.
    let types = harness.workflow_event_types(org_id).await;
    assert_eq!(
        types
            .iter()
            .filter(|t| t.as_str() == "dns.configured")
            .count(),
        1
    );

    let execution = harness
        .engine
        .get(&Harness::workflow_id(org_id))
        .await
        .unwrap();
    assert_eq!(execution.status, WorkflowStatus::Completed);
}

#[tokio::test]
async fn test_partial_email_failure_completes() {
    let mailer = RecordingMailer::new().rejecting("invalid@acme.test", "mailbox rejected");
    let harness = Harness::new(FlakyDns::reliable(), mailer);
    let (org_id, _) = harness
        .append_trigger(json!([
            {"email": "valid@acme.test"},
            {"email": "invalid@acme.test"}
        ]))
        .await;

    let status = harness.dispatch_and_drive(org_id).await;
    assert_eq!(status, WorkflowStatus::Completed);

    let types = harness.workflow_event_types(org_id).await;
    assert_eq!(
        types
            .iter()
            .filter(|t| t.as_str() == "invitation.email.sent")
            .count(),
        1
    );
    // Invitations were created for both; no compensations ran.
    assert_eq!(
        types
            .iter()
            .filter(|t| t.as_str() == "invitation.created")
            .count(),
        2
    );
    assert!(!types.iter().any(|t| t.contains("cancelled")
        || t.contains("removed")
        || t.contains("deactivated")));

    let result = harness.result(org_id).await;
    assert_eq!(result.email_failures().len(), 1);
    assert_eq!(result.email_failures()[0].email, "invalid@acme.test");
    assert_eq!(harness.mailer.sent(), vec!["valid@acme.test".to_string()]);
}

#[tokio::test]
async fn test_dns_exhaustion_triggers_saga() {
    let harness = Harness::new(FlakyDns::failing(u32::MAX), RecordingMailer::new());
    let (org_id, event_id) = harness.append_trigger(two_users()).await;

    let status = harness.dispatch_and_drive(org_id).await;
    assert_eq!(status, WorkflowStatus::Failed);

    // All five configured attempts were spent.
    assert_eq!(harness.dns.attempts(), 5);

    // Compensations ran in reverse order of registration: the DNS undo
    // before the organization deactivation. No invitations existed yet,
    // so none were cancelled.
    let types = harness.workflow_event_types(org_id).await;
    let position = |t: &str| types.iter().position(|x| x.as_str() == t);
    let removed = position("dns.removed").expect("dns.removed emitted");
    let deactivated = position("organization.deactivated").expect("deactivation emitted");
    assert!(removed < deactivated);
    assert!(!types.iter().any(|t| t == "invitation.cancelled"));
    assert!(!types.iter().any(|t| t == "organization.activated"));

    // The provider-side cleanup happened too.
    assert_eq!(harness.dns.removed(), vec!["acme".to_string()]);

    // Projections reflect the rollback.
    let row = harness.org_row(org_id).await;
    assert_eq!(row["status"], json!("inactive"));
    assert_eq!(row["dns_status"], json!("removed"));

    // The failure carries the originating event as its correlation id.
    let execution = harness
        .engine
        .get(&Harness::workflow_id(org_id))
        .await
        .unwrap();
    assert_eq!(execution.status, WorkflowStatus::Failed);
    assert_eq!(execution.error.unwrap().correlation_id, Some(event_id));
}

#[tokio::test]
async fn test_duplicate_trigger_runs_once() {
    let harness = Harness::new(FlakyDns::reliable(), RecordingMailer::new());
    let (org_id, first_event) = harness.append_trigger(json!([])).await;

    // A second bootstrap event lands on the same organization stream.
    let second_event = harness
        .event_store
        .append(AppendEvent::new(
            org_id,
            "organization",
            "organization.bootstrap.initiated",
            json!({"subdomain": "acme", "org_data": {}, "users": []}),
        ))
        .await
        .unwrap()
        .event_id;

    let first = harness.event_store.get_event(first_event).await.unwrap();
    let second = harness.event_store.get_event(second_event).await.unwrap();

    let outcome_one = harness
        .processor
        .process(&TriggerMessage::from(&first))
        .await
        .unwrap();
    let outcome_two = harness
        .processor
        .process(&TriggerMessage::from(&second))
        .await
        .unwrap();

    assert!(matches!(outcome_one, TriggerOutcome::Started(_)));
    assert!(matches!(outcome_two, TriggerOutcome::Deduplicated(_)));

    // Both events end dispatched, bearing the same workflow id.
    for event_id in [first_event, second_event] {
        let event = harness.event_store.get_event(event_id).await.unwrap();
        assert!(event.processed_at.is_some());
        assert_eq!(
            event.event_metadata.workflow_id.as_deref(),
            Some(Harness::workflow_id(org_id).as_str())
        );
    }

    let status = harness
        .runner
        .drive(&Harness::workflow_id(org_id))
        .await
        .unwrap()
        .status;
    assert_eq!(status, WorkflowStatus::Completed);
}

#[tokio::test]
async fn test_listener_crash_recovered_by_backlog() {
    let harness = Harness::new(FlakyDns::reliable(), RecordingMailer::new());

    // The trigger commits while no listener is running (crashed before
    // dispatch): no notification is ever delivered.
    let (org_id, event_id) = harness.append_trigger(json!([])).await;
    let event = harness.event_store.get_event(event_id).await.unwrap();
    assert!(event.processed_at.is_none());

    // Restart + backlog sweep picks it up exactly once.
    let stats = harness.backlog.run_once().await.unwrap();
    assert_eq!(stats.started, 1);

    let event = harness.event_store.get_event(event_id).await.unwrap();
    assert!(event.processed_at.is_some());
    assert!(event.event_metadata.workflow_run_id.is_some());

    // A second sweep has nothing to do.
    let stats = harness.backlog.run_once().await.unwrap();
    assert_eq!(stats.scanned, 0);

    let status = harness
        .runner
        .drive(&Harness::workflow_id(org_id))
        .await
        .unwrap()
        .status;
    assert_eq!(status, WorkflowStatus::Completed);
}
