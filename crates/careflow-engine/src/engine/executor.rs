//! Workflow executor with replay support
//!
//! The executor drives workflow state machines:
//! - starting runs (idempotent via the store's workflow-id uniqueness)
//! - replaying run histories to rebuild state after any interruption
//! - turning workflow actions into history events, queued tasks and timers
//! - the Saga path: reverse-order, best-effort compensation on failure or
//!   cancellation
//!
//! Replay feeds historical events through the workflow callbacks and
//! discards the resulting actions; only the event being applied for the
//! first time produces actions that are acted on. That keeps action
//! processing exactly-once per history event.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::activity::ActivityError;
use crate::persistence::{
    CancellationPolicy, EngineStore, EngineStoreError, ExecutionRecord, NewExecution, ReusePolicy,
    TaskDefinition, TaskKind, WorkflowStatus,
};
use crate::workflow::{ActivityOptions, RunEvent, WorkflowAction, WorkflowError};

use super::registry::{AnyWorkflow, RegistryError, WorkflowRegistry};

/// Errors from executor operations.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("store error: {0}")]
    Store(#[from] EngineStoreError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("workflow {0} is already in a terminal state")]
    WorkflowTerminal(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
struct CompensationEntry {
    compensation_id: String,
    activity_type: String,
    input: serde_json::Value,
    options: ActivityOptions,
}

/// Engine-level bookkeeping rebuilt alongside the workflow state.
#[derive(Default)]
struct ReplayState {
    /// Next expected history sequence (== events replayed so far)
    sequence: i64,

    /// Compensations in registration order
    compensations: Vec<CompensationEntry>,

    /// Compensations already started
    started: HashSet<String>,

    completed: bool,
    failure: Option<WorkflowError>,
    cancelled: Option<String>,
}

impl ReplayState {
    /// Unstarted compensations, most recently registered first.
    fn pending_compensations(&self) -> Vec<CompensationEntry> {
        self.compensations
            .iter()
            .rev()
            .filter(|c| !self.started.contains(&c.compensation_id))
            .cloned()
            .collect()
    }

    fn any_compensation_started(&self) -> bool {
        !self.started.is_empty()
    }

    fn terminal_decided(&self) -> bool {
        self.completed || self.failure.is_some() || self.cancelled.is_some()
    }
}

/// Workflow executor.
pub struct WorkflowExecutor<S: EngineStore> {
    store: Arc<S>,
    registry: WorkflowRegistry,
}

impl<S: EngineStore> WorkflowExecutor<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            registry: WorkflowRegistry::new(),
        }
    }

    /// Register a workflow type.
    pub fn register<W: crate::workflow::Workflow>(&mut self) {
        self.registry.register::<W>();
        info!(workflow_type = W::TYPE, "registered workflow type");
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn registry(&self) -> &WorkflowRegistry {
        &self.registry
    }

    /// Start a new run under a deterministic workflow id.
    ///
    /// Duplicate ids surface as `EngineStoreError::AlreadyExists` carrying
    /// the winning run; callers treat that as success for idempotency.
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip(self, params, deadline_at, reuse, cancellation_policy))]
    pub async fn start_workflow(
        &self,
        workflow_type: &str,
        workflow_id: &str,
        params: serde_json::Value,
        task_queue: &str,
        deadline_at: Option<DateTime<Utc>>,
        reuse: ReusePolicy,
        cancellation_policy: CancellationPolicy,
    ) -> Result<Uuid, ExecutorError> {
        if !self.registry.contains(workflow_type) {
            return Err(RegistryError::UnknownWorkflowType(workflow_type.to_string()).into());
        }

        let run_id = Uuid::now_v7();
        self.store
            .create_workflow(
                NewExecution {
                    workflow_id: workflow_id.to_string(),
                    run_id,
                    workflow_type: workflow_type.to_string(),
                    input: params.clone(),
                    task_queue: task_queue.to_string(),
                    deadline_at,
                    cancellation_policy,
                },
                reuse,
            )
            .await?;

        info!(%workflow_id, %run_id, "starting workflow");

        let record = self.store.get_execution_by_run(run_id).await?;
        let mut state = ReplayState::default();
        self.append_event(
            run_id,
            &mut state,
            RunEvent::WorkflowStarted {
                input: params.clone(),
            },
        )
        .await?;

        let mut workflow = self.registry.create(workflow_type, params)?;
        let actions = workflow.on_start();
        self.process_actions(&record, &mut state, actions).await?;

        if !state.terminal_decided() {
            self.store
                .update_status(run_id, WorkflowStatus::Running, None, None)
                .await?;
        }

        Ok(run_id)
    }

    /// Handle a successful activity completion.
    #[instrument(skip(self, result))]
    pub async fn on_activity_completed(
        &self,
        run_id: Uuid,
        activity_id: &str,
        result: serde_json::Value,
    ) -> Result<(), ExecutorError> {
        let record = self.store.get_execution_by_run(run_id).await?;
        if record.status.is_terminal() {
            debug!(%run_id, activity_id, "ignoring late completion for terminal workflow");
            return Ok(());
        }

        let (mut workflow, mut state) = self.replay(&record).await?;
        self.append_event(
            run_id,
            &mut state,
            RunEvent::ActivityCompleted {
                activity_id: activity_id.to_string(),
                result: result.clone(),
            },
        )
        .await?;

        let actions = workflow.on_activity_completed(activity_id, result);
        self.process_actions(&record, &mut state, actions).await?;
        self.settle(&record, &mut state, workflow.as_mut()).await
    }

    /// Handle an activity failure.
    ///
    /// Per-attempt failures (`will_retry = true`) are recorded for the
    /// audit trail only; the workflow sees the failure once retries are
    /// exhausted.
    #[instrument(skip(self, error))]
    pub async fn on_activity_failed(
        &self,
        run_id: Uuid,
        activity_id: &str,
        error: ActivityError,
        will_retry: bool,
    ) -> Result<(), ExecutorError> {
        let record = self.store.get_execution_by_run(run_id).await?;
        if record.status.is_terminal() {
            debug!(%run_id, activity_id, "ignoring late failure for terminal workflow");
            return Ok(());
        }

        if will_retry {
            let events = self.store.load_run_events(run_id).await?;
            self.store
                .append_run_events(
                    run_id,
                    events.len() as i64,
                    vec![RunEvent::ActivityFailed {
                        activity_id: activity_id.to_string(),
                        error,
                        will_retry: true,
                    }],
                )
                .await?;
            return Ok(());
        }

        let (mut workflow, mut state) = self.replay(&record).await?;
        self.append_event(
            run_id,
            &mut state,
            RunEvent::ActivityFailed {
                activity_id: activity_id.to_string(),
                error: error.clone(),
                will_retry: false,
            },
        )
        .await?;

        let actions = workflow.on_activity_failed(activity_id, &error);
        self.process_actions(&record, &mut state, actions).await?;
        self.settle(&record, &mut state, workflow.as_mut()).await
    }

    /// Handle an activity start-to-close timeout.
    #[instrument(skip(self))]
    pub async fn on_activity_timed_out(
        &self,
        run_id: Uuid,
        activity_id: &str,
        will_retry: bool,
    ) -> Result<(), ExecutorError> {
        let record = self.store.get_execution_by_run(run_id).await?;
        if record.status.is_terminal() {
            return Ok(());
        }

        if will_retry {
            let events = self.store.load_run_events(run_id).await?;
            self.store
                .append_run_events(
                    run_id,
                    events.len() as i64,
                    vec![RunEvent::ActivityTimedOut {
                        activity_id: activity_id.to_string(),
                        will_retry: true,
                    }],
                )
                .await?;
            return Ok(());
        }

        let (mut workflow, mut state) = self.replay(&record).await?;
        self.append_event(
            run_id,
            &mut state,
            RunEvent::ActivityTimedOut {
                activity_id: activity_id.to_string(),
                will_retry: false,
            },
        )
        .await?;

        let error = timeout_error(activity_id);
        let actions = workflow.on_activity_failed(activity_id, &error);
        self.process_actions(&record, &mut state, actions).await?;
        self.settle(&record, &mut state, workflow.as_mut()).await
    }

    /// Handle a fired durable timer.
    #[instrument(skip(self))]
    pub async fn on_timer_fired(&self, run_id: Uuid, timer_id: &str) -> Result<(), ExecutorError> {
        let record = self.store.get_execution_by_run(run_id).await?;
        if record.status.is_terminal() {
            return Ok(());
        }

        let (mut workflow, mut state) = self.replay(&record).await?;
        self.append_event(
            run_id,
            &mut state,
            RunEvent::TimerFired {
                timer_id: timer_id.to_string(),
            },
        )
        .await?;

        let actions = workflow.on_timer_fired(timer_id);
        self.process_actions(&record, &mut state, actions).await?;
        self.settle(&record, &mut state, workflow.as_mut()).await
    }

    /// Handle the wall-clock workflow timeout.
    #[instrument(skip(self))]
    pub async fn on_workflow_timeout(&self, run_id: Uuid) -> Result<(), ExecutorError> {
        let record = self.store.get_execution_by_run(run_id).await?;
        if record.status.is_terminal() {
            return Ok(());
        }

        warn!(workflow_id = %record.workflow_id, "workflow exceeded its timeout");

        let (mut workflow, mut state) = self.replay(&record).await?;
        self.append_event(run_id, &mut state, RunEvent::WorkflowTimedOut)
            .await?;

        let actions = workflow.on_timeout();
        self.process_actions(&record, &mut state, actions).await
    }

    /// Cancel a workflow externally. Registered compensations run in
    /// reverse order before the workflow settles.
    #[instrument(skip(self))]
    pub async fn cancel_workflow(
        &self,
        workflow_id: &str,
        reason: &str,
    ) -> Result<(), ExecutorError> {
        let record = self.store.get_execution(workflow_id).await?;
        if record.status.is_terminal() {
            return Err(ExecutorError::WorkflowTerminal(workflow_id.to_string()));
        }

        info!(%workflow_id, reason, "cancelling workflow");

        let (_workflow, mut state) = self.replay(&record).await?;
        self.append_event(
            record.run_id,
            &mut state,
            RunEvent::WorkflowCancelled {
                reason: reason.to_string(),
            },
        )
        .await?;
        state.cancelled = Some(reason.to_string());

        self.store.cancel_pending_tasks(record.run_id).await?;

        if state.pending_compensations().is_empty() {
            self.store
                .update_status(record.run_id, WorkflowStatus::Cancelled, None, None)
                .await?;
        } else {
            self.store
                .update_status(record.run_id, WorkflowStatus::Compensating, None, None)
                .await?;
            self.schedule_next_compensation(&record, &mut state).await?;
        }

        Ok(())
    }

    /// Handle a finished compensation activity. Failures are logged and
    /// the chain continues: compensation is best-effort.
    #[instrument(skip(self, outcome))]
    pub async fn on_compensation_finished(
        &self,
        run_id: Uuid,
        compensation_id: &str,
        outcome: Result<(), String>,
    ) -> Result<(), ExecutorError> {
        let record = self.store.get_execution_by_run(run_id).await?;
        let (_workflow, mut state) = self.replay(&record).await?;

        let event = match outcome {
            Ok(()) => RunEvent::CompensationCompleted {
                compensation_id: compensation_id.to_string(),
            },
            Err(error) => {
                warn!(
                    workflow_id = %record.workflow_id,
                    compensation_id,
                    %error,
                    "compensation failed; continuing the chain"
                );
                RunEvent::CompensationFailed {
                    compensation_id: compensation_id.to_string(),
                    error,
                }
            }
        };
        self.append_event(run_id, &mut state, event).await?;

        self.schedule_next_compensation(&record, &mut state).await
    }

    /// Deliver pending signals to the workflow. Returns how many were
    /// processed.
    #[instrument(skip(self))]
    pub async fn process_signals(&self, run_id: Uuid) -> Result<usize, ExecutorError> {
        let record = self.store.get_execution_by_run(run_id).await?;
        if record.status.is_terminal() {
            return Ok(0);
        }

        let signals = self.store.pending_signals(run_id).await?;
        if signals.is_empty() {
            return Ok(0);
        }

        let (mut workflow, mut state) = self.replay(&record).await?;
        let count = signals.len();

        for signal in signals {
            self.append_event(
                run_id,
                &mut state,
                RunEvent::SignalReceived {
                    signal: signal.clone(),
                },
            )
            .await?;
            let actions = workflow.on_signal(&signal);
            self.process_actions(&record, &mut state, actions).await?;
        }

        self.store.mark_signals_processed(run_id, count).await?;
        self.settle(&record, &mut state, workflow.as_mut()).await?;
        Ok(count)
    }

    // =========================================================================
    // Internal
    // =========================================================================

    /// Rebuild workflow state and engine bookkeeping from the history.
    async fn replay(
        &self,
        record: &ExecutionRecord,
    ) -> Result<(Box<dyn AnyWorkflow>, ReplayState), ExecutorError> {
        let events = self.store.load_run_events(record.run_id).await?;
        let mut workflow = self
            .registry
            .create(&record.workflow_type, record.input.clone())?;
        let mut state = ReplayState::default();

        for (_sequence, event) in &events {
            state.sequence += 1;
            match event {
                RunEvent::WorkflowStarted { .. } => {
                    let _ = workflow.on_start();
                }
                RunEvent::ActivityCompleted {
                    activity_id,
                    result,
                } => {
                    let _ = workflow.on_activity_completed(activity_id, result.clone());
                }
                RunEvent::ActivityFailed {
                    activity_id,
                    error,
                    will_retry,
                } => {
                    if !will_retry {
                        let _ = workflow.on_activity_failed(activity_id, error);
                    }
                }
                RunEvent::ActivityTimedOut {
                    activity_id,
                    will_retry,
                } => {
                    if !will_retry {
                        let _ = workflow.on_activity_failed(activity_id, &timeout_error(activity_id));
                    }
                }
                RunEvent::TimerFired { timer_id } => {
                    let _ = workflow.on_timer_fired(timer_id);
                }
                RunEvent::SignalReceived { signal } => {
                    let _ = workflow.on_signal(signal);
                }
                RunEvent::WorkflowTimedOut => {
                    let _ = workflow.on_timeout();
                }
                RunEvent::CompensationRegistered {
                    compensation_id,
                    activity_type,
                    input,
                    options,
                } => {
                    state.compensations.push(CompensationEntry {
                        compensation_id: compensation_id.clone(),
                        activity_type: activity_type.clone(),
                        input: input.clone(),
                        options: options.clone(),
                    });
                }
                RunEvent::CompensationStarted { compensation_id } => {
                    state.started.insert(compensation_id.clone());
                }
                RunEvent::WorkflowCompleted { .. } => {
                    state.completed = true;
                }
                RunEvent::WorkflowFailed { error } => {
                    state.failure = Some(error.clone());
                }
                RunEvent::WorkflowCancelled { reason } => {
                    state.cancelled = Some(reason.clone());
                }
                // Informational during replay
                RunEvent::ActivityScheduled { .. }
                | RunEvent::TimerStarted { .. }
                | RunEvent::CompensationCompleted { .. }
                | RunEvent::CompensationFailed { .. } => {}
            }
        }

        Ok((workflow, state))
    }

    async fn append_event(
        &self,
        run_id: Uuid,
        state: &mut ReplayState,
        event: RunEvent,
    ) -> Result<(), ExecutorError> {
        state.sequence = self
            .store
            .append_run_events(run_id, state.sequence, vec![event])
            .await?;
        Ok(())
    }

    async fn process_actions(
        &self,
        record: &ExecutionRecord,
        state: &mut ReplayState,
        actions: Vec<WorkflowAction>,
    ) -> Result<(), ExecutorError> {
        let run_id = record.run_id;

        for action in actions {
            match action {
                WorkflowAction::ScheduleActivity {
                    activity_id,
                    activity_type,
                    input,
                    options,
                } => {
                    debug!(workflow_id = %record.workflow_id, %activity_id, %activity_type, "scheduling activity");

                    self.append_event(
                        run_id,
                        state,
                        RunEvent::ActivityScheduled {
                            activity_id: activity_id.clone(),
                            activity_type: activity_type.clone(),
                            input: input.clone(),
                            options: options.clone(),
                        },
                    )
                    .await?;

                    self.store
                        .enqueue_task(TaskDefinition {
                            run_id,
                            workflow_id: record.workflow_id.clone(),
                            workflow_type: record.workflow_type.clone(),
                            activity_id,
                            activity_type,
                            kind: TaskKind::Activity,
                            task_queue: record.task_queue.clone(),
                            input,
                            options,
                        })
                        .await?;
                }

                WorkflowAction::RegisterCompensation {
                    compensation_id,
                    activity_type,
                    input,
                    options,
                } => {
                    debug!(workflow_id = %record.workflow_id, %compensation_id, "registered compensation");

                    self.append_event(
                        run_id,
                        state,
                        RunEvent::CompensationRegistered {
                            compensation_id: compensation_id.clone(),
                            activity_type: activity_type.clone(),
                            input: input.clone(),
                            options: options.clone(),
                        },
                    )
                    .await?;

                    state.compensations.push(CompensationEntry {
                        compensation_id,
                        activity_type,
                        input,
                        options,
                    });
                }

                WorkflowAction::StartTimer { timer_id, duration } => {
                    debug!(workflow_id = %record.workflow_id, %timer_id, ?duration, "starting timer");

                    self.append_event(
                        run_id,
                        state,
                        RunEvent::TimerStarted {
                            timer_id: timer_id.clone(),
                            duration_ms: duration.as_millis() as u64,
                        },
                    )
                    .await?;

                    let fire_at =
                        Utc::now() + chrono::Duration::from_std(duration).unwrap_or_default();
                    self.store
                        .schedule_timer(run_id, &record.workflow_id, &timer_id, fire_at)
                        .await?;
                }

                WorkflowAction::CompleteWorkflow { result } => {
                    info!(workflow_id = %record.workflow_id, "completing workflow");

                    self.append_event(
                        run_id,
                        state,
                        RunEvent::WorkflowCompleted {
                            result: result.clone(),
                        },
                    )
                    .await?;
                    state.completed = true;

                    self.store
                        .update_status(run_id, WorkflowStatus::Completed, Some(result), None)
                        .await?;
                }

                WorkflowAction::FailWorkflow { error } => {
                    self.handle_failure(record, state, error).await?;
                }

                WorkflowAction::None => {}
            }
        }

        Ok(())
    }

    /// Record a workflow failure and enter the Saga path when warranted.
    async fn handle_failure(
        &self,
        record: &ExecutionRecord,
        state: &mut ReplayState,
        error: WorkflowError,
    ) -> Result<(), ExecutorError> {
        warn!(workflow_id = %record.workflow_id, error = %error.message, "failing workflow");

        self.append_event(
            record.run_id,
            state,
            RunEvent::WorkflowFailed {
                error: error.clone(),
            },
        )
        .await?;
        state.failure = Some(error.clone());

        let compensate =
            !state.pending_compensations().is_empty() && error.kind.compensates_on_final();

        if compensate {
            self.store.cancel_pending_tasks(record.run_id).await?;
            self.store
                .update_status(
                    record.run_id,
                    WorkflowStatus::Compensating,
                    None,
                    Some(error),
                )
                .await?;
            self.schedule_next_compensation(record, state).await?;
        } else {
            self.store
                .update_status(record.run_id, WorkflowStatus::Failed, None, Some(error))
                .await?;
        }

        Ok(())
    }

    /// Enqueue the next pending compensation, or settle the Saga when the
    /// stack is drained.
    async fn schedule_next_compensation(
        &self,
        record: &ExecutionRecord,
        state: &mut ReplayState,
    ) -> Result<(), ExecutorError> {
        let Some(next) = state.pending_compensations().into_iter().next() else {
            return self.finalize_saga(record, state).await;
        };

        info!(
            workflow_id = %record.workflow_id,
            compensation_id = %next.compensation_id,
            "running compensation"
        );

        self.append_event(
            record.run_id,
            state,
            RunEvent::CompensationStarted {
                compensation_id: next.compensation_id.clone(),
            },
        )
        .await?;
        state.started.insert(next.compensation_id.clone());

        self.store
            .enqueue_task(TaskDefinition {
                run_id: record.run_id,
                workflow_id: record.workflow_id.clone(),
                workflow_type: record.workflow_type.clone(),
                activity_id: next.compensation_id,
                activity_type: next.activity_type,
                kind: TaskKind::Compensation,
                task_queue: record.task_queue.clone(),
                input: next.input,
                options: next.options,
            })
            .await?;

        Ok(())
    }

    /// Terminal status once the compensation chain has drained: a failed
    /// workflow stays `failed` (the compensation events are its audit
    /// trail); a cancelled one becomes `compensated` when anything was
    /// undone.
    async fn finalize_saga(
        &self,
        record: &ExecutionRecord,
        state: &mut ReplayState,
    ) -> Result<(), ExecutorError> {
        let status = if state.failure.is_some() {
            WorkflowStatus::Failed
        } else if state.any_compensation_started() {
            WorkflowStatus::Compensated
        } else {
            WorkflowStatus::Cancelled
        };

        info!(workflow_id = %record.workflow_id, %status, "saga settled");
        self.store
            .update_status(record.run_id, status, None, state.failure.clone())
            .await?;
        Ok(())
    }

    /// Safety net mirroring the workflow's own view of completion: if the
    /// state machine says it is done but no terminal action was issued,
    /// settle from `result()`/`error()`.
    async fn settle(
        &self,
        record: &ExecutionRecord,
        state: &mut ReplayState,
        workflow: &mut dyn AnyWorkflow,
    ) -> Result<(), ExecutorError> {
        if state.terminal_decided() || !workflow.is_completed() {
            return Ok(());
        }

        if let Some(result) = workflow.result_json() {
            self.append_event(
                record.run_id,
                state,
                RunEvent::WorkflowCompleted {
                    result: result.clone(),
                },
            )
            .await?;
            state.completed = true;
            self.store
                .update_status(record.run_id, WorkflowStatus::Completed, Some(result), None)
                .await?;
        } else if let Some(error) = workflow.error() {
            self.handle_failure(record, state, error).await?;
        }

        Ok(())
    }
}

fn timeout_error(activity_id: &str) -> ActivityError {
    ActivityError::timeout(format!(
        "activity {activity_id} exceeded its start-to-close timeout"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryEngineStore;
    use crate::workflow::{Workflow, WorkflowSignal};
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct ProvisionInput {
        steps: Vec<String>,
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct ProvisionOutput {
        provisioned: Vec<String>,
    }

    /// Runs one activity per step; registers a compensation after each
    /// success; fails the workflow when any step fails.
    struct ProvisionWorkflow {
        steps: Vec<String>,
        next: usize,
        provisioned: Vec<String>,
        failed: Option<WorkflowError>,
        done: bool,
    }

    impl ProvisionWorkflow {
        fn step_action(&self) -> WorkflowAction {
            WorkflowAction::schedule_activity(
                format!("provision-{}", self.steps[self.next]),
                "provision",
                json!({"step": self.steps[self.next]}),
            )
        }
    }

    impl Workflow for ProvisionWorkflow {
        const TYPE: &'static str = "provision";
        type Input = ProvisionInput;
        type Output = ProvisionOutput;

        fn new(input: Self::Input) -> Self {
            Self {
                steps: input.steps,
                next: 0,
                provisioned: vec![],
                failed: None,
                done: false,
            }
        }

        fn on_start(&mut self) -> Vec<WorkflowAction> {
            if self.steps.is_empty() {
                self.done = true;
                return vec![WorkflowAction::complete(json!({"provisioned": []}))];
            }
            vec![self.step_action()]
        }

        fn on_activity_completed(
            &mut self,
            _activity_id: &str,
            result: serde_json::Value,
        ) -> Vec<WorkflowAction> {
            let step = result["step"].as_str().unwrap_or_default().to_string();
            self.provisioned.push(step.clone());
            self.next += 1;

            let mut actions = vec![WorkflowAction::compensation(
                format!("undo-{step}"),
                "unprovision",
                json!({"step": step}),
            )];

            if self.next < self.steps.len() {
                actions.push(self.step_action());
            } else {
                self.done = true;
                actions.push(WorkflowAction::complete(
                    json!({"provisioned": self.provisioned}),
                ));
            }
            actions
        }

        fn on_activity_failed(
            &mut self,
            _activity_id: &str,
            error: &ActivityError,
        ) -> Vec<WorkflowAction> {
            let error = WorkflowError::from(error);
            self.failed = Some(error.clone());
            vec![WorkflowAction::fail(error)]
        }

        fn is_completed(&self) -> bool {
            self.done || self.failed.is_some()
        }

        fn result(&self) -> Option<Self::Output> {
            (self.done && self.failed.is_none()).then(|| ProvisionOutput {
                provisioned: self.provisioned.clone(),
            })
        }

        fn error(&self) -> Option<WorkflowError> {
            self.failed.clone()
        }
    }

    fn executor() -> WorkflowExecutor<InMemoryEngineStore> {
        let mut executor = WorkflowExecutor::new(Arc::new(InMemoryEngineStore::new()));
        executor.register::<ProvisionWorkflow>();
        executor
    }

    async fn start(
        executor: &WorkflowExecutor<InMemoryEngineStore>,
        workflow_id: &str,
        steps: &[&str],
    ) -> Uuid {
        executor
            .start_workflow(
                "provision",
                workflow_id,
                json!({"steps": steps}),
                "test-queue",
                None,
                ReusePolicy::RejectDuplicate,
                CancellationPolicy::default(),
            )
            .await
            .expect("start should succeed")
    }

    #[tokio::test]
    async fn test_start_schedules_first_activity() {
        let executor = executor();
        let run_id = start(&executor, "wf-1", &["dns"]).await;

        let record = executor.store().get_execution_by_run(run_id).await.unwrap();
        assert_eq!(record.status, WorkflowStatus::Running);
        assert_eq!(executor.store().pending_task_count(), 1);

        let events = executor.store().load_run_events(run_id).await.unwrap();
        assert!(matches!(events[0].1, RunEvent::WorkflowStarted { .. }));
        assert!(matches!(events[1].1, RunEvent::ActivityScheduled { .. }));
    }

    #[tokio::test]
    async fn test_immediate_completion() {
        let executor = executor();
        let run_id = start(&executor, "wf-empty", &[]).await;

        let record = executor.store().get_execution_by_run(run_id).await.unwrap();
        assert_eq!(record.status, WorkflowStatus::Completed);
    }

    #[tokio::test]
    async fn test_duplicate_start_surfaces_already_exists() {
        let executor = executor();
        let first_run = start(&executor, "wf-dup", &["dns"]).await;

        let result = executor
            .start_workflow(
                "provision",
                "wf-dup",
                json!({"steps": ["dns"]}),
                "test-queue",
                None,
                ReusePolicy::RejectDuplicate,
                CancellationPolicy::default(),
            )
            .await;

        match result {
            Err(ExecutorError::Store(EngineStoreError::AlreadyExists { run_id, .. })) => {
                assert_eq!(run_id, first_run);
            }
            other => panic!("expected AlreadyExists, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_completion_chains_activities() {
        let executor = executor();
        let run_id = start(&executor, "wf-chain", &["dns", "email"]).await;

        executor
            .on_activity_completed(run_id, "provision-dns", json!({"step": "dns"}))
            .await
            .unwrap();

        // Second activity scheduled, workflow still running.
        let record = executor.store().get_execution_by_run(run_id).await.unwrap();
        assert_eq!(record.status, WorkflowStatus::Running);

        executor
            .on_activity_completed(run_id, "provision-email", json!({"step": "email"}))
            .await
            .unwrap();

        let record = executor.store().get_execution_by_run(run_id).await.unwrap();
        assert_eq!(record.status, WorkflowStatus::Completed);
        assert_eq!(
            record.result,
            Some(json!({"provisioned": ["dns", "email"]}))
        );
    }

    #[tokio::test]
    async fn test_failure_without_compensations_fails_directly() {
        let executor = executor();
        let run_id = start(&executor, "wf-fail", &["dns"]).await;

        executor
            .on_activity_failed(
                run_id,
                "provision-dns",
                ActivityError::transient("dns provider down"),
                false,
            )
            .await
            .unwrap();

        let record = executor.store().get_execution_by_run(run_id).await.unwrap();
        assert_eq!(record.status, WorkflowStatus::Failed);
        assert_eq!(record.error.unwrap().message, "dns provider down");
    }

    #[tokio::test]
    async fn test_saga_runs_compensations_in_reverse_order() {
        let executor = executor();
        let run_id = start(&executor, "wf-saga", &["org", "dns", "email"]).await;

        executor
            .on_activity_completed(run_id, "provision-org", json!({"step": "org"}))
            .await
            .unwrap();
        executor
            .on_activity_completed(run_id, "provision-dns", json!({"step": "dns"}))
            .await
            .unwrap();
        executor
            .on_activity_failed(
                run_id,
                "provision-email",
                ActivityError::transient("smtp gone"),
                false,
            )
            .await
            .unwrap();

        // Saga underway: most recent side effect compensates first.
        let record = executor.store().get_execution_by_run(run_id).await.unwrap();
        assert_eq!(record.status, WorkflowStatus::Compensating);

        let tasks = executor
            .store()
            .claim_tasks("w", &["test-queue".to_string()], 10)
            .await
            .unwrap();
        let compensations: Vec<_> = tasks
            .iter()
            .filter(|t| t.kind == TaskKind::Compensation)
            .collect();
        assert_eq!(compensations.len(), 1);
        assert_eq!(compensations[0].activity_id, "undo-dns");

        // First compensation done; the next one (undo-org) is enqueued
        // even though this one failed.
        executor
            .on_compensation_finished(run_id, "undo-dns", Err("undo failed".to_string()))
            .await
            .unwrap();

        let tasks = executor
            .store()
            .claim_tasks("w", &["test-queue".to_string()], 10)
            .await
            .unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].activity_id, "undo-org");

        executor
            .on_compensation_finished(run_id, "undo-org", Ok(()))
            .await
            .unwrap();

        // Failure path settles as failed (scenario: exhausted retries).
        let record = executor.store().get_execution_by_run(run_id).await.unwrap();
        assert_eq!(record.status, WorkflowStatus::Failed);
        assert_eq!(record.error.unwrap().message, "smtp gone");

        // History shows the whole saga.
        let events = executor.store().load_run_events(run_id).await.unwrap();
        let types: Vec<&str> = events.iter().map(|(_, e)| e.type_name()).collect();
        assert!(types.contains(&"compensation_failed"));
        assert!(types.contains(&"compensation_completed"));
    }

    #[tokio::test]
    async fn test_validation_failure_skips_compensation() {
        let executor = executor();
        let run_id = start(&executor, "wf-val", &["org", "dns"]).await;

        executor
            .on_activity_completed(run_id, "provision-org", json!({"step": "org"}))
            .await
            .unwrap();
        executor
            .on_activity_failed(
                run_id,
                "provision-dns",
                ActivityError::validation("subdomain malformed"),
                false,
            )
            .await
            .unwrap();

        // Validation failures do not trigger the saga.
        let record = executor.store().get_execution_by_run(run_id).await.unwrap();
        assert_eq!(record.status, WorkflowStatus::Failed);
    }

    #[tokio::test]
    async fn test_cancel_runs_compensations() {
        let executor = executor();
        let run_id = start(&executor, "wf-cancel", &["org", "dns"]).await;

        executor
            .on_activity_completed(run_id, "provision-org", json!({"step": "org"}))
            .await
            .unwrap();

        executor
            .cancel_workflow("wf-cancel", "operator request")
            .await
            .unwrap();

        let record = executor.store().get_execution_by_run(run_id).await.unwrap();
        assert_eq!(record.status, WorkflowStatus::Compensating);

        let tasks = executor
            .store()
            .claim_tasks("w", &["test-queue".to_string()], 10)
            .await
            .unwrap();
        let compensation = tasks.iter().find(|t| t.kind == TaskKind::Compensation);
        assert_eq!(compensation.unwrap().activity_id, "undo-org");

        executor
            .on_compensation_finished(run_id, "undo-org", Ok(()))
            .await
            .unwrap();

        let record = executor.store().get_execution_by_run(run_id).await.unwrap();
        assert_eq!(record.status, WorkflowStatus::Compensated);
    }

    #[tokio::test]
    async fn test_cancel_without_side_effects_is_cancelled() {
        let executor = executor();
        let run_id = start(&executor, "wf-cancel-clean", &["org"]).await;

        executor
            .cancel_workflow("wf-cancel-clean", "operator request")
            .await
            .unwrap();

        let record = executor.store().get_execution_by_run(run_id).await.unwrap();
        assert_eq!(record.status, WorkflowStatus::Cancelled);

        // Cancelling again is an error.
        assert!(matches!(
            executor.cancel_workflow("wf-cancel-clean", "again").await,
            Err(ExecutorError::WorkflowTerminal(_))
        ));
    }

    #[tokio::test]
    async fn test_retry_failures_do_not_reach_workflow() {
        let executor = executor();
        let run_id = start(&executor, "wf-retry", &["dns"]).await;

        executor
            .on_activity_failed(
                run_id,
                "provision-dns",
                ActivityError::transient("blip"),
                true,
            )
            .await
            .unwrap();

        // Still running; the failure is only in the history.
        let record = executor.store().get_execution_by_run(run_id).await.unwrap();
        assert_eq!(record.status, WorkflowStatus::Running);

        let events = executor.store().load_run_events(run_id).await.unwrap();
        assert!(events.iter().any(|(_, e)| matches!(
            e,
            RunEvent::ActivityFailed {
                will_retry: true,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn test_workflow_timeout_enters_saga() {
        let executor = executor();
        let run_id = start(&executor, "wf-timeout", &["org", "dns"]).await;

        executor
            .on_activity_completed(run_id, "provision-org", json!({"step": "org"}))
            .await
            .unwrap();

        executor.on_workflow_timeout(run_id).await.unwrap();

        let record = executor.store().get_execution_by_run(run_id).await.unwrap();
        assert_eq!(record.status, WorkflowStatus::Compensating);

        executor
            .on_compensation_finished(run_id, "undo-org", Ok(()))
            .await
            .unwrap();

        let record = executor.store().get_execution_by_run(run_id).await.unwrap();
        assert_eq!(record.status, WorkflowStatus::Failed);
        assert_eq!(
            record.error.unwrap().kind,
            careflow_core::error::ErrorKind::Timeout
        );
    }

    #[tokio::test]
    async fn test_durable_timer_flow() {
        use std::time::Duration as StdDuration;

        #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
        struct WaitInput {}

        struct WaitWorkflow {
            done: bool,
        }

        impl crate::workflow::Workflow for WaitWorkflow {
            const TYPE: &'static str = "wait";
            type Input = WaitInput;
            type Output = WaitInput;

            fn new(_input: Self::Input) -> Self {
                Self { done: false }
            }

            fn on_start(&mut self) -> Vec<WorkflowAction> {
                vec![WorkflowAction::timer("cool-off", StdDuration::from_secs(60))]
            }

            fn on_activity_completed(&mut self, _: &str, _: serde_json::Value) -> Vec<WorkflowAction> {
                vec![]
            }

            fn on_activity_failed(&mut self, _: &str, _: &ActivityError) -> Vec<WorkflowAction> {
                vec![]
            }

            fn on_timer_fired(&mut self, _timer_id: &str) -> Vec<WorkflowAction> {
                self.done = true;
                vec![WorkflowAction::complete(json!({}))]
            }

            fn is_completed(&self) -> bool {
                self.done
            }

            fn result(&self) -> Option<Self::Output> {
                self.done.then_some(WaitInput {})
            }
        }

        let mut executor = WorkflowExecutor::new(Arc::new(InMemoryEngineStore::new()));
        executor.register::<WaitWorkflow>();

        let run_id = executor
            .start_workflow(
                "wait",
                "wait-1",
                json!({}),
                "test-queue",
                None,
                ReusePolicy::RejectDuplicate,
                CancellationPolicy::default(),
            )
            .await
            .unwrap();

        // The timer is durable and not yet due.
        let due = executor.store().due_timers(Utc::now()).await.unwrap();
        assert!(due.is_empty());

        let due = executor
            .store()
            .due_timers(Utc::now() + chrono::Duration::seconds(120))
            .await
            .unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].timer_id, "cool-off");

        // Firing it resumes and completes the workflow.
        executor.store().mark_timer_fired(due[0].id).await.unwrap();
        executor.on_timer_fired(run_id, "cool-off").await.unwrap();

        let record = executor.store().get_execution_by_run(run_id).await.unwrap();
        assert_eq!(record.status, WorkflowStatus::Completed);
    }

    #[tokio::test]
    async fn test_signals_are_delivered_once() {
        let executor = executor();
        let run_id = start(&executor, "wf-signal", &["dns"]).await;

        executor
            .store()
            .send_signal(run_id, WorkflowSignal::new("poke", json!({})))
            .await
            .unwrap();

        assert_eq!(executor.process_signals(run_id).await.unwrap(), 1);
        assert_eq!(executor.process_signals(run_id).await.unwrap(), 0);
    }
}
