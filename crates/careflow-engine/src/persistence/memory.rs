//! In-memory implementation of EngineStore for testing
//!
//! Same semantics as the PostgreSQL implementation, including task
//! visibility delays and deterministic `AlreadyExists` behavior.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::workflow::{RunEvent, WorkflowError, WorkflowSignal};

use super::store::*;

struct ExecutionState {
    record: ExecutionRecord,
}

struct RunState {
    events: Vec<RunEvent>,
    signals: Vec<WorkflowSignal>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum TaskStatus {
    Pending,
    Claimed,
    Completed,
    Failed,
    Cancelled,
}

struct TaskState {
    definition: TaskDefinition,
    status: TaskStatus,
    attempt: u32,
    visible_at: DateTime<Utc>,
    claimed_by: Option<String>,
    claimed_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

struct TimerState {
    record: TimerRecord,
    fired_at: Option<DateTime<Utc>>,
}

struct Inner {
    executions: HashMap<String, ExecutionState>,
    runs_by_id: HashMap<Uuid, String>,
    histories: HashMap<Uuid, RunState>,
    tasks: HashMap<Uuid, TaskState>,
    timers: HashMap<Uuid, TimerState>,
}

/// In-memory engine store.
pub struct InMemoryEngineStore {
    inner: RwLock<Inner>,
}

impl InMemoryEngineStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                executions: HashMap::new(),
                runs_by_id: HashMap::new(),
                histories: HashMap::new(),
                tasks: HashMap::new(),
                timers: HashMap::new(),
            }),
        }
    }

    pub fn pending_task_count(&self) -> usize {
        self.inner
            .read()
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .count()
    }

    /// The next instant at which anything becomes runnable: a pending
    /// task's visibility or an unfired timer. Used by the local runner to
    /// sleep exactly as long as needed.
    pub fn next_wake_at(&self) -> Option<DateTime<Utc>> {
        let inner = self.inner.read();
        let task_wake = inner
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .map(|t| t.visible_at)
            .min();
        let timer_wake = inner
            .timers
            .values()
            .filter(|t| t.fired_at.is_none())
            .map(|t| t.record.fire_at)
            .min();
        match (task_wake, timer_wake) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Shift every future timestamp backward by `delta`, simulating the
    /// passage of time. Test-only plumbing for the local runner: retries,
    /// timers and deadlines become due without wall-clock waits.
    pub fn advance_time(&self, delta: chrono::Duration) {
        let mut inner = self.inner.write();
        for task in inner.tasks.values_mut() {
            task.visible_at -= delta;
            if let Some(at) = task.claimed_at.as_mut() {
                *at -= delta;
            }
        }
        for timer in inner.timers.values_mut() {
            timer.record.fire_at -= delta;
        }
        for execution in inner.executions.values_mut() {
            if let Some(at) = execution.record.deadline_at.as_mut() {
                *at -= delta;
            }
        }
    }

    fn execution_record(
        inner: &Inner,
        workflow_id: &str,
    ) -> Result<ExecutionRecord, EngineStoreError> {
        inner
            .executions
            .get(workflow_id)
            .map(|e| e.record.clone())
            .ok_or_else(|| EngineStoreError::WorkflowNotFound(workflow_id.to_string()))
    }
}

impl Default for InMemoryEngineStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EngineStore for InMemoryEngineStore {
    async fn create_workflow(
        &self,
        new: NewExecution,
        reuse: ReusePolicy,
    ) -> Result<(), EngineStoreError> {
        let mut inner = self.inner.write();

        if let Some(existing) = inner.executions.get(&new.workflow_id) {
            let allowed = reuse == ReusePolicy::AllowAfterTerminal
                && existing.record.status.is_terminal();
            if !allowed {
                return Err(EngineStoreError::AlreadyExists {
                    workflow_id: new.workflow_id.clone(),
                    run_id: existing.record.run_id,
                    status: existing.record.status,
                });
            }
        }

        let record = ExecutionRecord {
            workflow_id: new.workflow_id.clone(),
            run_id: new.run_id,
            workflow_type: new.workflow_type,
            status: WorkflowStatus::Pending,
            input: new.input,
            result: None,
            error: None,
            task_queue: new.task_queue,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            deadline_at: new.deadline_at,
        };

        inner
            .runs_by_id
            .insert(new.run_id, new.workflow_id.clone());
        inner.histories.insert(
            new.run_id,
            RunState {
                events: vec![],
                signals: vec![],
            },
        );
        inner
            .executions
            .insert(new.workflow_id, ExecutionState { record });
        Ok(())
    }

    async fn get_execution(&self, workflow_id: &str) -> Result<ExecutionRecord, EngineStoreError> {
        Self::execution_record(&self.inner.read(), workflow_id)
    }

    async fn get_execution_by_run(
        &self,
        run_id: Uuid,
    ) -> Result<ExecutionRecord, EngineStoreError> {
        let inner = self.inner.read();
        let workflow_id = inner
            .runs_by_id
            .get(&run_id)
            .ok_or(EngineStoreError::RunNotFound(run_id))?;
        Self::execution_record(&inner, workflow_id)
    }

    async fn update_status(
        &self,
        run_id: Uuid,
        status: WorkflowStatus,
        result: Option<serde_json::Value>,
        error: Option<WorkflowError>,
    ) -> Result<(), EngineStoreError> {
        let mut inner = self.inner.write();
        let workflow_id = inner
            .runs_by_id
            .get(&run_id)
            .cloned()
            .ok_or(EngineStoreError::RunNotFound(run_id))?;
        let execution = inner
            .executions
            .get_mut(&workflow_id)
            .ok_or_else(|| EngineStoreError::WorkflowNotFound(workflow_id.clone()))?;

        execution.record.status = status;
        if let Some(result) = result {
            execution.record.result = Some(result);
        }
        if let Some(error) = error {
            execution.record.error = Some(error);
        }
        match status {
            WorkflowStatus::Running if execution.record.started_at.is_none() => {
                execution.record.started_at = Some(Utc::now());
            }
            s if s.is_terminal() => {
                execution.record.ended_at = Some(Utc::now());
            }
            _ => {}
        }
        Ok(())
    }

    async fn expired_executions(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExecutionRecord>, EngineStoreError> {
        let inner = self.inner.read();
        Ok(inner
            .executions
            .values()
            .filter(|e| !e.record.status.is_terminal())
            .filter(|e| e.record.status != WorkflowStatus::Pending)
            .filter(|e| e.record.deadline_at.is_some_and(|d| d <= now))
            .map(|e| e.record.clone())
            .collect())
    }

    async fn append_run_events(
        &self,
        run_id: Uuid,
        expected_sequence: i64,
        events: Vec<RunEvent>,
    ) -> Result<i64, EngineStoreError> {
        let mut inner = self.inner.write();
        let history = inner
            .histories
            .get_mut(&run_id)
            .ok_or(EngineStoreError::RunNotFound(run_id))?;

        let current = history.events.len() as i64;
        if current != expected_sequence {
            return Err(EngineStoreError::ConcurrencyConflict {
                expected: expected_sequence,
                actual: current,
            });
        }

        history.events.extend(events);
        Ok(history.events.len() as i64)
    }

    async fn load_run_events(
        &self,
        run_id: Uuid,
    ) -> Result<Vec<(i64, RunEvent)>, EngineStoreError> {
        let inner = self.inner.read();
        let history = inner
            .histories
            .get(&run_id)
            .ok_or(EngineStoreError::RunNotFound(run_id))?;

        Ok(history
            .events
            .iter()
            .enumerate()
            .map(|(i, e)| (i as i64, e.clone()))
            .collect())
    }

    async fn enqueue_task(&self, task: TaskDefinition) -> Result<Uuid, EngineStoreError> {
        let task_id = Uuid::now_v7();
        let mut inner = self.inner.write();
        inner.tasks.insert(
            task_id,
            TaskState {
                definition: task,
                status: TaskStatus::Pending,
                attempt: 0,
                visible_at: Utc::now(),
                claimed_by: None,
                claimed_at: None,
                last_error: None,
            },
        );
        Ok(task_id)
    }

    async fn claim_tasks(
        &self,
        worker_id: &str,
        task_queues: &[String],
        max_tasks: usize,
    ) -> Result<Vec<ClaimedTask>, EngineStoreError> {
        let now = Utc::now();
        let mut inner = self.inner.write();
        let mut claimable: Vec<(Uuid, DateTime<Utc>)> = inner
            .tasks
            .iter()
            .filter(|(_, t)| t.status == TaskStatus::Pending)
            .filter(|(_, t)| t.visible_at <= now)
            .filter(|(_, t)| task_queues.contains(&t.definition.task_queue))
            .map(|(id, t)| (*id, t.visible_at))
            .collect();
        claimable.sort_by_key(|(_, visible_at)| *visible_at);
        claimable.truncate(max_tasks);

        let mut claimed = Vec::with_capacity(claimable.len());
        for (task_id, _) in claimable {
            let Some(task) = inner.tasks.get_mut(&task_id) else {
                continue;
            };
            task.status = TaskStatus::Claimed;
            task.claimed_by = Some(worker_id.to_string());
            task.claimed_at = Some(now);
            task.attempt += 1;

            claimed.push(ClaimedTask {
                id: task_id,
                run_id: task.definition.run_id,
                workflow_id: task.definition.workflow_id.clone(),
                workflow_type: task.definition.workflow_type.clone(),
                activity_id: task.definition.activity_id.clone(),
                activity_type: task.definition.activity_type.clone(),
                kind: task.definition.kind,
                input: task.definition.input.clone(),
                options: task.definition.options.clone(),
                attempt: task.attempt,
                max_attempts: task.definition.options.retry_policy.max_attempts,
            });
        }

        Ok(claimed)
    }

    async fn complete_task(&self, task_id: Uuid) -> Result<(), EngineStoreError> {
        let mut inner = self.inner.write();
        let task = inner
            .tasks
            .get_mut(&task_id)
            .ok_or(EngineStoreError::TaskNotFound(task_id))?;
        task.status = TaskStatus::Completed;
        Ok(())
    }

    async fn fail_task(
        &self,
        task_id: Uuid,
        error: &str,
        retryable: bool,
        retry_after: Option<Duration>,
    ) -> Result<TaskFailureOutcome, EngineStoreError> {
        let mut inner = self.inner.write();
        let task = inner
            .tasks
            .get_mut(&task_id)
            .ok_or(EngineStoreError::TaskNotFound(task_id))?;

        task.last_error = Some(error.to_string());

        let policy = &task.definition.options.retry_policy;
        if retryable && policy.has_attempts_remaining(task.attempt) {
            let delay = policy.delay_with_retry_after(task.attempt + 1, retry_after);
            task.status = TaskStatus::Pending;
            task.claimed_by = None;
            task.claimed_at = None;
            task.visible_at = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            Ok(TaskFailureOutcome::WillRetry {
                next_attempt: task.attempt + 1,
                delay,
            })
        } else {
            task.status = TaskStatus::Failed;
            Ok(TaskFailureOutcome::Exhausted)
        }
    }

    async fn cancel_pending_tasks(&self, run_id: Uuid) -> Result<usize, EngineStoreError> {
        let mut inner = self.inner.write();
        let mut cancelled = 0;
        for task in inner.tasks.values_mut() {
            if task.definition.run_id == run_id && task.status == TaskStatus::Pending {
                task.status = TaskStatus::Cancelled;
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    async fn reclaim_stale_tasks(
        &self,
        stale_threshold: Duration,
    ) -> Result<Vec<Uuid>, EngineStoreError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(stale_threshold)
                .unwrap_or_else(|_| chrono::Duration::zero());

        let mut inner = self.inner.write();
        let mut reclaimed = vec![];
        for (task_id, task) in inner.tasks.iter_mut() {
            if task.status == TaskStatus::Claimed
                && task.claimed_at.is_some_and(|at| at < cutoff)
            {
                task.status = TaskStatus::Pending;
                task.claimed_by = None;
                task.claimed_at = None;
                reclaimed.push(*task_id);
            }
        }
        Ok(reclaimed)
    }

    async fn schedule_timer(
        &self,
        run_id: Uuid,
        workflow_id: &str,
        timer_id: &str,
        fire_at: DateTime<Utc>,
    ) -> Result<(), EngineStoreError> {
        let mut inner = self.inner.write();
        let id = Uuid::now_v7();
        inner.timers.insert(
            id,
            TimerState {
                record: TimerRecord {
                    id,
                    run_id,
                    workflow_id: workflow_id.to_string(),
                    timer_id: timer_id.to_string(),
                    fire_at,
                },
                fired_at: None,
            },
        );
        Ok(())
    }

    async fn due_timers(&self, now: DateTime<Utc>) -> Result<Vec<TimerRecord>, EngineStoreError> {
        let inner = self.inner.read();
        let mut due: Vec<TimerRecord> = inner
            .timers
            .values()
            .filter(|t| t.fired_at.is_none() && t.record.fire_at <= now)
            .map(|t| t.record.clone())
            .collect();
        due.sort_by_key(|t| t.fire_at);
        Ok(due)
    }

    async fn mark_timer_fired(&self, id: Uuid) -> Result<(), EngineStoreError> {
        let mut inner = self.inner.write();
        if let Some(timer) = inner.timers.get_mut(&id) {
            timer.fired_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn send_signal(
        &self,
        run_id: Uuid,
        signal: WorkflowSignal,
    ) -> Result<(), EngineStoreError> {
        let mut inner = self.inner.write();
        let history = inner
            .histories
            .get_mut(&run_id)
            .ok_or(EngineStoreError::RunNotFound(run_id))?;
        history.signals.push(signal);
        Ok(())
    }

    async fn pending_signals(
        &self,
        run_id: Uuid,
    ) -> Result<Vec<WorkflowSignal>, EngineStoreError> {
        let inner = self.inner.read();
        let history = inner
            .histories
            .get(&run_id)
            .ok_or(EngineStoreError::RunNotFound(run_id))?;
        Ok(history.signals.clone())
    }

    async fn mark_signals_processed(
        &self,
        run_id: Uuid,
        count: usize,
    ) -> Result<(), EngineStoreError> {
        let mut inner = self.inner.write();
        let history = inner
            .histories
            .get_mut(&run_id)
            .ok_or(EngineStoreError::RunNotFound(run_id))?;
        history.signals = history
            .signals
            .split_off(count.min(history.signals.len()));
        Ok(())
    }
}
