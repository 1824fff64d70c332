//! Deterministic in-process runner
//!
//! Drives a single workflow to its terminal state against the in-memory
//! store: claims and executes tasks serially, fires due timers, applies
//! the workflow deadline, and advances the store's virtual time instead
//! of sleeping. Tests get the full engine path (retries, saga,
//! timeouts) without wall-clock waits or background tasks.

use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use crate::activity::EventEmitter;
use crate::engine::{ActivityRegistry, ExecutorError, WorkflowExecutor};
use crate::EngineStore;
use crate::persistence::{
    EngineStoreError, ExecutionRecord, InMemoryEngineStore,
};

use super::execute_claimed_task;

/// Iteration cap; a workflow that schedules this much work in one drive
/// is stuck in a loop.
const MAX_STEPS: u32 = 10_000;

/// Errors from driving a workflow.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Store(#[from] EngineStoreError),

    #[error("runner stalled after {0} steps")]
    Stalled(u32),
}

/// Drives workflows to completion deterministically.
pub struct LocalRunner {
    store: Arc<InMemoryEngineStore>,
    executor: Arc<WorkflowExecutor<InMemoryEngineStore>>,
    activities: Arc<ActivityRegistry>,
    emitter: Option<Arc<EventEmitter>>,
}

impl LocalRunner {
    pub fn new(
        store: Arc<InMemoryEngineStore>,
        executor: Arc<WorkflowExecutor<InMemoryEngineStore>>,
        activities: Arc<ActivityRegistry>,
    ) -> Self {
        Self {
            store,
            executor,
            activities,
            emitter: None,
        }
    }

    pub fn with_emitter(mut self, emitter: Arc<EventEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    /// Run until the workflow reaches a terminal state, or until it is
    /// suspended with nothing left to wake it (awaiting a signal).
    pub async fn drive(&self, workflow_id: &str) -> Result<ExecutionRecord, RunnerError> {
        for _step in 0..MAX_STEPS {
            let record = self.store.get_execution(workflow_id).await?;
            if record.status.is_terminal() {
                return Ok(record);
            }

            let now = Utc::now();

            // Deadline beats everything else.
            let expired = self.store.expired_executions(now).await?;
            if expired.iter().any(|r| r.run_id == record.run_id) {
                self.executor.on_workflow_timeout(record.run_id).await?;
                continue;
            }

            // Due timers next.
            let due = self.store.due_timers(now).await?;
            if !due.is_empty() {
                for timer in due {
                    self.store.mark_timer_fired(timer.id).await?;
                    self.executor
                        .on_timer_fired(timer.run_id, &timer.timer_id)
                        .await?;
                }
                continue;
            }

            // One task at a time keeps execution order deterministic.
            let claimed = self
                .store
                .claim_tasks("local-runner", &[record.task_queue.clone()], 1)
                .await?;
            if let Some(task) = claimed.into_iter().next() {
                execute_claimed_task(
                    &self.store,
                    &self.executor,
                    &self.activities,
                    self.emitter.as_ref(),
                    task,
                )
                .await?;
                continue;
            }

            // Nothing runnable: fast-forward virtual time to the next
            // wake-up (retry visibility, timer, or the deadline).
            let mut target = self.store.next_wake_at();
            if let Some(deadline) = record.deadline_at {
                target = Some(target.map_or(deadline, |t| t.min(deadline)));
            }

            match target {
                Some(at) if at > now => {
                    let gap = at - now + chrono::Duration::milliseconds(1);
                    debug!(?gap, "fast-forwarding virtual time");
                    self.store.advance_time(gap);
                }
                Some(_) => {
                    // Already due; loop and pick it up.
                }
                None => {
                    // Suspended on an external signal.
                    return Ok(record);
                }
            }
        }

        Err(RunnerError::Stalled(MAX_STEPS))
    }
}
