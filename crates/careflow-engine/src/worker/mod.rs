//! Workers: task execution, sweeps, and the deterministic local runner

mod pool;
mod runner;

pub use pool::{WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerPoolStatus};
pub use runner::{LocalRunner, RunnerError};

use std::sync::Arc;

use tracing::{debug, warn};

use crate::activity::{ActivityContext, ActivityError, EventEmitter};
use crate::engine::{ActivityRegistry, ExecutorError, WorkflowExecutor};
use crate::persistence::{ClaimedTask, EngineStore, TaskFailureOutcome, TaskKind};

/// Execute one claimed task and report the outcome to the executor.
///
/// Shared by the worker pool and the local runner so both drive the
/// engine through exactly the same path.
pub(crate) async fn execute_claimed_task<S: EngineStore>(
    store: &Arc<S>,
    executor: &WorkflowExecutor<S>,
    activities: &ActivityRegistry,
    emitter: Option<&Arc<EventEmitter>>,
    task: ClaimedTask,
) -> Result<(), ExecutorError> {
    let mut ctx = ActivityContext::new(
        task.workflow_id.clone(),
        task.run_id,
        task.workflow_type.clone(),
        task.activity_id.clone(),
    )
    .with_attempt(task.attempt, task.max_attempts);
    if let Some(emitter) = emitter {
        ctx = ctx.with_emitter(Arc::clone(emitter));
    }

    debug!(
        workflow_id = %task.workflow_id,
        activity_id = %task.activity_id,
        activity_type = %task.activity_type,
        attempt = task.attempt,
        "executing task"
    );

    let outcome = tokio::time::timeout(
        task.options.start_to_close_timeout,
        activities.execute(&task.activity_type, ctx, task.input.clone()),
    )
    .await;

    match outcome {
        Ok(Ok(result)) => {
            store.complete_task(task.id).await?;
            match task.kind {
                TaskKind::Activity => {
                    executor
                        .on_activity_completed(task.run_id, &task.activity_id, result)
                        .await
                }
                TaskKind::Compensation => {
                    executor
                        .on_compensation_finished(task.run_id, &task.activity_id, Ok(()))
                        .await
                }
            }
        }

        Ok(Err(error)) => {
            let failure = store
                .fail_task(
                    task.id,
                    &error.to_string(),
                    error.is_retryable(),
                    error.retry_after,
                )
                .await?;

            match (task.kind, failure) {
                (TaskKind::Activity, TaskFailureOutcome::WillRetry { next_attempt, delay }) => {
                    debug!(
                        activity_id = %task.activity_id,
                        next_attempt,
                        ?delay,
                        "activity will retry"
                    );
                    executor
                        .on_activity_failed(task.run_id, &task.activity_id, error, true)
                        .await
                }
                (TaskKind::Activity, TaskFailureOutcome::Exhausted) => {
                    executor
                        .on_activity_failed(task.run_id, &task.activity_id, error, false)
                        .await
                }
                (TaskKind::Compensation, TaskFailureOutcome::WillRetry { .. }) => {
                    // The retry itself carries the chain forward.
                    Ok(())
                }
                (TaskKind::Compensation, TaskFailureOutcome::Exhausted) => {
                    executor
                        .on_compensation_finished(
                            task.run_id,
                            &task.activity_id,
                            Err(error.to_string()),
                        )
                        .await
                }
            }
        }

        Err(_elapsed) => {
            let error = ActivityError::timeout(format!(
                "activity {} exceeded its start-to-close timeout",
                task.activity_id
            ));
            warn!(activity_id = %task.activity_id, "activity timed out");

            let failure = store
                .fail_task(task.id, &error.to_string(), true, None)
                .await?;

            match (task.kind, failure) {
                (TaskKind::Activity, TaskFailureOutcome::WillRetry { .. }) => {
                    executor
                        .on_activity_timed_out(task.run_id, &task.activity_id, true)
                        .await
                }
                (TaskKind::Activity, TaskFailureOutcome::Exhausted) => {
                    executor
                        .on_activity_timed_out(task.run_id, &task.activity_id, false)
                        .await
                }
                (TaskKind::Compensation, TaskFailureOutcome::WillRetry { .. }) => Ok(()),
                (TaskKind::Compensation, TaskFailureOutcome::Exhausted) => {
                    executor
                        .on_compensation_finished(
                            task.run_id,
                            &task.activity_id,
                            Err(error.to_string()),
                        )
                        .await
                }
            }
        }
    }
}
