//! PostgreSQL implementation of EngineStore
//!
//! Idempotent starts ride on the primary key of `workflow_executions`;
//! task claiming uses SKIP LOCKED; the run history uses optimistic
//! sequence checks.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use crate::workflow::{ActivityOptions, RunEvent, WorkflowError, WorkflowSignal};

use super::store::*;

const EXECUTION_COLUMNS: &str = "workflow_id, run_id, workflow_type, status, input, result, \
     error, task_queue, created_at, started_at, ended_at, deadline_at";

/// PostgreSQL engine store.
#[derive(Clone)]
pub struct PostgresEngineStore {
    pool: PgPool,
}

impl PostgresEngineStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl EngineStore for PostgresEngineStore {
    #[instrument(skip(self, new), fields(workflow_id = %new.workflow_id, workflow_type = %new.workflow_type))]
    async fn create_workflow(
        &self,
        new: NewExecution,
        reuse: ReusePolicy,
    ) -> Result<(), EngineStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| EngineStoreError::Database(e.to_string()))?;

        let existing = sqlx::query(
            "SELECT run_id, status FROM workflow_executions WHERE workflow_id = $1 FOR UPDATE",
        )
        .bind(&new.workflow_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| EngineStoreError::Database(e.to_string()))?;

        if let Some(row) = existing {
            let run_id: Uuid = row.get("run_id");
            let status = WorkflowStatus::parse(row.get::<String, _>("status").as_str())?;
            let allowed = reuse == ReusePolicy::AllowAfterTerminal && status.is_terminal();

            if !allowed {
                return Err(EngineStoreError::AlreadyExists {
                    workflow_id: new.workflow_id.clone(),
                    run_id,
                    status,
                });
            }

            // Fresh run under the same deterministic id; the previous
            // run's history stays under its own run_id.
            sqlx::query(
                r#"
                UPDATE workflow_executions
                SET run_id = $2,
                    workflow_type = $3,
                    status = 'pending',
                    input = $4,
                    result = NULL,
                    error = NULL,
                    task_queue = $5,
                    created_at = NOW(),
                    started_at = NULL,
                    ended_at = NULL,
                    deadline_at = $6
                WHERE workflow_id = $1
                "#,
            )
            .bind(&new.workflow_id)
            .bind(new.run_id)
            .bind(&new.workflow_type)
            .bind(&new.input)
            .bind(&new.task_queue)
            .bind(new.deadline_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| EngineStoreError::Database(e.to_string()))?;
        } else {
            let insert = sqlx::query(
                r#"
                INSERT INTO workflow_executions
                    (workflow_id, run_id, workflow_type, status, input, task_queue,
                     cancellation_policy, deadline_at)
                VALUES ($1, $2, $3, 'pending', $4, $5, $6, $7)
                "#,
            )
            .bind(&new.workflow_id)
            .bind(new.run_id)
            .bind(&new.workflow_type)
            .bind(&new.input)
            .bind(&new.task_queue)
            .bind(match new.cancellation_policy {
                CancellationPolicy::AbandonPendingChildren => "abandon_pending_children",
            })
            .bind(new.deadline_at)
            .execute(&mut *tx)
            .await;

            if let Err(e) = insert {
                // Two replicas racing the same deterministic id: one wins
                // the insert, the other reads the winner back.
                let conflict = e
                    .as_database_error()
                    .map(|db| db.is_unique_violation())
                    .unwrap_or(false);
                if conflict {
                    drop(tx);
                    let winner = self.get_execution(&new.workflow_id).await?;
                    return Err(EngineStoreError::AlreadyExists {
                        workflow_id: winner.workflow_id,
                        run_id: winner.run_id,
                        status: winner.status,
                    });
                }
                return Err(EngineStoreError::Database(e.to_string()));
            }
        }

        tx.commit()
            .await
            .map_err(|e| EngineStoreError::Database(e.to_string()))?;

        debug!(workflow_id = %new.workflow_id, run_id = %new.run_id, "created workflow execution");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_execution(&self, workflow_id: &str) -> Result<ExecutionRecord, EngineStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM workflow_executions WHERE workflow_id = $1"
        ))
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| EngineStoreError::Database(e.to_string()))?
        .ok_or_else(|| EngineStoreError::WorkflowNotFound(workflow_id.to_string()))?;

        row_to_execution(&row)
    }

    #[instrument(skip(self))]
    async fn get_execution_by_run(
        &self,
        run_id: Uuid,
    ) -> Result<ExecutionRecord, EngineStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM workflow_executions WHERE run_id = $1"
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| EngineStoreError::Database(e.to_string()))?
        .ok_or(EngineStoreError::RunNotFound(run_id))?;

        row_to_execution(&row)
    }

    #[instrument(skip(self, result, error))]
    async fn update_status(
        &self,
        run_id: Uuid,
        status: WorkflowStatus,
        result: Option<serde_json::Value>,
        error: Option<WorkflowError>,
    ) -> Result<(), EngineStoreError> {
        let error_json = error
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| EngineStoreError::Serialization(e.to_string()))?;

        let (started_at, ended_at): (Option<DateTime<Utc>>, Option<DateTime<Utc>>) = match status
        {
            WorkflowStatus::Running => (Some(Utc::now()), None),
            s if s.is_terminal() => (None, Some(Utc::now())),
            _ => (None, None),
        };

        let updated = sqlx::query(
            r#"
            UPDATE workflow_executions
            SET status = $2,
                result = COALESCE($3, result),
                error = COALESCE($4, error),
                started_at = COALESCE(started_at, $5),
                ended_at = COALESCE(ended_at, $6)
            WHERE run_id = $1
            "#,
        )
        .bind(run_id)
        .bind(status.as_str())
        .bind(&result)
        .bind(&error_json)
        .bind(started_at)
        .bind(ended_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to update workflow status: {}", e);
            EngineStoreError::Database(e.to_string())
        })?;

        if updated.rows_affected() == 0 {
            return Err(EngineStoreError::RunNotFound(run_id));
        }
        debug!(%run_id, %status, "updated workflow status");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn expired_executions(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExecutionRecord>, EngineStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM workflow_executions \
             WHERE status IN ('running', 'compensating') AND deadline_at <= $1"
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| EngineStoreError::Database(e.to_string()))?;

        rows.iter().map(row_to_execution).collect()
    }

    #[instrument(skip(self, events))]
    async fn append_run_events(
        &self,
        run_id: Uuid,
        expected_sequence: i64,
        events: Vec<RunEvent>,
    ) -> Result<i64, EngineStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| EngineStoreError::Database(e.to_string()))?;

        let head: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT sequence_num FROM workflow_run_events
            WHERE run_id = $1
            ORDER BY sequence_num DESC
            LIMIT 1
            FOR UPDATE
            "#,
        )
        .bind(run_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| EngineStoreError::Database(e.to_string()))?;

        let current = head.map(|h| h + 1).unwrap_or(0);
        if current != expected_sequence {
            return Err(EngineStoreError::ConcurrencyConflict {
                expected: expected_sequence,
                actual: current,
            });
        }

        let mut sequence = current;
        for event in events {
            let payload = serde_json::to_value(&event)
                .map_err(|e| EngineStoreError::Serialization(e.to_string()))?;

            sqlx::query(
                r#"
                INSERT INTO workflow_run_events (run_id, sequence_num, event_type, event_data)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(run_id)
            .bind(sequence)
            .bind(event.type_name())
            .bind(&payload)
            .execute(&mut *tx)
            .await
            .map_err(|e| EngineStoreError::Database(e.to_string()))?;

            sequence += 1;
        }

        tx.commit()
            .await
            .map_err(|e| EngineStoreError::Database(e.to_string()))?;

        Ok(sequence)
    }

    #[instrument(skip(self))]
    async fn load_run_events(
        &self,
        run_id: Uuid,
    ) -> Result<Vec<(i64, RunEvent)>, EngineStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT sequence_num, event_data
            FROM workflow_run_events
            WHERE run_id = $1
            ORDER BY sequence_num
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| EngineStoreError::Database(e.to_string()))?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let sequence: i64 = row.get("sequence_num");
            let payload: serde_json::Value = row.get("event_data");
            let event: RunEvent = serde_json::from_value(payload)
                .map_err(|e| EngineStoreError::Serialization(e.to_string()))?;
            events.push((sequence, event));
        }
        Ok(events)
    }

    #[instrument(skip(self, task), fields(activity_type = %task.activity_type))]
    async fn enqueue_task(&self, task: TaskDefinition) -> Result<Uuid, EngineStoreError> {
        let task_id = Uuid::now_v7();
        let options = serde_json::to_value(&task.options)
            .map_err(|e| EngineStoreError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO workflow_tasks
                (id, run_id, workflow_id, activity_id, activity_type, kind,
                 task_queue, input, options, max_attempts)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(task_id)
        .bind(task.run_id)
        .bind(&task.workflow_id)
        .bind(&task.activity_id)
        .bind(&task.activity_type)
        .bind(task.kind.as_str())
        .bind(&task.task_queue)
        .bind(&task.input)
        .bind(&options)
        .bind(task.options.retry_policy.max_attempts as i32)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to enqueue task: {}", e);
            EngineStoreError::Database(e.to_string())
        })?;

        debug!(%task_id, "enqueued task");
        Ok(task_id)
    }

    #[instrument(skip(self, task_queues))]
    async fn claim_tasks(
        &self,
        worker_id: &str,
        task_queues: &[String],
        max_tasks: usize,
    ) -> Result<Vec<ClaimedTask>, EngineStoreError> {
        if task_queues.is_empty() {
            return Ok(vec![]);
        }

        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id
                FROM workflow_tasks
                WHERE status = 'pending'
                  AND task_queue = ANY($1)
                  AND visible_at <= NOW()
                ORDER BY visible_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE workflow_tasks t
            SET status = 'claimed',
                claimed_by = $3,
                claimed_at = NOW(),
                attempt = attempt + 1
            FROM claimable c
            WHERE t.id = c.id
            RETURNING t.id, t.run_id, t.workflow_id, t.activity_id, t.activity_type,
                      t.kind, t.input, t.options, t.attempt, t.max_attempts,
                      (SELECT workflow_type FROM workflow_executions e
                       WHERE e.run_id = t.run_id) AS workflow_type
            "#,
        )
        .bind(task_queues)
        .bind(max_tasks as i64)
        .bind(worker_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to claim tasks: {}", e);
            EngineStoreError::Database(e.to_string())
        })?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in rows {
            let options: ActivityOptions = serde_json::from_value(row.get("options"))
                .map_err(|e| EngineStoreError::Serialization(e.to_string()))?;

            claimed.push(ClaimedTask {
                id: row.get("id"),
                run_id: row.get("run_id"),
                workflow_id: row.get("workflow_id"),
                workflow_type: row
                    .get::<Option<String>, _>("workflow_type")
                    .unwrap_or_default(),
                activity_id: row.get("activity_id"),
                activity_type: row.get("activity_type"),
                kind: TaskKind::parse(row.get::<String, _>("kind").as_str())?,
                input: row.get("input"),
                options,
                attempt: row.get::<i32, _>("attempt") as u32,
                max_attempts: row.get::<i32, _>("max_attempts") as u32,
            });
        }

        if !claimed.is_empty() {
            debug!(worker_id, count = claimed.len(), "claimed tasks");
        }
        Ok(claimed)
    }

    #[instrument(skip(self))]
    async fn complete_task(&self, task_id: Uuid) -> Result<(), EngineStoreError> {
        sqlx::query("UPDATE workflow_tasks SET status = 'completed' WHERE id = $1")
            .bind(task_id)
            .execute(&self.pool)
            .await
            .map_err(|e| EngineStoreError::Database(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn fail_task(
        &self,
        task_id: Uuid,
        error: &str,
        retryable: bool,
        retry_after: Option<Duration>,
    ) -> Result<TaskFailureOutcome, EngineStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| EngineStoreError::Database(e.to_string()))?;

        let row = sqlx::query(
            "SELECT attempt, max_attempts, options FROM workflow_tasks WHERE id = $1 FOR UPDATE",
        )
        .bind(task_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| EngineStoreError::Database(e.to_string()))?
        .ok_or(EngineStoreError::TaskNotFound(task_id))?;

        let attempt: i32 = row.get("attempt");
        let max_attempts: i32 = row.get("max_attempts");
        let options: ActivityOptions = serde_json::from_value(row.get("options"))
            .map_err(|e| EngineStoreError::Serialization(e.to_string()))?;

        let outcome = if retryable && attempt < max_attempts {
            let delay = options
                .retry_policy
                .delay_with_retry_after((attempt + 1) as u32, retry_after);
            let visible_at =
                Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();

            sqlx::query(
                r#"
                UPDATE workflow_tasks
                SET status = 'pending',
                    claimed_by = NULL,
                    claimed_at = NULL,
                    last_error = $2,
                    visible_at = $3
                WHERE id = $1
                "#,
            )
            .bind(task_id)
            .bind(error)
            .bind(visible_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| EngineStoreError::Database(e.to_string()))?;

            TaskFailureOutcome::WillRetry {
                next_attempt: (attempt + 1) as u32,
                delay,
            }
        } else {
            sqlx::query(
                "UPDATE workflow_tasks SET status = 'failed', last_error = $2 WHERE id = $1",
            )
            .bind(task_id)
            .bind(error)
            .execute(&mut *tx)
            .await
            .map_err(|e| EngineStoreError::Database(e.to_string()))?;

            TaskFailureOutcome::Exhausted
        };

        tx.commit()
            .await
            .map_err(|e| EngineStoreError::Database(e.to_string()))?;

        Ok(outcome)
    }

    #[instrument(skip(self))]
    async fn cancel_pending_tasks(&self, run_id: Uuid) -> Result<usize, EngineStoreError> {
        let result = sqlx::query(
            "UPDATE workflow_tasks SET status = 'cancelled' \
             WHERE run_id = $1 AND status = 'pending'",
        )
        .bind(run_id)
        .execute(&self.pool)
        .await
        .map_err(|e| EngineStoreError::Database(e.to_string()))?;

        Ok(result.rows_affected() as usize)
    }

    #[instrument(skip(self))]
    async fn reclaim_stale_tasks(
        &self,
        stale_threshold: Duration,
    ) -> Result<Vec<Uuid>, EngineStoreError> {
        let cutoff =
            Utc::now() - chrono::Duration::from_std(stale_threshold).unwrap_or_default();

        let rows = sqlx::query(
            r#"
            UPDATE workflow_tasks
            SET status = 'pending',
                claimed_by = NULL,
                claimed_at = NULL
            WHERE status = 'claimed' AND claimed_at < $1
            RETURNING id
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| EngineStoreError::Database(e.to_string()))?;

        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    #[instrument(skip(self))]
    async fn schedule_timer(
        &self,
        run_id: Uuid,
        workflow_id: &str,
        timer_id: &str,
        fire_at: DateTime<Utc>,
    ) -> Result<(), EngineStoreError> {
        sqlx::query(
            r#"
            INSERT INTO workflow_timers (id, run_id, workflow_id, timer_id, fire_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (run_id, timer_id) DO NOTHING
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(run_id)
        .bind(workflow_id)
        .bind(timer_id)
        .bind(fire_at)
        .execute(&self.pool)
        .await
        .map_err(|e| EngineStoreError::Database(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn due_timers(&self, now: DateTime<Utc>) -> Result<Vec<TimerRecord>, EngineStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, run_id, workflow_id, timer_id, fire_at
            FROM workflow_timers
            WHERE fired_at IS NULL AND fire_at <= $1
            ORDER BY fire_at
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| EngineStoreError::Database(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|row| TimerRecord {
                id: row.get("id"),
                run_id: row.get("run_id"),
                workflow_id: row.get("workflow_id"),
                timer_id: row.get("timer_id"),
                fire_at: row.get("fire_at"),
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn mark_timer_fired(&self, id: Uuid) -> Result<(), EngineStoreError> {
        sqlx::query("UPDATE workflow_timers SET fired_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| EngineStoreError::Database(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self, signal))]
    async fn send_signal(
        &self,
        run_id: Uuid,
        signal: WorkflowSignal,
    ) -> Result<(), EngineStoreError> {
        sqlx::query(
            r#"
            INSERT INTO workflow_signals (run_id, signal_type, payload, sent_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(run_id)
        .bind(&signal.signal_type)
        .bind(&signal.payload)
        .bind(signal.sent_at)
        .execute(&self.pool)
        .await
        .map_err(|e| EngineStoreError::Database(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn pending_signals(
        &self,
        run_id: Uuid,
    ) -> Result<Vec<WorkflowSignal>, EngineStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT signal_type, payload, sent_at
            FROM workflow_signals
            WHERE run_id = $1 AND processed_at IS NULL
            ORDER BY id
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| EngineStoreError::Database(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|row| WorkflowSignal {
                signal_type: row.get("signal_type"),
                payload: row.get("payload"),
                sent_at: row.get("sent_at"),
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn mark_signals_processed(
        &self,
        run_id: Uuid,
        count: usize,
    ) -> Result<(), EngineStoreError> {
        sqlx::query(
            r#"
            UPDATE workflow_signals
            SET processed_at = NOW()
            WHERE id IN (
                SELECT id FROM workflow_signals
                WHERE run_id = $1 AND processed_at IS NULL
                ORDER BY id
                LIMIT $2
            )
            "#,
        )
        .bind(run_id)
        .bind(count as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| EngineStoreError::Database(e.to_string()))?;
        Ok(())
    }
}

fn row_to_execution(row: &PgRow) -> Result<ExecutionRecord, EngineStoreError> {
    let status = WorkflowStatus::parse(row.get::<String, _>("status").as_str())?;
    let error: Option<serde_json::Value> = row.get("error");

    Ok(ExecutionRecord {
        workflow_id: row.get("workflow_id"),
        run_id: row.get("run_id"),
        workflow_type: row.get("workflow_type"),
        status,
        input: row.get("input"),
        result: row.get("result"),
        error: error.and_then(|v| serde_json::from_value(v).ok()),
        task_queue: row.get("task_queue"),
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        ended_at: row.get("ended_at"),
        deadline_at: row.get("deadline_at"),
    })
}

#[cfg(test)]
mod tests {
    // Engine-store behavior against a live database is covered by the
    // workspace's Postgres integration tests; unit coverage lives in the
    // in-memory twin, which shares the trait-level semantics.
}
