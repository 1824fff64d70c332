//! Worker pool for activity execution
//!
//! Claims tasks from the engine store, executes them through the activity
//! registry with bounded concurrency, and runs the periodic sweeps the
//! engine needs: due timers, expired workflow deadlines, and stale
//! claims left behind by dead workers.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::activity::EventEmitter;
use crate::engine::{ActivityRegistry, WorkflowExecutor};
use crate::persistence::{EngineStore, EngineStoreError};

use super::execute_claimed_task;

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Unique worker id (generated if not provided)
    pub worker_id: String,

    /// Task queues this worker serves
    pub task_queues: Vec<String>,

    /// Maximum concurrent task executions
    pub max_concurrency: usize,

    /// Idle delay between claim attempts
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,

    /// Interval for the timer/timeout/stale sweeps
    #[serde(with = "duration_millis")]
    pub sweep_interval: Duration,

    /// How long a claim may go unfinished before it is requeued
    #[serde(with = "duration_millis")]
    pub stale_threshold: Duration,

    /// Graceful shutdown timeout
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            task_queues: vec![],
            max_concurrency: 10,
            poll_interval: Duration::from_millis(250),
            sweep_interval: Duration::from_secs(5),
            stale_threshold: Duration::from_secs(300),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    pub fn new(task_queues: Vec<String>) -> Self {
        Self {
            task_queues,
            ..Default::default()
        }
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Worker pool status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPoolStatus {
    Running,
    Draining,
    Stopped,
}

/// Worker pool errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    #[error("store error: {0}")]
    Store(#[from] EngineStoreError),

    #[error("worker pool is already running")]
    AlreadyRunning,

    #[error("graceful shutdown timed out")]
    ShutdownTimeout,
}

/// Worker pool.
pub struct WorkerPool<S: EngineStore> {
    store: Arc<S>,
    executor: Arc<WorkflowExecutor<S>>,
    activities: Arc<ActivityRegistry>,
    emitter: Option<Arc<EventEmitter>>,
    config: WorkerPoolConfig,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    status: parking_lot::RwLock<WorkerPoolStatus>,
    permits: Arc<Semaphore>,
    handles: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl<S: EngineStore> WorkerPool<S> {
    pub fn new(
        store: Arc<S>,
        executor: Arc<WorkflowExecutor<S>>,
        activities: Arc<ActivityRegistry>,
        config: WorkerPoolConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            store,
            executor,
            activities,
            emitter: None,
            permits: Arc::new(Semaphore::new(config.max_concurrency)),
            config,
            shutdown_tx,
            shutdown_rx,
            status: parking_lot::RwLock::new(WorkerPoolStatus::Stopped),
            handles: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Wire the emitter handed to activity contexts.
    pub fn with_emitter(mut self, emitter: Arc<EventEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    pub fn status(&self) -> WorkerPoolStatus {
        *self.status.read()
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Start the polling loop and the sweeps.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub fn start(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.write();
            if *status == WorkerPoolStatus::Running {
                return Err(WorkerPoolError::AlreadyRunning);
            }
            *status = WorkerPoolStatus::Running;
        }

        info!(
            worker_id = %self.config.worker_id,
            task_queues = ?self.config.task_queues,
            max_concurrency = self.config.max_concurrency,
            "starting worker pool"
        );

        let mut handles = self.handles.lock();
        handles.push(self.spawn_poll_loop());
        handles.push(self.spawn_sweep_loop());
        Ok(())
    }

    /// Graceful shutdown: stop claiming, drain in-flight tasks, stop.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn shutdown(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.write();
            if *status == WorkerPoolStatus::Stopped {
                return Ok(());
            }
            *status = WorkerPoolStatus::Draining;
        }

        info!(worker_id = %self.config.worker_id, "draining worker pool");
        let _ = self.shutdown_tx.send(true);

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        loop {
            if self.permits.available_permits() == self.config.max_concurrency {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    in_flight = self.config.max_concurrency - self.permits.available_permits(),
                    "shutdown timeout reached"
                );
                *self.status.write() = WorkerPoolStatus::Stopped;
                return Err(WorkerPoolError::ShutdownTimeout);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        for handle in self.handles.lock().drain(..) {
            handle.abort();
        }
        *self.status.write() = WorkerPoolStatus::Stopped;
        info!(worker_id = %self.config.worker_id, "worker pool stopped");
        Ok(())
    }

    fn spawn_poll_loop(&self) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let executor = Arc::clone(&self.executor);
        let activities = Arc::clone(&self.activities);
        let emitter = self.emitter.clone();
        let permits = Arc::clone(&self.permits);
        let config = self.config.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                let available = permits.available_permits();
                if available == 0 {
                    tokio::time::sleep(config.poll_interval).await;
                    continue;
                }

                let claimed = match store
                    .claim_tasks(&config.worker_id, &config.task_queues, available)
                    .await
                {
                    Ok(tasks) => tasks,
                    Err(e) => {
                        error!("task claim failed: {}", e);
                        vec![]
                    }
                };

                if claimed.is_empty() {
                    tokio::select! {
                        _ = tokio::time::sleep(config.poll_interval) => {}
                        _ = shutdown_rx.changed() => {}
                    }
                    continue;
                }

                for task in claimed {
                    let permit = match Arc::clone(&permits).try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            debug!("no permits available, task stays claimed for reclaim");
                            break;
                        }
                    };

                    let store = Arc::clone(&store);
                    let executor = Arc::clone(&executor);
                    let activities = Arc::clone(&activities);
                    let emitter = emitter.clone();

                    tokio::spawn(async move {
                        let activity_id = task.activity_id.clone();
                        if let Err(e) = execute_claimed_task(
                            &store,
                            &executor,
                            &activities,
                            emitter.as_ref(),
                            task,
                        )
                        .await
                        {
                            error!(%activity_id, "task execution reporting failed: {}", e);
                        }
                        drop(permit);
                    });
                }
            }

            debug!("poll loop exited");
        })
    }

    fn spawn_sweep_loop(&self) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let executor = Arc::clone(&self.executor);
        let config = self.config.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.sweep_interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        run_sweeps(&store, &executor, config.stale_threshold).await;
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("sweep loop: shutdown requested");
                        break;
                    }
                }
            }
        })
    }
}

/// One round of timer, deadline and stale-claim sweeps.
async fn run_sweeps<S: EngineStore>(
    store: &Arc<S>,
    executor: &Arc<WorkflowExecutor<S>>,
    stale_threshold: Duration,
) {
    let now = chrono::Utc::now();

    match store.due_timers(now).await {
        Ok(timers) => {
            for timer in timers {
                if let Err(e) = store.mark_timer_fired(timer.id).await {
                    error!("failed to mark timer fired: {}", e);
                    continue;
                }
                if let Err(e) = executor.on_timer_fired(timer.run_id, &timer.timer_id).await {
                    error!(timer_id = %timer.timer_id, "timer dispatch failed: {}", e);
                }
            }
        }
        Err(e) => error!("timer sweep failed: {}", e),
    }

    match store.expired_executions(now).await {
        Ok(expired) => {
            for record in expired {
                if let Err(e) = executor.on_workflow_timeout(record.run_id).await {
                    error!(workflow_id = %record.workflow_id, "timeout dispatch failed: {}", e);
                }
            }
        }
        Err(e) => error!("deadline sweep failed: {}", e),
    }

    match store.reclaim_stale_tasks(stale_threshold).await {
        Ok(reclaimed) => {
            if !reclaimed.is_empty() {
                info!(count = reclaimed.len(), "reclaimed stale tasks");
            }
        }
        Err(e) => error!("stale-claim sweep failed: {}", e),
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = WorkerPoolConfig::default();
        assert!(!config.worker_id.is_empty());
        assert_eq!(config.max_concurrency, 10);
        assert_eq!(config.sweep_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_config_builder() {
        let config = WorkerPoolConfig::new(vec!["careflow-onboarding".to_string()])
            .with_worker_id("test-worker")
            .with_max_concurrency(4)
            .with_poll_interval(Duration::from_millis(10));

        assert_eq!(config.worker_id, "test-worker");
        assert_eq!(config.task_queues, vec!["careflow-onboarding"]);
        assert_eq!(config.max_concurrency, 4);
    }

    #[test]
    fn test_concurrency_floor() {
        let config = WorkerPoolConfig::default().with_max_concurrency(0);
        assert_eq!(config.max_concurrency, 1);
    }
}
