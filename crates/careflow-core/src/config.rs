//! Enumerated configuration for the orchestration core
//!
//! Every knob the core exposes lives here with its default. The worker
//! binary overlays environment variables; library consumers construct the
//! structs directly.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Reconnect backoff for the trigger listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// First reconnect delay
    #[serde(with = "duration_millis")]
    pub initial: Duration,

    /// Delay ceiling
    #[serde(with = "duration_millis")]
    pub cap: Duration,

    /// Jitter factor (0.0-1.0); 0.2 means +-20%
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            cap: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl BackoffConfig {
    /// Delay before reconnect attempt `attempt` (1-based), jittered.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let base = self.initial.as_secs_f64() * 2f64.powi(exponent as i32);
        let capped = base.min(self.cap.as_secs_f64());

        let jittered = if self.jitter > 0.0 {
            let mut rng = rand::thread_rng();
            let spread = capped * self.jitter;
            let offset = rng.gen_range(-spread..=spread);
            (capped + offset).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
    }
}

/// Trigger-listener configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Notify channel carrying trigger events
    pub channel_name: String,

    pub reconnect_backoff: BackoffConfig,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            channel_name: "workflow_events".to_string(),
            reconnect_backoff: BackoffConfig::default(),
        }
    }
}

/// Backlog-reprocessor configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacklogConfig {
    /// Interval between periodic sweeps
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,

    /// Concurrent trigger dispatches per sweep
    pub concurrency: usize,

    /// Events retried more than this many times are abandoned to manual
    /// triage
    pub max_retry: i32,
}

impl Default for BacklogConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            concurrency: 4,
            max_retry: 10,
        }
    }
}

/// Default activity retry/timeout knobs; individual activities override.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityDefaults {
    #[serde(with = "duration_millis")]
    pub retry_initial: Duration,

    pub backoff_coeff: f64,

    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    pub max_attempts: u32,

    #[serde(with = "duration_millis")]
    pub start_to_close: Duration,
}

impl Default for ActivityDefaults {
    fn default() -> Self {
        Self {
            retry_initial: Duration::from_secs(1),
            backoff_coeff: 2.0,
            max_interval: Duration::from_secs(30),
            max_attempts: 3,
            start_to_close: Duration::from_secs(300),
        }
    }
}

/// Default workflow-level knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefaults {
    /// Wall-clock limit for a whole execution
    #[serde(with = "duration_millis")]
    pub timeout: Duration,

    pub task_queue: String,
}

impl Default for WorkflowDefaults {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3600),
            task_queue: "careflow-default".to_string(),
        }
    }
}

/// Worker-pool knobs for the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub max_concurrency: usize,

    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,

    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            poll_interval: Duration::from_millis(250),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Top-level configuration assembled by the daemon.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Postgres connection string; absent for in-memory deployments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,

    #[serde(default)]
    pub listener: ListenerConfig,

    #[serde(default)]
    pub backlog: BacklogConfig,

    #[serde(default)]
    pub activity_defaults: ActivityDefaults,

    #[serde(default)]
    pub workflow_defaults: WorkflowDefaults,

    #[serde(default)]
    pub worker: WorkerConfig,
}

impl CoreConfig {
    /// Build from `CAREFLOW_*` environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        config.database_url = std::env::var("DATABASE_URL").ok();

        if let Ok(channel) = std::env::var("CAREFLOW_LISTENER_CHANNEL") {
            config.listener.channel_name = channel;
        }
        if let Some(ms) = env_u64("CAREFLOW_LISTENER_BACKOFF_INITIAL_MS") {
            config.listener.reconnect_backoff.initial = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("CAREFLOW_LISTENER_BACKOFF_CAP_MS") {
            config.listener.reconnect_backoff.cap = Duration::from_millis(ms);
        }

        if let Some(secs) = env_u64("CAREFLOW_BACKLOG_POLL_INTERVAL_S") {
            config.backlog.poll_interval = Duration::from_secs(secs);
        }
        if let Some(n) = env_u64("CAREFLOW_BACKLOG_CONCURRENCY") {
            config.backlog.concurrency = n as usize;
        }
        if let Some(n) = env_u64("CAREFLOW_BACKLOG_MAX_RETRY") {
            config.backlog.max_retry = n as i32;
        }

        if let Some(secs) = env_u64("CAREFLOW_WORKFLOW_TIMEOUT_S") {
            config.workflow_defaults.timeout = Duration::from_secs(secs);
        }
        if let Ok(queue) = std::env::var("CAREFLOW_DEFAULT_TASK_QUEUE") {
            config.workflow_defaults.task_queue = queue;
        }

        if let Some(n) = env_u64("CAREFLOW_WORKER_CONCURRENCY") {
            config.worker.max_concurrency = n as usize;
        }

        config
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
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
