//! Retry policy implementation
//!
//! Exponential backoff with jitter, gated on the error-kind taxonomy:
//! non-retryable kinds stop the ladder immediately and rate-limited
//! failures honor their `retry_after`.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use careflow_core::config::ActivityDefaults;
use careflow_core::error::ErrorKind;

/// Configuration for activity retries.
///
/// # Example
///
/// ```
/// use careflow_engine::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_max_attempts(5)
///     .with_initial_interval(Duration::from_secs(5))
///     .with_max_interval(Duration::from_secs(120));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial one)
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,

    /// Delay ceiling
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier (2.0 for doubling)
    pub backoff_coefficient: f64,

    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        // The platform-wide activity default: 1s initial, doubling, 30s
        // cap, 3 attempts.
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(30),
            backoff_coefficient: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// The default exponential policy.
    pub fn exponential() -> Self {
        Self::default()
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            backoff_coefficient: 1.0,
            jitter: 0.0,
        }
    }

    /// Build from the configured activity defaults.
    pub fn from_defaults(defaults: &ActivityDefaults) -> Self {
        Self {
            max_attempts: defaults.max_attempts,
            initial_interval: defaults.retry_initial,
            max_interval: defaults.max_interval,
            backoff_coefficient: defaults.backoff_coeff,
            jitter: 0.1,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry attempt `attempt` (1-based; attempt 1 is the
    /// initial execution and runs immediately).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        // Attempt 2 is the first retry, so `attempt - 2` rungs have been
        // climbed before it.
        let Some(rungs) = attempt.checked_sub(2) else {
            return Duration::ZERO;
        };

        // Walk the ladder instead of exponentiating: the cap bounds every
        // rung and fixed policies (coefficient 1.0) stay flat. The rung
        // bound keeps pathological attempt counts from looping.
        let mut delay = self.initial_interval.min(self.max_interval);
        for _ in 0..rungs.min(32) {
            if delay >= self.max_interval {
                break;
            }
            delay = delay
                .mul_f64(self.backoff_coefficient)
                .min(self.max_interval);
        }

        self.jittered(delay)
    }

    /// Spread a delay by the jitter factor: the result lands uniformly in
    /// `[delay * (1 - jitter), delay * (1 + jitter)]`.
    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        delay.mul_f64(factor.max(0.0))
    }

    /// Delay for a retry, honoring an explicit server-supplied hold-off
    /// (Retry-After) when it exceeds the computed backoff.
    pub fn delay_with_retry_after(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let computed = self.delay_for_attempt(attempt);
        match retry_after {
            Some(hint) if hint > computed => hint,
            _ => computed,
        }
    }

    /// Whether a failure of this kind should be retried at all.
    pub fn should_retry(&self, kind: ErrorKind) -> bool {
        kind.is_retryable()
    }

    /// Whether attempts remain after `current_attempt`.
    pub fn has_attempts_remaining(&self, current_attempt: u32) -> bool {
        current_attempt < self.max_attempts
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
