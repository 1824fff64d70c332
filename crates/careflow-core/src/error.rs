//! Error-kind taxonomy
//!
//! Failures are classified by kind, not by concrete type. The kind decides
//! whether a retry is worthwhile and whether exhausting retries sends the
//! owning workflow down the compensation path.

use serde::{Deserialize, Serialize};

/// Classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network errors, 5xx, connection loss
    Transient,

    /// 429; retry after the indicated delay
    RateLimited,

    /// Bad payload, unknown event type
    Validation,

    /// Missing permission
    Authorization,

    /// Aggregate absent
    NotFound,

    /// Version conflict (retried at the append call site) or unique-key
    /// violation (aborts)
    Conflict,

    /// Activity exceeded its start-to-close deadline
    Timeout,

    /// Uncategorised
    Unknown,
}

impl ErrorKind {
    /// Whether an activity-level retry can help.
    ///
    /// `Conflict` is deliberately non-retryable here: version conflicts are
    /// retried inline by the append call site, and unique-key conflicts
    /// abort.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Transient | Self::RateLimited | Self::Timeout | Self::Unknown
        )
    }

    /// Whether exhausting retries with this kind triggers Saga compensation.
    ///
    /// `Transient` is included alongside `Timeout` and `Unknown`: a
    /// transient failure is retried rather than compensated per attempt,
    /// but once its attempts are spent the failure is final and the side
    /// effects it strands must still be unwound.
    pub fn compensates_on_final(self) -> bool {
        matches!(self, Self::Timeout | Self::Unknown | Self::Transient)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::RateLimited => "rate_limited",
            Self::Validation => "validation",
            Self::Authorization => "authorization",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Timeout => "timeout",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
