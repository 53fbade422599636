// =============================================================================
// Service error taxonomy
// =============================================================================
//
// Errors are classified by kind, not by origin: the same taxonomy drives
// retry/breaker decisions inside the engine and the structured bodies the
// REST edge returns. Stack traces and internal paths never cross the API
// boundary.
// =============================================================================

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;

/// Classified failure crossing a component boundary.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Upstream hiccup (broker disconnect, Redis drop, DB reset). Retryable;
    /// repeated occurrences open the relevant circuit breaker.
    #[error("transient upstream failure: {0}")]
    Transient(String),

    /// Malformed input (bad tick, bad order params). Dropped or rejected.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Referenced entity does not exist (stale instrument, unknown task id).
    #[error("not found: {0}")]
    NotFound(String),

    /// Per-account broker rate limit; the caller should wait for a lease or
    /// re-queue without consuming an attempt.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Credential failure. Fatal for the affected account only.
    #[error("authentication failed for account {account}: {reason}")]
    Auth { account: String, reason: String },

    /// Invariant violation. Surfaced to the task monitor, never swallowed.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    /// Stable machine-readable tag for API payloads and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transient(_) => "transient",
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::RateLimited(_) => "rate_limited",
            Self::Auth { .. } => "auth",
            Self::Internal(_) => "internal",
        }
    }

    /// True when a retry with backoff is a sensible response.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::RateLimited(_))
    }
}

/// Structured error body returned by the REST edge.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    pub timestamp: i64,
}

impl From<&ServiceError> for ErrorBody {
    fn from(err: &ServiceError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}
