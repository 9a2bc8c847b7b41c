//! Engine error taxonomy
//!
//! Kinds, routing, and caller-visible mapping:
//!
//! | Kind | Routing |
//! |------|---------|
//! | Validation | DLQ, caller sees failure |
//! | RetryExhausted | error-retry stream, idempotency = FAILED |
//! | Transient | error-retry stream after budget |
//! | Fatal | surfaced to operator, idempotency = FAILED |
//! | ReplayInconsistency | snapshot stays PROVISIONAL, alert |
//!
//! Optimistic conflicts and contract-lookup timeouts are recovered inside
//! the hotpath and never reach this enum. Idempotency duplicates are not
//! errors: the engines return the prior result.

use thiserror::Error;

use crate::store::StoreError;
use crate::validator::ValidationFailure;

/// Engine processing error
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(ValidationFailure),

    #[error("optimistic retries exhausted after {attempts} attempts")]
    RetryExhausted { attempts: u32 },

    #[error("hotpath deadline exceeded after {elapsed_ms}ms")]
    DeadlineExceeded { elapsed_ms: u64 },

    #[error("transient infrastructure failure: {0}")]
    Transient(String),

    #[error("fatal infrastructure failure: {0}")]
    Fatal(String),

    #[error("replay inconsistency: {0}")]
    ReplayInconsistency(String),
}

impl EngineError {
    /// Stable error code for API responses and outbound records.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "VALIDATION_ERROR",
            EngineError::RetryExhausted { .. } => "OPTIMISTIC_CONFLICT",
            EngineError::DeadlineExceeded { .. } => "DEADLINE_EXCEEDED",
            EngineError::Transient(_) => "TRANSIENT_INFRA",
            EngineError::Fatal(_) => "FATAL_INFRA",
            EngineError::ReplayInconsistency(_) => "REPLAY_INCONSISTENCY",
        }
    }

    /// HTTP status suggestion for the synchronous submit endpoint.
    pub fn http_status(&self) -> u16 {
        match self {
            EngineError::Validation(_) => 422,
            EngineError::RetryExhausted { .. } | EngineError::DeadlineExceeded { .. } => 409,
            EngineError::Transient(_) => 503,
            EngineError::Fatal(_) | EngineError::ReplayInconsistency(_) => 500,
        }
    }

    /// Whether a resubmit of the same trade may succeed.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            EngineError::RetryExhausted { .. }
                | EngineError::DeadlineExceeded { .. }
                | EngineError::Transient(_)
        )
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(msg) => EngineError::Transient(msg),
            StoreError::Database(msg) => EngineError::Fatal(msg),
            // conflicts are handled inside the retry loop; reaching here
            // means the budget is spent
            StoreError::VersionConflict { .. } | StoreError::CasFailed { .. } => {
                EngineError::RetryExhausted { attempts: 0 }
            }
            other => EngineError::Fatal(other.to_string()),
        }
    }
}
