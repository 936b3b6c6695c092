//! Typed error hierarchy for the orchestration engine.
//!
//! Two top-level enums cover the two subsystems:
//! - `StepError` — per-phase execution failures, split by retryability
//! - `OrchestratorError` — run lifecycle and scheduling failures
//!
//! The split drives the centralized retry policy: `Retryable` variants are
//! retried with backoff and never surfaced raw; `Fatal` variants end the
//! run and reach the client only through `user_message()`.

use thiserror::Error;

/// Transient failures worth retrying with backoff.
#[derive(Debug, Error)]
pub enum RetryableError {
    #[error("Model rate limited (retry after {retry_after_secs:?}s)")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("Model invocation timed out")]
    Timeout,

    #[error("Model server error: {0}")]
    ModelServer(String),

    #[error("Transient store error: {0}")]
    Store(#[source] anyhow::Error),
}

/// Failures that end the run. No retry, but the user-facing text is always
/// sanitized — internal detail stays in the logs.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("Token budget exceeded for account (retry after {retry_after_secs:?}s)")]
    BudgetExceeded {
        reason: String,
        retry_after_secs: Option<u64>,
    },

    #[error("Model refused the request: {0}")]
    ModelRefusal(String),

    #[error("Phase {phase} produced malformed output: {detail}")]
    MalformedOutput { phase: String, detail: String },

    #[error("Usage commit failed after retries for step {step_key}: {source}")]
    UsageCommitFailed {
        step_key: String,
        #[source]
        source: anyhow::Error,
    },
}

impl FatalError {
    /// Sanitized, actionable message safe to return to a client. Internal
    /// error text, collaborator error strings, and step keys never appear.
    pub fn user_message(&self) -> String {
        match self {
            Self::BudgetExceeded { retry_after_secs, .. } => match retry_after_secs {
                Some(secs) => format!(
                    "Your token budget is exhausted. Try again in about {} minutes.",
                    secs.div_ceil(60)
                ),
                None => "Your token budget for this period is exhausted.".to_string(),
            },
            Self::ModelRefusal(_) => {
                "The analysis model declined this request. Please rephrase your challenge.".to_string()
            }
            Self::MalformedOutput { .. } | Self::UsageCommitFailed { .. } => {
                "The analysis could not be completed due to an internal error.".to_string()
            }
        }
    }
}

/// Per-phase execution failure, classified for the retry policy.
#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Retryable(#[from] RetryableError),

    #[error(transparent)]
    Fatal(#[from] FatalError),
}

/// Errors from run lifecycle management.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Run {id} not found")]
    RunNotFound { id: String },

    #[error("Run {id} is already being executed")]
    AlreadyActive { id: String },

    #[error("Invalid status transition {from} -> {to} for run {id}")]
    InvalidTransition { id: String, from: String, to: String },

    #[error("Run {id} is not awaiting clarification")]
    NotAwaitingClarification { id: String },

    #[error("Rate limited: {reason}")]
    RateLimited {
        reason: String,
        retry_after_secs: u64,
    },

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
