//! Error types for the simulado engine.
//!
//! `StoreError` is what persistence backends report; `SimuladoError` is the
//! structured result every public operation surfaces to its caller.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Failures reported by a store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A uniqueness or state precondition did not hold.
    #[error("store conflict: {0}")]
    Conflict(String),

    /// A row the operation depends on is missing.
    #[error("store row not found: {0}")]
    NotFound(String),

    /// The backend returned an error.
    #[error("store backend error: {0}")]
    Backend(String),

    /// The backend could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Returns `true` if retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Backend(_) | StoreError::Unavailable(_))
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors surfaced by the engine's public operations.
#[derive(Debug, Error)]
pub enum SimuladoError {
    /// Target entity does not exist or is inactive.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Entity exists but belongs to a different user.
    #[error("{entity} {id} belongs to another user")]
    NotOwner { entity: &'static str, id: String },

    #[error("invalid exam spec: {0}")]
    InvalidSpec(String),

    #[error("invalid answer letter: {0}")]
    InvalidLetter(String),

    #[error("invalid answer time: {0}s")]
    InvalidTime(i64),

    #[error("invalid {field}: {reason}")]
    InvalidInput { field: &'static str, reason: String },

    /// The answered question is not part of the exam named in the call.
    #[error("question {question_id} does not belong to exam {exam_id}")]
    WrongExam { exam_id: Uuid, question_id: Uuid },

    #[error("no questions available for {0}")]
    NoQuestionsAvailable(String),

    #[error("insufficient diamonds: need {needed}, have {available}")]
    InsufficientDiamonds { needed: i64, available: i64 },

    /// Idempotency signal: the study session was already closed.
    #[error("study session {0} is already closed")]
    AlreadyClosed(Uuid),

    /// Idempotency signal: the exam was already completed.
    #[error("exam {0} is already completed")]
    AlreadyCompleted(Uuid),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SimuladoError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        SimuladoError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn not_owner(entity: &'static str, id: impl ToString) -> Self {
        SimuladoError::NotOwner {
            entity,
            id: id.to_string(),
        }
    }

    /// Returns `true` for the transition signals a caller may ignore.
    pub fn is_idempotency_signal(&self) -> bool {
        matches!(
            self,
            SimuladoError::AlreadyClosed(_) | SimuladoError::AlreadyCompleted(_)
        )
    }

    /// Returns `true` if the underlying store failure may clear on retry.
    pub fn is_transient(&self) -> bool {
        match self {
            SimuladoError::Store(e) => e.is_transient(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, SimuladoError>;

/// Run a store call, retrying a transient failure exactly once.
///
/// Permanent failures and the second transient failure are returned as-is.
pub async fn retry_once<T, F, Fut>(operation: &str, delay: Duration, mut call: F) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    match call().await {
        Err(e) if e.is_transient() => {
            tracing::warn!("{operation} failed: {e}, retrying once");
            tokio::time::sleep(delay).await;
            call().await
        }
        other => other,
    }
}
