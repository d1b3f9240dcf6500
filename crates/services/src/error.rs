//! Shared error types for the session engine.

use thiserror::Error;

use assess_core::model::{QuestionId, SessionPhase};
use storage::store::StoreError;

/// Errors emitted by session services.
///
/// State and validation variants are caller errors and never retried
/// automatically. `Retryable` marks a finalize attempt that left the session
/// in `Submitting`; calling `request_submit` again is safe and idempotent.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SessionError {
    #[error("no questions available for session")]
    Empty,

    #[error("session is {phase}, not active")]
    NotActive { phase: SessionPhase },

    #[error("question index {index} out of range ({total} questions)")]
    IndexOutOfRange { index: usize, total: usize },

    #[error("unknown question id {0:?}")]
    UnknownQuestion(QuestionId),

    #[error("finalize did not complete; retrying is safe")]
    Retryable(#[source] StoreError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SessionError {
    /// True when the caller may safely call `request_submit` again.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}
