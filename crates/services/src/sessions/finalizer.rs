use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tracing::info;

use assess_core::model::{SessionId, SessionMode, SessionOutcome};
use storage::store::{AssessmentStore, StoreError};

use super::draft_manager::AnswerDraftManager;
use super::lock;
use crate::error::SessionError;

/// Flushes pending drafts and performs idempotent, single-flight
/// finalization for one session.
///
/// An async mutex serializes callers; once an outcome exists it is cached,
/// so a concurrent or repeated caller receives the already-computed result
/// and the store-level finalize is issued exactly once on the success path.
pub(crate) struct SubmissionFinalizer {
    session_id: SessionId,
    store: Arc<dyn AssessmentStore>,
    network_timeout: Duration,
    in_flight: AsyncMutex<()>,
    outcome: Mutex<Option<SessionOutcome>>,
}

impl SubmissionFinalizer {
    pub(crate) fn new(
        session_id: SessionId,
        store: Arc<dyn AssessmentStore>,
        network_timeout: Duration,
        existing: Option<SessionOutcome>,
    ) -> Self {
        Self {
            session_id,
            store,
            network_timeout,
            in_flight: AsyncMutex::new(()),
            outcome: Mutex::new(existing),
        }
    }

    /// The cached outcome, if this session has already finalized.
    pub(crate) fn outcome(&self) -> Option<SessionOutcome> {
        lock(&self.outcome).clone()
    }

    async fn call_store<F, T>(&self, fut: F) -> Result<T, StoreError>
    where
        F: std::future::Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.network_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout),
        }
    }

    /// Flush drafts, then convert them into the graded result set.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Retryable` when the flush or the store call
    /// failed; the caller may retry safely. A store `Conflict` (already
    /// finalized through another path) is resolved by adopting the
    /// canonical stored result and is treated as success.
    pub(crate) async fn finalize(
        &self,
        drafts: &AnswerDraftManager,
        mode: SessionMode,
    ) -> Result<SessionOutcome, SessionError> {
        let _guard = self.in_flight.lock().await;
        if let Some(outcome) = lock(&self.outcome).clone() {
            return Ok(outcome);
        }

        drafts.flush_all(mode).await?;

        let outcome = match self.call_store(self.store.finalize(self.session_id)).await {
            Ok(outcome) => outcome,
            Err(StoreError::Conflict) => {
                info!(
                    session_id = self.session_id.value(),
                    "session already finalized elsewhere; adopting stored result"
                );
                let status = self
                    .call_store(self.store.get_session_status(self.session_id))
                    .await
                    .map_err(SessionError::Retryable)?;
                status
                    .outcome
                    .ok_or(SessionError::Retryable(StoreError::Conflict))?
            }
            Err(err) => return Err(SessionError::Retryable(err)),
        };

        *lock(&self.outcome) = Some(outcome.clone());
        Ok(outcome)
    }
}
