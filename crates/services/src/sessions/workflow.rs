use std::sync::Arc;

use tokio::sync::mpsc;

use assess_core::Clock;
use storage::store::AssessmentStore;

use super::controller::{SessionConfig, SessionController};
use super::events::SessionEvent;
use crate::error::SessionError;

/// Opens sessions in their canonical phase from the store's point of view.
///
/// This is the re-entry path: loading a session the store already finalized
/// lands directly in `Completed` with the stored results, an overrun
/// deadline lands in `ExpiredView`, and everything else starts `Active`
/// with the countdown running.
#[derive(Clone)]
pub struct SessionLauncher {
    clock: Clock,
    store: Arc<dyn AssessmentStore>,
}

impl SessionLauncher {
    #[must_use]
    pub fn new(clock: Clock, store: Arc<dyn AssessmentStore>) -> Self {
        Self { clock, store }
    }

    /// Fetch the canonical status and build the controller.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Store` when the status fetch fails and
    /// `SessionError::Empty` when the config carries no questions.
    pub async fn open_session(
        &self,
        config: SessionConfig,
        events: Option<mpsc::UnboundedSender<SessionEvent>>,
    ) -> Result<SessionController, SessionError> {
        let status = self.store.get_session_status(config.session_id).await?;
        let controller = SessionController::initialize(
            config,
            status,
            self.store.clone(),
            self.clock,
            events,
        )?;
        controller.start_deadline_clock();
        Ok(controller)
    }
}
