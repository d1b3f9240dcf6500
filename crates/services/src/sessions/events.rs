use tokio::sync::mpsc;

use assess_core::model::{QuestionId, SaveState, SessionOutcome};

/// Typed notifications pushed to the embedding UI/API layer.
///
/// This replaces framework-bound reactive state: subscribers receive events
/// over a channel and render however they like.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A draft moved between `Dirty`, `Saving`, `Saved` and `Failed`.
    DraftSaveState {
        question_id: QuestionId,
        save_state: SaveState,
    },
    /// Seconds left until the deadline, recomputed on every tick.
    RemainingTime { seconds: i64 },
    /// The session finalized; carries the graded result set.
    SessionCompleted { outcome: SessionOutcome },
    /// A failure the caller may want to surface (forced submit failed,
    /// finalize needs a retry).
    SessionError {
        question_id: Option<QuestionId>,
        message: String,
    },
}

/// Fan-out handle for session events.
///
/// Sends are fire-and-forget: a dropped receiver must never block or fail
/// the engine, so send errors are discarded.
#[derive(Clone, Default)]
pub(crate) struct EventSink {
    tx: Option<mpsc::UnboundedSender<SessionEvent>>,
}

impl EventSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub(crate) fn disabled() -> Self {
        Self { tx: None }
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropped_receiver_is_ignored() {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(tx);
        drop(rx);
        sink.emit(SessionEvent::RemainingTime { seconds: 10 });
    }

    #[test]
    fn disabled_sink_is_a_no_op() {
        let sink = EventSink::disabled();
        sink.emit(SessionEvent::RemainingTime { seconds: 0 });
    }
}
