use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{info, warn};

use assess_core::Clock;
use assess_core::model::{
    AnswerDraft, Question, QuestionId, SessionId, SessionMode, SessionOutcome, SessionPhase,
    SessionStatus,
};
use storage::store::AssessmentStore;

use super::deadline::DeadlineClock;
use super::draft_manager::{AnswerDraftManager, DraftTable};
use super::events::{EventSink, SessionEvent};
use super::finalizer::SubmissionFinalizer;
use super::lock;
use super::progress::SessionProgress;
use crate::error::SessionError;

//
// ─── CONFIG ────────────────────────────────────────────────────────────────────
//

/// Timing knobs for one session. The defaults match production behavior;
/// tests dial them down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTiming {
    /// Trailing-edge debounce window for free-text answers.
    pub debounce_delay: Duration,
    /// Cadence of the deadline countdown.
    pub tick_period: Duration,
    /// Upper bound on any single store call.
    pub network_timeout: Duration,
}

impl Default for SessionTiming {
    fn default() -> Self {
        Self {
            debounce_delay: Duration::from_millis(1500),
            tick_period: Duration::from_secs(1),
            network_timeout: Duration::from_secs(10),
        }
    }
}

/// Everything needed to open one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub session_id: SessionId,
    pub mode: SessionMode,
    pub questions: Vec<Question>,
    /// Authoritative, server-supplied deadline. Absent for untimed practice.
    pub deadline_at: Option<DateTime<Utc>>,
    pub timing: SessionTiming,
}

impl SessionConfig {
    #[must_use]
    pub fn new(session_id: SessionId, mode: SessionMode, questions: Vec<Question>) -> Self {
        Self {
            session_id,
            mode,
            questions,
            deadline_at: None,
            timing: SessionTiming::default(),
        }
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline_at: DateTime<Utc>) -> Self {
        self.deadline_at = Some(deadline_at);
        self
    }

    #[must_use]
    pub fn with_timing(mut self, timing: SessionTiming) -> Self {
        self.timing = timing;
        self
    }
}

//
// ─── CONTROLLER ────────────────────────────────────────────────────────────────
//

struct PhaseState {
    phase: SessionPhase,
    current: usize,
    outcome: Option<SessionOutcome>,
    expiry_fired: bool,
}

struct SessionCore {
    session_id: SessionId,
    mode: SessionMode,
    questions: Vec<Question>,
    deadline_at: Option<DateTime<Utc>>,
    clock: Clock,
    tick_period: Duration,
    phase: Mutex<PhaseState>,
    drafts: Arc<Mutex<DraftTable>>,
    draft_manager: AnswerDraftManager,
    finalizer: SubmissionFinalizer,
    deadline_clock: Mutex<Option<DeadlineClock>>,
    events: EventSink,
}

impl Drop for SessionCore {
    fn drop(&mut self) {
        // Teardown of the last handle: nothing may fire afterwards.
        if let Some(clock) = lock(&self.deadline_clock).take() {
            clock.stop();
        }
        self.draft_manager.cancel_all();
    }
}

/// Cloneable handle to one assessment session.
///
/// The controller is the only surface the embedding UI/API layer talks to.
/// All session state sits behind per-session locks; clones share the same
/// session, and independent sessions share nothing.
#[derive(Clone)]
pub struct SessionController {
    core: Arc<SessionCore>,
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController").finish_non_exhaustive()
    }
}

impl SessionController {
    /// Build a controller from the store's canonical status.
    ///
    /// A session the store already finalized comes up directly in
    /// `Completed` with the stored result set (idempotent re-entry, e.g. a
    /// page reload). A timed session whose deadline has already passed with
    /// no submission comes up read-only in `ExpiredView`. Everything else
    /// starts `Active`.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Empty` when no questions were supplied.
    pub fn initialize(
        config: SessionConfig,
        status: SessionStatus,
        store: Arc<dyn AssessmentStore>,
        clock: Clock,
        events: Option<mpsc::UnboundedSender<SessionEvent>>,
    ) -> Result<Self, SessionError> {
        if config.questions.is_empty() {
            return Err(SessionError::Empty);
        }

        let phase = if status.is_submitted {
            SessionPhase::Completed
        } else if config
            .deadline_at
            .is_some_and(|deadline| clock.now() >= deadline)
        {
            SessionPhase::ExpiredView
        } else {
            SessionPhase::Active
        };

        // Exactly one draft per question, present from the start.
        let mut table = DraftTable::with_capacity(config.questions.len());
        for question in &config.questions {
            table.insert(question.id(), AnswerDraft::new());
        }
        if phase == SessionPhase::Active {
            if let Some(first) = config.questions.first() {
                if let Some(draft) = table.get_mut(&first.id()) {
                    draft.mark_started(clock.now());
                }
            }
        }
        let drafts = Arc::new(Mutex::new(table));

        let events = events.map_or_else(EventSink::disabled, EventSink::new);
        let draft_manager = AnswerDraftManager::new(
            config.session_id,
            clock,
            config.timing.debounce_delay,
            config.timing.network_timeout,
            store.clone(),
            drafts.clone(),
            events.clone(),
        );
        let finalizer = SubmissionFinalizer::new(
            config.session_id,
            store,
            config.timing.network_timeout,
            status.outcome.clone(),
        );

        Ok(Self {
            core: Arc::new(SessionCore {
                session_id: config.session_id,
                mode: config.mode,
                questions: config.questions,
                deadline_at: config.deadline_at,
                clock,
                tick_period: config.timing.tick_period,
                phase: Mutex::new(PhaseState {
                    phase,
                    current: 0,
                    outcome: status.outcome,
                    expiry_fired: false,
                }),
                drafts,
                draft_manager,
                finalizer,
                deadline_clock: Mutex::new(None),
                events,
            }),
        })
    }

    /// Spawn the countdown task. A no-op for untimed sessions and sessions
    /// that are already terminal.
    pub fn start_deadline_clock(&self) {
        let Some(deadline_at) = self.core.deadline_at else {
            return;
        };
        if lock(&self.core.phase).phase.is_terminal() {
            return;
        }

        let weak = Arc::downgrade(&self.core);
        let clock = DeadlineClock::start(
            self.core.clock,
            deadline_at,
            self.core.tick_period,
            move |tick| {
                let Some(core) = weak.upgrade() else {
                    return false;
                };
                SessionController { core }.tick(tick.remaining_seconds);
                true
            },
        );
        *lock(&self.core.deadline_clock) = Some(clock);
    }

    fn stop_deadline_clock(&self) {
        if let Some(clock) = lock(&self.core.deadline_clock).take() {
            clock.stop();
        }
    }

    /// Tear the session down. No timer fires after this returns; safe to
    /// call repeatedly. Also runs when the last handle drops.
    pub fn close(&self) {
        self.stop_deadline_clock();
        self.core.draft_manager.cancel_all();
    }

    /// Record an edit to one question's answer.
    ///
    /// `immediate` persists right away (discrete choices); otherwise the
    /// trailing-edge debounce window applies.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::NotActive` unless the session is `Active` and
    /// `SessionError::UnknownQuestion` for ids outside this session.
    pub fn record_answer(
        &self,
        question_id: QuestionId,
        value: &str,
        immediate: bool,
    ) -> Result<(), SessionError> {
        {
            let state = lock(&self.core.phase);
            if state.phase != SessionPhase::Active {
                return Err(SessionError::NotActive { phase: state.phase });
            }
        }
        if !self.core.questions.iter().any(|q| q.id() == question_id) {
            return Err(SessionError::UnknownQuestion(question_id));
        }

        let now = self.core.clock.now();
        {
            let mut drafts = lock(&self.core.drafts);
            if let Some(draft) = drafts.get_mut(&question_id) {
                draft.mark_started(now);
                draft.note_edit(value, now);
            }
        }
        self.core.events.emit(SessionEvent::DraftSaveState {
            question_id,
            save_state: assess_core::model::SaveState::Dirty,
        });
        self.core
            .draft_manager
            .on_answer_changed(question_id, immediate);
        Ok(())
    }

    /// Move to another question. Starts that question's elapsed-time
    /// accounting on first visit; touches no other timer.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::IndexOutOfRange` for indexes past the
    /// question set.
    pub fn navigate(&self, index: usize) -> Result<(), SessionError> {
        let total = self.core.questions.len();
        if index >= total {
            return Err(SessionError::IndexOutOfRange { index, total });
        }

        let is_active = {
            let mut state = lock(&self.core.phase);
            state.current = index;
            state.phase == SessionPhase::Active
        };
        if is_active {
            let question_id = self.core.questions[index].id();
            let now = self.core.clock.now();
            let mut drafts = lock(&self.core.drafts);
            if let Some(draft) = drafts.get_mut(&question_id) {
                draft.mark_started(now);
            }
        }
        Ok(())
    }

    /// Flush drafts and finalize the session.
    ///
    /// Allowed from `Active` (first attempt) and `Submitting` (retry after
    /// a retryable failure). Concurrent callers collapse into one
    /// store-level finalize and share its result.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::NotActive` from terminal phases and
    /// `SessionError::Retryable` when finalize did not complete; the
    /// session then stays `Submitting` and may be retried.
    pub async fn request_submit(&self) -> Result<SessionOutcome, SessionError> {
        {
            let mut state = lock(&self.core.phase);
            match state.phase {
                SessionPhase::Active => state.phase = SessionPhase::Submitting,
                SessionPhase::Submitting => {}
                phase => return Err(SessionError::NotActive { phase }),
            }
        }

        match self
            .core
            .finalizer
            .finalize(&self.core.draft_manager, self.core.mode)
            .await
        {
            Ok(outcome) => {
                let newly_completed = {
                    let mut state = lock(&self.core.phase);
                    if state.phase == SessionPhase::Completed {
                        false
                    } else {
                        state.phase = SessionPhase::Completed;
                        state.outcome = Some(outcome.clone());
                        true
                    }
                };
                if newly_completed {
                    self.stop_deadline_clock();
                    info!(
                        session_id = self.core.session_id.value(),
                        total_points = outcome.total_points,
                        "session finalized"
                    );
                    self.core.events.emit(SessionEvent::SessionCompleted {
                        outcome: outcome.clone(),
                    });
                }
                Ok(outcome)
            }
            Err(err) => {
                // Still Submitting; the caller may try again.
                self.core.events.emit(SessionEvent::SessionError {
                    question_id: None,
                    message: err.to_string(),
                });
                Err(err)
            }
        }
    }

    /// Deadline observation, normally driven by the countdown task.
    ///
    /// Emits the remaining time; once it hits zero while the session is
    /// still `Active`, latches and forces exactly one submission. A no-op
    /// for any later phase.
    pub fn tick(&self, remaining_seconds: i64) {
        self.core.events.emit(SessionEvent::RemainingTime {
            seconds: remaining_seconds,
        });
        if remaining_seconds > 0 {
            return;
        }

        let fire = {
            let mut state = lock(&self.core.phase);
            if state.phase == SessionPhase::Active && !state.expiry_fired {
                state.expiry_fired = true;
                true
            } else {
                false
            }
        };
        if !fire {
            return;
        }

        info!(
            session_id = self.core.session_id.value(),
            "deadline reached; forcing submission"
        );
        let controller = self.clone();
        tokio::spawn(async move {
            if let Err(err) = controller.request_submit().await {
                warn!(
                    session_id = controller.core.session_id.value(),
                    error = %err,
                    "forced submission failed; session remains submitting"
                );
            }
        });
    }

    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.core.session_id
    }

    #[must_use]
    pub fn mode(&self) -> SessionMode {
        self.core.mode
    }

    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        lock(&self.core.phase).phase
    }

    #[must_use]
    pub fn questions(&self) -> &[Question] {
        &self.core.questions
    }

    #[must_use]
    pub fn current_index(&self) -> usize {
        lock(&self.core.phase).current
    }

    #[must_use]
    pub fn current_question(&self) -> Option<&Question> {
        self.core.questions.get(self.current_index())
    }

    /// Graded results, available once the session completed.
    #[must_use]
    pub fn outcome(&self) -> Option<SessionOutcome> {
        lock(&self.core.phase).outcome.clone()
    }

    /// Snapshot of one question's draft.
    #[must_use]
    pub fn draft(&self, question_id: QuestionId) -> Option<AnswerDraft> {
        lock(&self.core.drafts).get(&question_id).cloned()
    }

    /// Seconds left until the deadline according to the injected clock;
    /// `None` for untimed sessions.
    #[must_use]
    pub fn remaining_seconds(&self) -> Option<i64> {
        self.core
            .deadline_at
            .map(|deadline| self.core.clock.seconds_until(deadline).max(0))
    }

    #[must_use]
    pub fn progress(&self) -> SessionProgress {
        let total = self.core.questions.len();
        let answered = {
            let drafts = lock(&self.core.drafts);
            drafts.values().filter(|d| !d.is_empty()).count()
        };
        SessionProgress {
            total,
            answered,
            remaining: total.saturating_sub(answered),
            is_complete: self.phase() == SessionPhase::Completed,
        }
    }
}

//
// ─── TESTS ─────────────────────────────────────────────────────────────────────
//

#[cfg(test)]
mod tests {
    use super::*;
    use assess_core::model::QuestionKind;
    use assess_core::time::{fixed_clock, fixed_now};
    use chrono::Duration as ChronoDuration;
    use storage::store::{AssessmentStore, GradingKey, InMemoryStore};

    fn question(id: u64) -> Question {
        Question::new(
            QuestionId::new(id),
            QuestionKind::FillBlank,
            format!("Q{id}"),
            Vec::new(),
            5,
        )
        .unwrap()
    }

    fn key(id: u64) -> GradingKey {
        GradingKey {
            question_id: QuestionId::new(id),
            correct_answer: format!("A{id}"),
            points: 5,
            explanation: None,
            auto_gradable: true,
        }
    }

    fn seeded_store(session: SessionId, ids: &[u64]) -> Arc<InMemoryStore> {
        let store = Arc::new(InMemoryStore::new());
        store.register_session(session, ids.iter().map(|id| key(*id)).collect());
        store
    }

    fn active_controller(ids: &[u64]) -> SessionController {
        let session = SessionId::new(1);
        let store = seeded_store(session, ids);
        let config = SessionConfig::new(
            session,
            SessionMode::Contest,
            ids.iter().map(|id| question(*id)).collect(),
        )
        .with_deadline(fixed_now() + ChronoDuration::seconds(300));
        SessionController::initialize(
            config,
            SessionStatus::not_submitted(),
            store,
            fixed_clock(),
            None,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn initialize_requires_questions() {
        let store = Arc::new(InMemoryStore::new());
        let err = SessionController::initialize(
            SessionConfig::new(SessionId::new(1), SessionMode::Daily, Vec::new()),
            SessionStatus::not_submitted(),
            store,
            fixed_clock(),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, SessionError::Empty));
    }

    #[tokio::test]
    async fn expired_deadline_constructs_read_only() {
        let session = SessionId::new(1);
        let store = seeded_store(session, &[1]);
        let config = SessionConfig::new(session, SessionMode::Daily, vec![question(1)])
            .with_deadline(fixed_now() - ChronoDuration::seconds(1));
        let controller = SessionController::initialize(
            config,
            SessionStatus::not_submitted(),
            store,
            fixed_clock(),
            None,
        )
        .unwrap();

        assert_eq!(controller.phase(), SessionPhase::ExpiredView);
        let err = controller
            .record_answer(QuestionId::new(1), "late", false)
            .unwrap_err();
        assert!(matches!(err, SessionError::NotActive { .. }));
        // Drafts stay inspectable.
        assert!(controller.draft(QuestionId::new(1)).is_some());
    }

    #[tokio::test]
    async fn navigation_is_bounds_checked_and_stamps_start() {
        let controller = active_controller(&[1, 2, 3]);

        let err = controller.navigate(3).unwrap_err();
        assert!(matches!(
            err,
            SessionError::IndexOutOfRange { index: 3, total: 3 }
        ));

        controller.navigate(1).unwrap();
        assert_eq!(controller.current_index(), 1);
        assert!(controller.draft(QuestionId::new(2)).unwrap().started_at().is_some());
        // Question 3 has never been visited.
        assert!(controller.draft(QuestionId::new(3)).unwrap().started_at().is_none());
    }

    #[tokio::test]
    async fn unknown_question_is_rejected() {
        let controller = active_controller(&[1]);
        let err = controller
            .record_answer(QuestionId::new(99), "x", false)
            .unwrap_err();
        assert!(matches!(err, SessionError::UnknownQuestion(_)));
    }

    #[tokio::test]
    async fn tick_is_a_no_op_after_leaving_active() {
        let controller = active_controller(&[1]);
        controller
            .record_answer(QuestionId::new(1), "A1", true)
            .unwrap();
        let outcome = controller.request_submit().await.unwrap();
        assert_eq!(controller.phase(), SessionPhase::Completed);

        // Expiry after completion neither re-submits nor changes results.
        controller.tick(0);
        controller.tick(0);
        assert_eq!(controller.outcome(), Some(outcome));
    }

    #[tokio::test]
    async fn expiry_latch_forces_exactly_one_submission() {
        let controller = active_controller(&[1]);

        controller.tick(0);
        controller.tick(0);
        controller.tick(0);

        // Wait for the forced submission to land.
        let mut tries = 0;
        while controller.phase() != SessionPhase::Completed && tries < 100 {
            tokio::task::yield_now().await;
            tries += 1;
        }
        assert_eq!(controller.phase(), SessionPhase::Completed);
        let outcome = controller.outcome().expect("forced submit outcome");
        assert_eq!(outcome.submissions.len(), 1);
    }

    #[tokio::test]
    async fn terminal_phases_reject_submission() {
        let session = SessionId::new(1);
        let store = seeded_store(session, &[1]);
        let stored = store.finalize(session).await.unwrap();
        let status = store.get_session_status(session).await.unwrap();

        let config = SessionConfig::new(session, SessionMode::Daily, vec![question(1)]);
        let controller =
            SessionController::initialize(config, status, store, fixed_clock(), None).unwrap();

        assert_eq!(controller.phase(), SessionPhase::Completed);
        assert_eq!(controller.outcome(), Some(stored));
        let err = controller.request_submit().await.unwrap_err();
        assert!(matches!(err, SessionError::NotActive { .. }));
    }

    #[tokio::test]
    async fn progress_counts_non_empty_drafts() {
        let controller = active_controller(&[1, 2, 3]);
        controller
            .record_answer(QuestionId::new(1), "A1", true)
            .unwrap();
        controller
            .record_answer(QuestionId::new(2), "something", false)
            .unwrap();

        let progress = controller.progress();
        assert_eq!(progress.total, 3);
        assert_eq!(progress.answered, 2);
        assert_eq!(progress.remaining, 1);
        assert!(!progress.is_complete);
    }
}
