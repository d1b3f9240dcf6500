use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use assess_core::Clock;
use assess_core::model::{AnswerDraft, QuestionId, SaveState, SessionId, SessionMode};
use storage::store::{AssessmentStore, StoreError};

use super::events::{EventSink, SessionEvent};
use super::lock;
use crate::error::SessionError;

/// In-memory table of drafts, one per question. Shared with the controller.
pub(crate) type DraftTable = HashMap<QuestionId, AnswerDraft>;

/// Owns the per-question debounce timers and drives persistence of edited
/// answers to the store.
///
/// At most one pending timer exists per question: a new edit always cancels
/// and replaces the outstanding one (trailing-edge debounce). Store calls
/// run without any lock held.
#[derive(Clone)]
pub(crate) struct AnswerDraftManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    session_id: SessionId,
    clock: Clock,
    debounce_delay: Duration,
    network_timeout: Duration,
    store: Arc<dyn AssessmentStore>,
    drafts: Arc<Mutex<DraftTable>>,
    timers: Mutex<HashMap<QuestionId, JoinHandle<()>>>,
    events: EventSink,
}

impl AnswerDraftManager {
    pub(crate) fn new(
        session_id: SessionId,
        clock: Clock,
        debounce_delay: Duration,
        network_timeout: Duration,
        store: Arc<dyn AssessmentStore>,
        drafts: Arc<Mutex<DraftTable>>,
        events: EventSink,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                session_id,
                clock,
                debounce_delay,
                network_timeout,
                store,
                drafts,
                timers: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    /// React to an edit the controller already recorded in the draft table.
    ///
    /// Discrete answers persist right away; free text waits out the
    /// debounce window first.
    pub(crate) fn on_answer_changed(&self, question_id: QuestionId, immediate: bool) {
        if immediate {
            // The persist supersedes any timer left over from earlier
            // free-text edits of the same question.
            self.cancel_timer(question_id);
            let manager = self.clone();
            tokio::spawn(async move {
                let _ = manager.persist_attempt(question_id).await;
            });
        } else {
            self.schedule(question_id);
        }
    }

    /// Start (or restart) the debounce timer for one question.
    fn schedule(&self, question_id: QuestionId) {
        let manager = self.clone();
        let delay = self.inner.debounce_delay;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Only the newest timer for a question survives to this point;
            // older ones were aborted when it was scheduled.
            lock(&manager.inner.timers).remove(&question_id);
            let _ = manager.persist_attempt(question_id).await;
        });

        let mut timers = lock(&self.inner.timers);
        if let Some(previous) = timers.insert(question_id, handle) {
            previous.abort();
        }
        debug!(
            session_id = self.inner.session_id.value(),
            question_id = question_id.value(),
            "debounce timer scheduled"
        );
    }

    /// Schedule a persist only when no timer is already pending.
    fn ensure_scheduled(&self, question_id: QuestionId) {
        let pending = lock(&self.inner.timers).contains_key(&question_id);
        if !pending {
            self.schedule(question_id);
        }
    }

    fn cancel_timer(&self, question_id: QuestionId) {
        if let Some(handle) = lock(&self.inner.timers).remove(&question_id) {
            handle.abort();
        }
    }

    /// Cancel every pending timer. After this returns no timer fires.
    pub(crate) fn cancel_all(&self) {
        let mut timers = lock(&self.inner.timers);
        for (_, handle) in timers.drain() {
            handle.abort();
        }
    }

    /// One persistence attempt for the current value of a question.
    ///
    /// Snapshot-compares after the store call returns: if a newer edit
    /// arrived mid-flight the draft stays `Dirty` and persistence of the
    /// latest value is re-scheduled, so a stale write can never mark a
    /// newer edit saved.
    async fn persist_attempt(&self, question_id: QuestionId) -> Result<(), StoreError> {
        let snapshot = {
            let mut drafts = lock(&self.inner.drafts);
            let Some(draft) = drafts.get_mut(&question_id) else {
                return Ok(());
            };
            // Empty answers are never sent to the store.
            if draft.is_empty() {
                return Ok(());
            }
            let Some(value) = draft.begin_save() else {
                return Ok(());
            };
            let time_taken = draft.elapsed_seconds(self.inner.clock.now());
            (value, time_taken)
        };
        self.inner.events.emit(SessionEvent::DraftSaveState {
            question_id,
            save_state: SaveState::Saving,
        });

        let (value, time_taken) = snapshot;
        let result = match tokio::time::timeout(
            self.inner.network_timeout,
            self.inner
                .store
                .save_draft(self.inner.session_id, question_id, &value, time_taken),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout),
        };

        match result {
            Ok(()) => {
                let saved = {
                    let mut drafts = lock(&self.inner.drafts);
                    drafts
                        .get_mut(&question_id)
                        .is_some_and(|d| d.complete_save(&value))
                };
                if saved {
                    self.inner.events.emit(SessionEvent::DraftSaveState {
                        question_id,
                        save_state: SaveState::Saved,
                    });
                } else {
                    debug!(
                        session_id = self.inner.session_id.value(),
                        question_id = question_id.value(),
                        "draft changed mid-save, rescheduling latest value"
                    );
                    self.ensure_scheduled(question_id);
                }
                Ok(())
            }
            Err(err) => {
                let failed = {
                    let mut drafts = lock(&self.inner.drafts);
                    drafts
                        .get_mut(&question_id)
                        .is_some_and(|d| d.fail_save(&value))
                };
                if failed {
                    warn!(
                        session_id = self.inner.session_id.value(),
                        question_id = question_id.value(),
                        error = %err,
                        "draft save failed"
                    );
                    self.inner.events.emit(SessionEvent::DraftSaveState {
                        question_id,
                        save_state: SaveState::Failed,
                    });
                } else {
                    // An edit raced the failure; its value still needs a
                    // persist pass.
                    self.ensure_scheduled(question_id);
                }
                Err(err)
            }
        }
    }

    /// Cancel all pending timers and persist everything unpersisted.
    ///
    /// Deadline-bound modes get one retry per draft and propagate the final
    /// failure; practice sessions report and move on.
    pub(crate) async fn flush_all(&self, mode: SessionMode) -> Result<(), SessionError> {
        self.cancel_all();

        let pending: Vec<QuestionId> = {
            let drafts = lock(&self.inner.drafts);
            drafts
                .iter()
                .filter(|(_, draft)| draft.needs_persist() && !draft.is_empty())
                .map(|(id, _)| *id)
                .collect()
        };

        for question_id in pending {
            match self.persist_attempt(question_id).await {
                Ok(()) => {}
                Err(err) if mode == SessionMode::Practice => {
                    warn!(
                        session_id = self.inner.session_id.value(),
                        question_id = question_id.value(),
                        error = %err,
                        "draft flush failed; practice session continues"
                    );
                }
                Err(_first_attempt) => {
                    if let Err(err) = self.persist_attempt(question_id).await {
                        warn!(
                            session_id = self.inner.session_id.value(),
                            question_id = question_id.value(),
                            error = %err,
                            "draft flush failed after retry"
                        );
                        return Err(SessionError::Retryable(err));
                    }
                }
            }
        }

        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn pending_timers(&self) -> usize {
        lock(&self.inner.timers).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assess_core::time::{fixed_clock, fixed_now};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    use assess_core::model::{SessionOutcome, SessionStatus};

    const DELAY: Duration = Duration::from_millis(1500);
    const NET_TIMEOUT: Duration = Duration::from_secs(10);

    /// Scripted store double: records saves, can fail or stall on demand.
    #[derive(Default)]
    struct ScriptedStore {
        saves: Mutex<Vec<(QuestionId, String, i64)>>,
        save_calls: AtomicUsize,
        fail_saves: AtomicUsize,
        gate: Option<Arc<Notify>>,
    }

    impl ScriptedStore {
        fn new() -> Self {
            Self::default()
        }

        fn gated(gate: Arc<Notify>) -> Self {
            Self {
                gate: Some(gate),
                ..Self::default()
            }
        }

        fn fail_next(&self, n: usize) {
            self.fail_saves.store(n, Ordering::SeqCst);
        }

        fn saved(&self) -> Vec<(QuestionId, String, i64)> {
            lock(&self.saves).clone()
        }
    }

    #[async_trait]
    impl AssessmentStore for ScriptedStore {
        async fn get_session_status(
            &self,
            _session: SessionId,
        ) -> Result<SessionStatus, StoreError> {
            Ok(SessionStatus::not_submitted())
        }

        async fn save_draft(
            &self,
            _session: SessionId,
            question: QuestionId,
            value: &str,
            time_taken_seconds: i64,
        ) -> Result<(), StoreError> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.save_calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.fail_saves.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_saves.store(remaining - 1, Ordering::SeqCst);
                return Err(StoreError::Connection("simulated outage".into()));
            }
            lock(&self.saves).push((question, value.to_owned(), time_taken_seconds));
            Ok(())
        }

        async fn finalize(&self, _session: SessionId) -> Result<SessionOutcome, StoreError> {
            Err(StoreError::NotFound)
        }
    }

    fn manager_with(store: Arc<ScriptedStore>) -> (AnswerDraftManager, Arc<Mutex<DraftTable>>) {
        let drafts: Arc<Mutex<DraftTable>> = Arc::new(Mutex::new(HashMap::new()));
        let manager = AnswerDraftManager::new(
            SessionId::new(1),
            fixed_clock(),
            DELAY,
            NET_TIMEOUT,
            store,
            drafts.clone(),
            EventSink::disabled(),
        );
        (manager, drafts)
    }

    fn edit(drafts: &Arc<Mutex<DraftTable>>, question: QuestionId, value: &str) {
        let mut guard = lock(drafts);
        guard
            .entry(question)
            .or_insert_with(AnswerDraft::new)
            .note_edit(value, fixed_now());
    }

    fn save_state(drafts: &Arc<Mutex<DraftTable>>, question: QuestionId) -> SaveState {
        lock(drafts)[&question].save_state()
    }

    /// Let every ready task run to its next suspension point. With paused
    /// time a 1 ms sleep only advances once the runtime is otherwise idle.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_edits_coalesce_into_one_save_of_the_last_value() {
        let store = Arc::new(ScriptedStore::new());
        let (manager, drafts) = manager_with(store.clone());
        let q = QuestionId::new(7);

        for value in ["a", "ab", "abc"] {
            edit(&drafts, q, value);
            manager.on_answer_changed(q, false);
            tokio::time::advance(Duration::from_millis(100)).await;
        }

        tokio::time::advance(DELAY).await;
        settle().await;

        let saved = store.saved();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].1, "abc");
        assert_eq!(save_state(&drafts, q), SaveState::Saved);
    }

    #[tokio::test(start_paused = true)]
    async fn debounce_window_restarts_on_every_edit() {
        let store = Arc::new(ScriptedStore::new());
        let (manager, drafts) = manager_with(store.clone());
        let q = QuestionId::new(1);

        edit(&drafts, q, "first");
        manager.on_answer_changed(q, false);

        // Second edit at t=1000ms pushes persistence to ~t=2500ms.
        tokio::time::advance(Duration::from_millis(1000)).await;
        edit(&drafts, q, "second");
        manager.on_answer_changed(q, false);

        // At t=1600ms the original window has elapsed but nothing saved.
        tokio::time::advance(Duration::from_millis(600)).await;
        settle().await;
        assert!(store.saved().is_empty());

        // At t=2600ms the restarted window has elapsed.
        tokio::time::advance(Duration::from_millis(1000)).await;
        settle().await;
        let saved = store.saved();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].1, "second");
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_answers_skip_the_debounce_window() {
        let store = Arc::new(ScriptedStore::new());
        let (manager, drafts) = manager_with(store.clone());
        let q = QuestionId::new(3);

        edit(&drafts, q, "Option B");
        manager.on_answer_changed(q, true);
        settle().await;

        assert_eq!(store.saved().len(), 1);
        assert_eq!(save_state(&drafts, q), SaveState::Saved);
        assert_eq!(manager.pending_timers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_save_marks_failed_and_next_edit_retries() {
        let store = Arc::new(ScriptedStore::new());
        store.fail_next(1);
        let (manager, drafts) = manager_with(store.clone());
        let q = QuestionId::new(7);

        edit(&drafts, q, "answer");
        manager.on_answer_changed(q, false);
        tokio::time::advance(DELAY).await;
        settle().await;
        assert_eq!(save_state(&drafts, q), SaveState::Failed);
        assert!(store.saved().is_empty());

        // Editing again resets to Dirty and schedules a fresh attempt.
        edit(&drafts, q, "answer v2");
        assert_eq!(save_state(&drafts, q), SaveState::Dirty);
        manager.on_answer_changed(q, false);
        tokio::time::advance(DELAY).await;
        settle().await;

        assert_eq!(save_state(&drafts, q), SaveState::Saved);
        assert_eq!(store.saved()[0].1, "answer v2");
    }

    #[tokio::test(start_paused = true)]
    async fn mid_flight_edit_is_never_masked_by_the_stale_write() {
        let gate = Arc::new(Notify::new());
        let store = Arc::new(ScriptedStore::gated(gate.clone()));
        let (manager, drafts) = manager_with(store.clone());
        let q = QuestionId::new(2);

        edit(&drafts, q, "old");
        manager.on_answer_changed(q, false);
        tokio::time::advance(DELAY).await;
        settle().await;
        // The save is now parked inside the store call.
        assert_eq!(save_state(&drafts, q), SaveState::Saving);

        edit(&drafts, q, "new");
        assert_eq!(save_state(&drafts, q), SaveState::Dirty);

        // Release the stale write; it must not mark the newer edit saved.
        gate.notify_one();
        settle().await;
        assert_eq!(save_state(&drafts, q), SaveState::Dirty);

        // The rescheduled persist picks up the latest value.
        tokio::time::advance(DELAY).await;
        settle().await;
        assert_eq!(save_state(&drafts, q), SaveState::Saving);
        gate.notify_one();
        settle().await;
        assert_eq!(save_state(&drafts, q), SaveState::Saved);
        let saved = store.saved();
        assert_eq!(saved.last().unwrap().1, "new");
    }

    #[tokio::test(start_paused = true)]
    async fn flush_cancels_timers_and_persists_dirty_drafts() {
        let store = Arc::new(ScriptedStore::new());
        let (manager, drafts) = manager_with(store.clone());

        edit(&drafts, QuestionId::new(1), "one");
        manager.on_answer_changed(QuestionId::new(1), false);
        edit(&drafts, QuestionId::new(2), "two");
        manager.on_answer_changed(QuestionId::new(2), false);
        assert_eq!(manager.pending_timers(), 2);

        manager.flush_all(SessionMode::Contest).await.unwrap();

        assert_eq!(manager.pending_timers(), 0);
        let mut saved: Vec<String> = store.saved().into_iter().map(|(_, v, _)| v).collect();
        saved.sort();
        assert_eq!(saved, vec!["one".to_owned(), "two".to_owned()]);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_retries_once_for_deadline_bound_modes() {
        let store = Arc::new(ScriptedStore::new());
        store.fail_next(1);
        let (manager, drafts) = manager_with(store.clone());

        edit(&drafts, QuestionId::new(5), "value");
        manager.flush_all(SessionMode::Daily).await.unwrap();

        assert_eq!(store.save_calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.saved().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_failure_after_retry_is_retryable() {
        let store = Arc::new(ScriptedStore::new());
        store.fail_next(2);
        let (manager, drafts) = manager_with(store.clone());

        edit(&drafts, QuestionId::new(5), "value");
        let err = manager.flush_all(SessionMode::Contest).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn practice_flush_tolerates_failures() {
        let store = Arc::new(ScriptedStore::new());
        store.fail_next(5);
        let (manager, drafts) = manager_with(store.clone());

        edit(&drafts, QuestionId::new(1), "kept locally");
        manager.flush_all(SessionMode::Practice).await.unwrap();
        assert_eq!(store.save_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_answers_are_never_persisted() {
        let store = Arc::new(ScriptedStore::new());
        let (manager, drafts) = manager_with(store.clone());
        let q = QuestionId::new(9);

        edit(&drafts, q, "   ");
        manager.on_answer_changed(q, false);
        tokio::time::advance(DELAY).await;
        settle().await;

        assert!(store.saved().is_empty());
        manager.flush_all(SessionMode::Contest).await.unwrap();
        assert!(store.saved().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_prevents_pending_persists() {
        let store = Arc::new(ScriptedStore::new());
        let (manager, drafts) = manager_with(store.clone());

        edit(&drafts, QuestionId::new(1), "never sent");
        manager.on_answer_changed(QuestionId::new(1), false);
        manager.cancel_all();

        tokio::time::advance(DELAY + Duration::from_secs(1)).await;
        settle().await;
        assert!(store.saved().is_empty());
    }
}
