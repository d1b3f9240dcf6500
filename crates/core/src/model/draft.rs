use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Persistence state of an answer draft.
///
/// A draft only moves `Dirty -> Saving -> {Saved, Failed}`; any new edit
/// resets it to `Dirty` regardless of where it currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaveState {
    Dirty,
    Saving,
    Saved,
    Failed,
}

/// A locally held, possibly-unpersisted answer for one question.
///
/// Exactly one draft exists per question per session. An untouched draft is
/// considered in sync with the store (there is nothing to persist) and
/// starts out `Saved` with an empty value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnswerDraft {
    value: String,
    last_modified_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    save_state: SaveState,
}

impl AnswerDraft {
    #[must_use]
    pub fn new() -> Self {
        Self {
            value: String::new(),
            last_modified_at: None,
            started_at: None,
            save_state: SaveState::Saved,
        }
    }

    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }

    #[must_use]
    pub fn save_state(&self) -> SaveState {
        self.save_state
    }

    #[must_use]
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    #[must_use]
    pub fn last_modified_at(&self) -> Option<DateTime<Utc>> {
        self.last_modified_at
    }

    /// True when the draft holds no meaningful answer text.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.value.trim().is_empty()
    }

    /// True when the draft has unpersisted or failed work.
    #[must_use]
    pub fn needs_persist(&self) -> bool {
        matches!(self.save_state, SaveState::Dirty | SaveState::Failed)
    }

    /// Record a new edit. Resets the save state to `Dirty` from any state,
    /// including while a save for an older value is still in flight.
    pub fn note_edit(&mut self, value: impl Into<String>, now: DateTime<Utc>) {
        self.value = value.into();
        self.last_modified_at = Some(now);
        self.save_state = SaveState::Dirty;
    }

    /// Begin persisting the current value.
    ///
    /// Returns a snapshot of the value being saved, or `None` when there is
    /// nothing to do (already `Saved`, or another save is in flight).
    pub fn begin_save(&mut self) -> Option<String> {
        match self.save_state {
            SaveState::Dirty | SaveState::Failed => {
                self.save_state = SaveState::Saving;
                Some(self.value.clone())
            }
            SaveState::Saving | SaveState::Saved => None,
        }
    }

    /// Settle a successful save.
    ///
    /// Only transitions to `Saved` when the draft still holds exactly the
    /// value that was persisted; a newer edit that raced the network call
    /// keeps its `Dirty` state so the stale write cannot mask it. Returns
    /// whether the draft is now `Saved`.
    pub fn complete_save(&mut self, persisted_value: &str) -> bool {
        if self.save_state == SaveState::Saving && self.value == persisted_value {
            self.save_state = SaveState::Saved;
            true
        } else {
            false
        }
    }

    /// Settle a failed save. A mid-flight edit wins over the failure and the
    /// draft stays `Dirty`. Returns whether the draft is now `Failed`.
    pub fn fail_save(&mut self, attempted_value: &str) -> bool {
        if self.save_state == SaveState::Saving && self.value == attempted_value {
            self.save_state = SaveState::Failed;
            true
        } else {
            false
        }
    }

    /// Record the first moment this question became active. Later calls are
    /// no-ops so elapsed time always counts from the first visit.
    pub fn mark_started(&mut self, now: DateTime<Utc>) {
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
    }

    /// Seconds spent on this question so far. Never negative, never more
    /// than wall time since the first visit; zero for unvisited questions.
    #[must_use]
    pub fn elapsed_seconds(&self, now: DateTime<Utc>) -> i64 {
        self.started_at
            .map(|started| (now - started).num_seconds().max(0))
            .unwrap_or(0)
    }
}

impl Default for AnswerDraft {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::fixed_now;
    use chrono::Duration;

    #[test]
    fn untouched_draft_is_in_sync() {
        let draft = AnswerDraft::new();
        assert_eq!(draft.save_state(), SaveState::Saved);
        assert!(draft.is_empty());
        assert!(!draft.needs_persist());
    }

    #[test]
    fn edit_save_cycle() {
        let mut draft = AnswerDraft::new();
        draft.note_edit("42", fixed_now());
        assert_eq!(draft.save_state(), SaveState::Dirty);

        let snapshot = draft.begin_save().expect("dirty draft must save");
        assert_eq!(snapshot, "42");
        assert_eq!(draft.save_state(), SaveState::Saving);

        assert!(draft.complete_save(&snapshot));
        assert_eq!(draft.save_state(), SaveState::Saved);
    }

    #[test]
    fn stale_write_cannot_mark_newer_edit_saved() {
        let mut draft = AnswerDraft::new();
        draft.note_edit("first", fixed_now());
        let snapshot = draft.begin_save().unwrap();

        // A newer edit lands while the save is in flight.
        draft.note_edit("second", fixed_now());
        assert_eq!(draft.save_state(), SaveState::Dirty);

        assert!(!draft.complete_save(&snapshot));
        assert_eq!(draft.save_state(), SaveState::Dirty);
        assert_eq!(draft.value(), "second");
    }

    #[test]
    fn failure_marks_failed_unless_edited() {
        let mut draft = AnswerDraft::new();
        draft.note_edit("x", fixed_now());
        let snapshot = draft.begin_save().unwrap();
        assert!(draft.fail_save(&snapshot));
        assert_eq!(draft.save_state(), SaveState::Failed);

        // Failed drafts may retry.
        assert!(draft.begin_save().is_some());

        // But an edit during flight beats the failure report.
        let mut racy = AnswerDraft::new();
        racy.note_edit("a", fixed_now());
        let snap = racy.begin_save().unwrap();
        racy.note_edit("b", fixed_now());
        assert!(!racy.fail_save(&snap));
        assert_eq!(racy.save_state(), SaveState::Dirty);
    }

    #[test]
    fn no_double_save_while_in_flight() {
        let mut draft = AnswerDraft::new();
        draft.note_edit("x", fixed_now());
        assert!(draft.begin_save().is_some());
        assert!(draft.begin_save().is_none());
    }

    #[test]
    fn elapsed_counts_from_first_visit_only() {
        let mut draft = AnswerDraft::new();
        let t0 = fixed_now();
        assert_eq!(draft.elapsed_seconds(t0), 0);

        draft.mark_started(t0);
        draft.mark_started(t0 + Duration::seconds(30));
        assert_eq!(draft.elapsed_seconds(t0 + Duration::seconds(45)), 45);

        // A clock running behind the first visit clamps to zero.
        assert_eq!(draft.elapsed_seconds(t0 - Duration::seconds(5)), 0);
    }
}
