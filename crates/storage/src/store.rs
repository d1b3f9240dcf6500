use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use assess_core::model::{
    QuestionId, SessionId, SessionOutcome, SessionStatus, SubmissionResult,
};

/// Errors surfaced by store adapters.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    #[error("not found")]
    NotFound,

    #[error("session already finalized")]
    Conflict,

    #[error("connection error: {0}")]
    Connection(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("operation timed out")]
    Timeout,
}

impl StoreError {
    /// Transient errors are worth retrying with the same arguments.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout)
    }
}

/// Grading key for one question. The store owns correctness and points;
/// the engine never sees this type, only the graded results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GradingKey {
    pub question_id: QuestionId,
    pub correct_answer: String,
    pub points: u32,
    pub explanation: Option<String>,
    /// False for kinds graded by a human later (essays); those always earn
    /// zero points here while the submitted text is preserved.
    pub auto_gradable: bool,
}

/// Persisted shape of one saved answer draft.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DraftRecord {
    pub value: String,
    pub time_taken_seconds: i64,
}

/// Grade a submitted answer against its key.
///
/// Comparison is trimmed and ASCII-case-insensitive; an empty submission is
/// never correct.
#[must_use]
pub fn grade_answer(key: &GradingKey, answer: &str, time_taken_seconds: i64) -> SubmissionResult {
    let submitted = answer.trim();
    let is_correct = key.auto_gradable
        && !submitted.is_empty()
        && submitted.eq_ignore_ascii_case(key.correct_answer.trim());

    SubmissionResult {
        question_id: key.question_id,
        answer: submitted.to_owned(),
        is_correct,
        points_earned: if is_correct { key.points } else { 0 },
        correct_answer: key.correct_answer.clone(),
        explanation: key.explanation.clone(),
        time_taken_seconds,
    }
}

/// Store contract the session engine runs against.
///
/// Implementations must make `save_draft` an idempotent last-write-wins
/// upsert and `finalize` idempotent per session: repeated finalize calls
/// return the stored result set instead of re-grading.
#[async_trait]
pub trait AssessmentStore: Send + Sync {
    /// Fetch the canonical submitted/graded status for a session.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` for unknown sessions, or other store
    /// errors.
    async fn get_session_status(&self, session: SessionId) -> Result<SessionStatus, StoreError>;

    /// Upsert the draft answer for one question. Safe to retry with the
    /// same arguments.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` for unknown sessions,
    /// `StoreError::Conflict` once the session has been finalized, or other
    /// store errors.
    async fn save_draft(
        &self,
        session: SessionId,
        question: QuestionId,
        value: &str,
        time_taken_seconds: i64,
    ) -> Result<(), StoreError>;

    /// Convert the saved drafts into a graded, immutable result set.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` for unknown sessions, or other store
    /// errors.
    async fn finalize(&self, session: SessionId) -> Result<SessionOutcome, StoreError>;
}

struct SessionRecord {
    keys: Vec<GradingKey>,
    drafts: HashMap<QuestionId, DraftRecord>,
    outcome: Option<SessionOutcome>,
}

/// Simple in-memory store implementation for testing and prototyping.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    sessions: Arc<Mutex<HashMap<SessionId, SessionRecord>>>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Seed a session with its grading keys. Key order fixes the order of
    /// the graded result set.
    pub fn register_session(&self, session: SessionId, keys: Vec<GradingKey>) {
        if let Ok(mut guard) = self.sessions.lock() {
            guard.insert(
                session,
                SessionRecord {
                    keys,
                    drafts: HashMap::new(),
                    outcome: None,
                },
            );
        }
    }

    /// Inspect a saved draft (test helper).
    #[must_use]
    pub fn draft(&self, session: SessionId, question: QuestionId) -> Option<DraftRecord> {
        self.sessions
            .lock()
            .ok()?
            .get(&session)?
            .drafts
            .get(&question)
            .cloned()
    }
}

#[async_trait]
impl AssessmentStore for InMemoryStore {
    async fn get_session_status(&self, session: SessionId) -> Result<SessionStatus, StoreError> {
        let guard = self
            .sessions
            .lock()
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let record = guard.get(&session).ok_or(StoreError::NotFound)?;
        Ok(match &record.outcome {
            Some(outcome) => SessionStatus::submitted(outcome.clone()),
            None => SessionStatus::not_submitted(),
        })
    }

    async fn save_draft(
        &self,
        session: SessionId,
        question: QuestionId,
        value: &str,
        time_taken_seconds: i64,
    ) -> Result<(), StoreError> {
        let mut guard = self
            .sessions
            .lock()
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let record = guard.get_mut(&session).ok_or(StoreError::NotFound)?;
        if record.outcome.is_some() {
            return Err(StoreError::Conflict);
        }
        record.drafts.insert(
            question,
            DraftRecord {
                value: value.to_owned(),
                time_taken_seconds,
            },
        );
        Ok(())
    }

    async fn finalize(&self, session: SessionId) -> Result<SessionOutcome, StoreError> {
        let mut guard = self
            .sessions
            .lock()
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let record = guard.get_mut(&session).ok_or(StoreError::NotFound)?;

        if let Some(outcome) = &record.outcome {
            return Ok(outcome.clone());
        }

        let submissions: Vec<SubmissionResult> = record
            .keys
            .iter()
            .map(|key| {
                let draft = record.drafts.get(&key.question_id);
                let value = draft.map_or("", |d| d.value.as_str());
                let time_taken = draft.map_or(0, |d| d.time_taken_seconds);
                grade_answer(key, value, time_taken)
            })
            .collect();
        let total_points = record
            .keys
            .iter()
            .map(|k| k.points)
            .fold(0, u32::saturating_add);

        let outcome = SessionOutcome {
            submissions,
            total_points,
        };
        record.outcome = Some(outcome.clone());
        Ok(outcome)
    }
}
