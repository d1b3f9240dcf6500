use serde::{Deserialize, Serialize};
use std::fmt;

use crate::model::QuestionId;

/// How a session is scheduled and graded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionMode {
    Daily,
    Practice,
    Contest,
}

impl SessionMode {
    /// Practice sessions carry no deadline and tolerate flush failures;
    /// the other modes are deadline-bound.
    #[must_use]
    pub fn is_timed(self) -> bool {
        !matches!(self, Self::Practice)
    }
}

/// Lifecycle of one attempt at a question set.
///
/// Transitions are monotonic. `Completed` and `ExpiredView` are terminal;
/// `ExpiredView` is only ever constructed at initialization, never reached
/// from `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Active,
    Submitting,
    Completed,
    ExpiredView,
}

impl SessionPhase {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::ExpiredView)
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Active => "active",
            Self::Submitting => "submitting",
            Self::Completed => "completed",
            Self::ExpiredView => "expired",
        };
        f.write_str(name)
    }
}

/// Graded record for a single question, produced only by finalization.
/// Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionResult {
    pub question_id: QuestionId,
    pub answer: String,
    pub is_correct: bool,
    pub points_earned: u32,
    pub correct_answer: String,
    pub explanation: Option<String>,
    pub time_taken_seconds: i64,
}

/// The full graded result set for a finalized session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOutcome {
    pub submissions: Vec<SubmissionResult>,
    pub total_points: u32,
}

impl SessionOutcome {
    /// Sum of points actually earned across all submissions.
    #[must_use]
    pub fn points_earned(&self) -> u32 {
        self.submissions
            .iter()
            .map(|s| s.points_earned)
            .fold(0, u32::saturating_add)
    }
}

/// The store's canonical answer to "has this session been finalized?".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub is_submitted: bool,
    pub outcome: Option<SessionOutcome>,
}

impl SessionStatus {
    #[must_use]
    pub fn not_submitted() -> Self {
        Self {
            is_submitted: false,
            outcome: None,
        }
    }

    #[must_use]
    pub fn submitted(outcome: SessionOutcome) -> Self {
        Self {
            is_submitted: true,
            outcome: Some(outcome),
        }
    }
}
