use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::QuestionId;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum QuestionError {
    #[error("choice question {0:?} needs at least two options")]
    MissingOptions(QuestionId),

    #[error("question {0:?} must be worth at least one point")]
    ZeroPoints(QuestionId),
}

/// Kind of answer a question expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuestionKind {
    SingleChoice,
    TrueFalse,
    FillBlank,
    Numeric,
    Essay,
}

impl QuestionKind {
    /// Discrete kinds (picking one option) are persisted immediately on
    /// selection; free-form input goes through the debounce window instead.
    #[must_use]
    pub fn is_discrete(self) -> bool {
        matches!(self, Self::SingleChoice | Self::TrueFalse)
    }
}

/// One selectable option of a choice-style question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionOption {
    pub id: u32,
    pub text: String,
}

/// A question as presented within a session.
///
/// Immutable for the life of the session; the set of questions is supplied
/// once at initialization and never changes afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    id: QuestionId,
    kind: QuestionKind,
    text: String,
    options: Vec<QuestionOption>,
    points: u32,
}

impl Question {
    /// Build a validated question.
    ///
    /// # Errors
    ///
    /// Returns `QuestionError::MissingOptions` when a choice-style question
    /// carries fewer than two options, and `QuestionError::ZeroPoints` when
    /// `points` is zero.
    pub fn new(
        id: QuestionId,
        kind: QuestionKind,
        text: impl Into<String>,
        options: Vec<QuestionOption>,
        points: u32,
    ) -> Result<Self, QuestionError> {
        if kind.is_discrete() && kind != QuestionKind::TrueFalse && options.len() < 2 {
            return Err(QuestionError::MissingOptions(id));
        }
        if points == 0 {
            return Err(QuestionError::ZeroPoints(id));
        }

        Ok(Self {
            id,
            kind,
            text: text.into(),
            options,
            points,
        })
    }

    #[must_use]
    pub fn id(&self) -> QuestionId {
        self.id
    }

    #[must_use]
    pub fn kind(&self) -> QuestionKind {
        self.kind
    }

    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    #[must_use]
    pub fn options(&self) -> &[QuestionOption] {
        &self.options
    }

    #[must_use]
    pub fn points(&self) -> u32 {
        self.points
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opt(id: u32, text: &str) -> QuestionOption {
        QuestionOption {
            id,
            text: text.to_owned(),
        }
    }

    #[test]
    fn single_choice_requires_options() {
        let err = Question::new(
            QuestionId::new(1),
            QuestionKind::SingleChoice,
            "Pick one",
            vec![opt(1, "only")],
            5,
        )
        .unwrap_err();
        assert!(matches!(err, QuestionError::MissingOptions(_)));
    }

    #[test]
    fn true_false_needs_no_options() {
        let q = Question::new(
            QuestionId::new(2),
            QuestionKind::TrueFalse,
            "Water is wet",
            Vec::new(),
            1,
        )
        .unwrap();
        assert!(q.kind().is_discrete());
    }

    #[test]
    fn zero_points_rejected() {
        let err = Question::new(
            QuestionId::new(3),
            QuestionKind::Essay,
            "Discuss",
            Vec::new(),
            0,
        )
        .unwrap_err();
        assert!(matches!(err, QuestionError::ZeroPoints(_)));
    }

    #[test]
    fn free_form_kinds_are_debounced() {
        assert!(!QuestionKind::FillBlank.is_discrete());
        assert!(!QuestionKind::Numeric.is_discrete());
        assert!(!QuestionKind::Essay.is_discrete());
    }
}
