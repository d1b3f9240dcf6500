mod draft;
mod ids;
mod question;
mod session;

pub use draft::{AnswerDraft, SaveState};
pub use ids::{QuestionId, SessionId};
pub use question::{Question, QuestionError, QuestionKind, QuestionOption};
pub use session::{
    SessionMode, SessionOutcome, SessionPhase, SessionStatus, SubmissionResult,
};
