#![forbid(unsafe_code)]

pub mod error;
pub mod remote_store;
pub mod sessions;

pub use assess_core::Clock;
pub use sessions as session;

pub use error::SessionError;

pub use sessions::{
    DeadlineClock, DeadlineTick, DeadlineTimer, SessionConfig, SessionController, SessionEvent,
    SessionLauncher, SessionProgress, SessionTiming,
};
