pub mod sqlite;
pub mod store;

pub use store::{AssessmentStore, DraftRecord, GradingKey, InMemoryStore, StoreError};
