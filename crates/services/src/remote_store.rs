use std::env;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use assess_core::model::{
    QuestionId, SessionId, SessionOutcome, SessionStatus, SubmissionResult,
};
use storage::store::{AssessmentStore, StoreError};

#[derive(Clone, Debug)]
pub struct RemoteStoreConfig {
    pub base_url: String,
    pub auth_token: String,
}

impl RemoteStoreConfig {
    #[must_use]
    pub fn from_env() -> Option<Self> {
        let base_url = env::var("ASSESS_API_BASE_URL").ok()?;
        if base_url.trim().is_empty() {
            return None;
        }
        let auth_token = env::var("ASSESS_API_TOKEN").unwrap_or_default();
        Some(Self {
            base_url,
            auth_token,
        })
    }
}

/// HTTP client implementation of the assessment store.
///
/// Talks JSON to the assessment backend; every failure maps onto
/// `StoreError` so the engine treats remote and local stores alike.
#[derive(Clone)]
pub struct RemoteStore {
    client: Client,
    config: RemoteStoreConfig,
}

impl RemoteStore {
    #[must_use]
    pub fn new(config: RemoteStoreConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    #[must_use]
    pub fn from_env() -> Option<Self> {
        RemoteStoreConfig::from_env().map(Self::new)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn request_error(err: &reqwest::Error) -> StoreError {
        if err.is_timeout() {
            StoreError::Timeout
        } else {
            StoreError::Connection(err.to_string())
        }
    }

    fn status_error(status: StatusCode) -> StoreError {
        match status {
            StatusCode::NOT_FOUND => StoreError::NotFound,
            StatusCode::CONFLICT => StoreError::Conflict,
            _ => StoreError::Connection(format!("unexpected status {status}")),
        }
    }
}

#[async_trait]
impl AssessmentStore for RemoteStore {
    async fn get_session_status(&self, session: SessionId) -> Result<SessionStatus, StoreError> {
        let url = self.url(&format!("sessions/{}/status", session.value()));
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.config.auth_token)
            .send()
            .await
            .map_err(|e| Self::request_error(&e))?;

        if !response.status().is_success() {
            return Err(Self::status_error(response.status()));
        }

        let body: StatusResponse = response
            .json()
            .await
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(body.into_status())
    }

    async fn save_draft(
        &self,
        session: SessionId,
        question: QuestionId,
        value: &str,
        time_taken_seconds: i64,
    ) -> Result<(), StoreError> {
        let url = self.url(&format!(
            "sessions/{}/questions/{}/answer",
            session.value(),
            question.value()
        ));
        let payload = SaveDraftRequest {
            answer: value,
            time_taken: time_taken_seconds,
        };
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.config.auth_token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| Self::request_error(&e))?;

        if !response.status().is_success() {
            return Err(Self::status_error(response.status()));
        }
        Ok(())
    }

    async fn finalize(&self, session: SessionId) -> Result<SessionOutcome, StoreError> {
        let url = self.url(&format!("sessions/{}/finalize", session.value()));
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.config.auth_token)
            .send()
            .await
            .map_err(|e| Self::request_error(&e))?;

        if !response.status().is_success() {
            return Err(Self::status_error(response.status()));
        }

        let body: OutcomePayload = response
            .json()
            .await
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(body.into_outcome())
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SaveDraftRequest<'a> {
    answer: &'a str,
    time_taken: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmissionPayload {
    question_id: u64,
    answer: String,
    is_correct: bool,
    points_earned: u32,
    correct_answer: String,
    explanation: Option<String>,
    time_taken: i64,
}

impl SubmissionPayload {
    fn into_result(self) -> SubmissionResult {
        SubmissionResult {
            question_id: QuestionId::new(self.question_id),
            answer: self.answer,
            is_correct: self.is_correct,
            points_earned: self.points_earned,
            correct_answer: self.correct_answer,
            explanation: self.explanation,
            time_taken_seconds: self.time_taken,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OutcomePayload {
    submissions: Vec<SubmissionPayload>,
    total_points: u32,
}

impl OutcomePayload {
    fn into_outcome(self) -> SessionOutcome {
        SessionOutcome {
            submissions: self
                .submissions
                .into_iter()
                .map(SubmissionPayload::into_result)
                .collect(),
            total_points: self.total_points,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    is_submitted: bool,
    #[serde(default)]
    result: Option<OutcomePayload>,
}

impl StatusResponse {
    fn into_status(self) -> SessionStatus {
        SessionStatus {
            is_submitted: self.is_submitted,
            outcome: self.result.map(OutcomePayload::into_outcome),
        }
    }
}
