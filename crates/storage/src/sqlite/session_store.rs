use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;

use assess_core::model::{
    QuestionId, SessionId, SessionMode, SessionOutcome, SessionStatus, SubmissionResult,
};

use super::SqliteStore;
use crate::store::{AssessmentStore, GradingKey, StoreError, grade_answer};

fn id_i64(field: &'static str, v: u64) -> Result<i64, StoreError> {
    i64::try_from(v).map_err(|_| StoreError::Serialization(format!("{field} overflow")))
}

fn ser<E: core::fmt::Display>(e: E) -> StoreError {
    StoreError::Serialization(e.to_string())
}

fn conn(e: sqlx::Error) -> StoreError {
    StoreError::Connection(e.to_string())
}

fn u32_from_i64(field: &'static str, v: i64) -> Result<u32, StoreError> {
    u32::try_from(v).map_err(|_| StoreError::Serialization(format!("invalid {field}: {v}")))
}

fn mode_str(mode: SessionMode) -> &'static str {
    match mode {
        SessionMode::Daily => "daily",
        SessionMode::Practice => "practice",
        SessionMode::Contest => "contest",
    }
}

fn map_submission_row(row: &sqlx::sqlite::SqliteRow) -> Result<SubmissionResult, StoreError> {
    let question_id: i64 = row.try_get("question_id").map_err(ser)?;
    let question_id = u64::try_from(question_id)
        .map_err(|_| StoreError::Serialization(format!("invalid question_id: {question_id}")))?;
    Ok(SubmissionResult {
        question_id: QuestionId::new(question_id),
        answer: row.try_get("answer").map_err(ser)?,
        is_correct: row.try_get::<i64, _>("is_correct").map_err(ser)? != 0,
        points_earned: u32_from_i64(
            "points_earned",
            row.try_get::<i64, _>("points_earned").map_err(ser)?,
        )?,
        correct_answer: row.try_get("correct_answer").map_err(ser)?,
        explanation: row.try_get("explanation").map_err(ser)?,
        time_taken_seconds: row.try_get("time_taken_seconds").map_err(ser)?,
    })
}

impl SqliteStore {
    /// Register a session and its grading keys. Key order fixes the order
    /// of the graded result set.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the session cannot be stored.
    pub async fn create_session(
        &self,
        session: SessionId,
        mode: SessionMode,
        deadline_at: Option<DateTime<Utc>>,
        keys: &[GradingKey],
    ) -> Result<(), StoreError> {
        let session_id = id_i64("session_id", session.value())?;
        let mut tx = self.pool().begin().await.map_err(conn)?;

        sqlx::query(
            r"
                INSERT INTO sessions (id, mode, deadline_at)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(id) DO NOTHING
            ",
        )
        .bind(session_id)
        .bind(mode_str(mode))
        .bind(deadline_at)
        .execute(&mut *tx)
        .await
        .map_err(conn)?;

        for (position, key) in keys.iter().enumerate() {
            let question_id = id_i64("question_id", key.question_id.value())?;
            sqlx::query(
                r"
                    INSERT INTO grading_keys (
                        session_id, question_id, correct_answer, points,
                        explanation, auto_gradable, position
                    )
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                    ON CONFLICT(session_id, question_id) DO NOTHING
                ",
            )
            .bind(session_id)
            .bind(question_id)
            .bind(&key.correct_answer)
            .bind(i64::from(key.points))
            .bind(&key.explanation)
            .bind(i64::from(key.auto_gradable))
            .bind(i64::try_from(position).map_err(|_| ser("position overflow"))?)
            .execute(&mut *tx)
            .await
            .map_err(conn)?;
        }

        tx.commit().await.map_err(conn)
    }

    async fn load_submissions(
        &self,
        session_id: i64,
        total_points: i64,
    ) -> Result<SessionOutcome, StoreError> {
        let rows = sqlx::query(
            r"
                SELECT question_id, answer, is_correct, points_earned,
                       correct_answer, explanation, time_taken_seconds
                FROM submissions
                WHERE session_id = ?1
                ORDER BY position
            ",
        )
        .bind(session_id)
        .fetch_all(self.pool())
        .await
        .map_err(conn)?;

        let submissions = rows
            .iter()
            .map(map_submission_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(SessionOutcome {
            submissions,
            total_points: u32_from_i64("total_points", total_points)?,
        })
    }
}

#[async_trait]
impl AssessmentStore for SqliteStore {
    async fn get_session_status(&self, session: SessionId) -> Result<SessionStatus, StoreError> {
        let session_id = id_i64("session_id", session.value())?;
        let row = sqlx::query("SELECT submitted_at, total_points FROM sessions WHERE id = ?1")
            .bind(session_id)
            .fetch_optional(self.pool())
            .await
            .map_err(conn)?
            .ok_or(StoreError::NotFound)?;

        let submitted_at: Option<DateTime<Utc>> = row.try_get("submitted_at").map_err(ser)?;
        if submitted_at.is_none() {
            return Ok(SessionStatus::not_submitted());
        }

        let total_points: i64 = row.try_get("total_points").map_err(ser)?;
        let outcome = self.load_submissions(session_id, total_points).await?;
        Ok(SessionStatus::submitted(outcome))
    }

    async fn save_draft(
        &self,
        session: SessionId,
        question: QuestionId,
        value: &str,
        time_taken_seconds: i64,
    ) -> Result<(), StoreError> {
        let session_id = id_i64("session_id", session.value())?;
        let question_id = id_i64("question_id", question.value())?;

        let row = sqlx::query("SELECT submitted_at FROM sessions WHERE id = ?1")
            .bind(session_id)
            .fetch_optional(self.pool())
            .await
            .map_err(conn)?
            .ok_or(StoreError::NotFound)?;
        let submitted_at: Option<DateTime<Utc>> = row.try_get("submitted_at").map_err(ser)?;
        if submitted_at.is_some() {
            return Err(StoreError::Conflict);
        }

        sqlx::query(
            r"
                INSERT INTO answer_drafts (
                    session_id, question_id, value, time_taken_seconds, updated_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(session_id, question_id) DO UPDATE SET
                    value = excluded.value,
                    time_taken_seconds = excluded.time_taken_seconds,
                    updated_at = excluded.updated_at
            ",
        )
        .bind(session_id)
        .bind(question_id)
        .bind(value)
        .bind(time_taken_seconds.max(0))
        .bind(Utc::now())
        .execute(self.pool())
        .await
        .map_err(conn)?;

        Ok(())
    }

    async fn finalize(&self, session: SessionId) -> Result<SessionOutcome, StoreError> {
        let session_id = id_i64("session_id", session.value())?;
        let mut tx = self.pool().begin().await.map_err(conn)?;

        let row = sqlx::query("SELECT submitted_at, total_points FROM sessions WHERE id = ?1")
            .bind(session_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(conn)?
            .ok_or(StoreError::NotFound)?;
        let submitted_at: Option<DateTime<Utc>> = row.try_get("submitted_at").map_err(ser)?;
        let stored_total: i64 = row.try_get("total_points").map_err(ser)?;

        // Already finalized: hand back the stored result set verbatim.
        if submitted_at.is_some() {
            tx.commit().await.map_err(conn)?;
            return self.load_submissions(session_id, stored_total).await;
        }

        let key_rows = sqlx::query(
            r"
                SELECT question_id, correct_answer, points, explanation, auto_gradable
                FROM grading_keys
                WHERE session_id = ?1
                ORDER BY position
            ",
        )
        .bind(session_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(conn)?;

        let mut submissions = Vec::with_capacity(key_rows.len());
        let mut total_points: u32 = 0;
        for (position, key_row) in key_rows.iter().enumerate() {
            let question_id: i64 = key_row.try_get("question_id").map_err(ser)?;
            let key = GradingKey {
                question_id: QuestionId::new(
                    u64::try_from(question_id).map_err(|_| {
                        StoreError::Serialization(format!("invalid question_id: {question_id}"))
                    })?,
                ),
                correct_answer: key_row.try_get("correct_answer").map_err(ser)?,
                points: u32_from_i64("points", key_row.try_get::<i64, _>("points").map_err(ser)?)?,
                explanation: key_row.try_get("explanation").map_err(ser)?,
                auto_gradable: key_row.try_get::<i64, _>("auto_gradable").map_err(ser)? != 0,
            };
            total_points = total_points.saturating_add(key.points);

            let draft_row = sqlx::query(
                r"
                    SELECT value, time_taken_seconds
                    FROM answer_drafts
                    WHERE session_id = ?1 AND question_id = ?2
                ",
            )
            .bind(session_id)
            .bind(question_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(conn)?;

            let (value, time_taken) = match &draft_row {
                Some(d) => (
                    d.try_get::<String, _>("value").map_err(ser)?,
                    d.try_get::<i64, _>("time_taken_seconds").map_err(ser)?,
                ),
                None => (String::new(), 0),
            };

            let graded = grade_answer(&key, &value, time_taken);
            sqlx::query(
                r"
                    INSERT INTO submissions (
                        session_id, question_id, answer, is_correct, points_earned,
                        correct_answer, explanation, time_taken_seconds, position
                    )
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ",
            )
            .bind(session_id)
            .bind(question_id)
            .bind(&graded.answer)
            .bind(i64::from(graded.is_correct))
            .bind(i64::from(graded.points_earned))
            .bind(&graded.correct_answer)
            .bind(&graded.explanation)
            .bind(graded.time_taken_seconds)
            .bind(i64::try_from(position).map_err(|_| ser("position overflow"))?)
            .execute(&mut *tx)
            .await
            .map_err(conn)?;
            submissions.push(graded);
        }

        sqlx::query("UPDATE sessions SET submitted_at = ?1, total_points = ?2 WHERE id = ?3")
            .bind(Utc::now())
            .bind(i64::from(total_points))
            .bind(session_id)
            .execute(&mut *tx)
            .await
            .map_err(conn)?;

        tx.commit().await.map_err(conn)?;
        Ok(SessionOutcome {
            submissions,
            total_points,
        })
    }
}
