//! Analysis record persistence.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{AnalysisId, AnalysisRecord, AnalysisStatus, PhaseResult};
use crate::phase::Phase;
use crate::store::AnalysisStore;

const COLUMNS: &str = "id, subject, owner, status, progress, current_phase, error_message, results, attempt, created_at, updated_at, started_at, completed_at, results_expire_at";

#[async_trait]
impl AnalysisStore for super::Db {
    async fn create_or_get(&self, subject: &str, owner: &str) -> Result<(AnalysisRecord, bool)> {
        let record = AnalysisRecord::new(subject, owner);
        // The unique index on subject makes concurrent creates collapse.
        let inserted: Option<(Uuid,)> = sqlx::query_as(
            "INSERT INTO analyses (id, subject, owner, status, progress, results, attempt, created_at, updated_at)
             VALUES ($1, $2, $3, 'pending', 0, '{}'::jsonb, $4, $5, $5)
             ON CONFLICT (subject) DO NOTHING
             RETURNING id",
        )
        .bind(record.id.0)
        .bind(&record.subject)
        .bind(&record.owner)
        .bind(record.attempt as i32)
        .bind(record.created_at)
        .fetch_optional(&self.pool)
        .await?;

        if inserted.is_some() {
            return Ok((record, true));
        }
        let existing = self
            .find_by_subject(subject)
            .await?
            .ok_or_else(|| Error::NotFound(format!("analysis for {subject}")))?;
        Ok((existing, false))
    }

    async fn get(&self, id: AnalysisId) -> Result<Option<AnalysisRecord>> {
        let row: Option<AnalysisRow> =
            sqlx::query_as(&format!("SELECT {COLUMNS} FROM analyses WHERE id = $1"))
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?;
        row.map(AnalysisRow::try_into_record).transpose()
    }

    async fn find_by_subject(&self, subject: &str) -> Result<Option<AnalysisRecord>> {
        let row: Option<AnalysisRow> =
            sqlx::query_as(&format!("SELECT {COLUMNS} FROM analyses WHERE subject = $1"))
                .bind(subject)
                .fetch_optional(&self.pool)
                .await?;
        row.map(AnalysisRow::try_into_record).transpose()
    }

    async fn update(&self, record: &AnalysisRecord, expected: AnalysisStatus) -> Result<()> {
        let results = serde_json::to_value(&record.results)?;
        let rows_affected = sqlx::query(
            "UPDATE analyses SET status = $1, progress = $2, current_phase = $3, error_message = $4,
                    results = $5, attempt = $6, updated_at = $7, started_at = $8,
                    completed_at = $9, results_expire_at = $10
             WHERE id = $11 AND status = $12",
        )
        .bind(record.status.as_str())
        .bind(record.progress as i16)
        .bind(record.current_phase.map(Phase::as_str))
        .bind(&record.error_message)
        .bind(results)
        .bind(record.attempt as i32)
        .bind(record.updated_at)
        .bind(record.started_at)
        .bind(record.completed_at)
        .bind(record.results_expire_at)
        .bind(record.id.0)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            let stored = self
                .get(record.id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("analysis {}", record.id)))?;
            return Err(Error::InvalidTransition {
                from: stored.status.to_string(),
                to: record.status.to_string(),
            });
        }
        Ok(())
    }

    async fn list_unfinished(&self) -> Result<Vec<AnalysisRecord>> {
        let rows: Vec<AnalysisRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM analyses
             WHERE status IN ('pending', 'analyzing')
             ORDER BY created_at"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(AnalysisRow::try_into_record).collect()
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM analyses
             WHERE status IN ('completed', 'failed') AND results_expire_at < $1",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn health_check(&self) -> Result<()> {
        self.ping().await
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct AnalysisRow {
    id: Uuid,
    subject: String,
    owner: String,
    status: String,
    progress: i16,
    current_phase: Option<String>,
    error_message: Option<String>,
    results: serde_json::Value,
    attempt: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    results_expire_at: Option<DateTime<Utc>>,
}

impl AnalysisRow {
    fn try_into_record(self) -> Result<AnalysisRecord> {
        let results: BTreeMap<Phase, PhaseResult> = serde_json::from_value(self.results)?;
        Ok(AnalysisRecord {
            id: AnalysisId(self.id),
            subject: self.subject,
            owner: self.owner,
            status: self.status.parse()?,
            progress: self.progress.clamp(0, 100) as u8,
            current_phase: self.current_phase.map(|p| p.parse()).transpose()?,
            error_message: self.error_message,
            results,
            attempt: self.attempt.max(1) as u32,
            created_at: self.created_at,
            updated_at: self.updated_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            results_expire_at: self.results_expire_at,
        })
    }
}
