//! Ingestion ledger persistence.
//!
//! Dedup is enforced by the schema: the composite primary key and the
//! partial unique index on active references turn a racing duplicate
//! insert into `ON CONFLICT DO NOTHING`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::model::{AnalysisId, LedgerEntry, LedgerKey, LedgerStatus};
use crate::store::LedgerStore;

const COLUMNS: &str = "source_item_id, candidate_reference, status, discovered_at, processed_at, error_message, reason, analysis_id";

#[async_trait]
impl LedgerStore for super::Db {
    async fn get_entry(&self, key: &LedgerKey) -> Result<Option<LedgerEntry>> {
        let row: Option<LedgerRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM ingestion_ledger
             WHERE source_item_id = $1 AND candidate_reference = $2"
        ))
        .bind(&key.source_item_id)
        .bind(&key.candidate_reference)
        .fetch_optional(&self.pool)
        .await?;
        row.map(LedgerRow::try_into_entry).transpose()
    }

    async fn find_active_for_reference(&self, reference: &str) -> Result<Option<LedgerEntry>> {
        let row: Option<LedgerRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM ingestion_ledger
             WHERE candidate_reference = $1 AND status IN ('pending', 'success')
             LIMIT 1"
        ))
        .bind(reference)
        .fetch_optional(&self.pool)
        .await?;
        row.map(LedgerRow::try_into_entry).transpose()
    }

    async fn insert_entry(&self, entry: &LedgerEntry) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO ingestion_ledger (source_item_id, candidate_reference, status, discovered_at, processed_at, error_message, reason, analysis_id)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT DO NOTHING",
        )
        .bind(&entry.key.source_item_id)
        .bind(&entry.key.candidate_reference)
        .bind(entry.status.as_str())
        .bind(entry.discovered_at)
        .bind(entry.processed_at)
        .bind(&entry.error_message)
        .bind(&entry.reason)
        .bind(entry.analysis_id.map(|id| id.0))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn finalize(
        &self,
        key: &LedgerKey,
        status: LedgerStatus,
        error: Option<&str>,
        analysis_id: Option<AnalysisId>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE ingestion_ledger
             SET status = $1, processed_at = now(), error_message = $2,
                 analysis_id = COALESCE($3, analysis_id)
             WHERE source_item_id = $4 AND candidate_reference = $5 AND status = 'pending'",
        )
        .bind(status.as_str())
        .bind(error)
        .bind(analysis_id.map(|id| id.0))
        .bind(&key.source_item_id)
        .bind(&key.candidate_reference)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_pending(&self) -> Result<Vec<LedgerEntry>> {
        let rows: Vec<LedgerRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM ingestion_ledger
             WHERE status = 'pending'
             ORDER BY discovered_at"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(LedgerRow::try_into_entry).collect()
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM ingestion_ledger
             WHERE status <> 'pending' AND COALESCE(processed_at, discovered_at) < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[derive(sqlx::FromRow)]
struct LedgerRow {
    source_item_id: String,
    candidate_reference: String,
    status: String,
    discovered_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    reason: Option<String>,
    analysis_id: Option<Uuid>,
}

impl LedgerRow {
    fn try_into_entry(self) -> Result<LedgerEntry> {
        Ok(LedgerEntry {
            key: LedgerKey {
                source_item_id: self.source_item_id,
                candidate_reference: self.candidate_reference,
            },
            status: self.status.parse()?,
            discovered_at: self.discovered_at,
            processed_at: self.processed_at,
            error_message: self.error_message,
            reason: self.reason,
            analysis_id: self.analysis_id.map(AnalysisId),
        })
    }
}
