//! Persistence seams.
//!
//! Implemented by [`crate::db::Db`] (postgres) and [`MemoryStore`] (tests and
//! single-process runs).

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::{
    AnalysisId, AnalysisRecord, AnalysisStatus, LedgerEntry, LedgerKey, LedgerStatus,
};

pub use memory::MemoryStore;

/// Storage for analysis records. One record per subject.
#[async_trait]
pub trait AnalysisStore: Send + Sync {
    /// Insert a pending record for `subject`, or return the existing one.
    /// The flag is `true` when this call created the record.
    async fn create_or_get(&self, subject: &str, owner: &str) -> Result<(AnalysisRecord, bool)>;

    async fn get(&self, id: AnalysisId) -> Result<Option<AnalysisRecord>>;

    async fn find_by_subject(&self, subject: &str) -> Result<Option<AnalysisRecord>>;

    /// Overwrite the stored record, provided its stored status is still
    /// `expected`. Fails with `Error::InvalidTransition` otherwise.
    async fn update(&self, record: &AnalysisRecord, expected: AnalysisStatus) -> Result<()>;

    /// Records in `pending` or `analyzing`.
    async fn list_unfinished(&self) -> Result<Vec<AnalysisRecord>>;

    /// Delete terminal records whose results expired before `now`.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64>;

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

/// Storage for the ingestion ledger.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn get_entry(&self, key: &LedgerKey) -> Result<Option<LedgerEntry>>;

    /// A `success` or `pending` entry for `reference`, under any source item.
    async fn find_active_for_reference(&self, reference: &str) -> Result<Option<LedgerEntry>>;

    /// Insert `entry` unless its key is taken or, for pending and success
    /// entries, the reference already has an active entry. Returns whether
    /// the entry was written.
    async fn insert_entry(&self, entry: &LedgerEntry) -> Result<bool>;

    /// Move a pending entry to its final status. No-op for entries that are
    /// not pending.
    async fn finalize(
        &self,
        key: &LedgerKey,
        status: LedgerStatus,
        error: Option<&str>,
        analysis_id: Option<AnalysisId>,
    ) -> Result<bool>;

    async fn list_pending(&self) -> Result<Vec<LedgerEntry>>;

    /// Delete settled entries last touched before `cutoff`.
    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}
