//! In-memory store.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{AnalysisStore, LedgerStore};
use crate::error::{Error, Result};
use crate::model::{
    AnalysisId, AnalysisRecord, AnalysisStatus, LedgerEntry, LedgerKey, LedgerStatus, timestamp,
};

#[derive(Default)]
struct State {
    analyses: HashMap<AnalysisId, AnalysisRecord>,
    by_subject: HashMap<String, AnalysisId>,
    ledger: HashMap<LedgerKey, LedgerEntry>,
}

/// Both stores behind one mutex. Nothing is held across an await.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// All ledger entries, for inspection.
    pub fn ledger_entries(&self) -> Vec<LedgerEntry> {
        self.lock().ledger.values().cloned().collect()
    }

    /// Number of analysis records.
    pub fn analysis_count(&self) -> usize {
        self.lock().analyses.len()
    }
}

fn is_active(status: LedgerStatus) -> bool {
    matches!(status, LedgerStatus::Success | LedgerStatus::Pending)
}

#[async_trait]
impl AnalysisStore for MemoryStore {
    async fn create_or_get(&self, subject: &str, owner: &str) -> Result<(AnalysisRecord, bool)> {
        let mut state = self.lock();
        if let Some(record) = state
            .by_subject
            .get(subject)
            .and_then(|id| state.analyses.get(id))
        {
            return Ok((record.clone(), false));
        }
        let record = AnalysisRecord::new(subject, owner);
        state.by_subject.insert(subject.to_string(), record.id);
        state.analyses.insert(record.id, record.clone());
        Ok((record, true))
    }

    async fn get(&self, id: AnalysisId) -> Result<Option<AnalysisRecord>> {
        Ok(self.lock().analyses.get(&id).cloned())
    }

    async fn find_by_subject(&self, subject: &str) -> Result<Option<AnalysisRecord>> {
        let state = self.lock();
        Ok(state
            .by_subject
            .get(subject)
            .and_then(|id| state.analyses.get(id))
            .cloned())
    }

    async fn update(&self, record: &AnalysisRecord, expected: AnalysisStatus) -> Result<()> {
        let mut state = self.lock();
        let stored = state
            .analyses
            .get_mut(&record.id)
            .ok_or_else(|| Error::NotFound(format!("analysis {}", record.id)))?;
        if stored.status != expected {
            return Err(Error::InvalidTransition {
                from: stored.status.to_string(),
                to: record.status.to_string(),
            });
        }
        *stored = record.clone();
        Ok(())
    }

    async fn list_unfinished(&self) -> Result<Vec<AnalysisRecord>> {
        let mut records: Vec<AnalysisRecord> = self
            .lock()
            .analyses
            .values()
            .filter(|r| !r.is_terminal())
            .cloned()
            .collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut state = self.lock();
        let expired: Vec<AnalysisId> = state
            .analyses
            .values()
            .filter(|r| r.is_terminal() && r.results_expire_at.is_some_and(|at| at < now))
            .map(|r| r.id)
            .collect();
        for id in &expired {
            if let Some(record) = state.analyses.remove(id) {
                state.by_subject.remove(&record.subject);
            }
        }
        Ok(expired.len() as u64)
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn get_entry(&self, key: &LedgerKey) -> Result<Option<LedgerEntry>> {
        Ok(self.lock().ledger.get(key).cloned())
    }

    async fn find_active_for_reference(&self, reference: &str) -> Result<Option<LedgerEntry>> {
        Ok(self
            .lock()
            .ledger
            .values()
            .find(|e| e.key.candidate_reference == reference && is_active(e.status))
            .cloned())
    }

    async fn insert_entry(&self, entry: &LedgerEntry) -> Result<bool> {
        let mut state = self.lock();
        if state.ledger.contains_key(&entry.key) {
            return Ok(false);
        }
        if is_active(entry.status)
            && state.ledger.values().any(|e| {
                e.key.candidate_reference == entry.key.candidate_reference && is_active(e.status)
            })
        {
            return Ok(false);
        }
        state.ledger.insert(entry.key.clone(), entry.clone());
        Ok(true)
    }

    async fn finalize(
        &self,
        key: &LedgerKey,
        status: LedgerStatus,
        error: Option<&str>,
        analysis_id: Option<AnalysisId>,
    ) -> Result<bool> {
        let mut state = self.lock();
        match state.ledger.get_mut(key) {
            Some(entry) if entry.status == LedgerStatus::Pending => {
                entry.status = status;
                entry.processed_at = Some(timestamp());
                entry.error_message = error.map(str::to_string);
                if analysis_id.is_some() {
                    entry.analysis_id = analysis_id;
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_pending(&self) -> Result<Vec<LedgerEntry>> {
        Ok(self
            .lock()
            .ledger
            .values()
            .filter(|e| e.status == LedgerStatus::Pending)
            .cloned()
            .collect())
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut state = self.lock();
        let before = state.ledger.len();
        state.ledger.retain(|_, e| {
            e.status == LedgerStatus::Pending
                || e.processed_at.unwrap_or(e.discovered_at) >= cutoff
        });
        Ok((before - state.ledger.len()) as u64)
    }
}
