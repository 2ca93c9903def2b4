//! Ingestion ledger types.

use chrono::{DateTime, Utc};

use super::analysis::timestamp;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::AnalysisId;

/// Something the feed found: a tender reference carried by a source message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// Identifier of the source message (e.g. a mail UID).
    pub source_item_id: String,
    pub discovered_at: DateTime<Utc>,
    /// The underlying target (e.g. a tender listing URL).
    pub candidate_reference: String,
    #[serde(default)]
    pub raw_payload: serde_json::Value,
}

impl Candidate {
    pub fn key(&self) -> LedgerKey {
        LedgerKey {
            source_item_id: self.source_item_id.clone(),
            candidate_reference: self.candidate_reference.clone(),
        }
    }
}

/// Composite ledger key. Unique across the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LedgerKey {
    pub source_item_id: String,
    pub candidate_reference: String,
}

impl std::fmt::Display for LedgerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.source_item_id, self.candidate_reference)
    }
}

/// One evaluated candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub key: LedgerKey,
    pub status: LedgerStatus,
    pub discovered_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    /// Why the candidate was skipped, when it was.
    pub reason: Option<String>,
    pub analysis_id: Option<AnalysisId>,
}

impl LedgerEntry {
    /// A reservation: the candidate is about to be handed to the orchestrator.
    pub fn pending(candidate: &Candidate) -> Self {
        Self {
            key: candidate.key(),
            status: LedgerStatus::Pending,
            discovered_at: candidate.discovered_at,
            processed_at: None,
            error_message: None,
            reason: None,
            analysis_id: None,
        }
    }

    pub fn skipped(candidate: &Candidate, reason: impl Into<String>) -> Self {
        Self {
            key: candidate.key(),
            status: LedgerStatus::Skipped,
            discovered_at: candidate.discovered_at,
            processed_at: Some(timestamp()),
            error_message: None,
            reason: Some(reason.into()),
            analysis_id: None,
        }
    }

    pub fn failed(key: LedgerKey, discovered_at: DateTime<Utc>, error: impl Into<String>) -> Self {
        Self {
            key,
            status: LedgerStatus::Failed,
            discovered_at,
            processed_at: Some(timestamp()),
            error_message: Some(error.into()),
            reason: None,
            analysis_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerStatus {
    /// Reserved, analysis in flight.
    Pending,
    Success,
    Failed,
    Skipped,
}

impl LedgerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LedgerStatus::Pending => "pending",
            LedgerStatus::Success => "success",
            LedgerStatus::Failed => "failed",
            LedgerStatus::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for LedgerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LedgerStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(LedgerStatus::Pending),
            "success" => Ok(LedgerStatus::Success),
            "failed" => Ok(LedgerStatus::Failed),
            "skipped" => Ok(LedgerStatus::Skipped),
            other => Err(Error::Other(format!("unknown ledger status: {other}"))),
        }
    }
}
