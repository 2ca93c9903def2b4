//! Analysis record types.

use std::collections::BTreeMap;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::phase::Phase;

// ---------------------------------------------------------------------------
// Analysis Record
// ---------------------------------------------------------------------------

/// One analysis per subject. Owned by the orchestrator; everyone else reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub id: AnalysisId,

    /// The tender reference being analyzed. Unique across records.
    pub subject: String,

    /// Who asked for it ("ingest" for feed-discovered work, or a user id).
    pub owner: String,

    pub status: AnalysisStatus,

    /// 0..=100. Non-decreasing within an attempt; 100 only when completed.
    pub progress: u8,

    pub current_phase: Option<Phase>,

    pub error_message: Option<String>,

    /// Phase name -> {output, confidence}.
    pub results: BTreeMap<Phase, PhaseResult>,

    /// 1-based run counter. Explicit retries start a new attempt.
    pub attempt: u32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub results_expire_at: Option<DateTime<Utc>>,
}

/// Current time at the precision the database keeps.
pub fn timestamp() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

impl AnalysisRecord {
    /// A fresh pending record.
    pub fn new(subject: impl Into<String>, owner: impl Into<String>) -> Self {
        let now = timestamp();
        Self {
            id: AnalysisId::new(),
            subject: subject.into(),
            owner: owner.into(),
            status: AnalysisStatus::Pending,
            progress: 0,
            current_phase: None,
            error_message: None,
            results: BTreeMap::new(),
            attempt: 1,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            results_expire_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Clear the previous attempt's outcome and start attempt `n + 1`.
    pub fn reset_for_retry(&mut self) -> Result<()> {
        validate_transition(self.status, AnalysisStatus::Pending)?;
        self.status = AnalysisStatus::Pending;
        self.progress = 0;
        self.current_phase = None;
        self.error_message = None;
        self.results.clear();
        self.attempt += 1;
        self.started_at = None;
        self.completed_at = None;
        self.results_expire_at = None;
        self.updated_at = timestamp();
        Ok(())
    }
}

/// Newtype for analysis IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnalysisId(pub Uuid);

impl AnalysisId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AnalysisId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AnalysisId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The stored output of one phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseResult {
    pub output: serde_json::Value,
    pub confidence: f64,
}

impl PhaseResult {
    /// Zero-confidence stand-in for a tolerant phase that failed.
    pub fn placeholder() -> Self {
        Self {
            output: serde_json::Value::Null,
            confidence: 0.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of an analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    /// Created, waiting for a worker.
    Pending,
    /// A worker is driving the phase pipeline.
    Analyzing,
    /// Every phase ran (possibly with zero-confidence placeholders). Terminal.
    Completed,
    /// A fatal phase failed. Terminal.
    Failed,
}

impl AnalysisStatus {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: AnalysisStatus) -> bool {
        use AnalysisStatus::*;
        matches!(
            (self, to),
            (Pending, Analyzing)
                // fatal before the first phase could start
                | (Pending, Failed)
                // resumed after a restart
                | (Analyzing, Analyzing)
                | (Analyzing, Completed)
                | (Analyzing, Failed)
                // explicit retry
                | (Completed, Pending)
                | (Failed, Pending)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, AnalysisStatus::Completed | AnalysisStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AnalysisStatus::Pending => "pending",
            AnalysisStatus::Analyzing => "analyzing",
            AnalysisStatus::Completed => "completed",
            AnalysisStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AnalysisStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(AnalysisStatus::Pending),
            "analyzing" => Ok(AnalysisStatus::Analyzing),
            "completed" => Ok(AnalysisStatus::Completed),
            "failed" => Ok(AnalysisStatus::Failed),
            other => Err(Error::Other(format!("unknown analysis status: {other}"))),
        }
    }
}

/// Validate a status transition, returning an error if disallowed.
pub fn validate_transition(from: AnalysisStatus, to: AnalysisStatus) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(Error::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}
