//! Stream events.
//!
//! The orchestrator publishes these through the bus; the gateway forwards
//! them to clients and synthesizes snapshot, replay, and heartbeat events.
//! Events are transient: the analysis record is the system of record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::model::{AnalysisId, AnalysisRecord, AnalysisStatus, PhaseResult};
use crate::phase::Phase;

/// One event on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_type: EventType,
    #[serde(rename = "work_unit_id")]
    pub analysis_id: AnalysisId,
    pub phase: Option<Phase>,
    /// Which part of the record this event updates (e.g. `results.analyze-scope`).
    pub field_path: String,
    pub payload: serde_json::Value,
    /// Per-analysis, strictly increasing for any single subscriber.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Synthetic: already-persisted state for a newly connected client.
    Snapshot,
    Status,
    PhaseStarted,
    PhaseCompleted,
    /// A tolerant phase failed and was replaced with a placeholder.
    PhaseDegraded,
    Completed,
    Failed,
    /// Synthetic keepalive from the gateway.
    Heartbeat,
}

impl EventType {
    pub fn is_terminal(self) -> bool {
        matches!(self, EventType::Completed | EventType::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Snapshot => "snapshot",
            EventType::Status => "status",
            EventType::PhaseStarted => "phase_started",
            EventType::PhaseCompleted => "phase_completed",
            EventType::PhaseDegraded => "phase_degraded",
            EventType::Completed => "completed",
            EventType::Failed => "failed",
            EventType::Heartbeat => "heartbeat",
        }
    }
}

impl Event {
    /// An unsequenced event. The bus assigns the sequence on publish.
    pub fn new(
        event_type: EventType,
        analysis_id: AnalysisId,
        phase: Option<Phase>,
        field_path: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_type,
            analysis_id,
            phase,
            field_path: field_path.into(),
            payload,
            sequence: 0,
            timestamp: Utc::now(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.event_type.is_terminal()
    }

    pub fn status(record: &AnalysisRecord) -> Self {
        Self::new(
            EventType::Status,
            record.id,
            record.current_phase,
            "status",
            json!({
                "status": record.status,
                "progress": record.progress,
                "attempt": record.attempt,
            }),
        )
    }

    pub fn phase_started(record: &AnalysisRecord, phase: Phase) -> Self {
        Self::new(
            EventType::PhaseStarted,
            record.id,
            Some(phase),
            "progress",
            json!({ "progress": record.progress }),
        )
    }

    /// A phase finished; `degraded` marks a tolerant failure's placeholder.
    pub fn phase_finished(
        record: &AnalysisRecord,
        phase: Phase,
        result: &PhaseResult,
        degraded: Option<&str>,
    ) -> Self {
        let event_type = if degraded.is_some() {
            EventType::PhaseDegraded
        } else {
            EventType::PhaseCompleted
        };
        let mut payload = json!({
            "progress": record.progress,
            "output": result.output,
            "confidence": result.confidence,
        });
        if let Some(error) = degraded {
            payload["error"] = json!(error);
        }
        Self::new(
            event_type,
            record.id,
            Some(phase),
            format!("results.{phase}"),
            payload,
        )
    }

    /// The terminal event for a finished record. The payload is the full
    /// record, so every replay of the same record is byte-identical.
    ///
    /// Returns `None` for records that are not terminal.
    pub fn terminal(record: &AnalysisRecord, sequence: u64) -> Option<Self> {
        let event_type = match record.status {
            AnalysisStatus::Completed => EventType::Completed,
            AnalysisStatus::Failed => EventType::Failed,
            _ => return None,
        };
        let payload = serde_json::to_value(record).unwrap_or(serde_json::Value::Null);
        let mut event = Self::new(event_type, record.id, record.current_phase, "", payload);
        event.sequence = sequence;
        event.timestamp = record.completed_at.unwrap_or(record.updated_at);
        Some(event)
    }

    /// Everything persisted so far, for a client joining mid-run.
    pub fn snapshot(record: &AnalysisRecord, sequence: u64) -> Self {
        let payload = json!({
            "status": record.status,
            "progress": record.progress,
            "current_phase": record.current_phase,
            "attempt": record.attempt,
            "results": record.results,
        });
        let mut event = Self::new(
            EventType::Snapshot,
            record.id,
            record.current_phase,
            "",
            payload,
        );
        event.sequence = sequence;
        event
    }

    pub fn heartbeat(analysis_id: AnalysisId, sequence: u64) -> Self {
        let mut event = Self::new(
            EventType::Heartbeat,
            analysis_id,
            None,
            "",
            serde_json::Value::Null,
        );
        event.sequence = sequence;
        event
    }
}
