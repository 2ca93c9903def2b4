//! Analysis run span helpers.

use tracing::Span;

use crate::model::AnalysisId;

/// Start a span covering one orchestration run.
///
/// The `analysis.state` field is declared empty and is updated via
/// [`record_state_transition`].
pub fn start_analysis_span(subject: &str, id: AnalysisId, attempt: u32) -> Span {
    tracing::info_span!(
        "analysis.run",
        "analysis.subject" = subject,
        "analysis.id" = %id,
        "analysis.attempt" = attempt,
        "analysis.state" = tracing::field::Empty,
    )
}

/// Record a status transition on the run span.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("analysis.state", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
