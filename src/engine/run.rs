//! One orchestration run: drive a record through the phase plan.
//!
//! The worker owning the subject's run slot is the only writer of the
//! record. Every write is a full overwrite guarded by the expected status,
//! so a run that resumes after a restart continues from the persisted state.

use std::time::Instant;

use opentelemetry::KeyValue;
use tracing::{Instrument, Span, info, warn};

use super::orchestrator::Inner;
use crate::analyzer::{AnalyzerError, PhaseInput, PhaseOutput};
use crate::error::{Error, Result};
use crate::event::Event;
use crate::model::{AnalysisRecord, AnalysisStatus, PhaseResult, timestamp, validate_transition};
use crate::phase::{FailurePolicy, PhaseSpec};
use crate::telemetry::analysis::{record_state_transition, start_analysis_span};
use crate::telemetry::metrics;

/// Progress ceiling before the completing write.
const MAX_RUNNING_PROGRESS: u8 = 99;

pub(super) async fn execute(inner: &Inner, subject: &str) -> Result<AnalysisRecord> {
    let record = inner
        .store
        .find_by_subject(subject)
        .await?
        .ok_or_else(|| Error::NotFound(format!("analysis for {subject}")))?;
    if record.is_terminal() {
        return Ok(record);
    }

    let span = start_analysis_span(&record.subject, record.id, record.attempt);
    let run = Run {
        inner,
        record,
        span: span.clone(),
    };
    run.drive().instrument(span).await
}

struct Run<'a> {
    inner: &'a Inner,
    record: AnalysisRecord,
    span: Span,
}

impl Run<'_> {
    async fn drive(mut self) -> Result<AnalysisRecord> {
        let started = Instant::now();
        self.begin().await?;

        let plan = self.inner.plan.clone();
        for spec in plan.specs() {
            if self.record.results.contains_key(&spec.phase) {
                // Persisted before a restart.
                continue;
            }
            self.enter(spec).await?;
            match self.call(spec).await {
                Ok(output) => {
                    let result = PhaseResult {
                        output: output.output,
                        confidence: output.confidence,
                    };
                    self.finish_phase(spec, result, None).await?;
                }
                Err(e) if spec.policy == FailurePolicy::Tolerant && e.is_retryable() => {
                    warn!(
                        phase = %spec.phase,
                        error = %e,
                        "tolerant phase failed, storing placeholder"
                    );
                    self.finish_phase(spec, PhaseResult::placeholder(), Some(e.to_string()))
                        .await?;
                }
                Err(e) => {
                    metrics::phase_outcomes().add(
                        1,
                        &[
                            KeyValue::new("phase", spec.phase.as_str()),
                            KeyValue::new("outcome", "fatal"),
                        ],
                    );
                    let record = self.fail(format!("{}: {e}", spec.phase)).await?;
                    record_duration(started);
                    return Ok(record);
                }
            }
        }

        let record = self.complete().await?;
        record_duration(started);
        Ok(record)
    }

    /// pending|analyzing -> analyzing.
    async fn begin(&mut self) -> Result<()> {
        let from = self.record.status;
        validate_transition(from, AnalysisStatus::Analyzing)?;
        let now = timestamp();
        self.record.status = AnalysisStatus::Analyzing;
        self.record.started_at.get_or_insert(now);
        self.record.updated_at = now;
        self.inner.store.update(&self.record, from).await?;
        self.transitioned(from, AnalysisStatus::Analyzing);
        if from == AnalysisStatus::Analyzing {
            info!(progress = self.record.progress, "resuming interrupted run");
        }
        self.inner.bus.publish(Event::status(&self.record));
        Ok(())
    }

    async fn enter(&mut self, spec: &PhaseSpec) -> Result<()> {
        self.record.current_phase = Some(spec.phase);
        self.raise_progress(spec.start);
        self.record.updated_at = timestamp();
        self.inner
            .store
            .update(&self.record, AnalysisStatus::Analyzing)
            .await?;
        self.inner
            .bus
            .publish(Event::phase_started(&self.record, spec.phase));
        Ok(())
    }

    /// Call the phase's analyzer under the deadline, retrying retryable
    /// failures with linear backoff.
    async fn call(&self, spec: &PhaseSpec) -> std::result::Result<PhaseOutput, AnalyzerError> {
        let analyzer = self.inner.analyzers.get(spec.phase).ok_or_else(|| {
            AnalyzerError::FatalInput(format!("no analyzer bound for {}", spec.phase))
        })?;
        let input = PhaseInput {
            subject: self.record.subject.clone(),
            phase: spec.phase,
            prior: spec
                .needs
                .iter()
                .filter_map(|need| {
                    self.record
                        .results
                        .get(need)
                        .map(|r| (*need, r.output.clone()))
                })
                .collect(),
        };

        let config = &self.inner.config;
        let deadline = config.phase_deadline;
        let max_attempts = config.phase_max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let started = Instant::now();
            let outcome = match tokio::time::timeout(deadline, analyzer.analyze(&input, deadline))
                .await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(AnalyzerError::DeadlineExceeded(deadline)),
            };
            metrics::operation_duration_ms().record(
                started.elapsed().as_secs_f64() * 1000.0,
                &[
                    KeyValue::new("operation", "analysis.phase"),
                    KeyValue::new("phase", spec.phase.as_str()),
                ],
            );
            match outcome {
                Ok(output) => return Ok(output),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    warn!(
                        phase = %spec.phase,
                        attempt,
                        error = %e,
                        "phase attempt failed, retrying"
                    );
                    tokio::time::sleep(config.retry_backoff * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn finish_phase(
        &mut self,
        spec: &PhaseSpec,
        result: PhaseResult,
        degraded: Option<String>,
    ) -> Result<()> {
        self.record.results.insert(spec.phase, result.clone());
        self.raise_progress(spec.end);
        self.record.updated_at = timestamp();
        self.inner
            .store
            .update(&self.record, AnalysisStatus::Analyzing)
            .await?;

        let outcome = if degraded.is_some() { "degraded" } else { "ok" };
        metrics::phase_outcomes().add(
            1,
            &[
                KeyValue::new("phase", spec.phase.as_str()),
                KeyValue::new("outcome", outcome),
            ],
        );
        info!(
            phase = %spec.phase,
            progress = self.record.progress,
            confidence = result.confidence,
            outcome,
            "phase finished"
        );
        self.inner.bus.publish(Event::phase_finished(
            &self.record,
            spec.phase,
            &result,
            degraded.as_deref(),
        ));
        Ok(())
    }

    async fn complete(mut self) -> Result<AnalysisRecord> {
        validate_transition(self.record.status, AnalysisStatus::Completed)?;
        let now = timestamp();
        self.record.status = AnalysisStatus::Completed;
        self.record.progress = 100;
        self.record.updated_at = now;
        self.record.completed_at = Some(now);
        self.record.results_expire_at = Some(now + self.inner.config.result_ttl);
        self.inner
            .store
            .update(&self.record, AnalysisStatus::Analyzing)
            .await?;
        self.transitioned(AnalysisStatus::Analyzing, AnalysisStatus::Completed);
        self.publish_terminal();
        Ok(self.record)
    }

    /// Fail the record. Progress stays where it is.
    async fn fail(mut self, message: String) -> Result<AnalysisRecord> {
        let from = self.record.status;
        validate_transition(from, AnalysisStatus::Failed)?;
        warn!(error = %message, progress = self.record.progress, "analysis failed");
        let now = timestamp();
        self.record.status = AnalysisStatus::Failed;
        self.record.error_message = Some(message);
        self.record.updated_at = now;
        self.record.completed_at = Some(now);
        self.record.results_expire_at = Some(now + self.inner.config.result_ttl);
        self.inner.store.update(&self.record, from).await?;
        self.transitioned(from, AnalysisStatus::Failed);
        self.publish_terminal();
        Ok(self.record)
    }

    fn raise_progress(&mut self, to: u8) {
        self.record.progress = self.record.progress.max(to.min(MAX_RUNNING_PROGRESS));
    }

    fn transitioned(&self, from: AnalysisStatus, to: AnalysisStatus) {
        record_state_transition(&self.span, from.as_str(), to.as_str());
        metrics::analysis_state_transitions().add(
            1,
            &[
                KeyValue::new("from", from.as_str()),
                KeyValue::new("to", to.as_str()),
            ],
        );
    }

    fn publish_terminal(&self) {
        if let Some(event) = Event::terminal(&self.record, 0) {
            self.inner.bus.publish(event);
        }
    }
}

fn record_duration(started: Instant) {
    metrics::operation_duration_ms().record(
        started.elapsed().as_secs_f64() * 1000.0,
        &[KeyValue::new("operation", "analysis.run")],
    );
}
