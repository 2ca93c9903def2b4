//! Deduplicating ingestion.
//!
//! Each poll cycle fetches recent candidates from the feed and decides, per
//! candidate, whether it is new work:
//!
//! 1. A ledger entry for the same (source item, reference) key means the
//!    candidate was already evaluated.
//! 2. A success or pending entry for the same reference under another source
//!    item means the target is already handled; the candidate is recorded as
//!    skipped.
//! 3. Otherwise a pending entry is reserved (the schema rejects a racing
//!    duplicate) and the reference is handed to the orchestrator, as a new
//!    attempt if its analysis failed before. The entry is finalized when the
//!    run ends.

pub mod feed;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::engine::{EnqueueOutcome, Enqueued, Orchestrator};
use crate::error::{Error, Result};
use crate::model::{AnalysisStatus, Candidate, LedgerEntry, LedgerKey, LedgerStatus};
use crate::store::LedgerStore;
use crate::telemetry::metrics;

pub use feed::{Feed, FeedItem, SpoolFeed};

/// Owner recorded on analyses started by ingestion.
pub const INGEST_OWNER: &str = "ingest";

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub poll_interval: Duration,
    /// Trailing discovery window fetched per cycle.
    pub window: chrono::Duration,
    /// Most items evaluated per cycle.
    pub max_items: usize,
    /// Settled ledger entries older than this are purged.
    pub retention: chrono::Duration,
    pub maintenance_interval: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(300),
            window: chrono::Duration::hours(24),
            max_items: 50,
            retention: chrono::Duration::days(30),
            maintenance_interval: Duration::from_secs(3600),
        }
    }
}

/// Counts from one poll cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PollReport {
    pub fetched: usize,
    /// Handed to the orchestrator.
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Pending entries from earlier cycles finalized at the start of this one.
    pub reconciled: usize,
}

/// Counts from one maintenance pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub ledger_entries: u64,
    pub analyses: u64,
}

enum Verdict {
    Processed,
    Skipped,
    Failed,
}

pub struct Deduplicator {
    feed: Arc<dyn Feed>,
    ledger: Arc<dyn LedgerStore>,
    orchestrator: Orchestrator,
    config: IngestConfig,
    in_flight: AtomicBool,
}

struct FlightGuard<'a>(&'a AtomicBool);

impl<'a> FlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Deduplicator {
    pub fn new(
        feed: Arc<dyn Feed>,
        ledger: Arc<dyn LedgerStore>,
        orchestrator: Orchestrator,
        config: IngestConfig,
    ) -> Self {
        Self {
            feed,
            ledger,
            orchestrator,
            config,
            in_flight: AtomicBool::new(false),
        }
    }

    /// Run one poll cycle. Fails with `Error::Busy` while another cycle is
    /// running.
    pub async fn poll_once(&self) -> Result<PollReport> {
        let _guard = FlightGuard::acquire(&self.in_flight)
            .ok_or_else(|| Error::Busy("a poll cycle is already running".to_string()))?;
        let started = Instant::now();
        let mut report = PollReport::default();

        match self.reconcile().await {
            Ok(n) => report.reconciled = n,
            Err(e) => warn!(error = %e, "ledger reconciliation failed"),
        }

        let since = Utc::now() - self.config.window;
        let items = feed::newest(
            self.feed.fetch(since, self.config.max_items).await?,
            self.config.max_items,
        );
        report.fetched = items.len();

        for item in items {
            match self.evaluate(item).await {
                Ok(Verdict::Processed) => report.processed += 1,
                Ok(Verdict::Skipped) => report.skipped += 1,
                Ok(Verdict::Failed) => report.failed += 1,
                Err(e) => {
                    report.failed += 1;
                    metrics::candidates_evaluated().add(1, &[KeyValue::new("result", "failed")]);
                    warn!(error = %e, "candidate evaluation failed");
                }
            }
        }

        metrics::operation_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("operation", "ingest.poll")],
        );
        info!(
            fetched = report.fetched,
            processed = report.processed,
            skipped = report.skipped,
            failed = report.failed,
            reconciled = report.reconciled,
            "poll cycle finished"
        );
        Ok(report)
    }

    async fn evaluate(&self, item: FeedItem) -> Result<Verdict> {
        let candidate = match item {
            FeedItem::Candidate(candidate) => candidate,
            FeedItem::Malformed {
                source_item_id,
                discovered_at,
                reason,
            } => {
                warn!(%source_item_id, %reason, "malformed feed item");
                let key = LedgerKey {
                    source_item_id,
                    candidate_reference: String::new(),
                };
                self.ledger
                    .insert_entry(&LedgerEntry::failed(key, discovered_at, reason))
                    .await?;
                metrics::candidates_evaluated().add(1, &[KeyValue::new("result", "failed")]);
                return Ok(Verdict::Failed);
            }
        };
        let key = candidate.key();

        if let Some(existing) = self.ledger.get_entry(&key).await? {
            debug!(%key, status = %existing.status, "candidate already evaluated");
            metrics::candidates_evaluated().add(1, &[KeyValue::new("result", "duplicate")]);
            return Ok(Verdict::Skipped);
        }

        if let Some(active) = self
            .ledger
            .find_active_for_reference(&candidate.candidate_reference)
            .await?
        {
            let reason = format!(
                "reference already {} via source item {}",
                active.status, active.key.source_item_id
            );
            return self.skip(&candidate, reason).await;
        }

        if !self.ledger.insert_entry(&LedgerEntry::pending(&candidate)).await? {
            return self.skip(&candidate, "reservation conflict".to_string()).await;
        }

        match self.start(&candidate.candidate_reference).await {
            Ok(enqueued) => {
                info!(
                    %key,
                    analysis_id = %enqueued.record.id,
                    outcome = ?enqueued.outcome,
                    "candidate handed to orchestrator"
                );
                self.spawn_finalizer(key, enqueued);
                metrics::candidates_evaluated().add(1, &[KeyValue::new("result", "ok")]);
                Ok(Verdict::Processed)
            }
            Err(e) => {
                warn!(%key, error = %e, "enqueue failed");
                self.ledger
                    .finalize(&key, LedgerStatus::Failed, Some(&e.to_string()), None)
                    .await?;
                metrics::candidates_evaluated().add(1, &[KeyValue::new("result", "failed")]);
                Ok(Verdict::Failed)
            }
        }
    }

    /// Hand a freshly reserved reference to the orchestrator. A reference
    /// whose earlier analysis failed gets a new attempt on the same record.
    async fn start(&self, reference: &str) -> Result<Enqueued> {
        let enqueued = self.orchestrator.enqueue(reference, INGEST_OWNER).await?;
        if enqueued.outcome == EnqueueOutcome::AlreadyFinished
            && enqueued.record.status == AnalysisStatus::Failed
        {
            info!(
                %reference,
                analysis_id = %enqueued.record.id,
                "re-analyzing previously failed reference"
            );
            return self.orchestrator.retry(reference).await;
        }
        Ok(enqueued)
    }

    async fn skip(&self, candidate: &Candidate, reason: String) -> Result<Verdict> {
        debug!(key = %candidate.key(), %reason, "candidate skipped");
        self.ledger
            .insert_entry(&LedgerEntry::skipped(candidate, reason))
            .await?;
        metrics::candidates_evaluated().add(1, &[KeyValue::new("result", "skipped")]);
        Ok(Verdict::Skipped)
    }

    /// Finalize the reservation once the run is terminal. An abandoned run
    /// leaves the entry pending for [`Deduplicator::reconcile`].
    fn spawn_finalizer(&self, key: LedgerKey, enqueued: Enqueued) {
        let ledger = Arc::clone(&self.ledger);
        let span = info_span!("ledger.finalize", key = %key);
        tokio::spawn(
            async move {
                let record = match enqueued.handle.wait().await {
                    Ok(record) => record,
                    Err(e) => {
                        debug!(error = %e, "run abandoned, entry stays pending");
                        return;
                    }
                };
                let (status, error) = settle(record.status, record.error_message.as_deref());
                if let Err(e) = ledger.finalize(&key, status, error, Some(record.id)).await {
                    warn!(error = %e, "ledger finalize failed");
                }
            }
            .instrument(span),
        );
    }

    /// Finalize pending entries whose analysis already ended, e.g. because
    /// the process restarted while the run was in flight.
    pub async fn reconcile(&self) -> Result<usize> {
        let store = self.orchestrator.store();
        let mut finalized = 0;
        for entry in self.ledger.list_pending().await? {
            let subject = &entry.key.candidate_reference;
            let done = match store.find_by_subject(subject).await? {
                Some(record) if record.is_terminal() => {
                    let (status, error) = settle(record.status, record.error_message.as_deref());
                    self.ledger
                        .finalize(&entry.key, status, error, Some(record.id))
                        .await?
                }
                Some(_) => false,
                None => {
                    self.ledger
                        .finalize(
                            &entry.key,
                            LedgerStatus::Failed,
                            Some("analysis record missing"),
                            None,
                        )
                        .await?
                }
            };
            if done {
                finalized += 1;
            }
        }
        if finalized > 0 {
            info!(finalized, "reconciled pending ledger entries");
        }
        Ok(finalized)
    }

    /// Delete settled ledger entries past retention and expired results.
    pub async fn purge(&self, now: DateTime<Utc>) -> Result<PurgeReport> {
        let report = PurgeReport {
            ledger_entries: self
                .ledger
                .purge_older_than(now - self.config.retention)
                .await?,
            analyses: self.orchestrator.store().purge_expired(now).await?,
        };
        info!(
            ledger_entries = report.ledger_entries,
            analyses = report.analyses,
            "maintenance purge finished"
        );
        Ok(report)
    }

    /// Poll on a fixed period and purge on the maintenance period until
    /// `shutdown` flips to true. A cycle that overruns its period causes the
    /// missed ticks to be skipped.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut poll = tokio::time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut maintenance = tokio::time::interval(self.config.maintenance_interval);
        maintenance.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            interval_secs = self.config.poll_interval.as_secs(),
            "ingestion poller started"
        );
        loop {
            tokio::select! {
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => {
                    info!("ingestion poller stopped");
                    return;
                }
                _ = poll.tick() => match self.poll_once().await {
                    Ok(_) => {}
                    Err(Error::Busy(_)) => debug!("poll already in flight, tick skipped"),
                    Err(e) => error!(error = %e, "poll cycle failed"),
                },
                _ = maintenance.tick() => {
                    if let Err(e) = self.purge(Utc::now()).await {
                        error!(error = %e, "maintenance purge failed");
                    }
                }
            }
        }
    }
}

fn settle(status: AnalysisStatus, error: Option<&str>) -> (LedgerStatus, Option<&str>) {
    match status {
        AnalysisStatus::Completed => (LedgerStatus::Success, None),
        _ => (LedgerStatus::Failed, error.or(Some("analysis failed"))),
    }
}
