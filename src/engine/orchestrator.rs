//! The orchestrator: accepts work, collapses duplicates, feeds workers.
//!
//! Each subject has at most one run slot. The slot is claimed before a job is
//! queued and released by the worker after the terminal write, so a
//! concurrent `enqueue` for the same subject joins the existing run instead
//! of starting a second one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use opentelemetry::KeyValue;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, error, info, info_span, warn};

use crate::analyzer::AnalyzerSet;
use crate::bus::EventBus;
use crate::error::{Error, Result};
use crate::model::{AnalysisRecord, AnalysisStatus};
use crate::phase::PhasePlan;
use crate::store::AnalysisStore;
use crate::telemetry::metrics;

/// Configuration for the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Worker tasks executing runs.
    pub workers: usize,
    /// Bound on queued jobs.
    pub queue_capacity: usize,
    /// Per-call deadline handed to analyzers.
    pub phase_deadline: Duration,
    /// Analyzer calls per phase, including the first.
    pub phase_max_attempts: u32,
    /// Linear backoff step between attempts.
    pub retry_backoff: Duration,
    /// How long terminal results are kept.
    pub result_ttl: chrono::Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 256,
            phase_deadline: Duration::from_secs(120),
            phase_max_attempts: 2,
            retry_backoff: Duration::from_millis(250),
            result_ttl: chrono::Duration::days(7),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnqueueOutcome {
    /// A new run was scheduled.
    Started,
    /// A run for this subject was already active; the caller joined it.
    Joined,
    /// The record is terminal. Nothing was scheduled.
    AlreadyFinished,
}

/// What `enqueue` and `retry` hand back.
#[derive(Debug)]
pub struct Enqueued {
    /// The record as read when the call was accepted.
    pub record: AnalysisRecord,
    pub handle: RunHandle,
    pub outcome: EnqueueOutcome,
}

/// Resolves to the record once its run is terminal.
#[derive(Debug, Clone)]
pub struct RunHandle {
    rx: watch::Receiver<Option<AnalysisRecord>>,
}

impl RunHandle {
    fn finished(record: AnalysisRecord) -> Self {
        let (_tx, rx) = watch::channel(Some(record));
        Self { rx }
    }

    /// Wait for the terminal record.
    ///
    /// Fails when the run was abandoned (store failure or shutdown); the
    /// persisted record is then still pending or analyzing and is picked up
    /// again by recovery.
    pub async fn wait(mut self) -> Result<AnalysisRecord> {
        match self.rx.wait_for(Option::is_some).await {
            Ok(record) => (*record)
                .clone()
                .ok_or_else(|| Error::Other("run finished without a record".to_string())),
            Err(_) => Err(Error::Other(
                "analysis run ended without a terminal record".to_string(),
            )),
        }
    }
}

pub(super) struct Job {
    pub subject: String,
}

enum Slot {
    Claimed(watch::Receiver<Option<AnalysisRecord>>),
    Existing(watch::Receiver<Option<AnalysisRecord>>),
}

pub(super) struct Inner {
    pub store: Arc<dyn AnalysisStore>,
    pub bus: EventBus,
    pub plan: PhasePlan,
    pub analyzers: AnalyzerSet,
    pub config: OrchestratorConfig,
    runs: Mutex<HashMap<String, watch::Sender<Option<AnalysisRecord>>>>,
    jobs: mpsc::Sender<Job>,
    shutdown: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Drives analysis records through the phase plan. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Build the orchestrator and spawn its worker pool.
    ///
    /// Fails if any phase of `plan` has no analyzer bound.
    pub fn spawn(
        store: Arc<dyn AnalysisStore>,
        bus: EventBus,
        plan: PhasePlan,
        analyzers: AnalyzerSet,
        config: OrchestratorConfig,
    ) -> Result<Self> {
        plan.validate()?;
        analyzers.check_covers(&plan)?;

        let (jobs, rx) = mpsc::channel(config.queue_capacity.max(1));
        let (shutdown, _) = watch::channel(false);
        let workers = config.workers.max(1);
        let inner = Arc::new(Inner {
            store,
            bus,
            plan,
            analyzers,
            config,
            runs: Mutex::new(HashMap::new()),
            jobs,
            shutdown,
            workers: Mutex::new(Vec::new()),
        });

        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let handles: Vec<JoinHandle<()>> = (0..workers)
            .map(|n| {
                let inner = Arc::clone(&inner);
                let rx = Arc::clone(&rx);
                tokio::spawn(worker(inner, rx).instrument(info_span!("worker", n)))
            })
            .collect();
        *lock(&inner.workers) = handles;
        info!(workers, "orchestrator started");

        Ok(Self { inner })
    }

    pub fn store(&self) -> &Arc<dyn AnalysisStore> {
        &self.inner.store
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// Make sure `subject` has a record and, unless it is terminal, an
    /// active run. Concurrent calls for one subject share a single run.
    pub async fn enqueue(&self, subject: &str, owner: &str) -> Result<Enqueued> {
        let (record, created) = self.inner.store.create_or_get(subject, owner).await?;
        if created {
            info!(%subject, analysis_id = %record.id, owner, "analysis created");
        }

        let rx = match self.inner.claim(subject) {
            Slot::Existing(rx) => {
                return Ok(Enqueued {
                    record,
                    handle: RunHandle { rx },
                    outcome: EnqueueOutcome::Joined,
                });
            }
            Slot::Claimed(rx) => rx,
        };

        // The previous run may have finished between the read above and the
        // claim; the slot makes this read authoritative.
        let current = match self.inner.store.find_by_subject(subject).await {
            Ok(Some(current)) => current,
            Ok(None) => {
                self.inner.release(subject, None);
                return Err(Error::NotFound(format!("analysis for {subject}")));
            }
            Err(e) => {
                self.inner.release(subject, None);
                return Err(e);
            }
        };
        if current.is_terminal() {
            self.inner.release(subject, Some(current.clone()));
            return Ok(Enqueued {
                handle: RunHandle::finished(current.clone()),
                record: current,
                outcome: EnqueueOutcome::AlreadyFinished,
            });
        }

        self.inner.schedule(subject).await?;
        Ok(Enqueued {
            record: current,
            handle: RunHandle { rx },
            outcome: EnqueueOutcome::Started,
        })
    }

    /// Re-run a terminal record as a new attempt on the same record.
    /// A retry while a run is active joins that run.
    pub async fn retry(&self, subject: &str) -> Result<Enqueued> {
        if self.inner.store.find_by_subject(subject).await?.is_none() {
            return Err(Error::NotFound(format!("analysis for {subject}")));
        }

        let rx = match self.inner.claim(subject) {
            Slot::Existing(rx) => {
                let record = self
                    .inner
                    .store
                    .find_by_subject(subject)
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("analysis for {subject}")))?;
                return Ok(Enqueued {
                    record,
                    handle: RunHandle { rx },
                    outcome: EnqueueOutcome::Joined,
                });
            }
            Slot::Claimed(rx) => rx,
        };

        let reset = async {
            let mut record = self
                .inner
                .store
                .find_by_subject(subject)
                .await?
                .ok_or_else(|| Error::NotFound(format!("analysis for {subject}")))?;
            if record.is_terminal() {
                let from = record.status;
                record.reset_for_retry()?;
                self.inner.store.update(&record, from).await?;
                metrics::analysis_state_transitions().add(
                    1,
                    &[
                        KeyValue::new("from", from.as_str()),
                        KeyValue::new("to", AnalysisStatus::Pending.as_str()),
                    ],
                );
                info!(%subject, attempt = record.attempt, "analysis retry requested");
            }
            Ok::<_, Error>(record)
        };
        let record = match reset.await {
            Ok(record) => record,
            Err(e) => {
                self.inner.release(subject, None);
                return Err(e);
            }
        };

        self.inner.schedule(subject).await?;
        Ok(Enqueued {
            record,
            handle: RunHandle { rx },
            outcome: EnqueueOutcome::Started,
        })
    }

    /// Re-schedule every persisted record that is pending or analyzing.
    /// Returns how many runs were started.
    pub async fn recover(&self) -> Result<usize> {
        let unfinished = self.inner.store.list_unfinished().await?;
        let mut started = 0;
        for record in unfinished {
            match self.enqueue(&record.subject, &record.owner).await {
                Ok(enqueued) if enqueued.outcome == EnqueueOutcome::Started => started += 1,
                Ok(_) => {}
                Err(e) => warn!(subject = %record.subject, error = %e, "recovery failed"),
            }
        }
        if started > 0 {
            info!(started, "recovered unfinished analyses");
        }
        Ok(started)
    }

    /// Whether `subject` has an active run slot.
    pub fn is_running(&self, subject: &str) -> bool {
        lock(&self.inner.runs).contains_key(subject)
    }

    pub fn active_runs(&self) -> usize {
        lock(&self.inner.runs).len()
    }

    /// Stop taking jobs and wait for workers to finish their current run.
    /// Waiters on jobs that never started see their run as abandoned.
    pub async fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        let handles = std::mem::take(&mut *lock(&self.inner.workers));
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "worker task panicked");
            }
        }
        let abandoned: Vec<String> = lock(&self.inner.runs).keys().cloned().collect();
        for subject in &abandoned {
            self.inner.release(subject, None);
        }
        info!(abandoned = abandoned.len(), "orchestrator stopped");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Inner {
    fn claim(&self, subject: &str) -> Slot {
        let mut runs = lock(&self.runs);
        if let Some(tx) = runs.get(subject) {
            return Slot::Existing(tx.subscribe());
        }
        let (tx, rx) = watch::channel(None);
        runs.insert(subject.to_string(), tx);
        Slot::Claimed(rx)
    }

    /// Free the slot, resolving waiters with `record` when there is one.
    /// Without a record, waiters see the run as abandoned.
    pub(super) fn release(&self, subject: &str, record: Option<AnalysisRecord>) {
        let tx = lock(&self.runs).remove(subject);
        if let (Some(tx), Some(record)) = (tx, record) {
            tx.send_replace(Some(record));
        }
    }

    async fn schedule(&self, subject: &str) -> Result<()> {
        let job = Job {
            subject: subject.to_string(),
        };
        if self.jobs.send(job).await.is_err() {
            self.release(subject, None);
            return Err(Error::Other("orchestrator is shut down".to_string()));
        }
        Ok(())
    }

    async fn process(&self, job: Job) {
        match super::run::execute(self, &job.subject).await {
            Ok(record) => self.release(&job.subject, Some(record)),
            Err(e) => {
                error!(subject = %job.subject, error = %e, "analysis run aborted");
                self.release(&job.subject, None);
            }
        }
    }
}

async fn worker(inner: Arc<Inner>, rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>) {
    let mut shutdown = inner.shutdown.subscribe();
    loop {
        let job = tokio::select! {
            biased;
            _ = stopped(&mut shutdown) => break,
            job = async { rx.lock().await.recv().await } => match job {
                Some(job) => job,
                None => break,
            },
        };
        inner.process(job).await;
    }
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
