//! Shared fixtures: scripted analyzers, an in-memory feed, and an
//! orchestrator wired to a `MemoryStore`.

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::Semaphore;

use tenderwatch::analyzer::{Analyzer, AnalyzerError, AnalyzerSet, PhaseInput, PhaseOutput};
use tenderwatch::bus::EventBus;
use tenderwatch::engine::{Orchestrator, OrchestratorConfig};
use tenderwatch::error::Result;
use tenderwatch::ingest::{Feed, FeedItem, feed};
use tenderwatch::model::Candidate;
use tenderwatch::phase::{Phase, PhasePlan};
use tenderwatch::store::MemoryStore;

/// How a scripted phase behaves.
#[derive(Clone)]
pub enum Step {
    /// Fail every call.
    Fail(AnalyzerError),
    /// Fail the first `n` calls, then succeed.
    FailTimes(u32, AnalyzerError),
    /// Block until a permit is added, then succeed.
    Gate(Arc<Semaphore>),
}

/// Analyzer bound to every phase. Unscripted phases succeed with
/// confidence 0.9 and echo which prior outputs they received.
#[derive(Default)]
pub struct Scripted {
    steps: HashMap<Phase, Step>,
    calls: Mutex<HashMap<Phase, u32>>,
}

impl Scripted {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, phase: Phase, step: Step) -> Self {
        self.steps.insert(phase, step);
        self
    }

    pub fn calls(&self, phase: Phase) -> u32 {
        self.calls.lock().unwrap().get(&phase).copied().unwrap_or(0)
    }

    fn answer(input: &PhaseInput) -> PhaseOutput {
        let prior: Vec<String> = input.prior.keys().map(|p| p.to_string()).collect();
        PhaseOutput::new(json!({ "phase": input.phase, "prior": prior }), 0.9)
    }
}

#[async_trait]
impl Analyzer for Scripted {
    async fn analyze(
        &self,
        input: &PhaseInput,
        _deadline: Duration,
    ) -> std::result::Result<PhaseOutput, AnalyzerError> {
        let n = {
            let mut calls = self.calls.lock().unwrap();
            let n = calls.entry(input.phase).or_default();
            *n += 1;
            *n
        };
        match self.steps.get(&input.phase) {
            None => Ok(Self::answer(input)),
            Some(Step::Fail(e)) => Err(e.clone()),
            Some(Step::FailTimes(k, e)) if n <= *k => Err(e.clone()),
            Some(Step::FailTimes(..)) => Ok(Self::answer(input)),
            Some(Step::Gate(gate)) => {
                gate.acquire()
                    .await
                    .map_err(|e| AnalyzerError::Transient(e.to_string()))?
                    .forget();
                Ok(Self::answer(input))
            }
        }
    }
}

pub fn gate() -> Arc<Semaphore> {
    Arc::new(Semaphore::new(0))
}

pub fn config() -> OrchestratorConfig {
    OrchestratorConfig {
        workers: 2,
        phase_deadline: Duration::from_secs(5),
        phase_max_attempts: 2,
        retry_backoff: Duration::from_millis(1),
        ..OrchestratorConfig::default()
    }
}

pub fn orchestrator(store: Arc<MemoryStore>, analyzer: Arc<Scripted>) -> Orchestrator {
    orchestrator_with(store, analyzer, config())
}

pub fn orchestrator_with(
    store: Arc<MemoryStore>,
    analyzer: Arc<Scripted>,
    config: OrchestratorConfig,
) -> Orchestrator {
    Orchestrator::spawn(
        store,
        EventBus::new(64),
        PhasePlan::standard(),
        AnalyzerSet::new().bind_all(Phase::ALL, analyzer),
        config,
    )
    .unwrap()
}

pub fn candidate(source: &str, reference: &str) -> Candidate {
    Candidate {
        source_item_id: source.to_string(),
        discovered_at: Utc::now(),
        candidate_reference: reference.to_string(),
        raw_payload: json!({ "subject": format!("Tender notice {reference}") }),
    }
}

/// Feed returning whatever has been pushed into it.
#[derive(Default)]
pub struct ScriptedFeed {
    items: Mutex<Vec<FeedItem>>,
    gate: Option<Arc<Semaphore>>,
    entered: tokio::sync::Notify,
}

impl ScriptedFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// A feed whose `fetch` blocks until `gate` gets a permit.
    pub fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }

    pub fn push(&self, item: FeedItem) {
        self.items.lock().unwrap().push(item);
    }

    pub fn push_candidate(&self, candidate: Candidate) {
        self.push(FeedItem::Candidate(candidate));
    }

    /// Resolves once a `fetch` call has started.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }
}

#[async_trait]
impl Feed for ScriptedFeed {
    async fn fetch(&self, since: DateTime<Utc>, limit: usize) -> Result<Vec<FeedItem>> {
        self.entered.notify_one();
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        let items: Vec<FeedItem> = self
            .items
            .lock()
            .unwrap()
            .iter()
            .filter(|item| item.discovered_at() >= since)
            .cloned()
            .collect();
        Ok(feed::newest(items, limit))
    }
}

/// Poll `check` until it returns true, panicking after five seconds.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
