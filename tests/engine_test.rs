//! Integration tests for the analysis orchestrator.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Scripted, Step, gate, orchestrator, orchestrator_with};
use tenderwatch::analyzer::AnalyzerError;
use tenderwatch::engine::{EnqueueOutcome, OrchestratorConfig};
use tenderwatch::error::Error;
use tenderwatch::event::{Event, EventType};
use tenderwatch::model::{AnalysisStatus, PhaseResult};
use tenderwatch::phase::Phase;
use tenderwatch::store::{AnalysisStore, MemoryStore};

// ---------------------------------------------------------------------------
// Happy path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn run_completes_every_phase() {
    let store = Arc::new(MemoryStore::new());
    let analyzer = Arc::new(Scripted::new());
    let orch = orchestrator(store.clone(), analyzer.clone());

    let enqueued = orch.enqueue("T-100", "alice").await.unwrap();
    assert_eq!(enqueued.outcome, EnqueueOutcome::Started);
    let record = enqueued.handle.wait().await.unwrap();

    assert_eq!(record.status, AnalysisStatus::Completed);
    assert_eq!(record.progress, 100);
    assert_eq!(record.attempt, 1);
    assert_eq!(record.results.len(), Phase::ALL.len());
    assert!(record.error_message.is_none());
    assert!(record.started_at.is_some());
    assert!(record.completed_at.is_some());
    assert!(record.results_expire_at > record.completed_at);
    for phase in Phase::ALL {
        assert_eq!(analyzer.calls(phase), 1, "{phase} called once");
    }

    let stored = store.find_by_subject("T-100").await.unwrap().unwrap();
    assert_eq!(stored, record);
}

#[tokio::test]
async fn phases_receive_declared_prior_outputs() {
    let store = Arc::new(MemoryStore::new());
    let orch = orchestrator(store, Arc::new(Scripted::new()));

    let record = orch
        .enqueue("T-101", "alice")
        .await
        .unwrap()
        .handle
        .wait()
        .await
        .unwrap();

    let summary = &record.results[&Phase::GenerateSummary].output;
    assert_eq!(
        summary["prior"],
        serde_json::json!(["extract-tender-info", "generate-onepager", "assess-intelligence"])
    );
    let parse = &record.results[&Phase::ParseDocuments].output;
    assert_eq!(parse["prior"], serde_json::json!([]));
}

// ---------------------------------------------------------------------------
// Failure policy
// ---------------------------------------------------------------------------

#[tokio::test]
async fn tolerant_phase_failure_degrades_and_continues() {
    let store = Arc::new(MemoryStore::new());
    let analyzer = Arc::new(Scripted::new().with(
        Phase::AnalyzeScope,
        Step::Fail(AnalyzerError::Transient("backend unavailable".into())),
    ));
    let orch = orchestrator(store, analyzer.clone());

    let record = orch
        .enqueue("T-200", "alice")
        .await
        .unwrap()
        .handle
        .wait()
        .await
        .unwrap();

    assert_eq!(record.status, AnalysisStatus::Completed);
    assert_eq!(record.progress, 100);
    assert_eq!(record.results[&Phase::AnalyzeScope], PhaseResult::placeholder());
    assert_eq!(record.results[&Phase::AnalyzeScope].confidence, 0.0);
    // Retried up to the attempt limit before degrading.
    assert_eq!(analyzer.calls(Phase::AnalyzeScope), 2);
    for phase in [
        Phase::AnalyzeRfpSections,
        Phase::AssessIntelligence,
        Phase::AssessQuality,
        Phase::GenerateSummary,
    ] {
        assert_eq!(analyzer.calls(phase), 1);
        assert!(record.results[&phase].confidence > 0.0);
    }
}

#[tokio::test]
async fn fatal_phase_failure_fails_the_record() {
    let store = Arc::new(MemoryStore::new());
    let analyzer = Arc::new(Scripted::new().with(
        Phase::ParseDocuments,
        Step::Fail(AnalyzerError::FatalInput("no documents".into())),
    ));
    let orch = orchestrator(store, analyzer.clone());

    let record = orch
        .enqueue("T-300", "alice")
        .await
        .unwrap()
        .handle
        .wait()
        .await
        .unwrap();

    assert_eq!(record.status, AnalysisStatus::Failed);
    assert_eq!(record.progress, Phase::ParseDocuments.spec().start);
    assert!(record.results.is_empty());
    assert!(
        record
            .error_message
            .as_deref()
            .is_some_and(|m| m.contains("no documents"))
    );
    assert!(record.completed_at.is_some());
    assert_eq!(analyzer.calls(Phase::ParseDocuments), 1);
    for phase in &Phase::ALL[1..] {
        assert_eq!(analyzer.calls(*phase), 0, "{phase} must not run");
    }
}

#[tokio::test]
async fn transient_failure_in_fatal_phase_is_retried() {
    let store = Arc::new(MemoryStore::new());
    let analyzer = Arc::new(Scripted::new().with(
        Phase::ParseDocuments,
        Step::FailTimes(1, AnalyzerError::Transient("flaky".into())),
    ));
    let orch = orchestrator(store, analyzer.clone());

    let record = orch
        .enqueue("T-301", "alice")
        .await
        .unwrap()
        .handle
        .wait()
        .await
        .unwrap();

    assert_eq!(record.status, AnalysisStatus::Completed);
    assert_eq!(analyzer.calls(Phase::ParseDocuments), 2);
}

#[tokio::test]
async fn unusable_input_in_tolerant_phase_fails_the_record() {
    let store = Arc::new(MemoryStore::new());
    let analyzer = Arc::new(Scripted::new().with(
        Phase::AssessQuality,
        Step::Fail(AnalyzerError::FatalInput("unreadable".into())),
    ));
    let orch = orchestrator(store, analyzer.clone());

    let record = orch
        .enqueue("T-302", "alice")
        .await
        .unwrap()
        .handle
        .wait()
        .await
        .unwrap();

    assert_eq!(record.status, AnalysisStatus::Failed);
    assert_eq!(record.progress, Phase::AssessQuality.spec().start);
    assert_eq!(analyzer.calls(Phase::AssessQuality), 1);
    assert_eq!(analyzer.calls(Phase::GenerateSummary), 0);
}

#[tokio::test]
async fn phase_deadline_degrades_tolerant_phase() {
    let store = Arc::new(MemoryStore::new());
    // Never released: every call overruns the deadline.
    let analyzer = Arc::new(Scripted::new().with(Phase::AnalyzeRfpSections, Step::Gate(gate())));
    let config = OrchestratorConfig {
        phase_deadline: Duration::from_millis(50),
        ..common::config()
    };
    let orch = orchestrator_with(store, analyzer, config);

    let record = orch
        .enqueue("T-303", "alice")
        .await
        .unwrap()
        .handle
        .wait()
        .await
        .unwrap();

    assert_eq!(record.status, AnalysisStatus::Completed);
    assert_eq!(record.results[&Phase::AnalyzeRfpSections].confidence, 0.0);
}

// ---------------------------------------------------------------------------
// Concurrency and progress
// ---------------------------------------------------------------------------

#[tokio::test]
async fn concurrent_enqueues_share_one_run() {
    let store = Arc::new(MemoryStore::new());
    let hold = gate();
    let analyzer = Arc::new(Scripted::new().with(Phase::ParseDocuments, Step::Gate(hold.clone())));
    let orch = orchestrator(store.clone(), analyzer.clone());

    let calls = (0..10).map(|n| {
        let orch = orch.clone();
        async move { orch.enqueue("T-400", &format!("client-{n}")).await.unwrap() }
    });
    let enqueued = futures::future::join_all(calls).await;

    let started = enqueued
        .iter()
        .filter(|e| e.outcome == EnqueueOutcome::Started)
        .count();
    assert_eq!(started, 1);
    assert!(
        enqueued
            .iter()
            .all(|e| e.outcome != EnqueueOutcome::AlreadyFinished)
    );
    assert_eq!(store.analysis_count(), 1);

    hold.add_permits(1);
    let mut ids = Vec::new();
    for e in enqueued {
        let record = e.handle.wait().await.unwrap();
        assert_eq!(record.status, AnalysisStatus::Completed);
        ids.push(record.id);
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);
    assert_eq!(analyzer.calls(Phase::ParseDocuments), 1);
}

#[tokio::test]
async fn progress_is_monotone_and_capped_until_completion() {
    let store = Arc::new(MemoryStore::new());
    let analyzer = Arc::new(Scripted::new().with(
        Phase::AnalyzeScope,
        Step::Fail(AnalyzerError::Malformed("no json".into())),
    ));
    let orch = orchestrator(store.clone(), analyzer);

    // Subscribe before the run is scheduled so every event is seen.
    let (record, _) = store.create_or_get("T-500", "alice").await.unwrap();
    let mut sub = orch.bus().subscribe(record.id);
    orch.enqueue("T-500", "alice").await.unwrap();

    let mut events: Vec<Event> = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .unwrap()
            .unwrap();
        let terminal = event.is_terminal();
        events.push(event);
        if terminal {
            break;
        }
    }

    let mut last_sequence = 0;
    let mut last_progress = 0;
    for event in &events {
        assert!(event.sequence > last_sequence);
        last_sequence = event.sequence;
        let progress = event.payload["progress"].as_u64().unwrap();
        assert!(progress >= last_progress, "progress went backwards");
        if !event.is_terminal() {
            assert!(progress <= 99, "progress {progress} before completion");
        }
        last_progress = progress;
    }

    let terminal = events.last().unwrap();
    assert_eq!(terminal.event_type, EventType::Completed);
    assert_eq!(terminal.payload["progress"], 100);
    assert!(
        events
            .iter()
            .any(|e| e.event_type == EventType::PhaseDegraded
                && e.phase == Some(Phase::AnalyzeScope))
    );
}

// ---------------------------------------------------------------------------
// Finished records, retry, recovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn enqueue_on_finished_record_is_a_no_op() {
    let store = Arc::new(MemoryStore::new());
    let analyzer = Arc::new(Scripted::new());
    let orch = orchestrator(store, analyzer.clone());

    let first = orch
        .enqueue("T-600", "alice")
        .await
        .unwrap()
        .handle
        .wait()
        .await
        .unwrap();

    let again = orch.enqueue("T-600", "bob").await.unwrap();
    assert_eq!(again.outcome, EnqueueOutcome::AlreadyFinished);
    assert_eq!(again.record, first);
    assert_eq!(again.handle.wait().await.unwrap(), first);
    assert_eq!(analyzer.calls(Phase::ParseDocuments), 1);
}

#[tokio::test]
async fn retry_reruns_a_failed_record_as_a_new_attempt() {
    let store = Arc::new(MemoryStore::new());
    let analyzer = Arc::new(Scripted::new().with(
        Phase::ParseDocuments,
        Step::FailTimes(1, AnalyzerError::FatalInput("portal down".into())),
    ));
    let orch = orchestrator(store, analyzer.clone());

    let failed = orch
        .enqueue("T-700", "alice")
        .await
        .unwrap()
        .handle
        .wait()
        .await
        .unwrap();
    assert_eq!(failed.status, AnalysisStatus::Failed);

    let retried = orch.retry("T-700").await.unwrap();
    assert_eq!(retried.outcome, EnqueueOutcome::Started);
    assert_eq!(retried.record.status, AnalysisStatus::Pending);
    assert_eq!(retried.record.progress, 0);

    let record = retried.handle.wait().await.unwrap();
    assert_eq!(record.id, failed.id);
    assert_eq!(record.status, AnalysisStatus::Completed);
    assert_eq!(record.attempt, 2);
    assert!(record.error_message.is_none());
    assert_eq!(analyzer.calls(Phase::ParseDocuments), 2);
}

#[tokio::test]
async fn retry_of_completed_record_republishes_every_event() {
    let store = Arc::new(MemoryStore::new());
    let analyzer = Arc::new(Scripted::new());
    let orch = orchestrator(store, analyzer.clone());

    let first = orch
        .enqueue("T-650", "alice")
        .await
        .unwrap()
        .handle
        .wait()
        .await
        .unwrap();
    assert_eq!(first.status, AnalysisStatus::Completed);

    let mut sub = orch.bus().subscribe(first.id);
    let retried = orch.retry("T-650").await.unwrap();
    assert_eq!(retried.outcome, EnqueueOutcome::Started);

    let mut events: Vec<Event> = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .unwrap()
            .unwrap();
        let terminal = event.is_terminal();
        events.push(event);
        if terminal {
            break;
        }
    }

    assert!(events.iter().all(|e| e.analysis_id == first.id));
    assert_eq!(events[0].event_type, EventType::Status);
    assert_eq!(events[0].payload["status"], "analyzing");
    assert_eq!(events[0].payload["attempt"], 2);

    let phases: Vec<(EventType, Option<Phase>)> = events[1..events.len() - 1]
        .iter()
        .map(|e| (e.event_type, e.phase))
        .collect();
    let expected: Vec<(EventType, Option<Phase>)> = Phase::ALL
        .into_iter()
        .flat_map(|p| {
            [
                (EventType::PhaseStarted, Some(p)),
                (EventType::PhaseCompleted, Some(p)),
            ]
        })
        .collect();
    assert_eq!(phases, expected);
    assert_eq!(phases[0], (EventType::PhaseStarted, Some(Phase::ParseDocuments)));

    let terminal = events.last().unwrap();
    assert_eq!(terminal.event_type, EventType::Completed);
    assert_eq!(terminal.payload["progress"], 100);
    assert_eq!(analyzer.calls(Phase::ParseDocuments), 2);

    let record = retried.handle.wait().await.unwrap();
    assert_eq!(record.id, first.id);
    assert_eq!(record.attempt, 2);
}

#[tokio::test]
async fn shutdown_abandons_runs_that_never_started() {
    let store = Arc::new(MemoryStore::new());
    let hold = gate();
    let analyzer = Arc::new(Scripted::new().with(Phase::ParseDocuments, Step::Gate(hold.clone())));
    let orch = orchestrator_with(
        store.clone(),
        analyzer.clone(),
        OrchestratorConfig {
            workers: 1,
            ..common::config()
        },
    );

    let running = orch.enqueue("T-680", "alice").await.unwrap();
    common::eventually("first run to reach its analyzer", || {
        let analyzer = analyzer.clone();
        async move { analyzer.calls(Phase::ParseDocuments) == 1 }
    })
    .await;
    let queued = orch.enqueue("T-681", "alice").await.unwrap();
    assert_eq!(queued.outcome, EnqueueOutcome::Started);

    let stopping = tokio::spawn({
        let orch = orch.clone();
        async move { orch.shutdown().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    hold.add_permits(1);

    let done = running.handle.wait().await.unwrap();
    assert_eq!(done.status, AnalysisStatus::Completed);
    stopping.await.unwrap();

    let abandoned = tokio::time::timeout(Duration::from_secs(5), queued.handle.wait())
        .await
        .expect("waiter on a queued run must not hang after shutdown");
    assert!(abandoned.is_err());
    assert!(!orch.is_running("T-681"));
    assert_eq!(analyzer.calls(Phase::ParseDocuments), 1);

    // Still pending, so recovery picks it up after a restart.
    let record = store.find_by_subject("T-681").await.unwrap().unwrap();
    assert_eq!(record.status, AnalysisStatus::Pending);
}

#[tokio::test]
async fn retry_of_unknown_subject_is_not_found() {
    let orch = orchestrator(Arc::new(MemoryStore::new()), Arc::new(Scripted::new()));
    let err = orch.retry("T-missing").await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn recover_resumes_after_persisted_phases() {
    let store = Arc::new(MemoryStore::new());

    // A run interrupted after its second phase.
    let (mut record, _) = store.create_or_get("T-800", "ingest").await.unwrap();
    record.status = AnalysisStatus::Analyzing;
    record.progress = Phase::ExtractTenderInfo.spec().end;
    record.current_phase = Some(Phase::ExtractTenderInfo);
    for phase in [Phase::ParseDocuments, Phase::ExtractTenderInfo] {
        record.results.insert(
            phase,
            PhaseResult {
                output: serde_json::json!({ "restored": true }),
                confidence: 0.8,
            },
        );
    }
    store.update(&record, AnalysisStatus::Pending).await.unwrap();

    let analyzer = Arc::new(Scripted::new());
    let orch = orchestrator(store.clone(), analyzer.clone());
    assert_eq!(orch.recover().await.unwrap(), 1);

    let record = orch
        .enqueue("T-800", "ingest")
        .await
        .unwrap()
        .handle
        .wait()
        .await
        .unwrap();
    assert_eq!(record.status, AnalysisStatus::Completed);
    assert_eq!(record.results.len(), Phase::ALL.len());
    assert_eq!(record.results[&Phase::ParseDocuments].output["restored"], true);
    assert_eq!(analyzer.calls(Phase::ParseDocuments), 0);
    assert_eq!(analyzer.calls(Phase::ExtractTenderInfo), 0);
    assert_eq!(analyzer.calls(Phase::GenerateOnepager), 1);
}

#[tokio::test]
async fn recover_ignores_finished_records() {
    let store = Arc::new(MemoryStore::new());
    let orch = orchestrator(store, Arc::new(Scripted::new()));
    orch.enqueue("T-801", "alice")
        .await
        .unwrap()
        .handle
        .wait()
        .await
        .unwrap();
    assert_eq!(orch.recover().await.unwrap(), 0);
}
