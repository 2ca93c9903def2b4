//! HTTP surface, served on an ephemeral port.

mod common;

use std::net::SocketAddr;
use std::sync::Arc;

use common::{Scripted, ScriptedFeed, candidate, eventually, orchestrator};
use serde_json::Value;
use tenderwatch::gateway::{GatewayConfig, StreamGateway};
use tenderwatch::http::{self, AppState};
use tenderwatch::ingest::{Deduplicator, IngestConfig};
use tenderwatch::store::MemoryStore;
use tokio::sync::watch;

struct Server {
    addr: SocketAddr,
    feed: Arc<ScriptedFeed>,
    _shutdown: watch::Sender<bool>,
}

impl Server {
    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }
}

async fn start() -> Server {
    let store = Arc::new(MemoryStore::new());
    let feed = Arc::new(ScriptedFeed::new());
    let orch = orchestrator(store.clone(), Arc::new(Scripted::new()));
    let state = AppState {
        gateway: StreamGateway::new(orch.clone(), GatewayConfig::default()),
        ingest: Arc::new(Deduplicator::new(
            feed.clone(),
            store,
            orch.clone(),
            IngestConfig::default(),
        )),
        orchestrator: orch,
    };

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown, rx) = watch::channel(false);
    tokio::spawn(http::serve(listener, state, rx));
    Server {
        addr,
        feed,
        _shutdown: shutdown,
    }
}

async fn status_of(client: &reqwest::Client, server: &Server, subject: &str) -> Option<String> {
    let response = client
        .get(server.url(&format!("/analyses/{subject}")))
        .send()
        .await
        .unwrap();
    if !response.status().is_success() {
        return None;
    }
    let body: Value = response.json().await.unwrap();
    body["status"].as_str().map(str::to_string)
}

#[tokio::test]
async fn healthz_reports_ok() {
    let server = start().await;
    let body: Value = reqwest::get(server.url("/healthz"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn unknown_analysis_is_404() {
    let server = start().await;
    let response = reqwest::get(server.url("/analyses/T-none")).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

    let client = reqwest::Client::new();
    let response = client
        .post(server.url("/analyses/T-none/retry"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn poll_trigger_ingests_and_analyzes() {
    let server = start().await;
    let client = reqwest::Client::new();
    server.feed.push_candidate(candidate("S1", "T-42"));

    let report: Value = client
        .post(server.url("/ingest/poll"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(report["fetched"], 1);
    assert_eq!(report["processed"], 1);

    let client_ref = &client;
    let server_ref = &server;
    eventually("T-42 to complete", move || async move {
        status_of(client_ref, server_ref, "T-42").await.as_deref() == Some("completed")
    })
    .await;
}

#[tokio::test]
async fn stream_of_finished_analysis_is_one_terminal_event() {
    let server = start().await;
    let client = reqwest::Client::new();

    // First contact over SSE creates the analysis and follows it to the end.
    let live = client
        .get(server.url("/analyses/T-7/stream?owner=bob"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(live.contains("event: completed"));

    let replay = client
        .get(server.url("/analyses/T-7/stream"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(replay.matches("event: ").count(), 1);
    assert!(replay.contains("event: completed"));
    assert!(replay.contains("\"work_unit_id\""));
}

#[tokio::test]
async fn retry_restarts_a_finished_analysis() {
    let server = start().await;
    let client = reqwest::Client::new();
    client
        .get(server.url("/analyses/T-8/stream"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    let body: Value = client
        .post(server.url("/analyses/T-8/retry"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["outcome"], "started");
    assert_eq!(body["record"]["attempt"], 2);

    let client_ref = &client;
    let server_ref = &server;
    eventually("T-8 retry to complete", move || async move {
        status_of(client_ref, server_ref, "T-8").await.as_deref() == Some("completed")
    })
    .await;
}
