//! HTTP surface: status, retry, poll trigger, and the SSE event stream.

use std::convert::Infallible;
use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::engine::{EnqueueOutcome, Orchestrator};
use crate::error::{Error, Result};
use crate::gateway::StreamGateway;
use crate::ingest::{Deduplicator, PollReport};
use crate::model::AnalysisRecord;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub gateway: StreamGateway,
    pub ingest: Arc<Deduplicator>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/analyses/{subject}", get(get_analysis))
        .route("/analyses/{subject}/stream", get(stream_analysis))
        .route("/analyses/{subject}/retry", post(retry_analysis))
        .route("/ingest/poll", post(trigger_poll))
        .with_state(state)
}

/// Serve until `shutdown` flips to true.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    info!(addr = ?listener.local_addr().ok(), "http listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;
    Ok(())
}

struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Busy(_) | Error::InvalidTransition { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            warn!(error = %self.0, "request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

async fn healthz(State(state): State<AppState>) -> Response {
    match state.orchestrator.store().health_check().await {
        Ok(()) => Json(json!({ "status": "ok" })).into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unavailable", "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn get_analysis(
    Path(subject): Path<String>,
    State(state): State<AppState>,
) -> std::result::Result<Json<AnalysisRecord>, ApiError> {
    state
        .orchestrator
        .store()
        .find_by_subject(&subject)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError(Error::NotFound(format!("analysis for {subject}"))))
}

#[derive(Debug, Deserialize)]
struct StreamParams {
    owner: Option<String>,
}

async fn stream_analysis(
    Path(subject): Path<String>,
    Query(params): Query<StreamParams>,
    State(state): State<AppState>,
) -> std::result::Result<
    Sse<impl Stream<Item = std::result::Result<SseEvent, Infallible>>>,
    ApiError,
> {
    let owner = params.owner.unwrap_or_else(|| "anonymous".to_string());
    let events = state.gateway.connect(&subject, &owner).await?;
    Ok(Sse::new(events.map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_default();
        Ok(SseEvent::default()
            .event(event.event_type.as_str())
            .data(data))
    })))
}

#[derive(Debug, Serialize)]
struct RetryResponse {
    outcome: EnqueueOutcome,
    record: AnalysisRecord,
}

async fn retry_analysis(
    Path(subject): Path<String>,
    State(state): State<AppState>,
) -> std::result::Result<Json<RetryResponse>, ApiError> {
    let enqueued = state.orchestrator.retry(&subject).await?;
    Ok(Json(RetryResponse {
        outcome: enqueued.outcome,
        record: enqueued.record,
    }))
}

async fn trigger_poll(
    State(state): State<AppState>,
) -> std::result::Result<Json<PollReport>, ApiError> {
    Ok(Json(state.ingest.poll_once().await?))
}
