//! Per-client event streams.
//!
//! A finished analysis is replayed from its record as one terminal event. A
//! running one gets a snapshot of what is persisted, then live bus events.
//! The gateway subscribes before it takes the snapshot, so nothing published
//! in between is lost, and re-reads the record on every heartbeat so a
//! subscriber that missed the terminal event still ends correctly.
//!
//! Sequence numbers: live events keep their bus sequence. The snapshot and
//! heartbeats carry the last sequence the client has seen; a terminal event
//! recovered from the record carries the next one. A replay of a finished
//! record carries 0.
//!
//! A gateway given a shutdown signal ends its live streams when the signal
//! fires, so open clients do not hold up a graceful stop.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use opentelemetry::KeyValue;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::engine::Orchestrator;
use crate::error::Result;
use crate::event::Event;
use crate::model::{AnalysisId, AnalysisRecord};
use crate::store::AnalysisStore;
use crate::telemetry::metrics;

pub type EventStream = Pin<Box<dyn Stream<Item = Event> + Send>>;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Idle time before the gateway re-reads the record and emits a heartbeat.
    pub heartbeat: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            heartbeat: Duration::from_secs(15),
        }
    }
}

#[derive(Clone)]
pub struct StreamGateway {
    orchestrator: Orchestrator,
    config: GatewayConfig,
    shutdown: Option<watch::Receiver<bool>>,
}

impl StreamGateway {
    pub fn new(orchestrator: Orchestrator, config: GatewayConfig) -> Self {
        Self {
            orchestrator,
            config,
            shutdown: None,
        }
    }

    /// End live streams once `shutdown` flips to true.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Open a stream for `subject`, creating and enqueueing its analysis on
    /// first contact. Dropping the stream never cancels the run.
    pub async fn connect(&self, subject: &str, owner: &str) -> Result<EventStream> {
        let store = Arc::clone(self.orchestrator.store());
        let record = match store.find_by_subject(subject).await? {
            Some(record) => record,
            None => self.orchestrator.enqueue(subject, owner).await?.record,
        };

        if record.is_terminal() {
            metrics::stream_connections().add(1, &[KeyValue::new("mode", "replay")]);
            debug!(%subject, status = %record.status, "replaying finished analysis");
            return Ok(Box::pin(futures::stream::iter(Event::terminal(&record, 0))));
        }

        if !self.orchestrator.is_running(subject) {
            self.orchestrator.enqueue(subject, &record.owner).await?;
        }

        metrics::stream_connections().add(1, &[KeyValue::new("mode", "live")]);
        let subscription = self.orchestrator.bus().subscribe(record.id);
        let heartbeat = self.config.heartbeat;
        let id = record.id;

        let live = async_stream::stream! {
            let mut subscription = subscription;
            let mut last = subscription.baseline();
            let current = reread(store.as_ref(), id).await.unwrap_or(record);

            if current.is_terminal() {
                if let Some(event) = Event::terminal(&current, last + 1) {
                    yield event;
                }
            } else {
                yield Event::snapshot(&current, last);
                loop {
                    match tokio::time::timeout(heartbeat, subscription.recv()).await {
                        Ok(Some(event)) => {
                            if event.sequence <= last {
                                continue;
                            }
                            last = event.sequence;
                            let terminal = event.is_terminal();
                            yield event;
                            if terminal {
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(_) => match reread(store.as_ref(), id).await {
                            Some(record) if record.is_terminal() => {
                                if let Some(event) = Event::terminal(&record, last + 1) {
                                    yield event;
                                }
                                break;
                            }
                            _ => yield Event::heartbeat(id, last),
                        },
                    }
                }
            }
        };

        let stream: EventStream = match self.shutdown.clone() {
            Some(mut shutdown) => Box::pin(live.take_until(async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
            })),
            None => Box::pin(live),
        };
        Ok(stream)
    }
}

/// Latest committed record, or `None` if it cannot be read.
async fn reread(store: &dyn AnalysisStore, id: AnalysisId) -> Option<AnalysisRecord> {
    match store.get(id).await {
        Ok(record) => record,
        Err(e) => {
            warn!(analysis_id = %id, error = %e, "record re-read failed");
            None
        }
    }
}
