//! In-process event fan-out, keyed by analysis id.
//!
//! Sequence numbers are assigned under the topic lock, so every subscriber
//! of an analysis sees its events in increasing order. Delivery uses
//! `try_send`: a full subscriber misses the event, the publisher never
//! waits. There is no history; late subscribers re-read the record.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use opentelemetry::KeyValue;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

use crate::event::Event;
use crate::model::AnalysisId;
use crate::telemetry::metrics;

#[derive(Default)]
struct Topic {
    last_sequence: u64,
    last_was_terminal: bool,
    next_subscriber: u64,
    subscribers: Vec<(u64, mpsc::Sender<Event>)>,
}

/// Cheap to clone; clones share topics.
#[derive(Clone)]
pub struct EventBus {
    topics: Arc<Mutex<HashMap<AnalysisId, Topic>>>,
    buffer: usize,
}

impl EventBus {
    /// `buffer` is the per-subscriber channel capacity.
    pub fn new(buffer: usize) -> Self {
        Self {
            topics: Arc::new(Mutex::new(HashMap::new())),
            buffer: buffer.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<AnalysisId, Topic>> {
        self.topics.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Assign the next sequence number for the event's analysis and deliver
    /// it to every current subscriber. Returns the assigned sequence.
    pub fn publish(&self, mut event: Event) -> u64 {
        let id = event.analysis_id;
        let mut topics = self.lock();
        let topic = topics.entry(id).or_default();
        topic.last_sequence += 1;
        topic.last_was_terminal = event.is_terminal();
        event.sequence = topic.last_sequence;

        let mut dropped = 0u64;
        topic.subscribers.retain(|(_, tx)| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                dropped += 1;
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });

        let sequence = event.sequence;
        let delivered = topic.subscribers.len() as u64 - dropped;
        if topic.last_was_terminal && topic.subscribers.is_empty() {
            topics.remove(&id);
        }
        drop(topics);

        metrics::bus_published().add(1, &[KeyValue::new("event_type", event.event_type.as_str())]);
        if dropped > 0 {
            metrics::bus_dropped().add(dropped, &[]);
            debug!(analysis_id = %id, sequence, dropped, "slow subscribers missed an event");
        }
        debug!(
            analysis_id = %id,
            sequence,
            delivered,
            event_type = event.event_type.as_str(),
            "published"
        );
        sequence
    }

    /// Register for live events. The subscription's baseline is the last
    /// sequence assigned before it was registered.
    pub fn subscribe(&self, id: AnalysisId) -> Subscription {
        let (tx, rx) = mpsc::channel(self.buffer);
        let mut topics = self.lock();
        let topic = topics.entry(id).or_default();
        let subscriber = topic.next_subscriber;
        topic.next_subscriber += 1;
        topic.subscribers.push((subscriber, tx));
        Subscription {
            analysis_id: id,
            subscriber,
            baseline: topic.last_sequence,
            rx,
            bus: self.clone(),
        }
    }

    fn unsubscribe(&self, id: AnalysisId, subscriber: u64) {
        let mut topics = self.lock();
        if let Some(topic) = topics.get_mut(&id) {
            topic.subscribers.retain(|(s, _)| *s != subscriber);
            if topic.subscribers.is_empty() && topic.last_was_terminal {
                topics.remove(&id);
            }
        }
    }

    /// Live subscribers for `id`.
    pub fn subscriber_count(&self, id: AnalysisId) -> usize {
        self.lock().get(&id).map_or(0, |t| t.subscribers.len())
    }

    /// Analyses with retained topic state.
    pub fn topic_count(&self) -> usize {
        self.lock().len()
    }
}

/// A live registration. Dropping it unsubscribes.
pub struct Subscription {
    analysis_id: AnalysisId,
    subscriber: u64,
    baseline: u64,
    rx: mpsc::Receiver<Event>,
    bus: EventBus,
}

impl Subscription {
    pub fn analysis_id(&self) -> AnalysisId {
        self.analysis_id
    }

    /// Every event received here has a sequence above this.
    pub fn baseline(&self) -> u64 {
        self.baseline
    }

    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.analysis_id, self.subscriber);
    }
}
