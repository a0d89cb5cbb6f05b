use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::metrics::IngestionMetrics;
use crate::models::*;
use crate::storage::EntityStore;

// Outbox rows fetched per replay round
const REPLAY_BATCH: usize = 500;

/// A destination for change events (Redis topics, in-process bus, extraction queue).
#[async_trait]
pub trait EventSink: Send + Sync {
    fn name(&self) -> &str;

    async fn publish(&self, event: &ChangeEvent) -> Result<()>;
}

/// Wire form of an event as published to topic channels.
pub fn event_payload(event: &ChangeEvent) -> serde_json::Value {
    serde_json::json!({
        "id": event.id,
        "dedupe_key": event.dedupe_key,
        "topic": event.topic(),
        "entity_type": event.entity_type,
        "kind": event.kind,
        "source_id": event.source_id,
        "body_id": event.body_id,
        "external_id": event.external_id,
        "remote_modified": event.remote_modified,
        "emitted_at": event.emitted_at,
    })
}

/// In-process fan-out over a tokio broadcast channel.
#[derive(Clone)]
pub struct BroadcastEventSink {
    tx: broadcast::Sender<ChangeEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl EventSink for BroadcastEventSink {
    fn name(&self) -> &str {
        "broadcast"
    }

    async fn publish(&self, event: &ChangeEvent) -> Result<()> {
        // No subscribers is not an error
        let _ = self.tx.send(event.clone());
        Ok(())
    }
}

/// Publishes one event per effective change, at least once.
///
/// Every event is written to the store's outbox before it is handed to the sinks and
/// removed only after all sinks accepted it. Events left behind by a crash or a failing
/// sink are delivered again by [`replay_pending`](Self::replay_pending), so consumers
/// must deduplicate on `dedupe_key`.
pub struct EventEmitter {
    store: Arc<dyn EntityStore>,
    sinks: Vec<Arc<dyn EventSink>>,
    metrics: Arc<IngestionMetrics>,
}

impl EventEmitter {
    pub fn new(store: Arc<dyn EntityStore>, metrics: Arc<IngestionMetrics>) -> Self {
        Self { store, sinks: Vec::new(), metrics }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn sink_names(&self) -> Vec<String> {
        self.sinks.iter().map(|s| s.name().to_string()).collect()
    }

    pub async fn emit(&self, event: ChangeEvent) -> Result<bool> {
        self.stage(&event).await?;
        self.deliver(&event).await
    }

    /// Write the event to the outbox without publishing it. Writers stage the event
    /// before the entity itself so a committed change always has an event behind it.
    pub async fn stage(&self, event: &ChangeEvent) -> Result<()> {
        self.store.enqueue_event(event).await
    }

    /// Drop a staged event whose entity write did not happen.
    pub async fn discard(&self, event: &ChangeEvent) {
        if let Err(e) = self.store.ack_event(&event.id).await {
            tracing::warn!(topic = %event.topic(), external_id = %event.external_id, error = %e, "Could not discard staged event");
        }
    }

    /// Returns true when every sink accepted the event and it left the outbox.
    pub async fn deliver(&self, event: &ChangeEvent) -> Result<bool> {
        let mut delivered = true;
        for sink in &self.sinks {
            if let Err(e) = sink.publish(event).await {
                delivered = false;
                tracing::warn!(
                    sink = sink.name(),
                    topic = %event.topic(),
                    external_id = %event.external_id,
                    error = %e,
                    "Event publish failed; kept in outbox for replay"
                );
            }
        }
        if delivered {
            self.store.ack_event(&event.id).await?;
            IngestionMetrics::incr(&self.metrics.events_published);
        } else {
            IngestionMetrics::incr(&self.metrics.events_failed);
        }
        Ok(delivered)
    }

    /// Re-deliver unacknowledged events. Stops at the first round without progress.
    pub async fn replay_pending(&self) -> Result<usize> {
        let mut replayed = 0;
        loop {
            let batch = self.store.pending_events(REPLAY_BATCH).await?;
            if batch.is_empty() {
                break;
            }
            let mut progressed = 0;
            for event in &batch {
                if self.deliver(event).await? {
                    progressed += 1;
                }
            }
            replayed += progressed;
            if progressed < batch.len() {
                break;
            }
        }
        if replayed > 0 {
            tracing::info!(replayed = replayed, "Replayed pending change events");
        }
        Ok(replayed)
    }
}
