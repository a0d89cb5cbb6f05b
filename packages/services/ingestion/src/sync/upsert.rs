use chrono::Utc;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::events::EventEmitter;
use crate::metrics::IngestionMetrics;
use crate::models::*;
use crate::storage::EntityStore;

type LockKey = (EntityType, String);

/// Idempotent create/update keyed by `(entity type, external id)`.
///
/// Writes for one key are serialized through a per-key async mutex; distinct keys
/// proceed concurrently. The decision is timestamp based: a remote change marker that
/// does not advance past the stored one is a no-op.
pub struct UpsertEngine {
    store: Arc<dyn EntityStore>,
    metrics: Arc<IngestionMetrics>,
    locks: DashMap<LockKey, Arc<Mutex<()>>>,
}

impl UpsertEngine {
    pub fn new(store: Arc<dyn EntityStore>, metrics: Arc<IngestionMetrics>) -> Self {
        Self { store, metrics, locks: DashMap::new() }
    }

    fn lock_for(&self, entity_type: EntityType, external_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry((entity_type, external_id.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn upsert(&self, source_id: &str, entity: &NormalizedEntity) -> Result<UpsertOutcome> {
        self.write(source_id, entity, None).await.map(|(outcome, _)| outcome)
    }

    /// Upsert with the change event written to the outbox ahead of the entity.
    ///
    /// If the outbox write fails the entity is left untouched; if the entity write fails
    /// the staged event is discarded. The staged event is returned for delivery.
    pub async fn upsert_with_event(
        &self,
        source_id: &str,
        entity: &NormalizedEntity,
        events: &EventEmitter,
    ) -> Result<(UpsertOutcome, Option<ChangeEvent>)> {
        self.write(source_id, entity, Some(events)).await
    }

    async fn write(
        &self,
        source_id: &str,
        entity: &NormalizedEntity,
        events: Option<&EventEmitter>,
    ) -> Result<(UpsertOutcome, Option<ChangeEvent>)> {
        let entity_type = entity.entity_type();
        let lock = self.lock_for(entity_type, &entity.external_id);
        let _held = lock.lock().await;

        let existing = self.store.get_entity(entity_type, &entity.external_id).await?;
        let outcome = decide(entity, existing.as_ref());
        let Some(kind) = ChangeKind::from_outcome(outcome) else {
            self.metrics.record_upsert(outcome);
            return Ok((outcome, None));
        };

        let mut record = entity.record.clone();
        if let (EntityRecord::File(incoming), Some(stored)) = (&mut record, existing.as_ref()) {
            keep_file_owner(incoming, stored, &entity.external_id);
        }

        let now = Utc::now();
        let stored = StoredEntity {
            entity_type,
            external_id: entity.external_id.clone(),
            body_id: entity.body_id.clone(),
            source_id: source_id.to_string(),
            record,
            // Re-resolved from the new record by the relationship resolver
            links: Vec::new(),
            payload_sha256: payload_digest(&entity.raw_payload),
            raw_payload: entity.raw_payload.clone(),
            remote_modified: entity.remote_modified,
            remote_created: entity.remote_created,
            deleted: entity.deleted,
            stored_at: existing.as_ref().map(|e| e.stored_at).unwrap_or(now),
            updated_at: now,
        };

        let staged = match events {
            Some(events) => {
                let event = ChangeEvent::new(
                    entity_type,
                    kind,
                    source_id,
                    &entity.body_id,
                    &entity.external_id,
                    entity.change_marker(),
                );
                events.stage(&event).await?;
                Some(event)
            }
            None => None,
        };
        if let Err(e) = self.store.put_entity(&stored).await {
            if let (Some(events), Some(event)) = (events, staged.as_ref()) {
                events.discard(event).await;
            }
            return Err(e);
        }
        self.metrics.record_upsert(outcome);

        tracing::debug!(
            entity_type = %entity_type,
            external_id = %entity.external_id,
            outcome = ?outcome,
            "Upserted entity"
        );
        Ok((outcome, staged))
    }

    /// Drop lock entries nobody holds. Called between cycles.
    pub fn prune_locks(&self) {
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }
}

fn decide(entity: &NormalizedEntity, existing: Option<&StoredEntity>) -> UpsertOutcome {
    let Some(stored) = existing else {
        return UpsertOutcome::Created;
    };
    match (entity.change_marker(), stored.change_marker()) {
        (Some(remote), Some(local)) if remote <= local => UpsertOutcome::Unchanged,
        (Some(_), _) => UpsertOutcome::Updated,
        // No marker at all: nothing proves the remote copy is newer
        (None, _) => UpsertOutcome::Unchanged,
    }
}

/// A File keeps the parent it was first stored under.
fn keep_file_owner(incoming: &mut File, stored: &StoredEntity, external_id: &str) {
    let Some(previous) = stored.record.as_file().and_then(|f| f.parent.clone()) else {
        return;
    };
    match &incoming.parent {
        Some(p) if p.entity_type == previous.entity_type && p.external_id == previous.external_id => {}
        Some(p) => {
            tracing::warn!(
                entity_type = %EntityType::File,
                external_id = %external_id,
                owner = %previous.external_id,
                target = %p.external_id,
                "File claimed by a second parent; keeping the original owner"
            );
            incoming.parent = Some(previous);
        }
        None => incoming.parent = Some(previous),
    }
}

fn payload_digest(payload: &serde_json::Value) -> String {
    let bytes = serde_json::to_vec(payload).unwrap_or_default();
    format!("{:x}", Sha256::digest(&bytes))
}
