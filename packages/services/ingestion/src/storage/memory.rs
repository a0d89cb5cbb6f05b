use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Mutex;

use crate::models::*;
use crate::storage::EntityStore;

/// In-process store for tests and dry runs.
#[derive(Default)]
pub struct MemoryStore {
    entities: DashMap<(EntityType, String), StoredEntity>,
    sources: DashMap<String, Source>,
    executions: Mutex<Vec<SyncExecution>>,
    unresolved: DashMap<String, Vec<DeferredLink>>,
    outbox: DashMap<String, ChangeEvent>,
    extractions: DashMap<String, FileExtraction>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_executions(&self) -> Result<std::sync::MutexGuard<'_, Vec<SyncExecution>>> {
        self.executions
            .lock()
            .map_err(|_| IngestionError::Sync("execution log lock poisoned".to_string()))
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn get_entity(&self, entity_type: EntityType, external_id: &str) -> Result<Option<StoredEntity>> {
        Ok(self
            .entities
            .get(&(entity_type, external_id.to_string()))
            .map(|e| e.value().clone()))
    }

    async fn put_entity(&self, entity: &StoredEntity) -> Result<()> {
        self.entities
            .insert((entity.entity_type, entity.external_id.clone()), entity.clone());
        Ok(())
    }

    async fn set_link(&self, entity_type: EntityType, external_id: &str, link: &EntityLink) -> Result<bool> {
        match self.entities.get_mut(&(entity_type, external_id.to_string())) {
            Some(mut entry) => {
                if entry.add_link(link.clone()) {
                    entry.updated_at = chrono::Utc::now();
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn count_entities(&self, entity_type: EntityType) -> Result<u64> {
        Ok(self.entities.iter().filter(|e| e.key().0 == entity_type).count() as u64)
    }

    async fn list_entities(&self, entity_type: EntityType, limit: usize) -> Result<Vec<StoredEntity>> {
        let mut out: Vec<StoredEntity> = self
            .entities
            .iter()
            .filter(|e| e.key().0 == entity_type)
            .map(|e| e.value().clone())
            .collect();
        out.sort_by(|a, b| a.external_id.cmp(&b.external_id));
        out.truncate(limit);
        Ok(out)
    }

    async fn get_source(&self, id: &str) -> Result<Option<Source>> {
        Ok(self.sources.get(id).map(|s| s.value().clone()))
    }

    async fn put_source(&self, source: &Source) -> Result<()> {
        self.sources.insert(source.id.clone(), source.clone());
        Ok(())
    }

    async fn list_sources(&self) -> Result<Vec<Source>> {
        let mut out: Vec<Source> = self.sources.iter().map(|s| s.value().clone()).collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    async fn insert_sync_execution(&self, execution: &SyncExecution) -> Result<()> {
        let mut log = self.lock_executions()?;
        log.retain(|e| e.id != execution.id);
        log.push(execution.clone());
        Ok(())
    }

    async fn latest_sync_executions(&self, source_id: Option<&str>, limit: usize) -> Result<Vec<SyncExecution>> {
        let log = self.lock_executions()?;
        let mut out: Vec<SyncExecution> = log
            .iter()
            .filter(|e| source_id.map_or(true, |id| e.source_id == id))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        out.truncate(limit);
        Ok(out)
    }

    async fn replace_unresolved_links(&self, source_id: &str, links: &[DeferredLink]) -> Result<()> {
        if links.is_empty() {
            self.unresolved.remove(source_id);
        } else {
            self.unresolved.insert(source_id.to_string(), links.to_vec());
        }
        Ok(())
    }

    async fn list_unresolved_links(&self, source_id: Option<&str>) -> Result<Vec<DeferredLink>> {
        Ok(match source_id {
            Some(id) => self.unresolved.get(id).map(|l| l.value().clone()).unwrap_or_default(),
            None => self.unresolved.iter().flat_map(|l| l.value().clone()).collect(),
        })
    }

    async fn enqueue_event(&self, event: &ChangeEvent) -> Result<()> {
        self.outbox.insert(event.id.clone(), event.clone());
        Ok(())
    }

    async fn ack_event(&self, event_id: &str) -> Result<()> {
        self.outbox.remove(event_id);
        Ok(())
    }

    async fn pending_events(&self, limit: usize) -> Result<Vec<ChangeEvent>> {
        let mut out: Vec<ChangeEvent> = self.outbox.iter().map(|e| e.value().clone()).collect();
        out.sort_by(|a, b| a.emitted_at.cmp(&b.emitted_at));
        out.truncate(limit);
        Ok(out)
    }

    async fn get_extraction(&self, file_id: &str) -> Result<Option<FileExtraction>> {
        Ok(self.extractions.get(file_id).map(|e| e.value().clone()))
    }

    async fn put_extraction(&self, extraction: &FileExtraction) -> Result<()> {
        self.extractions.insert(extraction.file_id.clone(), extraction.clone());
        Ok(())
    }

    async fn list_extractions(&self, state: Option<ExtractionState>, limit: usize) -> Result<Vec<FileExtraction>> {
        let mut out: Vec<FileExtraction> = self
            .extractions
            .iter()
            .filter(|e| state.map_or(true, |s| e.value().state == s))
            .map(|e| e.value().clone())
            .collect();
        out.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        out.truncate(limit);
        Ok(out)
    }

    async fn count_extractions(&self, state: Option<ExtractionState>) -> Result<u64> {
        Ok(self
            .extractions
            .iter()
            .filter(|e| state.map_or(true, |s| e.value().state == s))
            .count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn stored(id: &str) -> StoredEntity {
        StoredEntity {
            entity_type: EntityType::Paper,
            external_id: id.to_string(),
            body_id: "b".into(),
            source_id: "s".into(),
            record: EntityRecord::Paper(Paper::default()),
            links: vec![],
            raw_payload: serde_json::json!({"id": id}),
            payload_sha256: String::new(),
            remote_modified: None,
            remote_created: None,
            deleted: false,
            stored_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn set_link_is_idempotent_and_reports_missing_rows() {
        let store = MemoryStore::new();
        store.put_entity(&stored("p1")).await.unwrap();
        let link = EntityLink { relation: "meeting".into(), target_type: EntityType::Meeting, target_id: "m1".into() };
        assert!(store.set_link(EntityType::Paper, "p1", &link).await.unwrap());
        assert!(store.set_link(EntityType::Paper, "p1", &link).await.unwrap());
        assert!(!store.set_link(EntityType::Paper, "p2", &link).await.unwrap());
        let p1 = store.get_entity(EntityType::Paper, "p1").await.unwrap().unwrap();
        assert_eq!(p1.links.len(), 1);
    }

    #[tokio::test]
    async fn outbox_returns_unacked_events_oldest_first() {
        let store = MemoryStore::new();
        let first = ChangeEvent::new(EntityType::Paper, ChangeKind::Created, "s", "b", "p1", None);
        let second = ChangeEvent::new(EntityType::Paper, ChangeKind::Created, "s", "b", "p2", None);
        store.enqueue_event(&first).await.unwrap();
        store.enqueue_event(&second).await.unwrap();
        store.ack_event(&first.id).await.unwrap();
        let pending = store.pending_events(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].external_id, "p2");
    }

    #[tokio::test]
    async fn extraction_counts_are_not_capped_by_listing() {
        let store = MemoryStore::new();
        for i in 0..3 {
            store.put_extraction(&FileExtraction::pending(format!("f{}", i), None)).await.unwrap();
        }
        let mut done = FileExtraction::pending("f9", None);
        done.transition(ExtractionState::Processing).unwrap();
        done.transition(ExtractionState::Completed).unwrap();
        store.put_extraction(&done).await.unwrap();

        assert_eq!(store.count_extractions(Some(ExtractionState::Pending)).await.unwrap(), 3);
        assert_eq!(store.count_extractions(None).await.unwrap(), 4);
        assert_eq!(store.list_extractions(Some(ExtractionState::Pending), 1).await.unwrap().len(), 1);
    }
}
