pub mod memory;
pub mod mongo;

use async_trait::async_trait;

use crate::models::*;

pub use memory::MemoryStore;
pub use mongo::MongoStore;

/// Persistence seam for normalized entities and the engine's own bookkeeping
/// (sources, executions, unresolved links, event outbox, extraction state).
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn get_entity(&self, entity_type: EntityType, external_id: &str) -> Result<Option<StoredEntity>>;

    /// Insert or overwrite the entity keyed by `(entity_type, external_id)`.
    async fn put_entity(&self, entity: &StoredEntity) -> Result<()>;

    /// Attach a resolved link. Returns false when the entity does not exist.
    async fn set_link(&self, entity_type: EntityType, external_id: &str, link: &EntityLink) -> Result<bool>;

    async fn count_entities(&self, entity_type: EntityType) -> Result<u64>;

    async fn list_entities(&self, entity_type: EntityType, limit: usize) -> Result<Vec<StoredEntity>>;

    async fn get_source(&self, id: &str) -> Result<Option<Source>>;

    async fn put_source(&self, source: &Source) -> Result<()>;

    async fn list_sources(&self) -> Result<Vec<Source>>;

    async fn insert_sync_execution(&self, execution: &SyncExecution) -> Result<()>;

    /// Most recent executions first.
    async fn latest_sync_executions(&self, source_id: Option<&str>, limit: usize) -> Result<Vec<SyncExecution>>;

    /// Replace the set of links left unresolved by the last cycle of `source_id`.
    async fn replace_unresolved_links(&self, source_id: &str, links: &[DeferredLink]) -> Result<()>;

    async fn list_unresolved_links(&self, source_id: Option<&str>) -> Result<Vec<DeferredLink>>;

    async fn enqueue_event(&self, event: &ChangeEvent) -> Result<()>;

    async fn ack_event(&self, event_id: &str) -> Result<()>;

    /// Unacknowledged events, oldest first.
    async fn pending_events(&self, limit: usize) -> Result<Vec<ChangeEvent>>;

    async fn get_extraction(&self, file_id: &str) -> Result<Option<FileExtraction>>;

    async fn put_extraction(&self, extraction: &FileExtraction) -> Result<()>;

    async fn list_extractions(&self, state: Option<ExtractionState>, limit: usize) -> Result<Vec<FileExtraction>>;

    async fn count_extractions(&self, state: Option<ExtractionState>) -> Result<u64>;
}
