use async_trait::async_trait;
use futures::StreamExt;
use mongodb::bson::{doc, Document};
use mongodb::options::{FindOptions, IndexOptions, ReplaceOptions};
use mongodb::{Collection, Database, IndexModel};
use serde::{Deserialize, Serialize};

use crate::models::*;
use crate::storage::EntityStore;

const SOURCES: &str = "sources";
const SYNC_EXECUTIONS: &str = "sync_executions";
const DEFERRED_LINKS: &str = "deferred_links";
const EVENT_OUTBOX: &str = "event_outbox";
const FILE_EXTRACTIONS: &str = "file_extractions";

/// Unresolved link row, scoped to the source whose cycle left it behind.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct UnresolvedLinkDoc {
    source_id: String,
    #[serde(flatten)]
    link: DeferredLink,
}

/// MongoDB backend: one collection per entity type plus bookkeeping collections.
#[derive(Clone)]
pub struct MongoStore {
    db: Database,
}

impl MongoStore {
    pub fn with_db(db: Database) -> Self {
        Self { db }
    }

    pub async fn connect(uri: &str, database: &str) -> Result<Self> {
        let client = mongodb::Client::with_uri_str(uri).await?;
        Ok(Self::with_db(client.database(database)))
    }

    fn entities(&self, entity_type: EntityType) -> Collection<StoredEntity> {
        self.db.collection(&entity_type.collection_name())
    }

    pub async fn ensure_indexes(&self) -> Result<()> {
        tracing::info!(database = %self.db.name(), "Ensuring ingestion indexes");
        let unique = IndexOptions::builder().unique(true).build();

        for t in EntityType::ALL {
            let coll = self.db.collection::<Document>(&t.collection_name());
            coll.create_index(
                IndexModel::builder().keys(doc! {"external_id": 1}).options(unique.clone()).build(),
                None,
            )
            .await?;
            coll.create_index(IndexModel::builder().keys(doc! {"body_id": 1}).build(), None).await?;
            coll.create_index(IndexModel::builder().keys(doc! {"source_id": 1, "updated_at": -1}).build(), None)
                .await?;
        }

        let execs = self.db.collection::<Document>(SYNC_EXECUTIONS);
        execs.create_index(IndexModel::builder().keys(doc! {"source_id": 1, "started_at": -1}).build(), None).await?;
        execs.create_index(IndexModel::builder().keys(doc! {"status": 1}).build(), None).await?;

        let links = self.db.collection::<Document>(DEFERRED_LINKS);
        links.create_index(IndexModel::builder().keys(doc! {"source_id": 1}).build(), None).await?;
        links.create_index(IndexModel::builder().keys(doc! {"target_type": 1, "target_id": 1}).build(), None).await?;

        let outbox = self.db.collection::<Document>(EVENT_OUTBOX);
        outbox.create_index(IndexModel::builder().keys(doc! {"emitted_at": 1}).build(), None).await?;

        let extractions = self.db.collection::<Document>(FILE_EXTRACTIONS);
        extractions.create_index(IndexModel::builder().keys(doc! {"state": 1, "updated_at": 1}).build(), None).await?;

        Ok(())
    }
}

fn upsert_opts() -> ReplaceOptions {
    ReplaceOptions::builder().upsert(true).build()
}

async fn collect<T>(mut cursor: mongodb::Cursor<T>) -> Result<Vec<T>>
where
    T: serde::de::DeserializeOwned + Unpin + Send + Sync,
{
    let mut out = Vec::new();
    while let Some(doc) = cursor.next().await {
        out.push(doc?);
    }
    Ok(out)
}

#[async_trait]
impl EntityStore for MongoStore {
    async fn get_entity(&self, entity_type: EntityType, external_id: &str) -> Result<Option<StoredEntity>> {
        self.entities(entity_type)
            .find_one(doc! {"external_id": external_id}, None)
            .await
            .map_err(Into::into)
    }

    async fn put_entity(&self, entity: &StoredEntity) -> Result<()> {
        self.entities(entity.entity_type)
            .replace_one(doc! {"external_id": &entity.external_id}, entity, upsert_opts())
            .await?;
        Ok(())
    }

    async fn set_link(&self, entity_type: EntityType, external_id: &str, link: &EntityLink) -> Result<bool> {
        let link = bson::to_bson(link)?;
        let res = self
            .entities(entity_type)
            .update_one(
                doc! {"external_id": external_id},
                doc! {"$addToSet": {"links": link}, "$set": {"updated_at": chrono::Utc::now().to_rfc3339()}},
                None,
            )
            .await?;
        Ok(res.matched_count > 0)
    }

    async fn count_entities(&self, entity_type: EntityType) -> Result<u64> {
        Ok(self.entities(entity_type).count_documents(doc! {}, None).await?)
    }

    async fn list_entities(&self, entity_type: EntityType, limit: usize) -> Result<Vec<StoredEntity>> {
        let options = FindOptions::builder().sort(doc! {"external_id": 1}).limit(find_limit(limit)).build();
        collect(self.entities(entity_type).find(doc! {}, options).await?).await
    }

    async fn get_source(&self, id: &str) -> Result<Option<Source>> {
        let coll: Collection<Source> = self.db.collection(SOURCES);
        coll.find_one(doc! {"_id": id}, None).await.map_err(Into::into)
    }

    async fn put_source(&self, source: &Source) -> Result<()> {
        let coll: Collection<Source> = self.db.collection(SOURCES);
        coll.replace_one(doc! {"_id": &source.id}, source, upsert_opts()).await?;
        Ok(())
    }

    async fn list_sources(&self) -> Result<Vec<Source>> {
        let coll: Collection<Source> = self.db.collection(SOURCES);
        let options = FindOptions::builder().sort(doc! {"_id": 1}).build();
        collect(coll.find(doc! {}, options).await?).await
    }

    async fn insert_sync_execution(&self, execution: &SyncExecution) -> Result<()> {
        let coll: Collection<SyncExecution> = self.db.collection(SYNC_EXECUTIONS);
        coll.replace_one(doc! {"_id": &execution.id}, execution, upsert_opts()).await?;
        Ok(())
    }

    async fn latest_sync_executions(&self, source_id: Option<&str>, limit: usize) -> Result<Vec<SyncExecution>> {
        let coll: Collection<SyncExecution> = self.db.collection(SYNC_EXECUTIONS);
        let filter = match source_id {
            Some(id) => doc! {"source_id": id},
            None => doc! {},
        };
        let options = FindOptions::builder().sort(doc! {"started_at": -1}).limit(find_limit(limit)).build();
        collect(coll.find(filter, options).await?).await
    }

    async fn replace_unresolved_links(&self, source_id: &str, links: &[DeferredLink]) -> Result<()> {
        let coll: Collection<UnresolvedLinkDoc> = self.db.collection(DEFERRED_LINKS);
        coll.delete_many(doc! {"source_id": source_id}, None).await?;
        if links.is_empty() {
            return Ok(());
        }
        let docs: Vec<UnresolvedLinkDoc> = links
            .iter()
            .cloned()
            .map(|link| UnresolvedLinkDoc { source_id: source_id.to_string(), link })
            .collect();
        coll.insert_many(docs, None).await?;
        Ok(())
    }

    async fn list_unresolved_links(&self, source_id: Option<&str>) -> Result<Vec<DeferredLink>> {
        let coll: Collection<UnresolvedLinkDoc> = self.db.collection(DEFERRED_LINKS);
        let filter = match source_id {
            Some(id) => doc! {"source_id": id},
            None => doc! {},
        };
        let docs = collect(coll.find(filter, None).await?).await?;
        Ok(docs.into_iter().map(|d| d.link).collect())
    }

    async fn enqueue_event(&self, event: &ChangeEvent) -> Result<()> {
        let coll: Collection<ChangeEvent> = self.db.collection(EVENT_OUTBOX);
        coll.replace_one(doc! {"_id": &event.id}, event, upsert_opts()).await?;
        Ok(())
    }

    async fn ack_event(&self, event_id: &str) -> Result<()> {
        let coll: Collection<ChangeEvent> = self.db.collection(EVENT_OUTBOX);
        coll.delete_one(doc! {"_id": event_id}, None).await?;
        Ok(())
    }

    async fn pending_events(&self, limit: usize) -> Result<Vec<ChangeEvent>> {
        let coll: Collection<ChangeEvent> = self.db.collection(EVENT_OUTBOX);
        let options = FindOptions::builder().sort(doc! {"emitted_at": 1}).limit(find_limit(limit)).build();
        collect(coll.find(doc! {}, options).await?).await
    }

    async fn get_extraction(&self, file_id: &str) -> Result<Option<FileExtraction>> {
        let coll: Collection<FileExtraction> = self.db.collection(FILE_EXTRACTIONS);
        coll.find_one(doc! {"_id": file_id}, None).await.map_err(Into::into)
    }

    async fn put_extraction(&self, extraction: &FileExtraction) -> Result<()> {
        let coll: Collection<FileExtraction> = self.db.collection(FILE_EXTRACTIONS);
        coll.replace_one(doc! {"_id": &extraction.file_id}, extraction, upsert_opts()).await?;
        Ok(())
    }

    async fn list_extractions(&self, state: Option<ExtractionState>, limit: usize) -> Result<Vec<FileExtraction>> {
        let coll: Collection<FileExtraction> = self.db.collection(FILE_EXTRACTIONS);
        let filter = match state {
            Some(s) => doc! {"state": bson::to_bson(&s)?},
            None => doc! {},
        };
        let options = FindOptions::builder().sort(doc! {"updated_at": 1}).limit(find_limit(limit)).build();
        collect(coll.find(filter, options).await?).await
    }

    async fn count_extractions(&self, state: Option<ExtractionState>) -> Result<u64> {
        let coll = self.db.collection::<Document>(FILE_EXTRACTIONS);
        let filter = match state {
            Some(s) => doc! {"state": bson::to_bson(&s)?},
            None => doc! {},
        };
        Ok(coll.count_documents(filter, None).await?)
    }
}

/// Server-side limit for `find`. Negative values mean "single batch" to MongoDB,
/// so oversized requests saturate instead of wrapping.
fn find_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_limit_saturates_instead_of_going_negative() {
        assert_eq!(find_limit(25), 25);
        assert_eq!(find_limit(usize::MAX), i64::MAX);
    }
}
