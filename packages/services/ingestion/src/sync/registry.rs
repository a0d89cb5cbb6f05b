use std::sync::Arc;

use crate::models::*;
use crate::storage::EntityStore;

/// Source configuration and sync cursors, backed by the entity store.
#[derive(Clone)]
pub struct SourceRegistry {
    store: Arc<dyn EntityStore>,
}

impl SourceRegistry {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self { store }
    }

    /// Create the source if unknown; otherwise refresh its name and enabled flag from the
    /// definition while keeping its cursors.
    pub async fn register(&self, def: &SourceDefinition) -> Result<Source> {
        let url = def.url.trim();
        if url::Url::parse(url).is_err() {
            return Err(IngestionError::Configuration(format!("Invalid source URL: {}", def.url)));
        }
        let source = match self.store.get_source(url).await? {
            Some(mut existing) => {
                if existing.name != def.name || existing.enabled != def.enabled {
                    existing.name = def.name.clone().or(existing.name);
                    existing.enabled = def.enabled;
                    existing.updated_at = chrono::Utc::now();
                    self.store.put_source(&existing).await?;
                }
                existing
            }
            None => {
                let mut source = Source::new(url, def.name.clone());
                source.enabled = def.enabled;
                self.store.put_source(&source).await?;
                tracing::info!(source = %url, "Registered new source");
                source
            }
        };
        Ok(source)
    }

    pub async fn load_or_create(&self, url: &str) -> Result<Source> {
        match self.store.get_source(url).await? {
            Some(s) => Ok(s),
            None => {
                self.register(&SourceDefinition { url: url.to_string(), name: None, enabled: true })
                    .await
            }
        }
    }

    pub async fn get(&self, id: &str) -> Result<Option<Source>> {
        self.store.get_source(id).await
    }

    pub async fn list(&self) -> Result<Vec<Source>> {
        self.store.list_sources().await
    }

    pub async fn enabled(&self) -> Result<Vec<Source>> {
        Ok(self.list().await?.into_iter().filter(|s| s.enabled).collect())
    }

    /// Fold a finished execution into the source's cursors and persist it.
    pub async fn record_cycle(
        &self,
        source: &mut Source,
        execution: &SyncExecution,
        completed_types: &[EntityType],
    ) -> Result<()> {
        source.record_cycle(
            execution.started_at,
            execution.mode,
            execution.status,
            completed_types,
            &execution.failed_entity_types,
        );
        self.store.put_source(source).await
    }
}
