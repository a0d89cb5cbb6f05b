use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::clients::{CloudOcrClient, RedisEventSink};
use crate::config::{load_source_definitions, Config, StoreBackend};
use crate::events::{BroadcastEventSink, EventEmitter, EventSink};
use crate::handlers::Fetcher;
use crate::mapping::Normalizer;
use crate::metrics::IngestionMetrics;
use crate::models::*;
use crate::processing::{
    CloudOcrStrategy, ExtractionQueue, ExtractionSettings, ExtractionStrategy, LocalOcrStrategy, LocalTextStrategy,
};
use crate::storage::{EntityStore, MemoryStore, MongoStore};
use crate::sync::{SyncContext, SyncEngine};

// Capacity of the in-process event bus
const BUS_CAPACITY: usize = 4096;
// Rows listed per section of the status report
const STATUS_LIST_LIMIT: usize = 50;

/// Wired-up engine: store, fetcher, emitter with its sinks, extraction queue.
pub struct IngestionApp {
    pub config: Arc<Config>,
    pub store: Arc<dyn EntityStore>,
    pub metrics: Arc<IngestionMetrics>,
    pub engine: Arc<SyncEngine>,
    pub extraction: Arc<ExtractionQueue>,
    pub bus: BroadcastEventSink,
}

impl IngestionApp {
    pub async fn bootstrap(config: Config) -> Result<Self> {
        let store: Arc<dyn EntityStore> = match config.store_backend {
            StoreBackend::MongoDb => {
                let mongo = MongoStore::connect(&config.mongodb_uri, &config.database_name).await?;
                mongo.ensure_indexes().await?;
                tracing::info!(database = %config.database_name, "Connected to MongoDB");
                Arc::new(mongo)
            }
            StoreBackend::Memory => {
                tracing::warn!("Using the in-memory store; nothing survives this process");
                Arc::new(MemoryStore::new())
            }
        };
        let mut sinks: Vec<Arc<dyn EventSink>> = Vec::new();
        if let Some(url) = &config.redis_url {
            sinks.push(Arc::new(RedisEventSink::new(url).await?));
            tracing::info!("Publishing change events to Redis");
        }
        let app = Self::assemble(config, store, sinks)?;

        let replayed = app.engine.context().events.replay_pending().await?;
        if replayed > 0 {
            tracing::info!(replayed = replayed, "Re-delivered events left in the outbox");
        }
        Ok(app)
    }

    /// Build the component graph over an existing store. `sinks` receive every change
    /// event ahead of the in-process bus and the extraction queue.
    pub fn assemble(config: Config, store: Arc<dyn EntityStore>, sinks: Vec<Arc<dyn EventSink>>) -> Result<Self> {
        let config = Arc::new(config);
        let metrics = Arc::new(IngestionMetrics::new());
        let fetcher = Fetcher::with_config(&config, metrics.clone())?;

        let extraction = Arc::new(ExtractionQueue::new(
            store.clone(),
            fetcher.clone(),
            default_strategies(&config)?,
            ExtractionSettings::from_config(&config),
            metrics.clone(),
        ));
        let bus = BroadcastEventSink::new(BUS_CAPACITY);
        let events = sinks
            .into_iter()
            .fold(EventEmitter::new(store.clone(), metrics.clone()), |emitter, sink| emitter.with_sink(sink))
            .with_sink(Arc::new(bus.clone()))
            .with_sink(extraction.clone());

        let ctx = SyncContext {
            config: config.clone(),
            store: store.clone(),
            fetcher,
            normalizer: Normalizer::new(),
            events: Arc::new(events),
            metrics: metrics.clone(),
        };
        Ok(Self { config, store, metrics, engine: Arc::new(SyncEngine::new(ctx)), extraction, bus })
    }

    /// Register the sources file plus an optional extra source URL.
    pub async fn register_sources(&self, extra: Option<&str>) -> Result<Vec<Source>> {
        let mut defs = load_source_definitions(&self.config.sources_file)?;
        if let Some(url) = extra {
            match defs.iter_mut().find(|d| d.url == url) {
                Some(def) => def.enabled = true,
                None => defs.push(SourceDefinition { url: url.to_string(), name: None, enabled: true }),
            }
        }
        let mut sources = Vec::with_capacity(defs.len());
        for def in &defs {
            sources.push(self.engine.registry().register(def).await?);
        }
        tracing::info!(sources = sources.len(), sources_file = %self.config.sources_file, "Sources registered");
        Ok(sources)
    }

    pub async fn status_report(&self, source: Option<&str>) -> Result<StatusReport> {
        let sources = match source {
            Some(id) => self.engine.registry().get(id).await?.into_iter().collect(),
            None => self.engine.registry().list().await?,
        };

        let mut report = StatusReport::default();
        for s in sources {
            let latest = self.store.latest_sync_executions(Some(&s.id), 1).await?.into_iter().next();
            let unresolved = self.store.list_unresolved_links(Some(&s.id)).await?;
            report.sources.push(SourceStatus {
                unresolved_link_count: unresolved.len(),
                unresolved_links: unresolved.into_iter().take(STATUS_LIST_LIMIT).collect(),
                latest_execution: latest.map(ExecutionSummary::from),
                last_success: s.last_success,
                last_attempt: s.last_attempt,
                last_status: s.last_status,
                pending_retry: s.pending_retry,
                enabled: s.enabled,
                name: s.name,
                source_id: s.id,
            });
        }
        report.extraction_failures = self
            .store
            .list_extractions(Some(ExtractionState::Failed), STATUS_LIST_LIMIT)
            .await?
            .into_iter()
            .map(|f| ExtractionFailure {
                file_id: f.file_id,
                error: f.error,
                attempted_methods: f.attempted_methods,
                attempts: f.attempts,
                updated_at: f.updated_at,
            })
            .collect();
        report.pending_extractions = self.store.count_extractions(Some(ExtractionState::Pending)).await?;
        Ok(report)
    }

    /// Counters of this process merged with the snapshot stored by the latest cycle.
    pub async fn metrics_report(&self) -> Result<serde_json::Value> {
        let latest = self.store.latest_sync_executions(None, 10).await?;
        let cycles: Vec<serde_json::Value> = latest
            .iter()
            .map(|e| {
                serde_json::json!({
                    "source_id": e.source_id,
                    "execution_id": e.id,
                    "status": e.status,
                    "started_at": e.started_at,
                    "metrics": e.metrics,
                })
            })
            .collect();
        Ok(serde_json::json!({
            "process": self.metrics.export_json(),
            "latest_cycles": cycles,
        }))
    }
}

/// Extraction chain in fallback order: local text, cloud OCR when configured, local OCR.
pub fn default_strategies(config: &Config) -> Result<Vec<Arc<dyn ExtractionStrategy>>> {
    let mut strategies: Vec<Arc<dyn ExtractionStrategy>> = vec![Arc::new(LocalTextStrategy)];
    if let Some(endpoint) = &config.ocr_endpoint {
        let client = CloudOcrClient::new(
            endpoint,
            config.ocr_api_key.clone(),
            config.ocr_requests_per_minute,
            config.http_timeout(),
        )?;
        strategies.push(Arc::new(CloudOcrStrategy::new(client)));
    }
    strategies.push(Arc::new(
        LocalOcrStrategy::new(config.tesseract_bin.clone()).with_rasterizer(config.pdftoppm_bin.clone()),
    ));
    Ok(strategies)
}

#[derive(Debug, Default, Serialize)]
pub struct StatusReport {
    pub sources: Vec<SourceStatus>,
    pub pending_extractions: u64,
    pub extraction_failures: Vec<ExtractionFailure>,
}

#[derive(Debug, Serialize)]
pub struct SourceStatus {
    pub source_id: String,
    pub name: Option<String>,
    pub enabled: bool,
    pub last_success: Option<DateTime<Utc>>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_status: Option<SyncStatus>,
    pub pending_retry: BTreeSet<EntityType>,
    pub latest_execution: Option<ExecutionSummary>,
    pub unresolved_link_count: usize,
    pub unresolved_links: Vec<DeferredLink>,
}

#[derive(Debug, Serialize)]
pub struct ExtractionFailure {
    pub file_id: String,
    pub error: Option<String>,
    pub attempted_methods: Vec<String>,
    pub attempts: u32,
    pub updated_at: DateTime<Utc>,
}

/// A finished execution without its metrics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionSummary {
    pub execution_id: String,
    pub source_id: String,
    pub mode: SyncMode,
    pub status: SyncStatus,
    pub started_at: DateTime<Utc>,
    pub duration_ms: Option<i64>,
    pub type_stats: BTreeMap<EntityType, TypeStats>,
    pub failed_entity_types: BTreeSet<EntityType>,
    pub unresolved_links: u64,
    pub errors: Vec<SyncError>,
}

impl From<SyncExecution> for ExecutionSummary {
    fn from(e: SyncExecution) -> Self {
        Self {
            execution_id: e.id,
            source_id: e.source_id,
            mode: e.mode,
            status: e.status,
            started_at: e.started_at,
            duration_ms: e.duration_ms,
            type_stats: e.type_stats,
            failed_entity_types: e.failed_entity_types,
            unresolved_links: e.unresolved_links,
            errors: e.error_details,
        }
    }
}
