use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::Config;
use crate::events::EventEmitter;
use crate::handlers::Fetcher;
use crate::mapping::Normalizer;
use crate::metrics::{delta_json, IngestionMetrics};
use crate::models::*;
use crate::storage::EntityStore;
use crate::sync::registry::SourceRegistry;
use crate::sync::resolver::RelationshipResolver;
use crate::sync::upsert::UpsertEngine;

/// Remote collection types, in traversal order after the Body phase.
pub const COLLECTION_TYPES: [EntityType; 4] =
    [EntityType::Organization, EntityType::Person, EntityType::Meeting, EntityType::Paper];

/// Everything a sync worker needs, passed explicitly instead of living in globals.
#[derive(Clone)]
pub struct SyncContext {
    pub config: Arc<Config>,
    pub store: Arc<dyn EntityStore>,
    pub fetcher: Fetcher,
    pub normalizer: Normalizer,
    pub events: Arc<EventEmitter>,
    pub metrics: Arc<IngestionMetrics>,
}

pub struct SyncEngine {
    ctx: SyncContext,
    registry: SourceRegistry,
    upserts: Arc<UpsertEngine>,
    active_syncs: Arc<Mutex<HashSet<String>>>,
}

struct ActiveSyncGuard {
    set: Arc<Mutex<HashSet<String>>>,
    id: String,
}

impl Drop for ActiveSyncGuard {
    fn drop(&mut self) {
        if let Ok(mut s) = self.set.lock() {
            s.remove(&self.id);
        }
    }
}

/// Execution record shared by the concurrent workers of one cycle.
struct CycleState {
    exec: Mutex<SyncExecution>,
}

impl CycleState {
    fn with<R>(&self, f: impl FnOnce(&mut SyncExecution) -> R) -> R {
        let mut guard = self.exec.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut guard)
    }

    fn into_inner(self) -> SyncExecution {
        self.exec.into_inner().unwrap_or_else(|p| p.into_inner())
    }
}

/// Shape of the document a source URL points at.
enum EntryPoint {
    System { body_list: Url },
    BodyList,
    SingleBody,
}

impl SyncEngine {
    pub fn new(ctx: SyncContext) -> Self {
        let registry = SourceRegistry::new(ctx.store.clone());
        let upserts = Arc::new(UpsertEngine::new(ctx.store.clone(), ctx.metrics.clone()));
        Self {
            ctx,
            registry,
            upserts,
            active_syncs: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn context(&self) -> &SyncContext {
        &self.ctx
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    /// One cycle for every enabled source. Sources run independently; one source's
    /// failure never affects another.
    pub async fn sync_all(&self, mode: SyncMode, cancel: &CancellationToken) -> Result<Vec<SyncExecution>> {
        let sources = self.registry.enabled().await?;
        if sources.is_empty() {
            tracing::warn!("No enabled sources registered");
        }
        let results = stream::iter(sources)
            .map(|source| async move {
                let id = source.id.clone();
                (id, self.execute_sync(&source.id, mode, cancel).await)
            })
            .buffer_unordered(self.ctx.config.source_concurrency.max(1))
            .collect::<Vec<_>>()
            .await;

        let mut executions = Vec::new();
        for (id, result) in results {
            match result {
                Ok(exec) => executions.push(exec),
                Err(e) => tracing::error!(source = %id, error = %e, "Sync could not start"),
            }
        }
        Ok(executions)
    }

    pub async fn execute_sync(&self, source_url: &str, mode: SyncMode, cancel: &CancellationToken) -> Result<SyncExecution> {
        // Only one cycle per source at a time
        {
            let mut active = self
                .active_syncs
                .lock()
                .map_err(|_| IngestionError::Sync("active sync registry poisoned".to_string()))?;
            if active.contains(source_url) {
                return Err(IngestionError::Sync(format!("Sync for {} is already in progress", source_url)));
            }
            active.insert(source_url.to_string());
        }
        let _guard = ActiveSyncGuard { set: self.active_syncs.clone(), id: source_url.to_string() };
        let start_time = Instant::now();

        let mut source = self.registry.load_or_create(source_url).await?;
        if !source.enabled {
            return Err(IngestionError::Sync(format!("Source {} is disabled", source.id)));
        }
        let entry_url = Url::parse(&source.id)
            .map_err(|e| IngestionError::Configuration(format!("Invalid source URL {}: {}", source.id, e)))?;

        let mode = if mode == SyncMode::Incremental && source.last_success.is_none() {
            tracing::info!(source = %source.id, "No previous successful sync; running a full cycle");
            SyncMode::Full
        } else {
            mode
        };

        let baseline = self.ctx.metrics.export_json();
        let exec = SyncExecution::new(source.id.clone(), mode);
        self.ctx.store.insert_sync_execution(&exec).await?;
        tracing::info!(source = %source.id, mode = %mode, execution_id = %exec.id, "Starting sync cycle");
        let state = CycleState { exec: Mutex::new(exec) };

        let cycle_cancel = cancel.child_token();
        let _stop_timer = cycle_cancel.clone().drop_guard();
        if let Some(deadline) = self.ctx.config.sync_deadline() {
            let token = cycle_cancel.clone();
            let source_id = source.id.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(deadline) => {
                        tracing::warn!(source = %source_id, deadline_secs = deadline.as_secs(), "Sync deadline reached; cancelling cycle");
                        token.cancel();
                    }
                    _ = token.cancelled() => {}
                }
            });
        }

        let resolver = RelationshipResolver::new(self.ctx.store.clone(), self.ctx.metrics.clone());
        resolver.seed(self.ctx.store.list_unresolved_links(Some(&source.id)).await?).await;

        // Body phase: nothing downstream can proceed without it
        let raw_bodies = match self.discover_bodies(&entry_url, &cycle_cancel).await {
            Ok(b) => b,
            Err(e) => {
                tracing::error!(source = %source.id, error = %e, "Body endpoint unreachable; cycle failed");
                let error = SyncError::new(SyncErrorType::BodyFetch, Some(EntityType::Body), e.to_string());
                return self.abort_cycle(&mut source, state, error, &baseline).await;
            }
        };

        let discovered = raw_bodies.len();
        let mut bodies = Vec::new();
        for raw in raw_bodies {
            if let Some(body) = self.process_item(&source.id, EntityType::Body, None, raw, &resolver, &state).await {
                bodies.push(body);
            }
        }
        let lost = discovered - bodies.len();
        if lost > 0 {
            let error = SyncError::new(
                SyncErrorType::Upsert,
                Some(EntityType::Body),
                format!("{} of {} bodies could not be stored", lost, discovered),
            );
            if bodies.is_empty() {
                tracing::error!(source = %source.id, lost = lost, "No body could be stored; cycle failed");
                return self.abort_cycle(&mut source, state, error, &baseline).await;
            }
            tracing::warn!(source = %source.id, lost = lost, "Skipping the collections of bodies that could not be stored");
            state.with(|exec| exec.fail_entity_type(EntityType::Body, error));
        }
        tracing::info!(source = %source.id, body_count = bodies.len(), "Bodies synchronized");

        for (body_id, body) in &bodies {
            self.sync_body(&source, mode, body_id, body, &resolver, &state, &cycle_cancel).await;
        }

        // Final reconciliation pass over links still waiting for a target
        let unresolved = resolver.reconcile().await?;
        self.ctx.store.replace_unresolved_links(&source.id, &unresolved).await?;
        self.upserts.prune_locks();

        let mut exec = state.into_inner();
        exec.unresolved_links = unresolved.len() as u64;
        exec.finish(SyncStatus::Completed);
        exec.metrics = delta_json(&baseline, &self.ctx.metrics.export_json());
        self.ctx.store.insert_sync_execution(&exec).await?;

        // Cursors are kept per source; a skipped body would miss its changes for good
        let completed: Vec<EntityType> = if exec.failed_entity_types.contains(&EntityType::Body) {
            Vec::new()
        } else {
            std::iter::once(EntityType::Body)
                .chain(COLLECTION_TYPES)
                .filter(|t| !exec.failed_entity_types.contains(t))
                .collect()
        };
        self.registry.record_cycle(&mut source, &exec, &completed).await?;

        tracing::info!(
            source = %source.id,
            execution_id = %exec.id,
            status = ?exec.status,
            created = exec.total(UpsertOutcome::Created),
            updated = exec.total(UpsertOutcome::Updated),
            unchanged = exec.total(UpsertOutcome::Unchanged),
            failed_types = ?exec.failed_entity_types,
            unresolved_links = exec.unresolved_links,
            duration_ms = start_time.elapsed().as_millis() as u64,
            "Sync cycle finished"
        );
        Ok(exec)
    }

    /// Close a cycle that could not get past the Body phase. No cursor moves.
    async fn abort_cycle(
        &self,
        source: &mut Source,
        state: CycleState,
        error: SyncError,
        baseline: &Value,
    ) -> Result<SyncExecution> {
        let mut exec = state.into_inner();
        exec.fail_with_error(error);
        exec.metrics = delta_json(baseline, &self.ctx.metrics.export_json());
        self.ctx.store.insert_sync_execution(&exec).await?;
        self.registry.record_cycle(source, &exec, &[]).await?;
        Ok(exec)
    }

    async fn discover_bodies(&self, entry_url: &Url, cancel: &CancellationToken) -> Result<Vec<Value>> {
        let entry = tokio::select! {
            _ = cancel.cancelled() => return Err(IngestionError::Cancelled),
            r = self.ctx.fetcher.fetch_json(entry_url) => r?.0,
        };
        let list_url = match classify_entry(&entry, entry_url) {
            EntryPoint::SingleBody => return Ok(vec![entry]),
            EntryPoint::System { body_list } => body_list,
            EntryPoint::BodyList => entry_url.clone(),
        };

        let mut bodies = Vec::new();
        let mut pages = Box::pin(self.ctx.fetcher.pages(list_url, None, cancel.clone()));
        while let Some(page) = pages.next().await {
            bodies.extend(page?.items);
        }
        Ok(bodies)
    }

    /// Traverse one Body's collections: {Organization, Person} -> Meeting -> Paper.
    #[allow(clippy::too_many_arguments)]
    async fn sync_body(
        &self,
        source: &Source,
        mode: SyncMode,
        body_id: &str,
        body: &Body,
        resolver: &RelationshipResolver,
        state: &CycleState,
        cancel: &CancellationToken,
    ) {
        let list = |t: EntityType| match t {
            EntityType::Organization => body.organization_list.as_deref(),
            EntityType::Person => body.person_list.as_deref(),
            EntityType::Meeting => body.meeting_list.as_deref(),
            EntityType::Paper => body.paper_list.as_deref(),
            _ => None,
        };
        let run = |t: EntityType| self.sync_collection(source, mode, body_id, t, list(t), resolver, state, cancel);

        tokio::join!(run(EntityType::Organization), run(EntityType::Person));
        run(EntityType::Meeting).await;
        run(EntityType::Paper).await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn sync_collection(
        &self,
        source: &Source,
        mode: SyncMode,
        body_id: &str,
        entity_type: EntityType,
        list_url: Option<&str>,
        resolver: &RelationshipResolver,
        state: &CycleState,
        cancel: &CancellationToken,
    ) {
        let Some(raw_url) = list_url else {
            tracing::debug!(body_id = %body_id, entity_type = %entity_type, "Body exposes no list for this type");
            return;
        };
        let since = source.modified_since(entity_type, mode, self.ctx.config.incremental_overlap());
        let started = Instant::now();
        let result = match Url::parse(raw_url) {
            Ok(url) => self.page_through(source, body_id, entity_type, url, since, resolver, state, cancel).await,
            Err(e) => Err(IngestionError::Malformed(format!("Invalid {} list URL {}: {}", entity_type, raw_url, e))),
        };

        match result {
            Ok(items) => tracing::info!(
                source = %source.id,
                body_id = %body_id,
                entity_type = %entity_type,
                items = items,
                incremental = since.is_some(),
                duration_ms = started.elapsed().as_millis() as u64,
                "Collection synchronized"
            ),
            Err(e) => {
                let error_type = match e {
                    IngestionError::Cancelled => SyncErrorType::Cancelled,
                    _ => SyncErrorType::CollectionFetch,
                };
                tracing::warn!(
                    source = %source.id,
                    body_id = %body_id,
                    entity_type = %entity_type,
                    error = %e,
                    "Collection fetch failed; type will be retried next cycle"
                );
                state.with(|exec| {
                    exec.fail_entity_type(entity_type, SyncError::new(error_type, Some(entity_type), e.to_string()))
                });
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn page_through(
        &self,
        source: &Source,
        body_id: &str,
        entity_type: EntityType,
        url: Url,
        since: Option<chrono::DateTime<chrono::Utc>>,
        resolver: &RelationshipResolver,
        state: &CycleState,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let concurrency = self.ctx.config.worker_concurrency.max(1);
        let mut items = 0usize;
        let mut pages = Box::pin(self.ctx.fetcher.pages(url, since, cancel.clone()));
        while let Some(page) = pages.next().await {
            let page = page?;
            items += page.items.len();
            stream::iter(page.items)
                .map(|raw| self.process_item(&source.id, entity_type, Some(body_id), raw, resolver, state))
                .buffer_unordered(concurrency)
                .collect::<Vec<_>>()
                .await;
            if cancel.is_cancelled() {
                return Err(IngestionError::Cancelled);
            }
        }
        Ok(items)
    }

    /// Normalize one remote object and apply every entity it yields, parent first.
    /// For Bodies the stored Body record is handed back.
    async fn process_item(
        &self,
        source_id: &str,
        entity_type: EntityType,
        body_id: Option<&str>,
        raw: Value,
        resolver: &RelationshipResolver,
        state: &CycleState,
    ) -> Option<(String, Body)> {
        let entities = match self.ctx.normalizer.normalize(entity_type, body_id, &raw) {
            Ok(e) => e,
            Err(e) => {
                IngestionMetrics::incr(&self.ctx.metrics.malformed_records);
                let record_id = raw.get("id").and_then(|v| v.as_str()).unwrap_or("<unknown>").to_string();
                tracing::warn!(entity_type = %entity_type, external_id = %record_id, error = %e, "Skipping malformed record");
                state.with(|exec| {
                    exec.stats_mut(entity_type).failed += 1;
                    exec.push_error(
                        SyncError::new(SyncErrorType::Malformed, Some(entity_type), e.to_string()).with_record(record_id),
                    );
                });
                return None;
            }
        };

        let mut body = None;
        for entity in &entities {
            let t = entity.entity_type();
            match self.apply(source_id, entity, resolver).await {
                Ok(outcome) => state.with(|exec| exec.stats_mut(t).record(outcome)),
                Err(e) => {
                    tracing::warn!(entity_type = %t, external_id = %entity.external_id, error = %e, "Upsert failed");
                    // The collection's cursor must not pass a change that was never stored
                    state.with(|exec| {
                        exec.stats_mut(t).failed += 1;
                        exec.fail_entity_type(
                            entity_type,
                            SyncError::new(SyncErrorType::Upsert, Some(t), e.to_string()).with_record(&entity.external_id),
                        );
                    });
                    if t == EntityType::Body {
                        return None;
                    }
                }
            }
            if let EntityRecord::Body(b) = &entity.record {
                body = Some((entity.external_id.clone(), b.clone()));
            }
        }
        body
    }

    /// Store one entity with its change event already in the outbox, link it, then
    /// publish the event. An undelivered event stays in the outbox for replay.
    async fn apply(&self, source_id: &str, entity: &NormalizedEntity, resolver: &RelationshipResolver) -> Result<UpsertOutcome> {
        let (outcome, staged) = self.upserts.upsert_with_event(source_id, entity, &self.ctx.events).await?;
        let Some(event) = staged else {
            return Ok(outcome);
        };

        let t = entity.entity_type();
        resolver.register(entity).await?;
        resolver.on_stored(t, &entity.external_id, &entity.body_id).await?;

        if let Err(e) = self.ctx.events.deliver(&event).await {
            tracing::warn!(entity_type = %t, external_id = %entity.external_id, error = %e, "Change event left in outbox");
        }
        Ok(outcome)
    }

    /// Types that failed in the last cycle of every source.
    pub async fn pending_retries(&self) -> Result<BTreeSet<EntityType>> {
        Ok(self
            .registry
            .list()
            .await?
            .into_iter()
            .flat_map(|s| s.pending_retry.into_iter())
            .collect())
    }
}

fn classify_entry(entry: &Value, entry_url: &Url) -> EntryPoint {
    let type_uri = entry.get("type").and_then(|v| v.as_str()).unwrap_or_default();
    let body_list = entry
        .get("body")
        .and_then(|v| v.as_str())
        .and_then(|s| entry_url.join(s).ok());

    if type_uri.ends_with("/System") {
        if let Some(body_list) = body_list {
            return EntryPoint::System { body_list };
        }
    }
    if EntityType::from_type_uri(type_uri) == Some(EntityType::Body) {
        return EntryPoint::SingleBody;
    }
    if entry.get("data").is_some() || entry.is_array() {
        return EntryPoint::BodyList;
    }
    match body_list {
        Some(body_list) => EntryPoint::System { body_list },
        None if entry.get("paper").is_some() => EntryPoint::SingleBody,
        None => EntryPoint::BodyList,
    }
}
