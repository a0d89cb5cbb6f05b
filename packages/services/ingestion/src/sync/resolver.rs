use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::metrics::IngestionMetrics;
use crate::models::*;
use crate::storage::EntityStore;

type TargetKey = (EntityType, String);

/// Outcome of registering one entity's references.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LinkReport {
    pub resolved: usize,
    pub deferred: usize,
    pub rejected: usize,
}

/// Links entities to the entities they reference, deferring references whose target
/// has not been stored yet.
///
/// The deferred table is keyed by target. Checking a target and parking a link happen
/// under the same lock that [`on_stored`](Self::on_stored) takes after a write, so a
/// target stored concurrently is never missed.
pub struct RelationshipResolver {
    store: Arc<dyn EntityStore>,
    metrics: Arc<IngestionMetrics>,
    deferred: Mutex<HashMap<TargetKey, Vec<DeferredLink>>>,
}

impl RelationshipResolver {
    pub fn new(store: Arc<dyn EntityStore>, metrics: Arc<IngestionMetrics>) -> Self {
        Self { store, metrics, deferred: Mutex::new(HashMap::new()) }
    }

    /// Re-park links left unresolved by an earlier cycle.
    pub async fn seed(&self, links: Vec<DeferredLink>) {
        let mut table = self.deferred.lock().await;
        for link in links {
            park(&mut table, link);
        }
    }

    /// Resolve or defer every outgoing reference of a freshly written entity.
    pub async fn register(&self, entity: &NormalizedEntity) -> Result<LinkReport> {
        let mut report = LinkReport::default();
        let source_type = entity.entity_type();
        let references = entity.record.references();
        if references.is_empty() {
            return Ok(report);
        }

        let mut table = self.deferred.lock().await;
        for (relation, target_type, target_id) in references {
            let link = DeferredLink {
                source_type,
                source_external_id: entity.external_id.clone(),
                body_id: entity.body_id.clone(),
                relation,
                target_type,
                target_id,
                first_seen: Utc::now(),
            };
            match self.store.get_entity(target_type, &link.target_id).await? {
                Some(target) if target.body_id != link.body_id => {
                    self.reject(&link, &target.body_id);
                    report.rejected += 1;
                }
                Some(_) => {
                    self.complete(&link).await?;
                    report.resolved += 1;
                }
                None => {
                    IngestionMetrics::incr(&self.metrics.links_deferred);
                    park(&mut table, link);
                    report.deferred += 1;
                }
            }
        }
        Ok(report)
    }

    /// Complete every link waiting for the entity just stored. Returns how many resolved.
    pub async fn on_stored(&self, entity_type: EntityType, external_id: &str, body_id: &str) -> Result<usize> {
        let mut table = self.deferred.lock().await;
        let Some(waiting) = table.remove(&(entity_type, external_id.to_string())) else {
            return Ok(0);
        };
        let mut resolved = 0;
        for link in waiting {
            if link.body_id != body_id {
                self.reject(&link, body_id);
                continue;
            }
            if self.complete(&link).await? {
                resolved += 1;
            }
        }
        Ok(resolved)
    }

    /// Final sweep: retry every deferred link against the store and hand back the ones
    /// that still have no target.
    pub async fn reconcile(&self) -> Result<Vec<DeferredLink>> {
        let mut table = self.deferred.lock().await;
        let pending: Vec<DeferredLink> = table.drain().flat_map(|(_, links)| links).collect();
        let mut unresolved = Vec::new();
        for link in pending {
            match self.store.get_entity(link.target_type, &link.target_id).await? {
                Some(target) if target.body_id != link.body_id => self.reject(&link, &target.body_id),
                Some(_) => {
                    self.complete(&link).await?;
                }
                None => {
                    tracing::warn!(
                        entity_type = %link.source_type,
                        external_id = %link.source_external_id,
                        relation = %link.relation,
                        target = %link.target_id,
                        target_type = %link.target_type,
                        "Unresolved reference at end of cycle"
                    );
                    unresolved.push(link);
                }
            }
        }
        unresolved.sort_by(|a, b| {
            (&a.source_external_id, &a.relation, &a.target_id).cmp(&(&b.source_external_id, &b.relation, &b.target_id))
        });
        Ok(unresolved)
    }

    pub async fn pending_count(&self) -> usize {
        self.deferred.lock().await.values().map(Vec::len).sum()
    }

    async fn complete(&self, link: &DeferredLink) -> Result<bool> {
        let entity_link = EntityLink {
            relation: link.relation.clone(),
            target_type: link.target_type,
            target_id: link.target_id.clone(),
        };
        let attached = self
            .store
            .set_link(link.source_type, &link.source_external_id, &entity_link)
            .await?;
        if attached {
            IngestionMetrics::incr(&self.metrics.links_resolved);
        } else {
            tracing::debug!(external_id = %link.source_external_id, "Link source vanished before resolution");
        }
        Ok(attached)
    }

    fn reject(&self, link: &DeferredLink, target_body: &str) {
        IngestionMetrics::incr(&self.metrics.links_rejected);
        warn_cross_body(link, target_body);
    }
}

fn park(table: &mut HashMap<TargetKey, Vec<DeferredLink>>, link: DeferredLink) {
    let waiting = table.entry((link.target_type, link.target_id.clone())).or_default();
    let duplicate = waiting.iter().any(|l| {
        l.source_type == link.source_type && l.source_external_id == link.source_external_id && l.relation == link.relation
    });
    if !duplicate {
        waiting.push(link);
    }
}

fn warn_cross_body(link: &DeferredLink, target_body: &str) {
    tracing::warn!(
        entity_type = %link.source_type,
        external_id = %link.source_external_id,
        target = %link.target_id,
        body_id = %link.body_id,
        target_body_id = %target_body,
        "Cross-body reference ignored"
    );
}
