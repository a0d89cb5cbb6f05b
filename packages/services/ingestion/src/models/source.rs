use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::models::{EntityType, SyncMode, SyncStatus};

/// A remote OParl endpoint mirrored into the local store, with its sync cursors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    /// System or body-list URL; doubles as the stable source identifier.
    #[serde(rename = "_id")]
    pub id: String,
    pub name: Option<String>,
    pub enabled: bool,
    pub last_success: Option<DateTime<Utc>>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_full_sync: Option<DateTime<Utc>>,
    pub last_status: Option<SyncStatus>,
    /// Start time of the last cycle in which each collection type completed.
    #[serde(default)]
    pub cursors: BTreeMap<EntityType, DateTime<Utc>>,
    /// Collection types that failed in the previous cycle and are retried next run.
    #[serde(default)]
    pub pending_retry: BTreeSet<EntityType>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Source {
    pub fn new(id: impl Into<String>, name: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name,
            enabled: true,
            last_success: None,
            last_attempt: None,
            last_full_sync: None,
            last_status: None,
            cursors: BTreeMap::new(),
            pending_retry: BTreeSet::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// `modified_since` filter for one collection type, or `None` for a full fetch.
    pub fn modified_since(&self, entity_type: EntityType, mode: SyncMode, overlap: Duration) -> Option<DateTime<Utc>> {
        if mode == SyncMode::Full {
            return None;
        }
        self.cursors.get(&entity_type).map(|c| *c - overlap)
    }

    /// Fold a finished cycle into the registry entry.
    pub fn record_cycle(
        &mut self,
        started_at: DateTime<Utc>,
        mode: SyncMode,
        status: SyncStatus,
        completed_types: &[EntityType],
        failed_types: &BTreeSet<EntityType>,
    ) {
        let now = Utc::now();
        self.last_attempt = Some(started_at);
        self.last_status = Some(status);
        if status != SyncStatus::Failed {
            self.last_success = Some(started_at);
            if mode == SyncMode::Full && failed_types.is_empty() {
                self.last_full_sync = Some(started_at);
            }
        }
        for t in completed_types {
            self.cursors.insert(*t, started_at);
        }
        self.pending_retry = failed_types.clone();
        self.updated_at = now;
    }
}

/// Source definition as declared in the sources file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDefinition {
    pub url: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_types_keep_their_old_cursor() {
        let mut source = Source::new("http://example.org/oparl/system", None);
        let first = Utc::now() - Duration::hours(2);
        source.record_cycle(
            first,
            SyncMode::Full,
            SyncStatus::Completed,
            &[EntityType::Meeting, EntityType::Paper],
            &BTreeSet::new(),
        );

        let second = Utc::now();
        let failed: BTreeSet<_> = [EntityType::Meeting].into_iter().collect();
        source.record_cycle(second, SyncMode::Incremental, SyncStatus::PartialFailure, &[EntityType::Paper], &failed);

        assert_eq!(source.cursors[&EntityType::Meeting], first);
        assert_eq!(source.cursors[&EntityType::Paper], second);
        assert!(source.pending_retry.contains(&EntityType::Meeting));
        assert_eq!(source.last_success, Some(second));
        assert_eq!(source.last_full_sync, Some(first));
    }

    #[test]
    fn incremental_filter_subtracts_overlap_and_full_ignores_cursor() {
        let mut source = Source::new("s", None);
        let cursor = Utc::now();
        source.cursors.insert(EntityType::Paper, cursor);
        let overlap = Duration::minutes(5);

        assert_eq!(
            source.modified_since(EntityType::Paper, SyncMode::Incremental, overlap),
            Some(cursor - overlap)
        );
        assert_eq!(source.modified_since(EntityType::Paper, SyncMode::Full, overlap), None);
        assert_eq!(source.modified_since(EntityType::Meeting, SyncMode::Incremental, overlap), None);
    }

    #[test]
    fn failed_cycle_does_not_advance_last_success() {
        let mut source = Source::new("s", None);
        source.record_cycle(Utc::now(), SyncMode::Incremental, SyncStatus::Failed, &[], &BTreeSet::new());
        assert!(source.last_success.is_none());
        assert_eq!(source.last_status, Some(SyncStatus::Failed));
    }
}
