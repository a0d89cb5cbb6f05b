use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::models::{EntityType, UpsertOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    Full,
    Incremental,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::Full => f.write_str("full"),
            SyncMode::Incremental => f.write_str("incremental"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Idle,
    Running,
    Completed,
    PartialFailure,
    Failed,
}

impl SyncStatus {
    /// Process exit code for a finished cycle.
    pub fn exit_code(&self) -> u8 {
        match self {
            SyncStatus::Failed => 1,
            SyncStatus::PartialFailure => 2,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeStats {
    pub created: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub failed: u64,
}

impl TypeStats {
    pub fn record(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Created => self.created += 1,
            UpsertOutcome::Updated => self.updated += 1,
            UpsertOutcome::Unchanged => self.unchanged += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncErrorType {
    BodyFetch,
    CollectionFetch,
    Malformed,
    Upsert,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncError {
    pub error_type: SyncErrorType,
    pub entity_type: Option<EntityType>,
    pub message: String,
    pub record_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl SyncError {
    pub fn new(error_type: SyncErrorType, entity_type: Option<EntityType>, message: impl Into<String>) -> Self {
        Self {
            error_type,
            entity_type,
            message: message.into(),
            record_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_record(mut self, record_id: impl Into<String>) -> Self {
        self.record_id = Some(record_id.into());
        self
    }
}

/// One run of the orchestrator against one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncExecution {
    #[serde(rename = "_id")]
    pub id: String,
    pub source_id: String,
    pub mode: SyncMode,
    pub status: SyncStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    #[serde(default)]
    pub type_stats: BTreeMap<EntityType, TypeStats>,
    #[serde(default)]
    pub failed_entity_types: BTreeSet<EntityType>,
    #[serde(default)]
    pub error_details: Vec<SyncError>,
    pub unresolved_links: u64,
    #[serde(default)]
    pub metrics: serde_json::Value,
}

// Cap on stored error samples per execution.
const MAX_SAMPLED_ERRORS: usize = 100;

impl SyncExecution {
    pub fn new(source_id: impl Into<String>, mode: SyncMode) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source_id: source_id.into(),
            mode,
            status: SyncStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            type_stats: BTreeMap::new(),
            failed_entity_types: BTreeSet::new(),
            error_details: Vec::new(),
            unresolved_links: 0,
            metrics: serde_json::Value::Null,
        }
    }

    pub fn stats_mut(&mut self, entity_type: EntityType) -> &mut TypeStats {
        self.type_stats.entry(entity_type).or_default()
    }

    pub fn push_error(&mut self, error: SyncError) {
        if self.error_details.len() < MAX_SAMPLED_ERRORS {
            self.error_details.push(error);
        }
    }

    pub fn fail_entity_type(&mut self, entity_type: EntityType, error: SyncError) {
        self.failed_entity_types.insert(entity_type);
        self.push_error(error);
    }

    pub fn fail_with_error(&mut self, error: SyncError) {
        self.push_error(error);
        self.finish(SyncStatus::Failed);
    }

    /// Close the execution, deriving `Completed`/`PartialFailure` unless a status is forced.
    pub fn finish(&mut self, forced: SyncStatus) {
        self.status = match forced {
            SyncStatus::Failed => SyncStatus::Failed,
            _ if !self.failed_entity_types.is_empty() => SyncStatus::PartialFailure,
            _ => SyncStatus::Completed,
        };
        let completed = Utc::now();
        self.duration_ms = Some((completed - self.started_at).num_milliseconds());
        self.completed_at = Some(completed);
    }

    pub fn total(&self, outcome: UpsertOutcome) -> u64 {
        self.type_stats
            .values()
            .map(|s| match outcome {
                UpsertOutcome::Created => s.created,
                UpsertOutcome::Updated => s.updated,
                UpsertOutcome::Unchanged => s.unchanged,
            })
            .sum()
    }
}

/// A relationship recorded before its target entity was stored locally.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeferredLink {
    pub source_type: EntityType,
    pub source_external_id: String,
    pub body_id: String,
    pub relation: String,
    pub target_type: EntityType,
    pub target_id: String,
    pub first_seen: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_derives_partial_failure_from_failed_types() {
        let mut exec = SyncExecution::new("s", SyncMode::Full);
        exec.fail_entity_type(
            EntityType::Meeting,
            SyncError::new(SyncErrorType::CollectionFetch, Some(EntityType::Meeting), "500"),
        );
        exec.finish(SyncStatus::Completed);
        assert_eq!(exec.status, SyncStatus::PartialFailure);
        assert_eq!(exec.status.exit_code(), 2);
        assert!(exec.completed_at.is_some());
    }

    #[test]
    fn error_samples_are_capped() {
        let mut exec = SyncExecution::new("s", SyncMode::Full);
        for i in 0..150 {
            exec.push_error(SyncError::new(SyncErrorType::Malformed, None, format!("bad {}", i)));
        }
        assert_eq!(exec.error_details.len(), MAX_SAMPLED_ERRORS);
    }
}
