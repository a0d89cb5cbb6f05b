use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{EntityType, UpsertOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Updated,
}

impl ChangeKind {
    pub fn from_outcome(outcome: UpsertOutcome) -> Option<Self> {
        match outcome {
            UpsertOutcome::Created => Some(ChangeKind::Created),
            UpsertOutcome::Updated => Some(ChangeKind::Updated),
            UpsertOutcome::Unchanged => None,
        }
    }
}

/// Notification published once per effective entity change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(rename = "_id")]
    pub id: String,
    /// Consumers deduplicate redeliveries on this key.
    pub dedupe_key: String,
    pub entity_type: EntityType,
    pub kind: ChangeKind,
    pub source_id: String,
    pub body_id: String,
    pub external_id: String,
    pub remote_modified: Option<DateTime<Utc>>,
    pub emitted_at: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(
        entity_type: EntityType,
        kind: ChangeKind,
        source_id: impl Into<String>,
        body_id: impl Into<String>,
        external_id: impl Into<String>,
        remote_modified: Option<DateTime<Utc>>,
    ) -> Self {
        let external_id = external_id.into();
        let marker = remote_modified
            .map(|m| m.to_rfc3339())
            .unwrap_or_else(|| "none".to_string());
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            dedupe_key: format!("{}:{}:{}", entity_type, external_id, marker),
            entity_type,
            kind,
            source_id: source_id.into(),
            body_id: body_id.into(),
            external_id,
            remote_modified,
            emitted_at: Utc::now(),
        }
    }

    pub fn topic(&self) -> String {
        self.entity_type.topic()
    }
}
