use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{IngestionError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionState {
    Pending,
    Processing,
    Completed,
    Failed,
    Skipped,
}

impl ExtractionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExtractionState::Completed | ExtractionState::Failed | ExtractionState::Skipped)
    }

    /// `pending -> processing -> {completed, failed, skipped}`; a newer file version
    /// may send a terminal record back to `pending`, and a stale `processing` claim may be
    /// released back to `pending`.
    pub fn can_transition_to(&self, next: ExtractionState) -> bool {
        use ExtractionState::*;
        match (self, next) {
            (Pending, Processing) => true,
            (Processing, Completed) | (Processing, Failed) | (Processing, Skipped) => true,
            (Processing, Pending) => true,
            (s, Pending) if s.is_terminal() => true,
            _ => false,
        }
    }
}

/// Text extraction bookkeeping for one File.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileExtraction {
    #[serde(rename = "_id")]
    pub file_id: String,
    pub state: ExtractionState,
    /// Remote modification marker of the file version this record belongs to.
    pub file_version: Option<DateTime<Utc>>,
    pub method: Option<String>,
    pub confidence: Option<f32>,
    pub text: Option<String>,
    pub error: Option<String>,
    #[serde(default)]
    pub attempted_methods: Vec<String>,
    pub attempts: u32,
    pub updated_at: DateTime<Utc>,
}

impl FileExtraction {
    pub fn pending(file_id: impl Into<String>, file_version: Option<DateTime<Utc>>) -> Self {
        Self {
            file_id: file_id.into(),
            state: ExtractionState::Pending,
            file_version,
            method: None,
            confidence: None,
            text: None,
            error: None,
            attempted_methods: Vec::new(),
            attempts: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn transition(&mut self, next: ExtractionState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(IngestionError::Extraction(format!(
                "Invalid extraction transition {:?} -> {:?} for {}",
                self.state, next, self.file_id
            )));
        }
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_cannot_skip_back_to_processing() {
        let mut job = FileExtraction::pending("f1", None);
        job.transition(ExtractionState::Processing).unwrap();
        job.transition(ExtractionState::Completed).unwrap();
        assert!(job.transition(ExtractionState::Processing).is_err());
        job.transition(ExtractionState::Pending).unwrap();
        assert_eq!(job.state, ExtractionState::Pending);
    }

    #[test]
    fn pending_cannot_complete_without_processing() {
        let mut job = FileExtraction::pending("f1", None);
        assert!(job.transition(ExtractionState::Completed).is_err());
        assert!(job.transition(ExtractionState::Failed).is_err());
    }
}
