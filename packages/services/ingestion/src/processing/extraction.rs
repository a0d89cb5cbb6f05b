use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use url::Url;

use crate::config::Config;
use crate::events::EventSink;
use crate::handlers::Fetcher;
use crate::metrics::IngestionMetrics;
use crate::models::*;
use crate::processing::strategies::{ExtractionInput, ExtractionStrategy, StrategyResult};
use crate::storage::EntityStore;

#[derive(Debug, Clone)]
pub struct ExtractionSettings {
    pub min_confidence: f32,
    pub max_file_bytes: u64,
    pub batch_size: usize,
    /// A `processing` claim older than this is considered abandoned.
    pub stale_after: chrono::Duration,
}

impl ExtractionSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            min_confidence: cfg.extraction_min_confidence,
            max_file_bytes: cfg.extraction_max_file_mb.saturating_mul(1024 * 1024),
            batch_size: cfg.extraction_batch_size.max(1),
            stale_after: cfg.extraction_stale_after(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExtractionReport {
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub reclaimed: usize,
}

impl ExtractionReport {
    fn record(&mut self, state: ExtractionState) {
        match state {
            ExtractionState::Completed => self.completed += 1,
            ExtractionState::Failed => self.failed += 1,
            ExtractionState::Skipped => self.skipped += 1,
            _ => {}
        }
    }

    pub fn total(&self) -> usize {
        self.completed + self.failed + self.skipped
    }
}

/// What the strategy chain produced for one file.
#[derive(Debug, Clone, Default)]
pub struct ChainOutcome {
    pub winner: Option<StrategyResult>,
    pub attempted: Vec<String>,
    pub errors: Vec<String>,
}

/// Per-File text extraction with an ordered fallback chain.
///
/// State per file: `pending -> processing -> {completed, failed, skipped}`. Strategies
/// run in order; the first whose text is non-empty and clears `min_confidence` wins.
/// Errors (rate limits included) and weak results hand over to the next strategy;
/// only an exhausted chain marks the file `failed`.
pub struct ExtractionQueue {
    store: Arc<dyn EntityStore>,
    fetcher: Fetcher,
    strategies: Vec<Arc<dyn ExtractionStrategy>>,
    settings: ExtractionSettings,
    metrics: Arc<IngestionMetrics>,
}

impl ExtractionQueue {
    pub fn new(
        store: Arc<dyn EntityStore>,
        fetcher: Fetcher,
        strategies: Vec<Arc<dyn ExtractionStrategy>>,
        settings: ExtractionSettings,
        metrics: Arc<IngestionMetrics>,
    ) -> Self {
        Self { store, fetcher, strategies, settings, metrics }
    }

    pub fn methods(&self) -> Vec<String> {
        self.strategies.iter().map(|s| s.method().to_string()).collect()
    }

    /// Put a file (back) into `pending` for the given version. Returns false when this
    /// version is already queued, running or handled. A newer version arriving while the
    /// file is being processed is recorded on the claim and re-queued once it finishes.
    pub async fn enqueue(&self, file_id: &str, version: Option<DateTime<Utc>>) -> Result<bool> {
        match self.store.get_extraction(file_id).await? {
            None => {
                self.store.put_extraction(&FileExtraction::pending(file_id, version)).await?;
                Ok(true)
            }
            Some(mut job) => match job.state {
                ExtractionState::Pending => {
                    if job.file_version != version {
                        job.file_version = version;
                        job.updated_at = Utc::now();
                        self.store.put_extraction(&job).await?;
                    }
                    Ok(true)
                }
                ExtractionState::Processing if job.file_version == version => Ok(false),
                ExtractionState::Processing => {
                    tracing::debug!(file_id = %file_id, "Newer version arrived during extraction; re-queued after it");
                    job.file_version = version;
                    self.store.put_extraction(&job).await?;
                    Ok(true)
                }
                _ if job.file_version == version => Ok(false),
                _ => {
                    job.transition(ExtractionState::Pending)?;
                    reset_result(&mut job, version);
                    self.store.put_extraction(&job).await?;
                    Ok(true)
                }
            },
        }
    }

    /// Release abandoned claims, then process up to `limit` pending files.
    pub async fn run_once(&self, limit: Option<usize>) -> Result<ExtractionReport> {
        let limit = limit.unwrap_or(self.settings.batch_size);
        let mut report = ExtractionReport { reclaimed: self.reclaim_stale().await?, ..Default::default() };
        let jobs = self.store.list_extractions(Some(ExtractionState::Pending), limit).await?;
        for job in jobs {
            let file_id = job.file_id.clone();
            match self.process(job).await {
                Ok(state) => report.record(state),
                Err(e) => tracing::error!(file_id = %file_id, error = %e, "Extraction bookkeeping failed"),
            }
        }
        if report.total() > 0 {
            tracing::info!(
                completed = report.completed,
                failed = report.failed,
                skipped = report.skipped,
                "Extraction batch finished"
            );
        }
        Ok(report)
    }

    /// Send `processing` rows nobody has touched within `stale_after` back to `pending`.
    /// Such claims are left behind by a worker that died mid-extraction.
    pub async fn reclaim_stale(&self) -> Result<usize> {
        let cutoff = Utc::now() - self.settings.stale_after;
        let claimed = self.store.list_extractions(Some(ExtractionState::Processing), RECLAIM_BATCH).await?;
        let mut reclaimed = 0;
        for mut job in claimed.into_iter().filter(|j| j.updated_at < cutoff) {
            tracing::warn!(file_id = %job.file_id, claimed_at = %job.updated_at, "Reclaiming abandoned extraction");
            job.transition(ExtractionState::Pending)?;
            self.store.put_extraction(&job).await?;
            reclaimed += 1;
        }
        Ok(reclaimed)
    }

    async fn process(&self, mut job: FileExtraction) -> Result<ExtractionState> {
        job.transition(ExtractionState::Processing)?;
        job.attempts += 1;
        self.store.put_extraction(&job).await?;
        let claimed_version = job.file_version;

        let (state, detail) = match self.extract_file(&job.file_id).await {
            Ok(FileResult::Skipped(reason)) => (ExtractionState::Skipped, Some(reason)),
            Ok(FileResult::Chain(outcome)) => {
                job.attempted_methods = outcome.attempted.clone();
                match outcome.winner {
                    Some(win) => {
                        job.method = Some(win.method);
                        job.confidence = Some(win.confidence);
                        job.text = Some(win.text);
                        (ExtractionState::Completed, None)
                    }
                    None if outcome.attempted.is_empty() => {
                        (ExtractionState::Skipped, Some("No strategy accepts this file type".to_string()))
                    }
                    None => (ExtractionState::Failed, Some(outcome.errors.join("; "))),
                }
            }
            Err(e) => (ExtractionState::Failed, Some(e.to_string())),
        };

        // A newer version recorded while this one ran invalidates the result
        if let Some(current) = self.store.get_extraction(&job.file_id).await? {
            if current.file_version != claimed_version {
                tracing::info!(file_id = %job.file_id, "File changed during extraction; re-queued");
                job.transition(ExtractionState::Pending)?;
                reset_result(&mut job, current.file_version);
                self.store.put_extraction(&job).await?;
                return Ok(ExtractionState::Pending);
            }
        }

        job.error = detail;
        job.transition(state)?;
        self.store.put_extraction(&job).await?;

        match state {
            ExtractionState::Completed => IngestionMetrics::incr(&self.metrics.extraction_completed),
            ExtractionState::Failed => IngestionMetrics::incr(&self.metrics.extraction_failed),
            _ => IngestionMetrics::incr(&self.metrics.extraction_skipped),
        }
        tracing::info!(
            file_id = %job.file_id,
            state = ?state,
            method = job.method.as_deref().unwrap_or("-"),
            error = job.error.as_deref().unwrap_or(""),
            "File extraction finished"
        );
        Ok(state)
    }

    async fn extract_file(&self, file_id: &str) -> Result<FileResult> {
        let Some(stored) = self.store.get_entity(EntityType::File, file_id).await? else {
            return Ok(FileResult::Skipped("File is not stored".to_string()));
        };
        let Some(file) = stored.record.as_file() else {
            return Ok(FileResult::Skipped("Stored record is not a File".to_string()));
        };
        let Some(raw_url) = file.fetch_url() else {
            return Ok(FileResult::Skipped("File has no download or access URL".to_string()));
        };
        let mime_type = file.mime_type.as_deref().and_then(|m| m.parse::<mime::Mime>().ok());
        if let Some(m) = &mime_type {
            if !extractable(m) {
                return Ok(FileResult::Skipped(format!("Mime type {} is not extractable", m)));
            }
        }
        if let Some(size) = file.size {
            if size > 0 && size as u64 > self.settings.max_file_bytes {
                return Ok(FileResult::Skipped(format!("File size {} exceeds limit", size)));
            }
        }

        let url = Url::parse(raw_url)
            .map_err(|e| IngestionError::Extraction(format!("Invalid file URL {}: {}", raw_url, e)))?;
        let bytes = self.fetcher.fetch_bytes(&url).await?;
        if bytes.len() as u64 > self.settings.max_file_bytes {
            return Ok(FileResult::Skipped(format!("Downloaded size {} exceeds limit", bytes.len())));
        }

        let input = ExtractionInput { file_id, mime_type: mime_type.as_ref(), bytes: &bytes };
        Ok(FileResult::Chain(self.run_chain(&input).await))
    }

    /// Try each accepting strategy in order; the first acceptable result wins.
    pub async fn run_chain(&self, input: &ExtractionInput<'_>) -> ChainOutcome {
        let mut outcome = ChainOutcome::default();
        for strategy in &self.strategies {
            if !strategy.accepts(input.mime_type) {
                continue;
            }
            let method = strategy.method().to_string();
            outcome.attempted.push(method.clone());
            match strategy.extract(input).await {
                Ok(result) if result.text.trim().is_empty() => {
                    tracing::debug!(file_id = %input.file_id, method = %method, "Strategy produced no text");
                    outcome.errors.push(format!("{}: empty text", method));
                }
                Ok(result) if result.confidence < self.settings.min_confidence => {
                    tracing::debug!(file_id = %input.file_id, method = %method, confidence = result.confidence, "Strategy below confidence threshold");
                    outcome.errors.push(format!("{}: confidence {:.2} below threshold", method, result.confidence));
                }
                Ok(result) => {
                    outcome.winner = Some(StrategyResult { method, ..result });
                    return outcome;
                }
                Err(e) => {
                    tracing::warn!(file_id = %input.file_id, method = %method, error = %e, "Extraction strategy failed; trying next");
                    outcome.errors.push(format!("{}: {}", method, e));
                }
            }
        }
        outcome
    }
}

// Processing rows inspected per reclaim pass
const RECLAIM_BATCH: usize = 500;

fn reset_result(job: &mut FileExtraction, version: Option<DateTime<Utc>>) {
    job.file_version = version;
    job.method = None;
    job.confidence = None;
    job.text = None;
    job.error = None;
    job.attempted_methods.clear();
}

enum FileResult {
    Skipped(String),
    Chain(ChainOutcome),
}

fn extractable(m: &mime::Mime) -> bool {
    m.type_() == mime::TEXT
        || m.type_() == mime::IMAGE
        || (m.type_() == mime::APPLICATION && m.subtype() == mime::PDF)
        || m.essence_str() == "application/xhtml+xml"
}

/// File change events feed the queue.
#[async_trait]
impl EventSink for ExtractionQueue {
    fn name(&self) -> &str {
        "extraction_queue"
    }

    async fn publish(&self, event: &ChangeEvent) -> Result<()> {
        if event.entity_type != EntityType::File {
            return Ok(());
        }
        self.enqueue(&event.external_id, event.remote_modified).await?;
        Ok(())
    }
}
