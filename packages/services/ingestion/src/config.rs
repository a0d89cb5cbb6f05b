use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::models::{IngestionError, Result, SourceDefinition};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreBackend {
    MongoDb,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub port: u16,
    pub store_backend: StoreBackend,
    pub mongodb_uri: String,
    pub database_name: String,
    // Events are only published in-process when unset
    pub redis_url: Option<String>,
    pub http_timeout_ms: u64,
    pub http_user_agent: String,
    pub http_max_attempts: u32,
    pub http_retry_backoff_ms: u64,
    pub http_max_backoff_ms: u64,
    pub host_max_in_flight: usize,
    pub breaker_failure_threshold: u32,
    pub breaker_cooldown_ms: u64,
    pub worker_concurrency: usize,
    // Sources synchronized side by side by one `sync_all` round
    pub source_concurrency: usize,
    pub incremental_overlap_secs: i64,
    pub max_pages_per_collection: usize,
    pub sync_deadline_secs: Option<u64>,
    pub sources_file: String,
    // Text extraction
    pub ocr_endpoint: Option<String>,
    pub ocr_api_key: Option<String>,
    pub ocr_requests_per_minute: u32,
    pub tesseract_bin: String,
    pub pdftoppm_bin: String,
    pub extraction_min_confidence: f32,
    pub extraction_max_file_mb: u64,
    pub extraction_batch_size: usize,
    // A job stuck in `processing` this long is handed out again
    pub extraction_stale_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8089,
            store_backend: StoreBackend::MongoDb,
            mongodb_uri: "mongodb://localhost:27017".to_string(),
            database_name: "oparl".to_string(),
            redis_url: None,
            http_timeout_ms: 60_000,
            http_user_agent: "oparl-ingestion/0.1".to_string(),
            http_max_attempts: 3,
            http_retry_backoff_ms: 500,
            http_max_backoff_ms: 30_000,
            host_max_in_flight: 20,
            breaker_failure_threshold: 5,
            breaker_cooldown_ms: 30_000,
            worker_concurrency: 8,
            source_concurrency: 4,
            incremental_overlap_secs: 300,
            max_pages_per_collection: 10_000,
            sync_deadline_secs: None,
            sources_file: "sources.toml".to_string(),
            ocr_endpoint: None,
            ocr_api_key: None,
            ocr_requests_per_minute: 30,
            tesseract_bin: "tesseract".to_string(),
            pdftoppm_bin: "pdftoppm".to_string(),
            extraction_min_confidence: 0.5,
            extraction_max_file_mb: 50,
            extraction_batch_size: 25,
            extraction_stale_secs: 1_800,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let get = |k: &str| std::env::var(k).ok().filter(|v| !v.trim().is_empty());
        let d = Config::default();

        let store_backend = match get("STORE_BACKEND").as_deref().map(str::to_lowercase).as_deref() {
            Some("memory") => StoreBackend::Memory,
            _ => StoreBackend::MongoDb,
        };

        Self {
            port: get("PORT").and_then(|s| s.parse().ok()).unwrap_or(d.port),
            store_backend,
            mongodb_uri: get("MONGODB_URI").unwrap_or(d.mongodb_uri),
            database_name: get("DATABASE_NAME").unwrap_or(d.database_name),
            redis_url: get("REDIS_URL"),
            http_timeout_ms: get("HTTP_TIMEOUT_MS").and_then(|s| s.parse().ok()).unwrap_or(d.http_timeout_ms),
            http_user_agent: get("HTTP_USER_AGENT").unwrap_or(d.http_user_agent),
            http_max_attempts: get("HTTP_MAX_RETRIES").and_then(|s| s.parse().ok()).unwrap_or(d.http_max_attempts),
            http_retry_backoff_ms: get("HTTP_RETRY_BACKOFF_MS").and_then(|s| s.parse().ok()).unwrap_or(d.http_retry_backoff_ms),
            http_max_backoff_ms: get("HTTP_MAX_BACKOFF_MS").and_then(|s| s.parse().ok()).unwrap_or(d.http_max_backoff_ms),
            host_max_in_flight: get("HOST_MAX_IN_FLIGHT").and_then(|s| s.parse().ok()).unwrap_or(d.host_max_in_flight),
            breaker_failure_threshold: get("BREAKER_FAILURE_THRESHOLD").and_then(|s| s.parse().ok()).unwrap_or(d.breaker_failure_threshold),
            breaker_cooldown_ms: get("BREAKER_COOLDOWN_MS").and_then(|s| s.parse().ok()).unwrap_or(d.breaker_cooldown_ms),
            worker_concurrency: get("WORKER_CONCURRENCY").and_then(|s| s.parse().ok()).unwrap_or(d.worker_concurrency),
            source_concurrency: get("SOURCE_CONCURRENCY").and_then(|s| s.parse().ok()).unwrap_or(d.source_concurrency),
            incremental_overlap_secs: get("INCREMENTAL_OVERLAP_SECS").and_then(|s| s.parse().ok()).unwrap_or(d.incremental_overlap_secs),
            max_pages_per_collection: get("MAX_PAGES_PER_COLLECTION").and_then(|s| s.parse().ok()).unwrap_or(d.max_pages_per_collection),
            sync_deadline_secs: get("SYNC_DEADLINE_SECS").and_then(|s| s.parse().ok()),
            sources_file: get("SOURCES_FILE").unwrap_or(d.sources_file),
            ocr_endpoint: get("OCR_ENDPOINT"),
            ocr_api_key: get("OCR_API_KEY"),
            ocr_requests_per_minute: get("OCR_REQUESTS_PER_MINUTE").and_then(|s| s.parse().ok()).unwrap_or(d.ocr_requests_per_minute),
            tesseract_bin: get("TESSERACT_BIN").unwrap_or(d.tesseract_bin),
            pdftoppm_bin: get("PDFTOPPM_BIN").unwrap_or(d.pdftoppm_bin),
            extraction_min_confidence: get("EXTRACTION_MIN_CONFIDENCE").and_then(|s| s.parse().ok()).unwrap_or(d.extraction_min_confidence),
            extraction_max_file_mb: get("EXTRACTION_MAX_FILE_MB").and_then(|s| s.parse().ok()).unwrap_or(d.extraction_max_file_mb),
            extraction_batch_size: get("EXTRACTION_BATCH_SIZE").and_then(|s| s.parse().ok()).unwrap_or(d.extraction_batch_size),
            extraction_stale_secs: get("EXTRACTION_STALE_SECS").and_then(|s| s.parse().ok()).unwrap_or(d.extraction_stale_secs),
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub fn incremental_overlap(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.incremental_overlap_secs.max(0))
    }

    pub fn sync_deadline(&self) -> Option<Duration> {
        self.sync_deadline_secs.map(Duration::from_secs)
    }

    pub fn extraction_stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.extraction_stale_secs.min(i64::MAX as u64) as i64)
    }
}

#[derive(Debug, Deserialize)]
struct SourcesFile {
    #[serde(default)]
    sources: Vec<SourceDefinition>,
}

/// Load `[[sources]]` entries from a TOML/YAML/JSON file. A missing file yields no sources.
pub fn load_source_definitions(path: &str) -> Result<Vec<SourceDefinition>> {
    let settings = config::Config::builder()
        .add_source(config::File::with_name(path).required(false))
        .build()
        .map_err(|e| IngestionError::Configuration(format!("Failed to read sources file {}: {}", path, e)))?;
    let parsed: SourcesFile = settings
        .try_deserialize()
        .map_err(|e| IngestionError::Configuration(format!("Invalid sources file {}: {}", path, e)))?;
    Ok(parsed.sources)
}
