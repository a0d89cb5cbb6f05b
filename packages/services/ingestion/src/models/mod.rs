pub mod entity;
pub mod source;
pub mod sync;
pub mod extraction;
pub mod event;

pub use entity::*;
pub use source::*;
pub use sync::*;
pub use extraction::*;
pub use event::*;

#[derive(Debug, thiserror::Error)]
pub enum IngestionError {
    #[error("Database error: {0}")]
    Database(#[from] mongodb::error::Error),

    #[error("BSON serialization error: {0}")]
    Bson(#[from] bson::ser::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transient error fetching {url}: {detail}")]
    Transient { url: String, detail: String },

    #[error("Rate limited by {host} (retry after {retry_after_ms:?} ms)")]
    RateLimited { host: String, retry_after_ms: Option<u64> },

    #[error("Host unavailable (circuit open): {host}")]
    HostUnavailable { host: String },

    #[error("Remote returned status {status} for {url}")]
    Status { url: String, status: u16 },

    #[error("Malformed record: {0}")]
    Malformed(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Sync error: {0}")]
    Sync(String),

    #[error("Extraction error: {0}")]
    Extraction(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl IngestionError {
    /// Errors worth another attempt against the same host.
    pub fn is_transient(&self) -> bool {
        match self {
            IngestionError::Transient { .. } | IngestionError::RateLimited { .. } => true,
            IngestionError::Http(e) => e.is_timeout() || e.is_connect() || (e.is_request() && !e.is_builder()),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, IngestionError>;
