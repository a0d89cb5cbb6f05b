pub mod app;
pub mod cli;
pub mod clients;
pub mod config;
pub mod daemon;
pub mod events;
pub mod handlers;
pub mod mapping;
pub mod metrics;
pub mod models;
pub mod processing;
pub mod storage;
pub mod sync;

// Convenient re-exports for tests and external callers
pub use app::{IngestionApp, StatusReport};
pub use config::Config;
pub use events::{EventEmitter, EventSink};
pub use handlers::Fetcher;
pub use metrics::IngestionMetrics;
pub use models::*;
pub use storage::{EntityStore, MemoryStore, MongoStore};
pub use sync::{SyncContext, SyncEngine};
