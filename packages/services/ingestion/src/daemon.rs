use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::{Local, NaiveDate, Timelike};
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::app::{IngestionApp, StatusReport};
use crate::models::{IngestionError, SyncMode};

#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub interval: Duration,
    /// Six-field cron expression (seconds first); replaces `interval` when set.
    pub schedule: Option<String>,
    /// Local hour (0-23) in which the first cycle of the day runs as a full sync.
    pub full_sync_hour: u32,
}

/// Validate a cron expression before handing it to the scheduler.
pub fn parse_schedule(expr: &str) -> Result<cron::Schedule, IngestionError> {
    cron::Schedule::from_str(expr)
        .map_err(|e| IngestionError::Configuration(format!("Invalid cron schedule '{}': {}", expr, e)))
}

/// Scheduled sync loop plus the health/status endpoints.
pub struct Daemon {
    app: Arc<IngestionApp>,
    options: DaemonOptions,
    cancel: CancellationToken,
    cycle_lock: tokio::sync::Mutex<()>,
    last_full_day: Mutex<Option<NaiveDate>>,
}

impl Daemon {
    pub fn new(app: Arc<IngestionApp>, options: DaemonOptions, cancel: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            app,
            options,
            cancel,
            cycle_lock: tokio::sync::Mutex::new(()),
            last_full_day: Mutex::new(None),
        })
    }

    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let mut scheduler = JobScheduler::new().await?;
        let daemon = self.clone();
        let job = match &self.options.schedule {
            Some(expr) => {
                let next = parse_schedule(expr)?.upcoming(chrono::Utc).next();
                tracing::info!(schedule = %expr, next_run = ?next, "Using cron schedule");
                Job::new_async(expr.as_str(), move |_uuid, _l| {
                    let daemon = daemon.clone();
                    Box::pin(async move {
                        daemon.tick().await;
                    })
                })?
            }
            None => Job::new_repeated_async(self.options.interval, move |_uuid, _l| {
                let daemon = daemon.clone();
                Box::pin(async move {
                    daemon.tick().await;
                })
            })?,
        };
        scheduler.add(job).await?;
        scheduler.start().await?;
        tracing::info!(
            interval_secs = self.options.interval.as_secs(),
            full_sync_hour = self.options.full_sync_hour,
            "Sync scheduler started"
        );

        // First cycle right away instead of one interval from now
        let first = self.clone();
        tokio::spawn(async move { first.tick().await });

        let server = {
            let addr: SocketAddr = format!("0.0.0.0:{}", self.app.config.port).parse()?;
            let listener = match tokio::net::TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(e) => {
                    if e.kind() == std::io::ErrorKind::AddrInUse {
                        tracing::error!(port = self.app.config.port, "Port is already in use. Try changing PORT env var or stop the other process.");
                    }
                    return Err(e.into());
                }
            };
            tracing::info!(port = self.app.config.port, "Health endpoint listening");
            let cancel = self.cancel.clone();
            let app = router(self.app.clone());
            tokio::spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move { cancel.cancelled().await })
                    .await
            })
        };

        self.cancel.cancelled().await;
        tracing::info!("Shutdown requested; stopping scheduler");
        scheduler.shutdown().await?;
        // Wait for an in-flight cycle to observe the cancellation
        let _idle = self.cycle_lock.lock().await;
        if let Err(e) = server.await? {
            tracing::warn!(error = %e, "Health server stopped with an error");
        }
        Ok(())
    }

    /// One scheduled cycle for every enabled source, followed by an extraction drain.
    /// Skipped when the previous cycle is still running.
    pub async fn tick(&self) {
        let Ok(_running) = self.cycle_lock.try_lock() else {
            tracing::info!("Previous cycle still running; skipping this tick");
            return;
        };
        if self.cancel.is_cancelled() {
            return;
        }

        let mode = self.next_mode();
        match self.app.engine.sync_all(mode, &self.cancel).await {
            Ok(executions) => {
                for exec in executions {
                    if exec.mode == SyncMode::Full && exec.status == crate::models::SyncStatus::Failed {
                        // Retry the full sync on the next tick of the hour
                        self.forget_full_sync();
                    }
                    tracing::info!(source = %exec.source_id, status = ?exec.status, mode = %exec.mode, "Scheduled cycle done");
                }
            }
            Err(e) => tracing::error!(error = %e, "Scheduled sync failed"),
        }

        if let Err(e) = self.app.engine.context().events.replay_pending().await {
            tracing::warn!(error = %e, "Event replay failed");
        }
        self.drain_extraction().await;
    }

    async fn drain_extraction(&self) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            match self.app.extraction.run_once(None).await {
                Ok(report) if report.total() == 0 => break,
                Ok(report) => tracing::info!(
                    completed = report.completed,
                    failed = report.failed,
                    skipped = report.skipped,
                    "Extraction batch processed"
                ),
                Err(e) => {
                    tracing::error!(error = %e, "Extraction batch failed");
                    break;
                }
            }
        }
    }

    fn next_mode(&self) -> SyncMode {
        let now = Local::now();
        let mut last = self.last_full_day.lock().unwrap_or_else(|p| p.into_inner());
        let mode = choose_mode(now.hour(), now.date_naive(), *last, self.options.full_sync_hour);
        if mode == SyncMode::Full {
            *last = Some(now.date_naive());
        }
        mode
    }

    fn forget_full_sync(&self) {
        *self.last_full_day.lock().unwrap_or_else(|p| p.into_inner()) = None;
    }
}

/// Full once per day during `full_sync_hour`, incremental otherwise.
pub fn choose_mode(hour: u32, today: NaiveDate, last_full_day: Option<NaiveDate>, full_sync_hour: u32) -> SyncMode {
    if hour == full_sync_hour && last_full_day != Some(today) {
        SyncMode::Full
    } else {
        SyncMode::Incremental
    }
}

pub fn router(app: Arc<IngestionApp>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(status))
        .layer(TraceLayer::new_for_http())
        .with_state(app)
}

async fn health_check() -> &'static str {
    "OK"
}

async fn status(State(app): State<Arc<IngestionApp>>) -> Result<Json<StatusReport>, (StatusCode, String)> {
    app.status_report(None)
        .await
        .map(Json)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}
