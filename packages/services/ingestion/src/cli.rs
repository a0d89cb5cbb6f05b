use anyhow::Result;
use clap::{ArgGroup, Args, Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::app::{ExecutionSummary, IngestionApp};
use crate::config::Config;
use crate::daemon::{parse_schedule, Daemon, DaemonOptions};
use crate::models::{SyncExecution, SyncMode, SyncStatus};

#[derive(Debug, Parser)]
#[command(name = "oparl-ingestion", version, about = "Mirror OParl council-information APIs into a local store")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run one sync cycle for every enabled source (or only --source)
    Sync(SyncArgs),
    /// Run scheduled cycles until interrupted
    Daemon {
        /// Minutes between incremental cycles
        #[arg(long, default_value_t = 15, value_parser = clap::value_parser!(u64).range(1..))]
        interval: u64,
        /// Cron expression with seconds, e.g. "0 */15 * * * *"; overrides --interval
        #[arg(long)]
        schedule: Option<String>,
        /// Local hour in which the daily full sync runs
        #[arg(long, default_value_t = 2, value_parser = clap::value_parser!(u32).range(0..24))]
        full_sync_hour: u32,
        #[arg(long)]
        source: Option<String>,
    },
    /// Last success, latest per-type counts, unresolved links and extraction failures
    Status {
        #[arg(long)]
        source: Option<String>,
    },
    /// Metrics recorded by the latest cycles
    Metrics,
    /// Drain pending text extraction once
    Extract {
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[derive(Debug, Args)]
#[command(group(ArgGroup::new("mode").required(true).args(["full", "incremental"])))]
pub struct SyncArgs {
    #[arg(long)]
    pub full: bool,
    #[arg(long)]
    pub incremental: bool,
    #[arg(long)]
    pub source: Option<String>,
}

impl SyncArgs {
    pub fn mode(&self) -> SyncMode {
        if self.full {
            SyncMode::Full
        } else {
            SyncMode::Incremental
        }
    }
}

/// Execute a parsed command. The returned value is the process exit code.
pub async fn run(cli: Cli, config: Config) -> Result<u8> {
    let app = Arc::new(IngestionApp::bootstrap(config).await?);
    let cancel = CancellationToken::new();
    spawn_ctrl_c(cancel.clone());

    match cli.command {
        Command::Sync(args) => {
            app.register_sources(args.source.as_deref()).await?;
            let executions = match &args.source {
                Some(url) => vec![app.engine.execute_sync(url, args.mode(), &cancel).await?],
                None => app.engine.sync_all(args.mode(), &cancel).await?,
            };
            if executions.is_empty() {
                anyhow::bail!("no enabled sources; add [[sources]] to {} or pass --source", app.config.sources_file);
            }
            let summaries: Vec<ExecutionSummary> = executions.iter().cloned().map(ExecutionSummary::from).collect();
            println!("{}", serde_json::to_string_pretty(&summaries)?);
            Ok(worst_exit_code(&executions))
        }
        Command::Daemon { interval, schedule, full_sync_hour, source } => {
            if let Some(expr) = &schedule {
                parse_schedule(expr)?;
            }
            app.register_sources(source.as_deref()).await?;
            let options = DaemonOptions { interval: Duration::from_secs(interval * 60), schedule, full_sync_hour };
            Daemon::new(app, options, cancel).run().await?;
            Ok(0)
        }
        Command::Status { source } => {
            let report = app.status_report(source.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(0)
        }
        Command::Metrics => {
            println!("{}", serde_json::to_string_pretty(&app.metrics_report().await?)?);
            Ok(0)
        }
        Command::Extract { limit } => {
            let report = app.extraction.run_once(limit).await?;
            println!(
                "{}",
                serde_json::json!({
                    "completed": report.completed,
                    "failed": report.failed,
                    "skipped": report.skipped,
                    "reclaimed": report.reclaimed,
                })
            );
            Ok(0)
        }
    }
}

fn spawn_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received; cancelling");
            cancel.cancel();
        }
    });
}

/// A fatal source outranks partial failures, which outrank success.
pub fn worst_exit_code(executions: &[SyncExecution]) -> u8 {
    if executions.iter().any(|e| e.status == SyncStatus::Failed) {
        SyncStatus::Failed.exit_code()
    } else if executions.iter().any(|e| e.status == SyncStatus::PartialFailure) {
        SyncStatus::PartialFailure.exit_code()
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exec(status: SyncStatus) -> SyncExecution {
        let mut e = SyncExecution::new("s", SyncMode::Full);
        e.status = status;
        e
    }

    #[test]
    fn exit_code_reflects_the_worst_source() {
        assert_eq!(worst_exit_code(&[exec(SyncStatus::Completed)]), 0);
        assert_eq!(worst_exit_code(&[exec(SyncStatus::Completed), exec(SyncStatus::PartialFailure)]), 2);
        assert_eq!(worst_exit_code(&[exec(SyncStatus::PartialFailure), exec(SyncStatus::Failed)]), 1);
    }

    #[test]
    fn sync_requires_exactly_one_mode() {
        assert!(Cli::try_parse_from(["oparl-ingestion", "sync"]).is_err());
        assert!(Cli::try_parse_from(["oparl-ingestion", "sync", "--full", "--incremental"]).is_err());
        let cli = Cli::try_parse_from(["oparl-ingestion", "sync", "--incremental", "--source", "https://x/system"]).unwrap();
        match cli.command {
            Command::Sync(args) => {
                assert_eq!(args.mode(), SyncMode::Incremental);
                assert_eq!(args.source.as_deref(), Some("https://x/system"));
            }
            _ => panic!("expected sync"),
        }
    }

    #[test]
    fn daemon_rejects_out_of_range_hour() {
        assert!(Cli::try_parse_from(["oparl-ingestion", "daemon", "--full-sync-hour", "24"]).is_err());
        assert!(Cli::try_parse_from(["oparl-ingestion", "daemon", "--interval", "5", "--full-sync-hour", "23"]).is_ok());
    }
}
