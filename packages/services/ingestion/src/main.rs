use clap::Parser;
use std::process::ExitCode;
use tracing_subscriber::{fmt, EnvFilter};

use oparl_ingestion::cli::{self, Cli};
use oparl_ingestion::config::Config;

#[tokio::main]
async fn main() -> ExitCode {
    // Load this crate's .env regardless of current working directory, then the working directory's
    let _ = dotenvy::from_filename(concat!(env!("CARGO_MANIFEST_DIR"), "/.env"));
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    let cfg = Config::from_env();
    tracing::info!(
        database = %cfg.database_name,
        store_backend = ?cfg.store_backend,
        sources_file = %cfg.sources_file,
        "Loaded configuration"
    );

    match cli::run(cli, cfg).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "Ingestion command failed");
            ExitCode::from(1)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // stdout carries command output; logs go to stderr
    if std::env::var("LOG_FORMAT").map(|v| v.eq_ignore_ascii_case("pretty")).unwrap_or(false) {
        fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
    } else {
        fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(true)
            .init();
    }
}
