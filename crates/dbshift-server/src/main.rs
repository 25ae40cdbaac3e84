//! dbshift-server - turns VCS push events into schema update issues.

mod services;
mod webhook;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

use dbshift::vcs::GitlabClient;
use dbshift::DriverError;

use services::{LoggingIssueService, SeedDatabaseService, SeedRepositoryService, SeedData};
use webhook::{webhook_router, AppState};

#[derive(Parser)]
#[command(name = "dbshift-server")]
#[command(about = "Webhook server turning VCS push events into executed migrations")]
#[command(version)]
struct Cli {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:8080")]
    addr: SocketAddr,

    /// Path to the JSON seed file with repositories and databases
    #[arg(long, default_value = "seed.json")]
    seed: PathBuf,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), DriverError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format)?;

    let seed = SeedData::load(&cli.seed)?;
    info!(
        repositories = seed.repositories.len(),
        databases = seed.databases.len(),
        "loaded seed data from {:?}",
        cli.seed
    );

    let state = AppState {
        repositories: Arc::new(SeedRepositoryService::new(seed.repositories)),
        databases: Arc::new(SeedDatabaseService::new(seed.databases)),
        issues: Arc::new(LoggingIssueService::default()),
        vcs: Arc::new(GitlabClient::new()),
    };

    let listener = tokio::net::TcpListener::bind(cli.addr)
        .await
        .map_err(|e| DriverError::Config(format!("cannot bind {}: {e}", cli.addr)))?;
    info!("listening on {}", cli.addr);

    axum::serve(listener, webhook_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| DriverError::Internal(format!("server error: {e}")))?;

    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), DriverError> {
    let level = match verbosity {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        other => {
            return Err(DriverError::Config(format!(
                "invalid verbosity {other:?}; valid: debug, info, warn, error"
            )))
        }
    };

    let builder = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::NONE)
        .with_target(false);

    match format {
        "json" => builder.json().init(),
        "text" => builder.init(),
        other => {
            return Err(DriverError::Config(format!(
                "invalid log format {other:?}; valid: text, json"
            )))
        }
    }
    Ok(())
}
