//! ptyhub server binary
//!
//! Serves the PTY tool protocol over stdio. Diagnostics go to stderr so
//! stdout stays clean for the protocol.

#![forbid(unsafe_code)]

use anyhow::Context;
use clap::Parser;
use ptyhub::{ServerConfig, SessionManager};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// PTY sessions over a JSON-RPC tool protocol
#[derive(Parser, Debug)]
#[command(name = "ptyhub")]
#[command(about = "Expose interactive PTY sessions as agent tools over stdio")]
#[command(version)]
struct Cli {
    /// Maximum concurrent PTY sessions
    #[arg(long, default_value_t = ptyhub::config::DEFAULT_MAX_SESSIONS)]
    max_sessions: usize,

    /// Directory for per-session log files (must exist)
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ptyhub=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = ServerConfig {
        max_sessions: cli.max_sessions,
        log_dir: cli.log_dir,
    };
    let config = match config.validated() {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return ExitCode::from(2);
        }
    };

    info!(
        max_sessions = config.max_sessions,
        log_dir = ?config.log_dir,
        "starting ptyhub v{}",
        env!("CARGO_PKG_VERSION")
    );

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: ServerConfig) -> anyhow::Result<()> {
    let manager = SessionManager::new(config);
    manager.start();

    let result = ptyhub::server::run(Arc::clone(&manager), shutdown_signal()).await;

    manager.shutdown().await;
    info!("ptyhub shutdown complete");
    result.context("server loop failed")
}

/// Resolves when the process receives Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        }
    }
}
