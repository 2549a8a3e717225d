#![forbid(unsafe_code)]

//! `conduit-host`: agent host speaking the control protocol on stdio.
//!
//! Reads requests from stdin, writes replies and streamed events to
//! stdout. Logs go to stderr; stdout carries nothing but protocol records.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use agent_conduit::config::GlobalConfig;
use agent_conduit::host::{serve, Host};
use agent_conduit::{AppError, Result};

/// How long shutdown waits for blocking I/O threads.
const STDIN_RELEASE: Duration = Duration::from_millis(500);

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "conduit-host", about = "Agent host speaking the conduit protocol on stdio", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file. Built-in defaults when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("conduit-host bootstrap");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?;
    let result = runtime.block_on(run(args));
    // A blocking stdin read may still be parked after a `shutdown` request.
    runtime.shutdown_timeout(STDIN_RELEASE);
    result
}

async fn run(args: Cli) -> Result<()> {
    let config = GlobalConfig::load(args.config.as_deref())?;
    let host = Arc::new(Host::new(&config.host)?);
    info!(
        name = host.name(),
        agents = config.host.agents.len(),
        "configuration loaded"
    );

    tokio::select! {
        served = serve(Arc::clone(&host), tokio::io::stdin(), tokio::io::stdout()) => {
            if let Err(err) = &served {
                error!(%err, "host loop failed");
            }
            served?;
        }
        () = shutdown_signal() => {
            info!("shutdown signal received");
        }
    }

    info!("conduit-host shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_ansi(false);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
