//! Streamer - MongoDB change streams to stdout and webhooks
//!
//! Reads a JSON configuration naming sources, sinks and the connections between them,
//! establishes every connection and runs until interrupted. Any startup error, or a watch
//! that gives up after exhausting its retries, ends the process with exit code 1.

use anyhow::{Result, anyhow};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use streamer::core::StreamerConfig;
use streamer::engine::{Engine, Registry};
use streamer::source::{FailureReporter, SourceFailure};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(
    name = "streamer",
    about = "Forward MongoDB change notifications to stdout or webhooks",
    version
)]
struct Args {
    /// Path of the JSON configuration file
    #[arg(long, env = "STREAMER_CONFIG")]
    config: PathBuf,

    /// Log output format
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.log_format);

    match run(args).await {
        Ok(()) => {
            info!("Streamer stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Streamer failed: {:#}", e);
            ExitCode::from(1)
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match format {
        LogFormat::Text => fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .init(),
        LogFormat::Json => fmt().with_env_filter(filter).json().init(),
    }
}

async fn run(args: Args) -> Result<()> {
    let config = StreamerConfig::from_file(&args.config)?;

    let (failures_tx, mut failures) = mpsc::unbounded_channel();
    let registry = Registry::from_config(&config, FailureReporter::new(failures_tx)).await?;
    let engine = Engine::start(&registry, &config.connections, &config.pipeline).await?;
    info!(
        "Streamer running with {} connection(s)",
        engine.connection_names().len()
    );

    let outcome = wait_for_exit(&mut failures, shutdown_signal()).await;
    engine.shutdown().await;
    outcome
}

/// Wait for `signal` or a watch that failed for good
async fn wait_for_exit(
    failures: &mut mpsc::UnboundedReceiver<SourceFailure>,
    signal: impl Future<Output = ()>,
) -> Result<()> {
    tokio::pin!(signal);

    loop {
        tokio::select! {
            _ = &mut signal => {
                info!("Shutdown signal received");
                return Ok(());
            }
            failure = failures.recv() => match failure {
                Some(failure) if failure.is_terminal() => {
                    error!("{}", failure);
                    return Err(anyhow!("{}", failure));
                }
                Some(failure) => warn!("{}", failure),
                None => {
                    signal.await;
                    info!("Shutdown signal received");
                    return Ok(());
                }
            },
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
