//! Lifeline service binary.
//!
//! Loads configuration, starts one process generation and keeps it running
//! until it is terminated or replaced by a successor (SIGHUP).

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use lifeline::collaborators::TcpCollaborator;
use lifeline::config::{load_config, load_from_env, ServiceConfig};
use lifeline::lifecycle::{spawn_signal_listener, ManagedCollaborator, Orchestrator};
use lifeline::net::{ExitReason, Upgrader, UpgraderOptions};
use lifeline::observability::{logging::init_logging, metrics::install_recorder};

#[derive(Parser)]
#[command(name = "lifeline", version, about = "Zero-downtime service supervisor")]
struct Args {
    /// TOML configuration file. Defaults plus LIFELINE__* variables when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => load_config(path),
        None => load_from_env(std::env::vars()),
    };
    let config = match config {
        Ok(config) => Arc::new(config),
        Err(error) => {
            eprintln!("lifeline: {error}");
            return ExitCode::from(2);
        }
    };

    init_logging(&config.observability);
    tracing::info!(
        name = %config.app.name,
        version = %config.app.version,
        environment = %config.app.environment,
        pid = std::process::id(),
        "lifeline starting"
    );

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(error = %error, "lifeline exiting with error");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Arc<ServiceConfig>) -> Result<(), Box<dyn std::error::Error>> {
    let options = UpgraderOptions::current_process()?
        .with_ready_timeout(config.listener.upgrade_timeout())
        .with_pid_file(config.app.pid_file.as_ref().map(PathBuf::from));
    let upgrader = Upgrader::from_env(options)?;

    let mut orchestrator = Orchestrator::new(config.clone(), upgrader.clone());
    if config.observability.metrics_enabled {
        orchestrator = orchestrator.with_metrics(install_recorder()?);
    }
    for (name, settings, check) in [
        ("database", &config.database, config.health.database_check),
        ("redis", &config.redis, config.health.redis_check),
    ] {
        if settings.enabled {
            let collaborator = Arc::new(TcpCollaborator::from_config(name, settings, config.health.timeout()));
            orchestrator = orchestrator.with_collaborator(ManagedCollaborator::from_config(collaborator, settings, check));
        }
    }

    let signals = CancellationToken::new();
    let listener = spawn_signal_listener(upgrader.clone(), signals.clone())?;

    let service = match orchestrator.startup().await {
        Ok(service) => service,
        Err(error) => {
            signals.cancel();
            let _ = listener.await;
            if let Some(ExitReason::Terminated(signal)) = upgrader.exit_reason() {
                tracing::info!(signal = %signal, error = %error, "Terminated before startup completed");
                return Ok(());
            }
            return Err(error.into());
        }
    };

    let result = service.run_until_exit().await;
    signals.cancel();
    let _ = listener.await;

    let report = result?;
    match &report.reason {
        ExitReason::Fatal(reason) => Err(format!("stopped after fatal error: {reason}").into()),
        reason => {
            tracing::info!(reason = %reason, elapsed = ?report.elapsed, "Generation exited");
            Ok(())
        }
    }
}
