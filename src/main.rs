use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};

use meshguard::admission::{AdmissionController, StatusReporter};
use meshguard::config::MeshGuardConfig;
use meshguard::logging::{self, LogFormat};

/// Per-service rate limiting and circuit breaking for a service mesh.
#[derive(Debug, Parser)]
#[command(name = "meshguard", version, about)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Seconds between status reports, overriding the configuration (0 disables)
    #[arg(long)]
    report_interval: Option<u64>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_format);

    info!("Starting Meshguard Admission Control");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = MeshGuardConfig::load(cli.config.as_deref())?;
    if let Some(secs) = cli.report_interval {
        config.telemetry.report_interval_secs = secs;
    }
    info!(
        services = config.services.len(),
        report_interval_secs = config.telemetry.report_interval_secs,
        "Configuration loaded"
    );

    let controller = Arc::new(AdmissionController::from_config(&config)?);
    info!(health = %serde_json::to_string(&controller.health())?, "Health");

    let reporter = StatusReporter::new(
        Arc::clone(&controller),
        Duration::from_secs(config.telemetry.report_interval_secs),
    );
    let reports = reporter.run_until(shutdown_signal()).await;

    info!(
        reports,
        telemetry = %serde_json::to_string(&controller.telemetry())?,
        "Final status"
    );
    info!("Meshguard Admission Control stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
