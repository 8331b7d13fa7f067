//! Fleet daemon
//!
//! Runs the resource monitoring loop and agent lifecycle for one host and
//! serves fleet operations, health checks and metrics over HTTP.

use anyhow::{Context, Result};
use fleet_core::{
    controller::FleetController, lifecycle::ProcessRuntime, observability::StructuredLogger,
    platform::detect_platform,
};
use fleetd::{api, config::DaemonConfig};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const FLEETD_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting fleetd");

    let config = DaemonConfig::load()?;
    info!(node_name = %config.node_name, port = config.api_port, "Daemon configured");

    let adapter = detect_platform(config.fleet.monitoring.command_timeout());
    let platform = adapter.platform().to_string();
    let logger = StructuredLogger::new(&config.node_name);
    logger.log_startup(FLEETD_VERSION, &platform);

    let controller = FleetController::new(
        config.fleet.clone(),
        adapter,
        Arc::new(ProcessRuntime::new()),
    )
    .await
    .context("failed to build fleet controller")?;

    for spec in &config.agent_types {
        controller
            .agents()
            .register_spec(spec.clone())
            .with_context(|| format!("invalid agent type '{}'", spec.agent_type))?;
    }

    if config.monitor_on_start {
        let status = controller.start_monitoring(None).await?;
        info!(interval_ms = status.interval_ms, "Monitoring enabled at startup");
    }

    let app_state = Arc::new(api::AppState::new(controller.clone()));
    let mut api_handle = tokio::spawn(api::serve(config.listen_addr(), app_state));

    let reason = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for shutdown signal")?;
            "SIGINT received"
        }
        served = &mut api_handle => {
            match served {
                Ok(Ok(())) => warn!("API server exited"),
                Ok(Err(e)) => error!(error = %e, "API server failed"),
                Err(e) => error!(error = %e, "API server task panicked"),
            }
            "API server stopped"
        }
    };

    logger.log_shutdown(reason);
    info!("Shutting down");
    controller.shutdown().await;
    api_handle.abort();

    Ok(())
}
