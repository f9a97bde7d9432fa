//! VPA rollout controller
//!
//! Watches VerticalPodAutoscaler objects and restarts their target
//! workloads when the running pods drift from the recommendation,
//! optionally behind a temporary surge buffer workload.

use anyhow::{Context, Result};
use rollout_lib::{
    ControllerHealth, ControllerMetrics, KubeStore, ReconciliationDriver, RolloutEngine,
    RolloutLogger, CONTROLLER_NAME,
};
use std::future::Future;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const CONTROLLER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let config = config::ControllerConfig::load().context("failed to load configuration")?;
    info!(
        namespace = config.namespace.as_deref().unwrap_or("<all>"),
        diff_percent_trigger = config.diff_percent_trigger,
        cooldown_period = %config.cooldown_period,
        "Controller configured"
    );

    let health = ControllerHealth::new();
    let metrics = ControllerMetrics::new();
    let logger = RolloutLogger::new(CONTROLLER_NAME);

    // Installed before the initial listing, which can take a while
    let shutdown = shutdown_signal().context("failed to install signal handlers")?;
    tokio::pin!(shutdown);

    // Probes are served while the initial listing runs
    let app_state = Arc::new(api::AppState::new(health.clone(), metrics));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    let store = Arc::new(
        KubeStore::try_default()
            .await
            .context("failed to create Kubernetes client")?,
    );
    let engine = Arc::new(RolloutEngine::new(store.clone(), config.engine_config()?));
    let driver = ReconciliationDriver::new(store, engine, config.driver_config(), health);

    let handle = tokio::select! {
        result = driver.start() => result.context("initial reconciliation failed")?,
        reason = &mut shutdown => {
            logger.log_shutdown(reason);
            api_handle.abort();
            return Ok(());
        }
    };
    logger.log_startup(CONTROLLER_VERSION, config.namespace.as_deref());

    let reason = tokio::select! {
        reason = &mut shutdown => reason,
        result = api_handle => {
            match result {
                Ok(Err(e)) => error!(error = %e, "API server failed"),
                Err(e) => error!(error = %e, "API server task panicked"),
                Ok(Ok(())) => {}
            }
            "api server exited"
        }
    };

    logger.log_shutdown(reason);
    handle.shutdown().await;
    info!("Shutdown complete");

    Ok(())
}

/// Install SIGINT and SIGTERM handlers. The returned future resolves on
/// the first signal received.
#[cfg(unix)]
fn shutdown_signal() -> Result<impl Future<Output = &'static str>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    Ok(async move {
        tokio::select! {
            _ = interrupt.recv() => "SIGINT received",
            _ = terminate.recv() => "SIGTERM received",
        }
    })
}

#[cfg(not(unix))]
fn shutdown_signal() -> Result<impl Future<Output = &'static str>> {
    Ok(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for SIGINT");
        }
        "SIGINT received"
    })
}
