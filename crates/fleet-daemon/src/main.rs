//! Fleet usage daemon
//!
//! Provisions one usage collector per discovered cluster, consolidates their
//! output into per-cluster history and answers usage queries.

use anyhow::{Context, Result};
use fleet_daemon::{
    api,
    config::DaemonConfig,
    supervisor::{self, ExitCause},
};
use fleet_lib::{
    fleet::{DockerRuntime, FleetReconciler, InventoryClusterSource},
    health::{components, HealthRegistry},
    observability::{FleetMetrics, StructuredLogger},
    registry::InstanceRegistry,
    usage::{ClusterUsageSnapshotter, ConsolidationLoop},
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DAEMON_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let config = DaemonConfig::load()?;
    let paths = config.paths();

    let logger = StructuredLogger::new("fleet-daemon");
    logger.log_startup(DAEMON_VERSION, &paths.root().display().to_string());

    // Without its state directories the daemon can do nothing useful
    paths.ensure().with_context(|| {
        format!("Failed to create state directories under {}", paths.root().display())
    })?;
    let registry = InstanceRegistry::load(paths.registry_file())
        .context("Failed to initialize instance registry")?;

    let metrics = FleetMetrics::new();
    metrics.set_instances_managed(registry.len());
    drop(registry);

    let health_registry = HealthRegistry::new();
    health_registry.register(components::RECONCILER).await;
    health_registry.register(components::CONSOLIDATOR).await;
    health_registry.register(components::REGISTRY).await;

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let reconciler = FleetReconciler::new(
        Arc::new(InventoryClusterSource::new(config.inventory_path())),
        Arc::new(DockerRuntime::new(config.runtime_binary.clone())),
        paths.clone(),
        config.reconciler_config(),
    )
    .with_health(health_registry.clone());
    let mut reconciler_handle = tokio::spawn(reconciler.run(shutdown_tx.subscribe()));

    let consolidation_config = config.consolidation_config();
    let snapshotter =
        ClusterUsageSnapshotter::new(config.archive_layout(), consolidation_config.step_secs);
    let consolidation = ConsolidationLoop::new(paths.clone(), snapshotter, consolidation_config)
        .with_health(health_registry.clone());
    let consolidation_handle = tokio::spawn(consolidation.run(shutdown_tx.subscribe()));

    let app_state = Arc::new(api::AppState::new(
        health_registry.clone(),
        metrics.clone(),
        paths.clone(),
    ));
    let mut api_handle = tokio::spawn(api::serve(
        config.api_port,
        app_state,
        shutdown_tx.subscribe(),
    ));

    health_registry.set_ready(true).await;

    // Run until a signal arrives, the reconciler gives up or the API server stops
    let cause =
        supervisor::wait_for_exit(shutdown_signal(), &mut reconciler_handle, &mut api_handle).await;
    logger.log_shutdown(cause.reason());

    health_registry.set_ready(false).await;
    let _ = shutdown_tx.send(());

    let (reconciler_result, api_result) = match cause {
        ExitCause::Signal => (reconciler_handle.await, api_handle.await),
        ExitCause::Reconciler(joined) => (joined, api_handle.await),
        ExitCause::Api(joined) => (reconciler_handle.await, joined),
    };
    consolidation_handle
        .await
        .context("Consolidation task panicked")?;

    reconciler_result
        .context("Reconciler task panicked")?
        .context("Fleet reconciler stopped")?;
    api_result
        .context("API task panicked")?
        .context("API server failed")?;

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
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
                error!(error = %e, "Failed to listen for SIGTERM");
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
