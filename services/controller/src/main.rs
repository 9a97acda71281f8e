//! fleetd
//!
//! Runs a controller together with in-process executor nodes, submits the
//! specifications found at `FLEET_SPECS_PATH`, and keeps them reconciled
//! until interrupted.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use fleet_controller::{
    config, local, ControllerWorker, Deployer, DispatchQueue, ExecutorRegistry,
    FaultMonitorFactory, LeastLoadedSelector, LocalNode, ManagerContext, WorkerConfig,
};
use fleet_events::{EventNotifier, LoggingListener};
use fleet_executor::MockRuntime;
use fleet_id::ControllerId;
use fleet_proto::{LeaseRegistrar, ServiceSpec};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to FLEET_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let controller_id = ControllerId::new();
    info!(controller_id = %controller_id, "Starting fleet controller");
    info!(
        reconcile_interval_secs = config.reconcile_interval.as_secs(),
        local_executors = config.local_executors,
        "Configuration loaded"
    );

    let notifier = Arc::new(EventNotifier::new());
    notifier.register(Arc::new(LoggingListener));

    let registry = Arc::new(ExecutorRegistry::new(controller_id, config.max_lease));
    let queue = Arc::new(DispatchQueue::new(
        registry.clone(),
        Arc::new(LeastLoadedSelector),
        config.dispatch_concurrency,
    ));
    let deployer = Arc::new(Deployer::new(
        ManagerContext {
            queue: queue.clone(),
            registry: registry.clone(),
            notifier,
            monitors: FaultMonitorFactory::new(config.controller_node_id),
        },
        config.default_liveness(),
    ));

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker = ControllerWorker::new(
        deployer.clone(),
        queue,
        registry.clone(),
        WorkerConfig::from(&config),
    );
    let worker_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            worker.run(shutdown_rx).await;
        }
    });

    // Start in-process executors
    let template = fleet_executor::Config::from_env()?;
    let mut nodes = Vec::with_capacity(config.local_executors);
    for index in 0..config.local_executors {
        let registrar: Arc<dyn LeaseRegistrar> = registry.clone();
        match LocalNode::start(
            local::node_config(&template, index),
            Arc::new(MockRuntime::new()),
            registrar,
        )
        .await
        {
            Ok(node) => nodes.push(node),
            Err(e) => error!(error = %e, "Failed to start local executor"),
        }
    }
    info!(executors = registry.len(), "Executor pool ready");

    if let Some(path) = &config.specs_path {
        for spec in load_specs(path)? {
            let key = spec.key();
            match deployer.submit(spec) {
                Ok(_) => info!(spec = %key, "Specification submitted"),
                Err(e) => error!(spec = %key, error = %e, "Specification rejected"),
            }
        }
    }

    // Wait for shutdown signal (Ctrl+C)
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Received shutdown signal");

    // Signal shutdown to the worker
    let _ = shutdown_tx.send(true);

    let shutdown_timeout = Duration::from_secs(10);
    if let Err(e) = tokio::time::timeout(shutdown_timeout, worker_handle).await {
        warn!(error = %e, "Controller worker did not shut down in time");
    }

    let destroyed = deployer.undeploy_all(true).await;
    info!(destroyed, "Specifications undeployed");

    for node in nodes {
        node.stop().await;
    }

    info!("Fleet controller shutdown complete");
    Ok(())
}

fn load_specs(path: &Path) -> Result<Vec<ServiceSpec>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid specifications in {}", path.display()))
}
