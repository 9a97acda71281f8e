//! In-process executor nodes.
//!
//! `fleetd` and the end-to-end tests run executors inside the controller
//! process: each node is a container host backed by [`MockRuntime`], a
//! resource monitor and a membership client leased to the local registry.

use std::sync::Arc;

use anyhow::{Context, Result};
use fleet_executor::{ContainerHost, MembershipClient, MembershipConfig, MockRuntime, ResourceMonitor};
use fleet_id::NodeId;
use fleet_proto::LeaseRegistrar;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// One running in-process executor.
pub struct LocalNode {
    pub host: Arc<ContainerHost>,
    pub runtime: Arc<MockRuntime>,
    pub membership: Arc<MembershipClient>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl LocalNode {
    /// Start a node from `config` and register it with `registrar`.
    pub async fn start(
        config: fleet_executor::Config,
        runtime: Arc<MockRuntime>,
        registrar: Arc<dyn LeaseRegistrar>,
    ) -> Result<Self> {
        let host = Arc::new(
            ContainerHost::open(&config, runtime.clone())
                .with_context(|| format!("failed to open executor {}", config.node_id))?,
        );
        let monitor = ResourceMonitor::new(
            host.clone(),
            config.capacity_threshold,
            config.resource_poll_interval,
        );
        let (capability_tx, capability_rx) = monitor.channel();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let membership = MembershipClient::new(
            MembershipConfig::from(&config),
            host.clone(),
            capability_rx,
            shutdown_rx.clone(),
        );
        membership
            .register_with(registrar)
            .await
            .with_context(|| format!("executor {} failed to register", config.node_id))?;

        let tasks = vec![
            tokio::spawn(monitor.run(capability_tx, shutdown_rx)),
            tokio::spawn(membership.clone().run_updates()),
        ];
        info!(node_id = %config.node_id, host_address = %config.host_address, "Local executor started");

        Ok(Self {
            host,
            runtime,
            membership,
            shutdown,
            tasks,
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.host.node_id()
    }

    /// Cancel leases, tear down hosted instances and stop background tasks.
    /// Returns the number of instances torn down.
    pub async fn stop(self) -> usize {
        self.shutdown.send_replace(true);
        let cancelled = self.membership.cancel_all().await;
        let destroyed = self.host.shutdown().await;
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Local executor task failed");
            }
        }
        info!(node_id = %self.host.node_id(), cancelled, destroyed, "Local executor stopped");
        destroyed
    }
}

/// Per-node executor configuration derived from a shared template.
pub fn node_config(template: &fleet_executor::Config, index: usize) -> fleet_executor::Config {
    let node_id = NodeId::new();
    fleet_executor::Config {
        node_id,
        host_address: format!("{}:{}", template.host_address, 7000 + index),
        data_dir: template.data_dir.as_ref().map(|dir| dir.join(node_id.to_string())),
        ..template.clone()
    }
}
