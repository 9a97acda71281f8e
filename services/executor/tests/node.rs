//! Integration tests for a whole executor node.
//!
//! These wire a container host, resource monitor and membership client
//! together against an in-memory lease registrar:
//! 1. The node registers and reports its capability
//! 2. Hosting an instance pushes a deployment update
//! 3. Shutdown cancels leases and tears down containers

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_executor::config::Config;
use fleet_executor::resources::SystemResources;
use fleet_executor::{ContainerHost, MembershipClient, MembershipConfig, MockRuntime, ResourceMonitor};
use fleet_id::{ControllerId, LeaseId};
use fleet_proto::{
    DeployedService, Executor, ExecutorRegistration, Lease, LeaseRegistrar, RemoteError,
    ResourceCapability,
};
use fleet_testing::{NullDeployment, SpecBuilder};
use tokio::sync::watch;

#[derive(Default)]
struct Recorded {
    registrations: Vec<ExecutorRegistration>,
    updates: Vec<Vec<DeployedService>>,
    cancelled: Vec<LeaseId>,
}

struct InMemoryRegistrar {
    id: ControllerId,
    recorded: Mutex<Recorded>,
}

impl InMemoryRegistrar {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            id: ControllerId::new(),
            recorded: Mutex::new(Recorded::default()),
        })
    }

    fn updates(&self) -> Vec<Vec<DeployedService>> {
        self.recorded.lock().unwrap().updates.clone()
    }
}

#[async_trait]
impl LeaseRegistrar for InMemoryRegistrar {
    fn controller_id(&self) -> ControllerId {
        self.id
    }

    async fn register(&self, registration: ExecutorRegistration) -> Result<Lease, RemoteError> {
        let duration = registration.requested;
        self.recorded.lock().unwrap().registrations.push(registration);
        Ok(Lease {
            lease_id: LeaseId::new(),
            controller_id: self.id,
            expires_at: Utc::now() + chrono::Duration::from_std(duration).unwrap(),
            duration,
        })
    }

    async fn renew(&self, _: LeaseId, duration: Duration) -> Result<DateTime<Utc>, RemoteError> {
        Ok(Utc::now() + chrono::Duration::from_std(duration).unwrap())
    }

    async fn cancel(&self, lease_id: LeaseId) -> Result<(), RemoteError> {
        self.recorded.lock().unwrap().cancelled.push(lease_id);
        Ok(())
    }

    async fn update(
        &self,
        _: LeaseId,
        _: ResourceCapability,
        deployments: Vec<DeployedService>,
        _: u32,
    ) -> Result<(), RemoteError> {
        self.recorded.lock().unwrap().updates.push(deployments);
        Ok(())
    }
}

fn test_config() -> Config {
    Config {
        service_limit: 4,
        lease_duration: Duration::from_secs(5),
        activation_timeout: Duration::from_secs(1),
        ..Config::default()
    }
}

fn fixed_probe() -> SystemResources {
    SystemResources {
        cpu_cores: 8,
        total_memory_bytes: 16 << 30,
        available_memory_bytes: 12 << 30,
    }
}

#[tokio::test]
async fn test_node_registers_hosts_and_shuts_down() {
    let config = test_config();
    let runtime = Arc::new(MockRuntime::with_delay(Duration::from_millis(5)));
    let host = Arc::new(ContainerHost::new(&config, runtime.clone()));

    let monitor = ResourceMonitor::new(host.clone(), config.capacity_threshold, Duration::from_secs(60))
        .with_probe(Arc::new(fixed_probe));
    let (_cap_tx, cap_rx) = monitor.channel();
    assert!(cap_rx.borrow().is_within_range());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let client = MembershipClient::new(MembershipConfig::from(&config), host.clone(), cap_rx, shutdown_rx);
    let registrar = InMemoryRegistrar::new();

    client.register_with(registrar.clone()).await.unwrap();
    {
        let recorded = registrar.recorded.lock().unwrap();
        assert_eq!(recorded.registrations.len(), 1);
        assert_eq!(recorded.registrations[0].node_id, host.node_id());
        assert_eq!(recorded.registrations[0].service_limit, 4);
    }

    let updates = tokio::spawn(client.clone().run_updates());

    let spec = SpecBuilder::new("worker").planned(2).build();
    let record = host
        .instantiate(spec.snapshot_for(1), NullDeployment::new(spec.key()))
        .await
        .unwrap()
        .expect("instance should start");
    assert_eq!(record.instance_number(), Some(1));
    assert_eq!(runtime.running_count(), 1);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let pushed = registrar.updates();
    let last = pushed.last().expect("deployment update pushed");
    assert_eq!(last[0].key, spec.key());
    assert_eq!(last[0].instances, 1);

    shutdown_tx.send(true).unwrap();
    updates.await.unwrap();

    assert_eq!(client.cancel_all().await, 1);
    assert_eq!(host.shutdown().await, 1);
    assert_eq!(host.instance_count(), 0);
    assert_eq!(registrar.recorded.lock().unwrap().cancelled.len(), 1);
}

#[tokio::test]
async fn test_self_destroy_reaches_deployment_manager() {
    let config = test_config();
    let host = Arc::new(ContainerHost::new(&config, Arc::new(MockRuntime::with_delay(Duration::ZERO))));
    let spec = SpecBuilder::new("api").build();
    let deployment = NullDeployment::new(spec.key());

    let record = host
        .instantiate(spec.snapshot_for(1), deployment.clone())
        .await
        .unwrap()
        .unwrap();

    assert!(host.terminate_instance(record.instance_id).await);
    assert_eq!(deployment.terminated(), vec![record.instance_id]);
    assert!(host.deployments().is_empty());
}
