//! End-to-end reconciliation tests.
//!
//! A real controller (registry, dispatch queue, deployer, worker) drives
//! real executor nodes (container host, mock runtime, membership client)
//! inside one process:
//!
//! 1. Shortfall against an empty pool heals once capacity registers
//! 2. A healthy pool converges on the planned count
//! 3. A crashed instance comes back with its number and host history
//! 4. The increment ceiling holds for both tiers
//! 5. Losing a node's lease re-provisions its instances
//!
//! ## Running
//!
//! ```bash
//! cargo test -p fleet-e2e --test reconcile_loop
//! ```

use std::sync::{Arc, Once};
use std::time::Duration;

use fleet_controller::{
    local, ControllerWorker, Deployer, DispatchQueue, ExecutorRegistry, FaultMonitorFactory,
    LeastLoadedSelector, LocalNode, ManagerContext, WorkerConfig,
};
use fleet_events::{EventNotifier, LifecycleAction};
use fleet_executor::MockRuntime;
use fleet_id::ControllerId;
use fleet_proto::{LeaseRegistrar, LivenessStrategy, SpecKey};
use fleet_testing::{RecordingListener, SpecBuilder};
use tokio::sync::watch;
use tokio::task::JoinHandle;

static TRACING: Once = Once::new();

fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

struct Cluster {
    registry: Arc<ExecutorRegistry>,
    queue: Arc<DispatchQueue>,
    deployer: Arc<Deployer>,
    events: Arc<RecordingListener>,
    nodes: Vec<LocalNode>,
    shutdown: watch::Sender<bool>,
    worker: Option<JoinHandle<()>>,
}

impl Cluster {
    fn new() -> Self {
        init_tracing();
        let registry = Arc::new(ExecutorRegistry::new(
            ControllerId::new(),
            Duration::from_secs(30),
        ));
        let queue = Arc::new(DispatchQueue::new(
            registry.clone(),
            Arc::new(LeastLoadedSelector),
            8,
        ));
        let notifier = Arc::new(EventNotifier::new());
        let events = RecordingListener::new();
        notifier.register(events.clone());
        let deployer = Arc::new(Deployer::new(
            ManagerContext {
                queue: queue.clone(),
                registry: registry.clone(),
                notifier,
                monitors: FaultMonitorFactory::default(),
            },
            LivenessStrategy::Heartbeat {
                interval_ms: 20,
                misses: 2,
            },
        ));
        let (shutdown, _) = watch::channel(false);

        Self {
            registry,
            queue,
            deployer,
            events,
            nodes: Vec::new(),
            shutdown,
            worker: None,
        }
    }

    /// Run the controller worker with short intervals.
    fn start_worker(&mut self) {
        let worker = ControllerWorker::new(
            self.deployer.clone(),
            self.queue.clone(),
            self.registry.clone(),
            WorkerConfig {
                reconcile_interval: Duration::from_millis(50),
                reap_interval: Duration::from_millis(50),
            },
        );
        let shutdown = self.shutdown.subscribe();
        self.worker = Some(tokio::spawn(async move { worker.run(shutdown).await }));
    }

    async fn add_node(&mut self, service_limit: u32) -> usize {
        let template = fleet_executor::Config {
            service_limit,
            activation_timeout: Duration::from_secs(1),
            registration_retry_delay: Duration::from_millis(10),
            ..fleet_executor::Config::default()
        };
        let registrar: Arc<dyn LeaseRegistrar> = self.registry.clone();
        let node = LocalNode::start(
            local::node_config(&template, self.nodes.len()),
            Arc::new(MockRuntime::with_delay(Duration::ZERO)),
            registrar,
        )
        .await
        .unwrap();
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    async fn shutdown(mut self) {
        self.shutdown.send_replace(true);
        if let Some(worker) = self.worker.take() {
            worker.await.unwrap();
        }
        self.deployer.undeploy_all(true).await;
        for node in self.nodes {
            node.stop().await;
        }
    }
}

/// Poll `condition` until it holds or two seconds pass.
async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[tokio::test]
async fn test_shortfall_heals_when_capacity_registers() {
    let mut cluster = Cluster::new();
    let key = cluster
        .deployer
        .submit(SpecBuilder::new("worker").planned(3).build())
        .unwrap();

    let status = cluster.deployer.manager(&key).unwrap().status();
    assert_eq!((status.pending, status.actual), (3, 0));

    cluster.add_node(1).await;
    cluster.queue.process().await;

    let status = cluster.deployer.manager(&key).unwrap().status();
    assert_eq!(status.actual, 1);
    assert_eq!(status.pending, 2);
    assert!(status.convergence.is_converging());

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_pool_converges_on_planned() {
    let mut cluster = Cluster::new();
    cluster.add_node(8).await;
    cluster.add_node(8).await;
    cluster.start_worker();

    let key = cluster
        .deployer
        .submit(SpecBuilder::new("worker").planned(4).build())
        .unwrap();
    let manager = cluster.deployer.manager(&key).unwrap();

    assert!(eventually(|| manager.status().convergence.is_converged()).await);
    let running: usize = cluster.nodes.iter().map(|n| n.runtime.running_count()).sum();
    assert_eq!(running, 4);
    let mut numbers: Vec<_> = manager
        .instances()
        .iter()
        .filter_map(|r| r.instance_number())
        .collect();
    numbers.sort_unstable();
    assert_eq!(numbers, vec![1, 2, 3, 4]);
    assert_eq!(cluster.events.count(LifecycleAction::Provisioned), 4);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_crashed_instance_returns_with_its_number() {
    let mut cluster = Cluster::new();
    cluster.add_node(4).await;
    cluster.add_node(4).await;
    cluster.start_worker();

    let key = cluster
        .deployer
        .submit(SpecBuilder::new("worker").build())
        .unwrap();
    let manager = cluster.deployer.manager(&key).unwrap();
    assert!(eventually(|| manager.actual() == 1).await);

    let failed = manager.instances().remove(0);
    let host = cluster
        .nodes
        .iter()
        .find(|n| n.node_id() == failed.node_id)
        .unwrap();
    assert!(host.runtime.crash(failed.instance_id));

    assert!(
        eventually(|| manager
            .instances()
            .first()
            .is_some_and(|r| r.instance_id != failed.instance_id))
        .await
    );
    let replacement = manager.instances().remove(0);
    assert_eq!(replacement.instance_number(), failed.instance_number());
    assert_eq!(replacement.bean_config.host_history, vec![failed.node_id]);
    assert_ne!(replacement.node_id, failed.node_id);
    assert_eq!(cluster.events.count(LifecycleAction::Failed), 1);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_increment_ceiling_holds_for_both_tiers() {
    let mut cluster = Cluster::new();
    cluster.add_node(8).await;
    let key = cluster
        .deployer
        .submit(SpecBuilder::new("worker").planned(2).limits(&[2]).build())
        .unwrap();
    let manager = cluster.deployer.manager(&key).unwrap();

    assert!(manager.increment(false).is_none());
    assert!(manager.increment(true).is_none());
    assert_eq!(manager.planned(), 2);
    assert_eq!(manager.status().baseline, 2);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_lost_lease_reprovisions_instances() {
    let mut cluster = Cluster::new();
    cluster.add_node(4).await;
    cluster.add_node(4).await;
    cluster.start_worker();

    let key: SpecKey = cluster
        .deployer
        .submit(SpecBuilder::new("worker").planned(2).build())
        .unwrap();
    let manager = cluster.deployer.manager(&key).unwrap();
    assert!(eventually(|| manager.status().convergence.is_converged()).await);

    let lost_node = manager.instances()[0].node_id;
    let hosted = manager
        .instances()
        .iter()
        .filter(|r| r.node_id == lost_node)
        .count();
    let lost = cluster
        .nodes
        .iter()
        .find(|n| n.node_id() == lost_node)
        .unwrap();
    let lease = lost
        .membership
        .lease(cluster.registry.controller_id())
        .unwrap();
    cluster.registry.cancel(lease.lease_id).await.unwrap();

    assert!(eventually(|| cluster.events.count(LifecycleAction::Failed) == hosted).await);
    assert!(eventually(|| manager.status().convergence.is_converged()).await);
    assert_eq!(manager.planned(), 2);
    assert_eq!(manager.actual(), 2);
    assert!(manager.instances().iter().all(|r| r.node_id != lost_node));

    cluster.shutdown().await;
}
