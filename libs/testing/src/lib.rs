//! Test doubles shared by the fleet crates.
//!
//! - [`SpecBuilder`]: terse construction of [`ServiceSpec`] values
//! - [`FakeExecutor`]: an in-memory [`Executor`] with scriptable outcomes
//! - [`FakeProxy`]: a [`ServiceProxy`] whose liveness tests can flip
//! - [`RecordingListener`]: captures lifecycle events for assertions
//! - [`NullDeployment`]: a [`DeploymentManager`] that only counts calls

mod executor;
mod proxy;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use fleet_events::{EventError, EventListener, LifecycleAction, LifecycleEvent};
use fleet_id::{InstanceId, NodeId};
use fleet_proto::{
    DeploymentManager, LivenessStrategy, PlacementType, ResourceCapability, ServiceSpec, SpecKey,
};

pub use executor::{FakeExecutor, InstantiateBehavior};
pub use proxy::FakeProxy;

/// Builder for specifications used in tests.
#[derive(Debug, Clone)]
pub struct SpecBuilder {
    spec: ServiceSpec,
}

impl SpecBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            spec: ServiceSpec::new("test", name),
        }
    }

    pub fn group(mut self, group: &str) -> Self {
        self.spec.group = group.to_string();
        self
    }

    pub fn planned(mut self, planned: u32) -> Self {
        self.spec.planned = planned;
        self
    }

    pub fn max_per_node(mut self, max: u32) -> Self {
        self.spec.max_per_node = Some(max);
        self
    }

    pub fn placement(mut self, placement: PlacementType) -> Self {
        self.spec.placement = placement;
        self
    }

    pub fn limits(mut self, limits: &[u32]) -> Self {
        self.spec.constraints.service_limits = limits.to_vec();
        self
    }

    pub fn cpu(mut self, cores: f64) -> Self {
        self.spec.constraints.cpu_cores = cores;
        self
    }

    pub fn pinned(mut self, node: NodeId) -> Self {
        self.spec.constraints.pinned_node = Some(node);
        self
    }

    pub fn interface(mut self, interface: &str) -> Self {
        self.spec.interfaces.push(interface.to_string());
        self
    }

    pub fn liveness(mut self, liveness: LivenessStrategy) -> Self {
        self.spec.liveness = liveness;
        self
    }

    /// Heartbeat liveness fast enough for tests.
    pub fn fast_heartbeat(self) -> Self {
        self.liveness(LivenessStrategy::Heartbeat {
            interval_ms: 10,
            misses: 2,
        })
    }

    pub fn build(self) -> ServiceSpec {
        self.spec
    }
}

/// A roomy, idle capability snapshot for `node_id`.
pub fn idle_capability(node_id: NodeId) -> ResourceCapability {
    ResourceCapability {
        node_id,
        host_address: format!("10.0.0.{}", node_id.ulid().random() as u8),
        cpu_cores: 16,
        reserved_cpu: 0.0,
        total_memory_bytes: 64 << 30,
        available_memory_bytes: 48 << 30,
        utilization: 0.1,
        threshold: 0.9,
        attributes: Default::default(),
        measured_at: Utc::now(),
    }
}

/// Listener that keeps every event it sees.
#[derive(Debug, Default)]
pub struct RecordingListener {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn count(&self, action: LifecycleAction) -> usize {
        self.events().iter().filter(|e| e.action == action).count()
    }
}

impl EventListener for RecordingListener {
    fn on_event(&self, event: &LifecycleEvent) -> Result<(), EventError> {
        self.events
            .lock()
            .map_err(|_| EventError::ListenerFailed("poisoned".to_string()))?
            .push(event.clone());
        Ok(())
    }
}

/// Deployment manager that records terminations and nothing else.
#[derive(Debug)]
pub struct NullDeployment {
    key: SpecKey,
    terminated: Mutex<Vec<InstanceId>>,
    calls: AtomicUsize,
}

impl NullDeployment {
    pub fn new(key: SpecKey) -> Arc<Self> {
        Arc::new(Self {
            key,
            terminated: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn terminated(&self) -> Vec<InstanceId> {
        self.terminated.lock().map(|t| t.clone()).unwrap_or_default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeploymentManager for NullDeployment {
    fn key(&self) -> SpecKey {
        self.key.clone()
    }

    fn is_active(&self) -> bool {
        true
    }

    async fn instance_terminated(&self, instance_id: InstanceId) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut terminated) = self.terminated.lock() {
            terminated.push(instance_id);
        }
    }
}
