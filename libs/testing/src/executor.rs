use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fleet_id::{InstanceId, NodeId};
use fleet_proto::{
    DeploymentRef, Executor, ExecutorRegistration, InstanceRecord, InstantiationError,
    RemoteError, ServiceSpec, SpecKey,
};

use crate::proxy::FakeProxy;

/// What the next instantiate calls do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstantiateBehavior {
    /// Start instances until `capacity` are running, then decline.
    Accept,
    /// Always decline.
    Decline,
    /// Fail with the given retryability.
    Fail { retryable: bool },
}

#[derive(Default)]
struct FakeState {
    behavior: Option<InstantiateBehavior>,
    instances: Vec<(InstanceRecord, Arc<FakeProxy>)>,
    calls: usize,
    updates: HashMap<SpecKey, usize>,
}

/// In-memory executor.
pub struct FakeExecutor {
    node_id: NodeId,
    host_address: String,
    capacity: usize,
    state: Mutex<FakeState>,
}

impl FakeExecutor {
    pub fn new(capacity: usize) -> Arc<Self> {
        let node_id = NodeId::new();
        Arc::new(Self {
            node_id,
            host_address: format!("fake-{}", node_id.short()),
            capacity,
            state: Mutex::new(FakeState::default()),
        })
    }

    pub fn host_address(&self) -> &str {
        &self.host_address
    }

    /// A registration for this executor with an idle capability.
    pub fn registration(self: &Arc<Self>, service_limit: u32) -> ExecutorRegistration {
        let executor: Arc<dyn Executor> = self.clone();
        ExecutorRegistration {
            node_id: self.node_id,
            host_address: self.host_address.clone(),
            executor,
            capability: crate::idle_capability(self.node_id),
            deployments: Vec::new(),
            service_limit,
            requested: Duration::from_secs(30),
        }
    }

    pub fn set_behavior(&self, behavior: InstantiateBehavior) {
        if let Ok(mut state) = self.state.lock() {
            state.behavior = Some(behavior);
        }
    }

    /// Live (not destroyed) instances.
    pub fn running(&self) -> Vec<InstanceRecord> {
        self.state
            .lock()
            .map(|s| {
                s.instances
                    .iter()
                    .filter(|(_, p)| p.is_alive())
                    .map(|(r, _)| r.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn proxy(&self, instance_id: InstanceId) -> Option<Arc<FakeProxy>> {
        self.state.lock().ok().and_then(|s| {
            s.instances
                .iter()
                .find(|(r, _)| r.instance_id == instance_id)
                .map(|(_, p)| Arc::clone(p))
        })
    }

    pub fn calls(&self) -> usize {
        self.state.lock().map(|s| s.calls).unwrap_or(0)
    }

    pub fn updates(&self, key: &SpecKey) -> usize {
        self.state
            .lock()
            .map(|s| s.updates.get(key).copied().unwrap_or(0))
            .unwrap_or(0)
    }
}

#[async_trait]
impl Executor for FakeExecutor {
    fn node_id(&self) -> NodeId {
        self.node_id
    }

    async fn instantiate(
        &self,
        spec: ServiceSpec,
        _deployment: DeploymentRef,
    ) -> Result<Option<InstanceRecord>, InstantiationError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| InstantiationError::retryable("fake executor poisoned"))?;
        state.calls += 1;

        match state.behavior.clone().unwrap_or(InstantiateBehavior::Accept) {
            InstantiateBehavior::Decline => return Ok(None),
            InstantiateBehavior::Fail { retryable } => {
                return Err(InstantiationError {
                    reason: "scripted failure".to_string(),
                    retryable,
                })
            }
            InstantiateBehavior::Accept => {}
        }

        let running = state.instances.iter().filter(|(_, p)| p.is_alive()).count();
        if running >= self.capacity {
            return Ok(None);
        }

        let proxy = FakeProxy::new();
        let record = InstanceRecord {
            instance_id: InstanceId::new(),
            key: spec.key(),
            handle: proxy.clone(),
            bean_config: spec.bean_config.clone(),
            host_address: self.host_address.clone(),
            node_id: self.node_id,
        };
        state.instances.push((record.clone(), proxy));
        Ok(Some(record))
    }

    async fn update(
        &self,
        spec: ServiceSpec,
        _deployment: DeploymentRef,
    ) -> Result<usize, RemoteError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| RemoteError::Uncategorized("fake executor poisoned".to_string()))?;
        let key = spec.key();
        let patched = state
            .instances
            .iter()
            .filter(|(r, p)| r.key == key && p.is_alive())
            .count();
        *state.updates.entry(key).or_default() += 1;
        Ok(patched)
    }
}
