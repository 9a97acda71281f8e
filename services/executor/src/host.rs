//! Container host: every container on this node behind one [`Executor`].

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use fleet_id::{InstanceId, NodeId};
use fleet_proto::{
    DeployedService, DeploymentRef, Executor, InstanceRecord, InstantiationError, RemoteError,
    ResourceCapability, ServiceSpec, SpecKey,
};
use fleet_reconcile::SpecHash;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::container::{ContainerSettings, ContainerState, ServiceContainer};
use crate::error::ContainerError;
use crate::reservation::ReservationLedger;
use crate::resources::SystemResources;
use crate::runtime::ServiceRuntime;
use crate::state::{InstancePhase, StateStore, StateStoreError, StoredInstance};

type Containers = Arc<RwLock<HashMap<InstanceId, Arc<ServiceContainer>>>>;

/// Hosts service containers for one node.
pub struct ContainerHost {
    settings: ContainerSettings,
    runtime: Arc<dyn ServiceRuntime>,
    ledger: Arc<ReservationLedger>,
    workers: Arc<Semaphore>,
    containers: Containers,
    store: Option<Arc<Mutex<StateStore>>>,
    /// Bumped whenever the hosted set changes.
    changes: Arc<watch::Sender<u64>>,
}

impl ContainerHost {
    pub fn new(config: &Config, runtime: Arc<dyn ServiceRuntime>) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            settings: ContainerSettings {
                node_id: config.node_id,
                host_address: config.host_address.clone(),
                activation_timeout: config.activation_timeout,
            },
            runtime,
            ledger: Arc::new(ReservationLedger::new(config.service_limit)),
            workers: Arc::new(Semaphore::new(config.activation_workers.max(1))),
            containers: Arc::new(RwLock::new(HashMap::new())),
            store: None,
            changes: Arc::new(changes),
        }
    }

    /// Build a host, opening the state store when a data directory is set.
    pub fn open(config: &Config, runtime: Arc<dyn ServiceRuntime>) -> Result<Self, ContainerError> {
        let host = Self::new(config, runtime);
        match &config.data_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir).map_err(|e| {
                    StateStoreError::Invalid(format!("cannot create {}: {e}", dir.display()))
                })?;
                host.with_store(&dir.join("executor.db"))
            }
            None => Ok(host),
        }
    }

    /// Attach a state store, clearing rows left by a previous run.
    pub fn with_store(mut self, path: &Path) -> Result<Self, ContainerError> {
        let store = StateStore::open(path)?;
        let stale = store.list_instances()?;
        for row in &stale {
            warn!(
                instance_id = %row.instance_id,
                spec = %row.spec_key,
                phase = ?row.phase,
                "Discarding instance left by previous run"
            );
        }
        if !stale.is_empty() {
            store.clear_instances()?;
        }
        info!(path = %path.display(), stale = stale.len(), "State store opened");
        self.store = Some(Arc::new(Mutex::new(store)));
        Ok(self)
    }

    pub fn node_id(&self) -> NodeId {
        self.settings.node_id
    }

    pub fn host_address(&self) -> &str {
        &self.settings.host_address
    }

    pub fn service_limit(&self) -> u32 {
        self.ledger.service_limit()
    }

    pub fn activation_timeout(&self) -> Duration {
        self.settings.activation_timeout
    }

    /// Containers currently loading or active.
    pub fn instance_count(&self) -> usize {
        self.snapshot()
            .iter()
            .filter(|c| matches!(c.state(), ContainerState::Loading | ContainerState::Active))
            .count()
    }

    pub fn container(&self, instance_id: InstanceId) -> Option<Arc<ServiceContainer>> {
        read(&self.containers).get(&instance_id).cloned()
    }

    /// Containers hosting instances of `key`.
    pub fn containers_for(&self, key: &SpecKey) -> Vec<Arc<ServiceContainer>> {
        self.snapshot()
            .into_iter()
            .filter(|c| c.key().as_ref() == Some(key))
            .collect()
    }

    pub fn deployments(&self) -> Vec<DeployedService> {
        self.ledger.deployments()
    }

    /// Combine host measurements with reservations.
    pub fn capability(&self, system: &SystemResources, threshold: f64) -> ResourceCapability {
        let (reserved_cpu, reserved_memory) = self.ledger.reserved();
        let available_memory = system.available_memory_bytes.saturating_sub(reserved_memory);

        let cpu_util = if system.cpu_cores == 0 {
            1.0
        } else {
            reserved_cpu / f64::from(system.cpu_cores)
        };
        let memory_util = if system.total_memory_bytes == 0 {
            1.0
        } else {
            1.0 - available_memory as f64 / system.total_memory_bytes as f64
        };
        let slot_util = if self.service_limit() == 0 {
            1.0
        } else {
            f64::from(self.ledger.total()) / f64::from(self.service_limit())
        };

        ResourceCapability {
            node_id: self.settings.node_id,
            host_address: self.settings.host_address.clone(),
            cpu_cores: system.cpu_cores,
            reserved_cpu,
            total_memory_bytes: system.total_memory_bytes,
            available_memory_bytes: available_memory,
            utilization: cpu_util.max(memory_util).max(slot_util).clamp(0.0, 1.0),
            threshold,
            attributes: Default::default(),
            measured_at: Utc::now(),
        }
    }

    /// Watch channel bumped whenever the hosted set changes.
    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    /// Tear down one instance locally, as if it destroyed itself.
    pub async fn terminate_instance(&self, instance_id: InstanceId) -> bool {
        match self.container(instance_id) {
            Some(container) => container.terminate().await,
            None => false,
        }
    }

    /// Record that an instance's process died.
    pub fn report_exit(&self, instance_id: InstanceId) -> bool {
        self.container(instance_id)
            .map(|c| c.crashed())
            .unwrap_or(false)
    }

    /// Terminate every container. Returns how many were torn down.
    #[instrument(skip(self), fields(node_id = %self.settings.node_id))]
    pub async fn shutdown(&self) -> usize {
        let mut terminated = 0;
        for container in self.snapshot() {
            if container.terminate().await {
                terminated += 1;
            }
        }
        info!(terminated, "Container host shut down");
        terminated
    }

    fn snapshot(&self) -> Vec<Arc<ServiceContainer>> {
        read(&self.containers).values().cloned().collect()
    }

    fn persist<F>(&self, op: F)
    where
        F: FnOnce(&StateStore) -> Result<(), StateStoreError>,
    {
        persist(self.store.as_ref(), op);
    }

    fn bump(&self) {
        self.changes.send_modify(|generation| *generation += 1);
    }
}

fn read(
    containers: &RwLock<HashMap<InstanceId, Arc<ServiceContainer>>>,
) -> std::sync::RwLockReadGuard<'_, HashMap<InstanceId, Arc<ServiceContainer>>> {
    match containers.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn remove(containers: &Containers, instance_id: InstanceId) -> Option<Arc<ServiceContainer>> {
    match containers.write() {
        Ok(mut guard) => guard.remove(&instance_id),
        Err(poisoned) => poisoned.into_inner().remove(&instance_id),
    }
}

fn persist<F>(store: Option<&Arc<Mutex<StateStore>>>, op: F)
where
    F: FnOnce(&StateStore) -> Result<(), StateStoreError>,
{
    let Some(store) = store else {
        return;
    };
    let guard = match store.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    if let Err(e) = op(&guard) {
        warn!(error = %e, "State store write failed");
    }
}

fn spec_hash(spec: &ServiceSpec) -> String {
    serde_json::to_value(spec)
        .map(|json| SpecHash::from_json(&json).to_string())
        .unwrap_or_default()
}

#[async_trait]
impl Executor for ContainerHost {
    fn node_id(&self) -> NodeId {
        self.settings.node_id
    }

    #[instrument(skip(self, spec, deployment), fields(node_id = %self.settings.node_id, spec = %spec.key()))]
    async fn instantiate(
        &self,
        spec: ServiceSpec,
        deployment: DeploymentRef,
    ) -> Result<Option<InstanceRecord>, InstantiationError> {
        let container = ServiceContainer::new(
            self.settings.clone(),
            Arc::clone(&self.runtime),
            Arc::clone(&self.ledger),
            Arc::clone(&self.workers),
        );
        let instance_id = container.instance_id();

        {
            let containers = Arc::clone(&self.containers);
            let store = self.store.clone();
            let changes = Arc::clone(&self.changes);
            container.add_listener(Arc::new(move |instance_id: InstanceId, key: &SpecKey| {
                remove(&containers, instance_id);
                persist(store.as_ref(), |s| s.delete_instance(&instance_id.to_string()));
                changes.send_modify(|generation| *generation += 1);
                debug!(instance_id = %instance_id, spec = %key, "Container released");
            }));
        }

        match self.containers.write() {
            Ok(mut guard) => guard.insert(instance_id, Arc::clone(&container)),
            Err(poisoned) => poisoned.into_inner().insert(instance_id, Arc::clone(&container)),
        };

        let now = Utc::now().timestamp();
        let row = StoredInstance {
            instance_id: instance_id.to_string(),
            spec_key: spec.key().to_string(),
            instance_number: spec.instance_number().and_then(|n| i64::try_from(n).ok()),
            phase: InstancePhase::Loading,
            spec_hash: spec_hash(&spec),
            created_at: now,
            updated_at: now,
        };
        self.persist(|s| s.upsert_instance(&row));

        let result = container.activate(spec, deployment).await;
        match &result {
            Ok(Some(_)) => {
                self.persist(|s| s.set_instance_phase(&row.instance_id, InstancePhase::Running));
                self.bump();
            }
            Ok(None) | Err(_) => {
                remove(&self.containers, instance_id);
                self.persist(|s| s.delete_instance(&row.instance_id));
            }
        }
        result
    }

    async fn update(
        &self,
        spec: ServiceSpec,
        deployment: DeploymentRef,
    ) -> Result<usize, RemoteError> {
        let key = spec.key();
        let mut patched = 0;
        for container in self.containers_for(&key) {
            if container.update(spec.clone(), Arc::clone(&deployment)) {
                patched += 1;
                if let Some(current) = container.spec() {
                    let hash = spec_hash(&current);
                    let id = container.instance_id().to_string();
                    self.persist(|s| {
                        let Some(mut row) = s.get_instance(&id)? else {
                            return Ok(());
                        };
                        row.spec_hash = hash;
                        row.updated_at = Utc::now().timestamp();
                        s.upsert_instance(&row)
                    });
                }
            }
        }
        if patched > 0 {
            self.bump();
        }
        debug!(spec = %key, patched, "Applied live update");
        Ok(patched)
    }
}

impl std::fmt::Debug for ContainerHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerHost")
            .field("node_id", &self.settings.node_id)
            .field("containers", &read(&self.containers).len())
            .finish_non_exhaustive()
    }
}
