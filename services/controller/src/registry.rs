//! Executor registry: the controller side of the lease protocol.
//!
//! Executors register with a capability snapshot and their deployment list
//! and receive a lease. The registry keeps the latest view of every leased
//! executor for placement, publishes membership changes, and wakes the
//! dispatch queue whenever capacity becomes available.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_id::{ControllerId, LeaseId, NodeId};
use fleet_proto::{
    DeployedService, Executor, ExecutorRegistration, Lease, LeaseRegistrar, RemoteError,
    ResourceCapability, SpecKey,
};
use tokio::sync::{broadcast, Notify};
use tracing::{debug, info, instrument, warn};

/// Membership change published by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    Added(NodeId),
    Updated(NodeId),
    /// Lease cancelled or expired.
    Removed(NodeId),
}

/// Placement view of one leased executor.
#[derive(Clone)]
pub struct ExecutorView {
    pub node_id: NodeId,
    pub host_address: String,
    pub executor: Arc<dyn Executor>,
    pub capability: ResourceCapability,
    pub service_limit: u32,
    /// Instances per specification, reported plus placed since the last report.
    pub deployments: HashMap<SpecKey, u32>,
    pub lease_id: LeaseId,
    pub expires_at: DateTime<Utc>,
}

impl ExecutorView {
    /// Instances of `key` on this executor.
    pub fn count(&self, key: &SpecKey) -> u32 {
        self.deployments.get(key).copied().unwrap_or(0)
    }

    /// Instances of every specification on this executor.
    pub fn placed(&self) -> u32 {
        self.deployments.values().sum()
    }

    /// Fraction of the service limit in use.
    pub fn load(&self) -> f64 {
        if self.service_limit == 0 {
            return 1.0;
        }
        f64::from(self.placed()) / f64::from(self.service_limit)
    }
}

impl std::fmt::Debug for ExecutorView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorView")
            .field("node_id", &self.node_id)
            .field("host_address", &self.host_address)
            .field("service_limit", &self.service_limit)
            .field("placed", &self.placed())
            .field("lease_id", &self.lease_id)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

fn deployment_map(deployments: &[DeployedService]) -> HashMap<SpecKey, u32> {
    deployments
        .iter()
        .map(|d| (d.key.clone(), d.instances))
        .collect()
}

/// Leased executors known to one controller.
pub struct ExecutorRegistry {
    controller_id: ControllerId,
    max_lease: Duration,
    allowed: Option<HashSet<NodeId>>,
    entries: RwLock<HashMap<LeaseId, ExecutorView>>,
    events: broadcast::Sender<MembershipEvent>,
    capacity: Arc<Notify>,
}

impl ExecutorRegistry {
    pub fn new(controller_id: ControllerId, max_lease: Duration) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            controller_id,
            max_lease,
            allowed: None,
            entries: RwLock::new(HashMap::new()),
            events,
            capacity: Arc::new(Notify::new()),
        }
    }

    /// Only accept registrations from these nodes.
    pub fn with_allow_list(mut self, nodes: impl IntoIterator<Item = NodeId>) -> Self {
        self.allowed = Some(nodes.into_iter().collect());
        self
    }

    /// Notified whenever new executor capacity becomes known.
    pub fn capacity_notify(&self) -> Arc<Notify> {
        Arc::clone(&self.capacity)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<LeaseId, ExecutorView>> {
        match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<LeaseId, ExecutorView>> {
        match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Every leased executor, ordered by node id.
    pub fn snapshot(&self) -> Vec<ExecutorView> {
        let mut views: Vec<_> = self.read().values().cloned().collect();
        views.sort_by_key(|v| v.node_id);
        views
    }

    pub fn get(&self, node_id: NodeId) -> Option<ExecutorView> {
        self.read().values().find(|v| v.node_id == node_id).cloned()
    }

    pub fn contains(&self, node_id: NodeId) -> bool {
        self.read().values().any(|v| v.node_id == node_id)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Count a placement before the executor's next report arrives.
    pub fn record_placement(&self, node_id: NodeId, key: &SpecKey) {
        if let Some(view) = self.write().values_mut().find(|v| v.node_id == node_id) {
            *view.deployments.entry(key.clone()).or_insert(0) += 1;
        }
    }

    /// Uncount an instance that left `node_id` before the executor's next
    /// report arrives.
    pub fn record_removal(&self, node_id: NodeId, key: &SpecKey) {
        if let Some(view) = self.write().values_mut().find(|v| v.node_id == node_id) {
            if let Some(count) = view.deployments.get_mut(key) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    view.deployments.remove(key);
                }
            }
        }
        self.wake();
    }

    /// Drop every lease that expired before `now`. Returns the removed nodes.
    #[instrument(skip(self))]
    pub fn reap_expired(&self, now: DateTime<Utc>) -> Vec<NodeId> {
        let expired: Vec<_> = {
            let mut entries = self.write();
            let lease_ids: Vec<_> = entries
                .iter()
                .filter(|(_, v)| v.expires_at <= now)
                .map(|(id, _)| *id)
                .collect();
            lease_ids
                .into_iter()
                .filter_map(|id| entries.remove(&id))
                .collect()
        };

        for view in &expired {
            warn!(node_id = %view.node_id, lease_id = %view.lease_id, "Executor lease expired");
            self.publish(MembershipEvent::Removed(view.node_id));
        }
        expired.into_iter().map(|v| v.node_id).collect()
    }

    fn lease_duration(&self, requested: Duration) -> Duration {
        if requested.is_zero() {
            self.max_lease
        } else {
            requested.min(self.max_lease)
        }
    }

    fn expiry(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
        now + chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::seconds(60))
    }

    fn publish(&self, event: MembershipEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    fn wake(&self) {
        self.capacity.notify_one();
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("controller_id", &self.controller_id)
            .field("max_lease", &self.max_lease)
            .field("executors", &self.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl LeaseRegistrar for ExecutorRegistry {
    fn controller_id(&self) -> ControllerId {
        self.controller_id
    }

    #[instrument(skip_all, fields(node_id = %registration.node_id))]
    async fn register(&self, registration: ExecutorRegistration) -> Result<Lease, RemoteError> {
        if let Some(allowed) = &self.allowed {
            if !allowed.contains(&registration.node_id) {
                warn!("Refusing registration from node outside the allow list");
                return Err(RemoteError::PermissionDenied(format!(
                    "node {} is not allowed to register",
                    registration.node_id
                )));
            }
        }

        let now = Utc::now();
        let duration = self.lease_duration(registration.requested);
        let lease = Lease {
            lease_id: LeaseId::new(),
            controller_id: self.controller_id,
            expires_at: Self::expiry(now, duration),
            duration,
        };
        let within_range = registration.capability.is_within_range();
        let node_id = registration.node_id;

        let replaced = {
            let mut entries = self.write();
            let previous: Vec<_> = entries
                .iter()
                .filter(|(_, v)| v.node_id == node_id)
                .map(|(id, _)| *id)
                .collect();
            for id in &previous {
                entries.remove(id);
            }
            entries.insert(
                lease.lease_id,
                ExecutorView {
                    node_id,
                    host_address: registration.host_address,
                    executor: registration.executor,
                    capability: registration.capability,
                    service_limit: registration.service_limit,
                    deployments: deployment_map(&registration.deployments),
                    lease_id: lease.lease_id,
                    expires_at: lease.expires_at,
                },
            );
            !previous.is_empty()
        };

        info!(
            lease_id = %lease.lease_id,
            duration_secs = duration.as_secs(),
            replaced,
            within_range,
            "Executor registered"
        );

        self.publish(if replaced {
            MembershipEvent::Updated(node_id)
        } else {
            MembershipEvent::Added(node_id)
        });
        if within_range {
            self.wake();
        }
        Ok(lease)
    }

    async fn renew(&self, lease_id: LeaseId, duration: Duration) -> Result<DateTime<Utc>, RemoteError> {
        let expires_at = Self::expiry(Utc::now(), self.lease_duration(duration));
        match self.write().get_mut(&lease_id) {
            Some(view) => {
                view.expires_at = expires_at;
                debug!(lease_id = %lease_id, node_id = %view.node_id, "Lease renewed");
                Ok(expires_at)
            }
            None => Err(RemoteError::UnknownLease(lease_id)),
        }
    }

    async fn cancel(&self, lease_id: LeaseId) -> Result<(), RemoteError> {
        let removed = self.write().remove(&lease_id);
        match removed {
            Some(view) => {
                info!(lease_id = %lease_id, node_id = %view.node_id, "Executor lease cancelled");
                self.publish(MembershipEvent::Removed(view.node_id));
                Ok(())
            }
            None => Err(RemoteError::UnknownLease(lease_id)),
        }
    }

    async fn update(
        &self,
        lease_id: LeaseId,
        capability: ResourceCapability,
        deployments: Vec<DeployedService>,
        service_limit: u32,
    ) -> Result<(), RemoteError> {
        let (node_id, back_in_range) = {
            let mut entries = self.write();
            let Some(view) = entries.get_mut(&lease_id) else {
                return Err(RemoteError::UnknownLease(lease_id));
            };
            let back_in_range =
                !view.capability.is_within_range() && capability.is_within_range();
            view.capability = capability;
            view.deployments = deployment_map(&deployments);
            view.service_limit = service_limit;
            (view.node_id, back_in_range)
        };

        debug!(node_id = %node_id, back_in_range, "Executor capacity updated");
        self.publish(MembershipEvent::Updated(node_id));
        if back_in_range {
            self.wake();
        }
        Ok(())
    }
}
