//! Remote interfaces between controllers and executors.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_id::{ControllerId, InstanceId, LeaseId, NodeId};

use crate::capability::{DeployedService, ResourceCapability};
use crate::error::{InstantiationError, RemoteError};
use crate::record::InstanceRecord;
use crate::spec::{ServiceSpec, SpecKey};

/// Controller-side manager of one specification, as seen by executors.
#[async_trait]
pub trait DeploymentManager: Send + Sync {
    fn key(&self) -> SpecKey;

    /// Whether the manager still issues work for its specification.
    fn is_active(&self) -> bool;

    /// An instance hosted for this manager finished tearing down.
    async fn instance_terminated(&self, instance_id: InstanceId);
}

pub type DeploymentRef = Arc<dyn DeploymentManager>;

/// A node able to host service instances.
#[async_trait]
pub trait Executor: Send + Sync {
    fn node_id(&self) -> NodeId;

    /// Start one instance of `spec`.
    ///
    /// Returns `Ok(None)` when the node declines for capacity reasons.
    async fn instantiate(
        &self,
        spec: ServiceSpec,
        deployment: DeploymentRef,
    ) -> Result<Option<InstanceRecord>, InstantiationError>;

    /// Live-patch every instance of `spec` hosted here. Returns the number
    /// of instances patched in place.
    async fn update(&self, spec: ServiceSpec, deployment: DeploymentRef)
        -> Result<usize, RemoteError>;
}

/// What an executor presents when asking for a lease.
#[derive(Clone)]
pub struct ExecutorRegistration {
    pub node_id: NodeId,
    pub host_address: String,
    pub executor: Arc<dyn Executor>,
    pub capability: ResourceCapability,
    pub deployments: Vec<DeployedService>,
    /// Maximum number of instances the executor will host.
    pub service_limit: u32,
    pub requested: Duration,
}

impl std::fmt::Debug for ExecutorRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistration")
            .field("node_id", &self.node_id)
            .field("host_address", &self.host_address)
            .field("service_limit", &self.service_limit)
            .field("requested", &self.requested)
            .finish_non_exhaustive()
    }
}

/// A granted membership lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub lease_id: LeaseId,
    pub controller_id: ControllerId,
    pub expires_at: DateTime<Utc>,
    /// Granted duration; may be shorter than requested.
    pub duration: Duration,
}

impl Lease {
    /// Time left until expiry, zero if already expired.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Controller-side membership endpoint.
#[async_trait]
pub trait LeaseRegistrar: Send + Sync {
    fn controller_id(&self) -> ControllerId;

    async fn register(&self, registration: ExecutorRegistration) -> Result<Lease, RemoteError>;

    /// Extend a lease; returns the new expiry.
    async fn renew(&self, lease_id: LeaseId, duration: Duration)
        -> Result<DateTime<Utc>, RemoteError>;

    async fn cancel(&self, lease_id: LeaseId) -> Result<(), RemoteError>;

    /// Push a fresh capacity snapshot and deployment list.
    async fn update(
        &self,
        lease_id: LeaseId,
        capability: ResourceCapability,
        deployments: Vec<DeployedService>,
        service_limit: u32,
    ) -> Result<(), RemoteError>;
}
