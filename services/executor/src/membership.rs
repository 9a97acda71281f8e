//! Membership client: leases with every known controller.
//!
//! For each controller the client:
//! - Registers with the node's identity, capability, deployments and a
//!   requested lease duration, retrying indefinite failures
//! - Renews the lease at about half its remaining time, falling back to a
//!   single re-registration before forgetting the controller; a controller
//!   that refuses the renewal is forgotten at once
//! - Pushes capacity and deployment updates when they change
//!
//! Lease trouble never touches running instances; only new registrations
//! and capacity reports are affected.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_id::ControllerId;
use fleet_proto::{
    DeployedService, Executor, ExecutorRegistration, Lease, LeaseRegistrar, RemoteError,
    ResourceCapability,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::error::MembershipError;
use crate::host::ContainerHost;

/// Shortest wait between renewals.
const MIN_RENEWAL_WAIT: Duration = Duration::from_millis(50);

/// Lease-protocol settings.
#[derive(Debug, Clone)]
pub struct MembershipConfig {
    pub lease_duration: Duration,
    pub registration_retries: u32,
    pub retry_delay: Duration,
}

impl From<&Config> for MembershipConfig {
    fn from(config: &Config) -> Self {
        Self {
            lease_duration: config.lease_duration,
            registration_retries: config.registration_retries,
            retry_delay: config.registration_retry_delay,
        }
    }
}

struct Membership {
    registrar: Arc<dyn LeaseRegistrar>,
    lease: Lease,
    renewal: Option<JoinHandle<()>>,
}

/// Executor side of the lease protocol.
pub struct MembershipClient {
    config: MembershipConfig,
    host: Arc<ContainerHost>,
    capability: watch::Receiver<ResourceCapability>,
    memberships: Mutex<HashMap<ControllerId, Membership>>,
    shutdown: watch::Receiver<bool>,
    weak_self: Weak<Self>,
}

impl MembershipClient {
    pub fn new(
        config: MembershipConfig,
        host: Arc<ContainerHost>,
        capability: watch::Receiver<ResourceCapability>,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            config,
            host,
            capability,
            memberships: Mutex::new(HashMap::new()),
            shutdown,
            weak_self: weak_self.clone(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ControllerId, Membership>> {
        match self.memberships.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Controllers currently holding a lease for this node.
    pub fn controllers(&self) -> Vec<ControllerId> {
        self.lock().keys().copied().collect()
    }

    pub fn lease(&self, controller: ControllerId) -> Option<Lease> {
        self.lock().get(&controller).map(|m| m.lease.clone())
    }

    fn registration(&self) -> ExecutorRegistration {
        let executor: Arc<dyn Executor> = self.host.clone();
        ExecutorRegistration {
            node_id: self.host.node_id(),
            host_address: self.host.host_address().to_string(),
            executor,
            capability: self.capability.borrow().clone(),
            deployments: self.host.deployments(),
            service_limit: self.host.service_limit(),
            requested: self.config.lease_duration,
        }
    }

    /// Register with a controller and keep the lease renewed.
    #[instrument(skip_all, fields(controller = %registrar.controller_id(), node_id = %self.host.node_id()))]
    pub async fn register_with(
        &self,
        registrar: Arc<dyn LeaseRegistrar>,
    ) -> Result<Lease, MembershipError> {
        let lease = self.try_register(&registrar).await?;
        self.install(registrar, lease.clone());
        Ok(lease)
    }

    async fn try_register(
        &self,
        registrar: &Arc<dyn LeaseRegistrar>,
    ) -> Result<Lease, MembershipError> {
        let attempts = self.config.registration_retries.saturating_add(1);
        let mut last = None;

        for attempt in 1..=attempts {
            if *self.shutdown.borrow() {
                return Err(MembershipError::ShuttingDown);
            }

            match registrar.register(self.registration()).await {
                Ok(lease) => {
                    info!(
                        lease_id = %lease.lease_id,
                        duration_ms = lease.duration.as_millis() as u64,
                        attempt,
                        "Registered with controller"
                    );
                    return Ok(lease);
                }
                Err(e) if e.is_permission() => {
                    warn!(error = %e, "Controller refused registration");
                    return Err(MembershipError::PermissionDenied(e.to_string()));
                }
                Err(e) => {
                    warn!(error = %e, attempt, attempts, "Registration attempt failed");
                    last = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(self.config.retry_delay).await;
                    }
                }
            }
        }

        Err(MembershipError::Exhausted {
            attempts,
            last: last.unwrap_or_else(|| RemoteError::Uncategorized("no attempt made".to_string())),
        })
    }

    /// Store a lease and (re)start its renewal task.
    fn install(&self, registrar: Arc<dyn LeaseRegistrar>, lease: Lease) {
        let controller = registrar.controller_id();
        let previous = self.lock().insert(
            controller,
            Membership {
                registrar,
                lease,
                renewal: None,
            },
        );
        if let Some(renewal) = previous.and_then(|m| m.renewal) {
            renewal.abort();
        }

        let weak = self.weak_self.clone();
        let renewal = tokio::spawn(renewal_loop(weak, controller));
        match self.lock().get_mut(&controller) {
            Some(membership) => membership.renewal = Some(renewal),
            None => renewal.abort(),
        }
    }

    fn set_expiry(&self, controller: ControllerId, expires_at: DateTime<Utc>) {
        if let Some(membership) = self.lock().get_mut(&controller) {
            membership.lease.expires_at = expires_at;
        }
    }

    fn replace_lease(&self, controller: ControllerId, lease: Lease) {
        if let Some(membership) = self.lock().get_mut(&controller) {
            membership.lease = lease;
        }
    }

    fn forget(&self, controller: ControllerId) {
        self.lock().remove(&controller);
    }

    /// One reconnect-and-register attempt.
    async fn reregister(&self, registrar: &Arc<dyn LeaseRegistrar>) -> Result<Lease, RemoteError> {
        registrar.register(self.registration()).await
    }

    /// Push a capability snapshot and deployment list to every controller.
    /// Returns how many accepted it.
    pub async fn update_all(
        &self,
        capability: ResourceCapability,
        deployments: Vec<DeployedService>,
        service_limit: u32,
    ) -> usize {
        let targets: Vec<_> = self
            .lock()
            .iter()
            .map(|(id, m)| (*id, Arc::clone(&m.registrar), m.lease.lease_id))
            .collect();

        let mut accepted = 0;
        for (controller, registrar, lease_id) in targets {
            match registrar
                .update(lease_id, capability.clone(), deployments.clone(), service_limit)
                .await
            {
                Ok(()) => accepted += 1,
                Err(RemoteError::UnknownLease(_)) => {
                    warn!(controller = %controller, "Controller lost our lease, re-registering");
                    match self.reregister(&registrar).await {
                        Ok(lease) => {
                            self.replace_lease(controller, lease);
                            accepted += 1;
                        }
                        Err(e) => warn!(controller = %controller, error = %e, "Re-registration failed"),
                    }
                }
                Err(e) => warn!(controller = %controller, error = %e, "Capacity update failed"),
            }
        }
        accepted
    }

    /// Push the current capability and deployments.
    pub async fn push_current(&self) -> usize {
        let capability = self.capability.borrow().clone();
        self.update_all(capability, self.host.deployments(), self.host.service_limit())
            .await
    }

    /// Cancel every lease. Returns how many were cancelled cleanly.
    #[instrument(skip(self), fields(node_id = %self.host.node_id()))]
    pub async fn cancel_all(&self) -> usize {
        let memberships: Vec<_> = self.lock().drain().collect();
        let mut cancelled = 0;
        for (controller, membership) in memberships {
            if let Some(renewal) = membership.renewal {
                renewal.abort();
            }
            match membership.registrar.cancel(membership.lease.lease_id).await {
                Ok(()) => cancelled += 1,
                Err(e) => warn!(controller = %controller, error = %e, "Lease cancel failed"),
            }
        }
        info!(cancelled, "Cancelled leases");
        cancelled
    }

    /// Push updates whenever capacity crosses the threshold or the hosted
    /// set changes, until shutdown.
    #[instrument(skip_all, fields(node_id = %self.host.node_id()))]
    pub async fn run_updates(self: Arc<Self>) {
        let mut capability = self.capability.clone();
        let mut changes = self.host.subscribe_changes();
        let mut shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                changed = capability.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let pushed = self.push_current().await;
                    debug!(pushed, "Pushed capacity update");
                }
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let pushed = self.push_current().await;
                    debug!(pushed, "Pushed deployment update");
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Membership updates shutting down");
                        break;
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for MembershipClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MembershipClient")
            .field("node_id", &self.host.node_id())
            .field("controllers", &self.lock().len())
            .finish_non_exhaustive()
    }
}

/// Keep one lease alive until it is lost, forgotten or shutdown.
async fn renewal_loop(client: Weak<MembershipClient>, controller: ControllerId) {
    loop {
        let (registrar, lease, duration, mut shutdown) = {
            let Some(client) = client.upgrade() else {
                return;
            };
            let Some((registrar, lease)) = client
                .lock()
                .get(&controller)
                .map(|m| (Arc::clone(&m.registrar), m.lease.clone()))
            else {
                return;
            };
            (registrar, lease, client.config.lease_duration, client.shutdown.clone())
        };

        let wait = (lease.remaining(Utc::now()) / 2).max(MIN_RENEWAL_WAIT);
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = shutdown.wait_for(|stop| *stop) => return,
        }

        let Some(client) = client.upgrade() else {
            return;
        };

        match registrar.renew(lease.lease_id, duration).await {
            Ok(expires_at) => {
                debug!(controller = %controller, expires_at = %expires_at, "Lease renewed");
                client.set_expiry(controller, expires_at);
            }
            Err(e) if e.is_permission() => {
                warn!(controller = %controller, error = %e, "Controller refused renewal, forgetting it");
                client.forget(controller);
                return;
            }
            Err(e) => {
                warn!(controller = %controller, error = %e, "Lease renewal failed, re-registering");
                match client.reregister(&registrar).await {
                    Ok(lease) => {
                        info!(controller = %controller, lease_id = %lease.lease_id, "Re-registered with controller");
                        client.replace_lease(controller, lease);
                    }
                    Err(e) => {
                        warn!(controller = %controller, error = %e, "Giving up on controller");
                        client.forget(controller);
                        return;
                    }
                }
            }
        }
    }
}
