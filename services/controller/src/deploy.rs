//! Deployment submission.
//!
//! The deployer is the entry point for specifications: it validates them,
//! rejects malformed ones synchronously, and owns one reconciliation
//! manager per accepted specification.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use fleet_proto::{InstanceRecord, LivenessStrategy, PlacementType, ServiceSpec, SpecKey};
use tracing::{info, instrument, warn};

use crate::error::DeployError;
use crate::manager::{ManagerContext, ManagerStatus, ReconciliationManager};

/// Accepts, updates and withdraws specifications.
pub struct Deployer {
    ctx: ManagerContext,
    /// Liveness applied to specifications that keep the default.
    liveness: LivenessStrategy,
    managers: RwLock<HashMap<SpecKey, Arc<ReconciliationManager>>>,
}

impl Deployer {
    pub fn new(ctx: ManagerContext, liveness: LivenessStrategy) -> Self {
        Self {
            ctx,
            liveness,
            managers: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<SpecKey, Arc<ReconciliationManager>>> {
        match self.managers.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<SpecKey, Arc<ReconciliationManager>>> {
        match self.managers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Check a specification before it reaches a manager.
    pub fn validate(&self, spec: &ServiceSpec) -> Result<(), DeployError> {
        if spec.name.trim().is_empty() {
            return Err(DeployError::Invalid("name must not be empty".to_string()));
        }
        if spec.group.trim().is_empty() {
            return Err(DeployError::Invalid("group must not be empty".to_string()));
        }
        if let Some(ceiling) = spec.constraints.ceiling() {
            if spec.planned > ceiling {
                return Err(DeployError::Invalid(format!(
                    "planned count {} exceeds the service limit of {ceiling}",
                    spec.planned
                )));
            }
        }
        match (spec.placement, spec.max_per_node) {
            (_, Some(0)) => {
                return Err(DeployError::Invalid(
                    "max_per_node must be at least 1".to_string(),
                ))
            }
            (PlacementType::Fixed, Some(max)) if max < spec.planned => {
                return Err(DeployError::Invalid(format!(
                    "fixed placement needs {} instances per node but max_per_node is {max}",
                    spec.planned
                )))
            }
            _ => {}
        }
        match spec.liveness {
            LivenessStrategy::Heartbeat { interval_ms: 0, .. }
            | LivenessStrategy::HandleLoss { interval_ms: 0 } => {
                return Err(DeployError::Invalid(
                    "liveness interval must be positive".to_string(),
                ))
            }
            _ => {}
        }
        if let Some(node) = spec.constraints.pinned_node {
            if !self.ctx.registry.contains(node) {
                return Err(DeployError::PinnedNodeUnknown(node));
            }
        }
        Ok(())
    }

    /// Accept a specification and start reconciling it.
    pub fn submit(&self, spec: ServiceSpec) -> Result<SpecKey, DeployError> {
        self.submit_with(spec, Vec::new())
    }

    /// Accept a specification, adopting instances that already run.
    #[instrument(skip_all, fields(spec = %spec.key()))]
    pub fn submit_with(
        &self,
        mut spec: ServiceSpec,
        records: Vec<InstanceRecord>,
    ) -> Result<SpecKey, DeployError> {
        if let Err(e) = self.validate(&spec) {
            warn!(error = %e, "Specification rejected");
            return Err(e);
        }
        if spec.liveness == LivenessStrategy::default() {
            spec.liveness = self.liveness.clone();
        }

        let key = spec.key();
        let manager = {
            let mut managers = self.write();
            if managers.contains_key(&key) {
                return Err(DeployError::AlreadyDeployed(key));
            }
            let manager = ReconciliationManager::new(spec, self.ctx.clone());
            managers.insert(key.clone(), Arc::clone(&manager));
            manager
        };

        let adopted = manager.start(records);
        info!(adopted, "Specification deployed");
        Ok(key)
    }

    /// Withdraw a specification. Returns the number of instances torn down.
    #[instrument(skip(self), fields(spec = %key))]
    pub async fn undeploy(&self, key: &SpecKey, destroy: bool) -> Result<usize, DeployError> {
        let manager = self
            .write()
            .remove(key)
            .ok_or_else(|| DeployError::NotFound(key.clone()))?;
        let destroyed = manager.stop(destroy).await;
        info!(destroyed, "Specification undeployed");
        Ok(destroyed)
    }

    /// Apply a new version of a deployed specification.
    pub async fn update(&self, mut spec: ServiceSpec) -> Result<bool, DeployError> {
        self.validate(&spec)?;
        if spec.liveness == LivenessStrategy::default() {
            spec.liveness = self.liveness.clone();
        }
        let key = spec.key();
        let manager = self.manager(&key).ok_or(DeployError::NotFound(key))?;
        Ok(manager.set_specification(spec).await?)
    }

    pub fn manager(&self, key: &SpecKey) -> Option<Arc<ReconciliationManager>> {
        self.read().get(key).cloned()
    }

    /// Running instances of a specification.
    pub fn count(&self, key: &SpecKey) -> Option<u32> {
        self.manager(key).map(|m| m.actual())
    }

    pub fn keys(&self) -> Vec<SpecKey> {
        let mut keys: Vec<_> = self.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn statuses(&self) -> Vec<ManagerStatus> {
        let managers: Vec<_> = self.read().values().cloned().collect();
        let mut statuses: Vec<_> = managers.iter().map(|m| m.status()).collect();
        statuses.sort_by(|a, b| a.key.cmp(&b.key));
        statuses
    }

    /// Run `verify()` on every manager. Returns the requests enqueued.
    pub fn verify_all(&self) -> u32 {
        let managers: Vec<_> = self.read().values().cloned().collect();
        managers.iter().map(|m| m.verify()).sum()
    }

    /// Withdraw everything, e.g. at shutdown.
    pub async fn undeploy_all(&self, destroy: bool) -> usize {
        let managers: Vec<_> = self.write().drain().map(|(_, m)| m).collect();
        let mut destroyed = 0;
        for manager in managers {
            destroyed += manager.stop(destroy).await;
        }
        destroyed
    }
}

impl std::fmt::Debug for Deployer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deployer")
            .field("specifications", &self.read().len())
            .field("liveness", &self.liveness)
            .finish_non_exhaustive()
    }
}
