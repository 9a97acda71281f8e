//! Reconciliation manager: the per-specification control loop.
//!
//! A manager compares the planned count against running plus pending
//! instances and emits provision work for the shortfall. It absorbs
//! provision outcomes, fault-monitor failures, executor teardown callbacks
//! and membership removals.
//!
//! # Locking
//!
//! Every counting operation runs under the manager's single lock. The lock
//! is taken before the dispatch queue's and the registry's, and is never
//! held across an executor or instance call. Event listeners are invoked
//! after it is released.
//!
//! # Flags
//!
//! - `active`: the manager issues work
//! - `started`: discovery is running
//! - `shutting_down`: new work is rejected; set first by `stop`

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use fleet_events::{EventNotifier, LifecycleAction};
use fleet_id::{InstanceId, NodeId};
use fleet_proto::{
    BeanConfig, DeploymentManager, DeploymentRef, InstanceRecord, PlacementType, ServiceProxy,
    ServiceSpec, SpecKey,
};
use fleet_reconcile::{
    shortfall, ConvergenceStatus, InstanceIdAllocator, ScalePolicy, SpecHash, DEFAULT_PRIORITY,
    FAILURE_PRIORITY,
};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::dispatch::{DispatchQueue, ProvisionListener, ProvisionOutcome, ProvisionRequest, RequestKind};
use crate::error::ManagerError;
use crate::fault::{FailureCallback, FaultMonitor, FaultMonitorFactory};
use crate::registry::{ExecutorRegistry, MembershipEvent};

/// Collaborators shared by every manager of one controller.
#[derive(Clone)]
pub struct ManagerContext {
    pub queue: Arc<DispatchQueue>,
    pub registry: Arc<ExecutorRegistry>,
    pub notifier: Arc<EventNotifier>,
    pub monitors: FaultMonitorFactory,
}

/// Counts for one specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerStatus {
    pub key: SpecKey,
    pub planned: u32,
    pub baseline: u32,
    pub actual: u32,
    pub pending: u32,
    pub uninstantiable: u32,
    pub decremented: u32,
    pub convergence: ConvergenceStatus,
}

struct RedeployEntry {
    clean: bool,
    sticky: bool,
    observer: Option<ProvisionListener>,
}

struct ManagerState {
    spec: ServiceSpec,
    policy: ScalePolicy,
    active: bool,
    started: bool,
    shutting_down: bool,
    instances: Vec<InstanceRecord>,
    /// Removed by a decrement, teardown still in progress.
    decremented: Vec<InstanceRecord>,
    allocator: InstanceIdAllocator,
    redeploys: HashMap<InstanceId, RedeployEntry>,
    monitors: HashMap<InstanceId, Arc<dyn FaultMonitor>>,
    discovery: Option<JoinHandle<()>>,
}

impl ManagerState {
    fn position(&self, instance_id: InstanceId) -> Option<usize> {
        self.instances
            .iter()
            .position(|r| r.instance_id == instance_id)
    }

    fn stop_monitor(&mut self, instance_id: InstanceId) {
        if let Some(monitor) = self.monitors.remove(&instance_id) {
            monitor.terminate();
        }
    }

    fn release(&mut self, number: Option<u64>) {
        if let Some(number) = number {
            self.allocator.release(number);
        }
    }

    fn on_node(&self, node_id: NodeId) -> u32 {
        self.instances.iter().filter(|r| r.node_id == node_id).count() as u32
    }
}

enum Termination {
    Redeploy,
    Teardown,
    SelfRemoval(InstanceRecord),
    Unknown,
}

enum Admission {
    Accepted,
    Stopped,
    Duplicate,
    Surplus,
}

/// Control loop for one specification.
pub struct ReconciliationManager {
    key: SpecKey,
    ctx: ManagerContext,
    state: Mutex<ManagerState>,
    weak_self: Weak<Self>,
}

impl ReconciliationManager {
    pub fn new(spec: ServiceSpec, ctx: ManagerContext) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            key: spec.key(),
            ctx,
            state: Mutex::new(ManagerState {
                policy: ScalePolicy::new(spec.planned),
                spec,
                active: false,
                started: false,
                shutting_down: false,
                instances: Vec::new(),
                decremented: Vec::new(),
                allocator: InstanceIdAllocator::new(),
                redeploys: HashMap::new(),
                monitors: HashMap::new(),
                discovery: None,
            }),
            weak_self: weak_self.clone(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn key(&self) -> &SpecKey {
        &self.key
    }

    /// Current specification, including the live planned count.
    pub fn spec(&self) -> ServiceSpec {
        self.lock().spec.clone()
    }

    pub fn instances(&self) -> Vec<InstanceRecord> {
        self.lock().instances.clone()
    }

    pub fn actual(&self) -> u32 {
        self.lock().instances.len() as u32
    }

    pub fn planned(&self) -> u32 {
        self.lock().policy.planned()
    }

    pub fn status(&self) -> ManagerStatus {
        let state = self.lock();
        let actual = state.instances.len() as u32;
        let pending = self.ctx.queue.count(&self.key);
        let uninstantiable = self.ctx.queue.uninstantiable(&self.key);
        let planned = state.policy.planned();

        let target = match state.spec.placement {
            PlacementType::Fixed => {
                let nodes = self
                    .ctx
                    .registry
                    .snapshot()
                    .iter()
                    .filter(|v| v.capability.satisfies(&state.spec.constraints))
                    .count() as u32;
                planned.saturating_mul(nodes)
            }
            _ => planned,
        };
        let convergence = if !state.active {
            ConvergenceStatus::Unknown
        } else if !state.spec.is_managed() {
            ConvergenceStatus::Converged
        } else {
            ConvergenceStatus::assess(target, actual, pending, uninstantiable)
        };

        ManagerStatus {
            key: self.key.clone(),
            planned,
            baseline: state.policy.baseline(),
            actual,
            pending,
            uninstantiable,
            decremented: state.decremented.len() as u32,
            convergence,
        }
    }

    fn deployment(&self) -> Option<DeploymentRef> {
        self.weak_self
            .upgrade()
            .map(|manager| manager as DeploymentRef)
    }

    fn provision_listener(&self, observer: Option<ProvisionListener>) -> ProvisionListener {
        let weak = self.weak_self.clone();
        Arc::new(move |outcome: ProvisionOutcome| {
            if let Some(manager) = weak.upgrade() {
                manager.on_outcome(&outcome);
            }
            if let Some(observer) = &observer {
                observer(outcome);
            }
        })
    }

    fn failure_callback(&self) -> FailureCallback {
        let weak = self.weak_self.clone();
        Arc::new(move |_: Arc<dyn ServiceProxy>, instance_id: InstanceId| {
            if let Some(manager) = weak.upgrade() {
                manager.handle_failure(instance_id);
            }
        })
    }

    fn attach_monitor(&self, state: &mut ManagerState, record: &InstanceRecord) {
        let monitor = self.ctx.monitors.create(
            &state.spec.liveness,
            record.node_id,
            self.failure_callback(),
        );
        monitor.monitor(Arc::clone(&record.handle), record.instance_id);
        if let Some(previous) = state.monitors.insert(record.instance_id, monitor) {
            previous.terminate();
        }
    }

    /// Placement counts drop as soon as an instance leaves its node.
    fn uncount(&self, record: &InstanceRecord) {
        self.ctx.registry.record_removal(record.node_id, &self.key);
    }

    fn notify(&self, action: LifecycleAction, record: Option<&InstanceRecord>, detail: Option<String>) {
        self.ctx.notifier.notify(
            &self.key.name,
            &self.key.group,
            record.map(InstanceRecord::summary),
            action,
            detail,
        );
    }

    /// Destroy in the background, then finish a decrement's teardown.
    fn teardown_later(&self, record: InstanceRecord) {
        let weak = self.weak_self.clone();
        tokio::spawn(async move {
            if destroy_instance(&record).await {
                if let Some(manager) = weak.upgrade() {
                    manager.finish_teardown(record.instance_id);
                }
            }
        });
    }

    /// Replace the specification.
    ///
    /// The placement type cannot change. Pending requests are patched,
    /// executors hosting instances get a live update, and instances or
    /// requests beyond the new planned count are shed. Returns false when
    /// the specification is unchanged.
    #[instrument(skip_all, fields(spec = %self.key))]
    pub async fn set_specification(&self, spec: ServiceSpec) -> Result<bool, ManagerError> {
        if spec.key() != self.key {
            return Err(ManagerError::KeyMismatch {
                expected: self.key.clone(),
                found: spec.key(),
            });
        }
        let deployment = self.deployment().ok_or(ManagerError::ShuttingDown)?;

        let (hosts, surplus) = {
            let mut state = self.lock();
            if state.shutting_down {
                return Err(ManagerError::ShuttingDown);
            }
            if spec.placement != state.spec.placement {
                return Err(ManagerError::PlacementImmutable {
                    current: state.spec.placement,
                    requested: spec.placement,
                });
            }
            let unchanged = matches!(
                (spec_hash(&state.spec), spec_hash(&spec)),
                (Some(current), Some(next)) if current == next
            );
            if unchanged {
                return Ok(false);
            }

            state.policy.reset(spec.planned);
            state.spec = spec.clone();
            self.ctx
                .queue
                .update_all(&spec, self.provision_listener(None));
            let shed = self.shed_excess_pending(&mut state);

            let hosts: BTreeSet<NodeId> = state.instances.iter().map(|r| r.node_id).collect();
            let surplus = self.take_surplus(&mut state);
            info!(
                planned = spec.planned,
                shed,
                surplus = surplus.len(),
                "Specification updated"
            );
            (hosts, surplus)
        };

        for node_id in hosts {
            let Some(view) = self.ctx.registry.get(node_id) else {
                continue;
            };
            match view.executor.update(spec.clone(), Arc::clone(&deployment)).await {
                Ok(patched) => debug!(node_id = %node_id, patched, "Executor applied update"),
                Err(e) => warn!(node_id = %node_id, error = %e, "Executor update failed"),
            }
        }
        for record in surplus {
            self.teardown_later(record);
        }

        self.verify();
        Ok(true)
    }

    /// Drop pending DYNAMIC requests beyond the planned count.
    fn shed_excess_pending(&self, state: &mut ManagerState) -> usize {
        if state.spec.placement != PlacementType::Dynamic {
            return 0;
        }
        let actual = state.instances.len() as u32;
        let pending = self.ctx.queue.count(&self.key);
        let excess = actual.saturating_add(pending).saturating_sub(state.policy.planned());
        if excess == 0 {
            return 0;
        }
        let removed = self.ctx.queue.remove_n(&self.key, excess as usize);
        for request in &removed {
            state.release(request.instance_number());
        }
        removed.len()
    }

    /// Move running DYNAMIC instances beyond the planned count, highest
    /// numbers first, to the decremented list.
    fn take_surplus(&self, state: &mut ManagerState) -> Vec<InstanceRecord> {
        if state.spec.placement != PlacementType::Dynamic {
            return Vec::new();
        }
        let excess = (state.instances.len() as u32).saturating_sub(state.policy.planned()) as usize;
        if excess == 0 {
            return Vec::new();
        }
        state
            .instances
            .sort_by_key(|r| r.instance_number().unwrap_or(u64::MAX));
        let keep = state.instances.len() - excess;
        let surplus: Vec<_> = state.instances.drain(keep..).collect();
        for record in &surplus {
            state.stop_monitor(record.instance_id);
            self.uncount(record);
            state.decremented.push(record.clone());
        }
        surplus
    }

    /// Adopt already-running instances and start reconciling.
    ///
    /// Returns how many records were adopted.
    #[instrument(skip_all, fields(spec = %self.key))]
    pub fn start(&self, records: Vec<InstanceRecord>) -> usize {
        let (adopted, fixed) = {
            let mut state = self.lock();
            if state.started || state.shutting_down {
                return 0;
            }
            state.active = true;
            state.started = true;

            let mut adopted = 0;
            for mut record in records {
                if record.key != self.key {
                    warn!(instance_id = %record.instance_id, found = %record.key, "Ignoring record of another specification");
                    continue;
                }
                match record.instance_number() {
                    Some(number) if state.allocator.reserve(number) => {}
                    Some(number) => {
                        warn!(instance_id = %record.instance_id, instance_number = number, "Ignoring record with a duplicate instance number");
                        continue;
                    }
                    None => {
                        record.bean_config.instance_id = Some(state.allocator.allocate());
                    }
                }
                self.attach_monitor(&mut state, &record);
                state.instances.push(record);
                adopted += 1;
            }
            state.discovery = Some(self.spawn_discovery());
            (adopted, state.spec.placement == PlacementType::Fixed)
        };

        if fixed {
            let weak = self.weak_self.clone();
            self.ctx.queue.register_hook(
                self.key.clone(),
                Arc::new(move || {
                    if let Some(manager) = weak.upgrade() {
                        manager.verify();
                    }
                }),
            );
        }

        info!(adopted, "Reconciliation started");
        self.verify();
        adopted
    }

    fn spawn_discovery(&self) -> JoinHandle<()> {
        let mut events = self.ctx.registry.subscribe();
        let weak = self.weak_self.clone();
        let key = self.key.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(MembershipEvent::Removed(node_id)) => {
                        let Some(manager) = weak.upgrade() else {
                            return;
                        };
                        manager.node_removed(node_id);
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(spec = %key, skipped, "Membership events lagged");
                    }
                    Err(RecvError::Closed) => return,
                }
            }
        })
    }

    /// Treat every instance on a departed node as failed.
    fn node_removed(&self, node_id: NodeId) {
        let failed: Vec<InstanceId> = {
            let mut state = self.lock();
            if state.spec.placement == PlacementType::Fixed {
                for request in self.ctx.queue.remove_on(&self.key, node_id) {
                    state.release(request.instance_number());
                }
            }
            state
                .instances
                .iter()
                .filter(|r| r.node_id == node_id)
                .map(|r| r.instance_id)
                .collect()
        };

        if !failed.is_empty() {
            warn!(spec = %self.key, node_id = %node_id, instances = failed.len(), "Executor left, failing its instances");
        }
        for instance_id in failed {
            self.handle_failure(instance_id);
        }
    }

    /// Enqueue work for any shortfall. Returns the number of requests added.
    #[instrument(skip(self), fields(spec = %self.key))]
    pub fn verify(&self) -> u32 {
        let Some(deployment) = self.deployment() else {
            return 0;
        };
        let listener = self.provision_listener(None);

        let enqueued = {
            let mut state = self.lock();
            if !state.active || state.shutting_down || !state.spec.is_managed() {
                return 0;
            }
            match state.spec.placement {
                PlacementType::Fixed => self.verify_fixed(&mut state, &deployment, &listener),
                _ => self.verify_dynamic(&mut state, &deployment, &listener),
            }
        };

        if enqueued > 0 {
            self.ctx.queue.wake();
        }
        enqueued
    }

    fn verify_dynamic(
        &self,
        state: &mut ManagerState,
        deployment: &DeploymentRef,
        listener: &ProvisionListener,
    ) -> u32 {
        let planned = state.policy.planned();
        let actual = state.instances.len() as u32;
        let pending = self.ctx.queue.count(&self.key);
        let missing = shortfall(planned, actual, pending);

        for _ in 0..missing {
            let number = state.allocator.allocate();
            let request = ProvisionRequest::new(
                state.spec.snapshot_for(number),
                Arc::clone(deployment),
                Arc::clone(listener),
            );
            self.ctx.queue.add(request, DEFAULT_PRIORITY);
        }

        if missing > 0 {
            info!(planned, actual, pending, shortfall = missing, "Provisioning shortfall");
        }
        missing
    }

    /// FIXED: `planned` instances on every executor that satisfies the
    /// constraints.
    fn verify_fixed(
        &self,
        state: &mut ManagerState,
        deployment: &DeploymentRef,
        listener: &ProvisionListener,
    ) -> u32 {
        let planned = state.policy.planned();
        let mut enqueued = 0;

        for view in self.ctx.registry.snapshot() {
            if !view.capability.satisfies(&state.spec.constraints) {
                continue;
            }
            let running = state.on_node(view.node_id);
            let pending = self.ctx.queue.count_on(&self.key, view.node_id);
            let missing = shortfall(planned, running, pending);
            for _ in 0..missing {
                let number = state.allocator.allocate();
                let request = ProvisionRequest::new(
                    state.spec.snapshot_for(number),
                    Arc::clone(deployment),
                    Arc::clone(listener),
                )
                .requiring(Some(view.node_id));
                self.ctx.queue.add(request, DEFAULT_PRIORITY);
            }
            if missing > 0 {
                debug!(node_id = %view.node_id, running, pending, shortfall = missing, "Fixed placement shortfall");
            }
            enqueued += missing;
        }
        enqueued
    }

    /// Raise `planned` by one.
    ///
    /// Rejected, returning `None` with `planned` unchanged, when the
    /// increment would exceed the ceiling from the service limits. The
    /// ceiling applies to permanent and elastic increments alike.
    #[instrument(skip(self), fields(spec = %self.key))]
    pub fn increment(&self, permanent: bool) -> Option<ServiceSpec> {
        let spec = {
            let mut state = self.lock();
            if state.shutting_down {
                return None;
            }
            let ceiling = state.spec.constraints.ceiling();
            match state.policy.try_increment(permanent, ceiling) {
                Ok(planned) => {
                    state.spec.planned = planned;
                    info!(planned, baseline = state.policy.baseline(), "Planned count raised");
                    state.spec.clone()
                }
                Err(e) => {
                    warn!(error = %e, "Increment rejected");
                    return None;
                }
            }
        };
        self.verify();
        Some(spec)
    }

    /// Remove one instance and lower `planned`.
    ///
    /// Without `mandate` this only succeeds while more instances run than
    /// the baseline. With `destroy` the record waits in the decremented
    /// list until its teardown completes; otherwise the caller asserts the
    /// instance is gone and its number is released now. Decrementing an
    /// instance that is no longer active is a no-op.
    #[instrument(skip(self), fields(spec = %self.key))]
    pub fn decrement(
        &self,
        instance_id: InstanceId,
        mandate: bool,
        destroy: bool,
    ) -> Result<ServiceSpec, ManagerError> {
        let (spec, record) = {
            let mut state = self.lock();
            if state.shutting_down {
                return Err(ManagerError::ShuttingDown);
            }
            let Some(position) = state.position(instance_id) else {
                debug!(instance_id = %instance_id, "Instance already removed");
                return Ok(state.spec.clone());
            };

            let actual = state.instances.len() as u32;
            let planned = state.policy.try_decrement(actual, mandate)?;
            state.spec.planned = planned;
            let record = state.instances.remove(position);
            state.stop_monitor(instance_id);
            self.uncount(&record);
            if destroy {
                state.decremented.push(record.clone());
            } else {
                state.release(record.instance_number());
            }
            self.shed_excess_pending(&mut state);
            (state.spec.clone(), record)
        };

        info!(
            instance_id = %instance_id,
            instance_number = ?record.instance_number(),
            planned = spec.planned,
            mandate,
            destroy,
            "Instance decremented"
        );

        if destroy {
            self.teardown_later(record);
        } else {
            self.notify(LifecycleAction::Terminated, Some(&record), None);
        }
        Ok(spec)
    }

    fn finish_teardown(&self, instance_id: InstanceId) {
        let record = {
            let mut state = self.lock();
            let Some(position) = state
                .decremented
                .iter()
                .position(|r| r.instance_id == instance_id)
            else {
                return;
            };
            let record = state.decremented.remove(position);
            state.release(record.instance_number());
            record
        };
        debug!(spec = %self.key, instance_id = %instance_id, "Teardown complete");
        self.notify(LifecycleAction::Terminated, Some(&record), None);
    }

    /// Move an instance to another node.
    ///
    /// The replacement is dispatched immediately with the current node
    /// excluded (and `preferred` required, if given). The original is torn
    /// down only once the replacement runs; on failure it is left alone.
    #[instrument(skip(self, observer), fields(spec = %self.key))]
    pub async fn relocate(
        &self,
        instance_id: InstanceId,
        observer: Option<ProvisionListener>,
        preferred: Option<NodeId>,
    ) -> Result<InstanceRecord, ManagerError> {
        let (request, original) = {
            let state = self.lock();
            if state.shutting_down || !state.active {
                return Err(ManagerError::ShuttingDown);
            }
            let Some(position) = state.position(instance_id) else {
                return Err(ManagerError::UnknownInstance(instance_id));
            };
            let original = state.instances[position].clone();
            let deployment = self.deployment().ok_or(ManagerError::ShuttingDown)?;
            let request = ProvisionRequest::new(
                state.spec.with_bean_config(original.bean_config.clone()),
                deployment,
                self.provision_listener(None),
            )
            .excluding(original.node_id)
            .requiring(preferred)
            .with_kind(RequestKind::Relocate);
            (request, original)
        };

        let outcome = self.ctx.queue.dispatch_now(&request).await;
        let replacement = match outcome {
            ProvisionOutcome::Provisioned(record) => record,
            outcome => {
                let reason = outcome.reason().unwrap_or_default().to_string();
                warn!(instance_id = %instance_id, reason = %reason, "Relocation failed, original left in place");
                if let Some(observer) = &observer {
                    observer(outcome);
                }
                return Err(ManagerError::RelocationFailed(reason));
            }
        };

        let swapped = {
            let mut state = self.lock();
            match state.position(instance_id) {
                Some(position) if !state.shutting_down => {
                    state.instances[position] = replacement.clone();
                    state.stop_monitor(instance_id);
                    self.uncount(&original);
                    self.attach_monitor(&mut state, &replacement);
                    true
                }
                _ => false,
            }
        };

        if !swapped {
            warn!(instance_id = %instance_id, "Instance vanished during relocation, discarding replacement");
            self.uncount(&replacement);
            tokio::spawn(async move {
                destroy_instance(&replacement).await;
            });
            let reason = "instance is gone".to_string();
            if let Some(observer) = &observer {
                observer(ProvisionOutcome::Failed {
                    spec: request.spec.clone(),
                    reason: reason.clone(),
                });
            }
            return Err(ManagerError::RelocationFailed(reason));
        }

        info!(
            instance_id = %instance_id,
            replacement = %replacement.instance_id,
            from = %original.node_id,
            to = %replacement.node_id,
            "Instance relocated"
        );
        self.notify(LifecycleAction::Provisioned, Some(&replacement), Some("relocated".to_string()));
        if let Some(observer) = &observer {
            observer(ProvisionOutcome::Provisioned(replacement.clone()));
        }
        tokio::spawn(async move {
            destroy_instance(&original).await;
        });
        Ok(replacement)
    }

    /// Tear an instance down and provision it again.
    ///
    /// `clean` drops the instance's accumulated bean config in favour of the
    /// specification's; `sticky` keeps it on the same node. The observer,
    /// if any, receives the re-provision outcome.
    #[instrument(skip(self, observer), fields(spec = %self.key))]
    pub async fn redeploy(
        &self,
        instance_id: InstanceId,
        clean: bool,
        sticky: bool,
        observer: Option<ProvisionListener>,
    ) -> Result<(), ManagerError> {
        let record = {
            let mut state = self.lock();
            if state.shutting_down || !state.active {
                return Err(ManagerError::ShuttingDown);
            }
            let Some(position) = state.position(instance_id) else {
                return Err(ManagerError::UnknownInstance(instance_id));
            };
            let record = state.instances[position].clone();
            state.redeploys.insert(
                instance_id,
                RedeployEntry {
                    clean,
                    sticky,
                    observer,
                },
            );
            state.stop_monitor(instance_id);
            record
        };

        info!(instance_id = %instance_id, clean, sticky, "Redeploying instance");
        if !destroy_instance(&record).await {
            warn!(instance_id = %instance_id, "Old instance may still be running");
        }
        // No-op if the teardown callback already handled it.
        self.handle_failure(instance_id);
        Ok(())
    }

    /// React to an instance failure.
    ///
    /// A pending redeploy for the instance takes precedence and keeps its
    /// observer. Otherwise the instance is re-provisioned with its last
    /// bean config, keeping its number and adding the failed node to its
    /// host-visit history. EXTERNAL instances are never re-provisioned.
    pub fn handle_failure(&self, instance_id: InstanceId) {
        let deployment = self.deployment();

        let (record, redeployed, reprovisioned) = {
            let mut state = self.lock();
            let Some(position) = state.position(instance_id) else {
                debug!(spec = %self.key, instance_id = %instance_id, "Failure for an instance that is already gone");
                return;
            };
            let record = state.instances.remove(position);
            state.stop_monitor(instance_id);
            self.uncount(&record);
            let redeploy = state.redeploys.remove(&instance_id);
            let redeployed = redeploy.is_some();

            let fixed = state.spec.placement == PlacementType::Fixed;
            let node_available = !fixed || self.ctx.registry.contains(record.node_id);
            let reprovision = state.active
                && !state.shutting_down
                && state.spec.is_managed()
                && node_available;

            match (reprovision, deployment) {
                (true, Some(deployment)) => {
                    let mut bean_config = match &redeploy {
                        Some(entry) if entry.clean => BeanConfig {
                            instance_id: record.instance_number(),
                            ..state.spec.bean_config.clone()
                        },
                        _ => record.bean_config.clone(),
                    };
                    if !redeployed {
                        bean_config.record_visit(record.node_id);
                    }
                    let sticky = redeploy.as_ref().is_some_and(|entry| entry.sticky);
                    let require = (fixed || sticky).then_some(record.node_id);
                    let observer = redeploy.and_then(|entry| entry.observer);

                    let request = ProvisionRequest::new(
                        state.spec.with_bean_config(bean_config),
                        deployment,
                        self.provision_listener(observer),
                    )
                    .requiring(require);
                    self.ctx.queue.add(request, FAILURE_PRIORITY);
                    (record, redeployed, true)
                }
                _ => {
                    state.release(record.instance_number());
                    (record, redeployed, false)
                }
            }
        };

        if reprovisioned {
            self.ctx.queue.wake();
        }

        if redeployed {
            info!(spec = %self.key, instance_id = %instance_id, reprovisioned, "Instance redeploy queued");
            self.notify(LifecycleAction::Terminated, Some(&record), Some("redeploy".to_string()));
        } else {
            warn!(
                spec = %self.key,
                instance_id = %instance_id,
                instance_number = ?record.instance_number(),
                node_id = %record.node_id,
                reprovisioned,
                "Instance failed"
            );
            self.notify(LifecycleAction::Failed, Some(&record), None);
            // Best effort: the instance may be half alive.
            tokio::spawn(async move {
                let _ = record.handle.destroy().await;
            });
        }
    }

    fn on_outcome(&self, outcome: &ProvisionOutcome) {
        match outcome {
            ProvisionOutcome::Provisioned(record) => self.on_provisioned(record.clone()),
            ProvisionOutcome::Uninstantiable { spec, reason } => {
                error!(
                    spec = %self.key,
                    instance_number = ?spec.instance_number(),
                    reason = %reason,
                    "Specification cannot be instantiated"
                );
                self.notify(LifecycleAction::Failed, None, Some(reason.clone()));
            }
            ProvisionOutcome::Failed { reason, .. } => {
                debug!(spec = %self.key, reason = %reason, "Provision attempt failed");
            }
        }
    }

    fn on_provisioned(&self, record: InstanceRecord) {
        let admission = {
            let mut state = self.lock();
            let number = record.instance_number();
            if !state.active || state.shutting_down {
                Admission::Stopped
            } else if number.is_some()
                && state.instances.iter().any(|r| r.instance_number() == number)
            {
                Admission::Duplicate
            } else if self.is_surplus(&state, &record) {
                state.release(number);
                Admission::Surplus
            } else {
                if let Some(number) = number {
                    state.allocator.reserve(number);
                }
                self.attach_monitor(&mut state, &record);
                state.instances.push(record.clone());
                Admission::Accepted
            }
        };

        match admission {
            Admission::Accepted => {
                self.notify(LifecycleAction::Provisioned, Some(&record), None);
            }
            Admission::Stopped | Admission::Duplicate | Admission::Surplus => {
                let reason = match admission {
                    Admission::Stopped => "manager stopped",
                    Admission::Duplicate => "duplicate instance number",
                    _ => "planned count already met",
                };
                warn!(
                    spec = %self.key,
                    instance_id = %record.instance_id,
                    reason,
                    "Discarding provisioned instance"
                );
                self.uncount(&record);
                tokio::spawn(async move {
                    destroy_instance(&record).await;
                });
            }
        }
    }

    fn is_surplus(&self, state: &ManagerState, record: &InstanceRecord) -> bool {
        let planned = state.policy.planned();
        match state.spec.placement {
            PlacementType::Fixed => state.on_node(record.node_id) >= planned,
            _ => state.instances.len() as u32 >= planned,
        }
    }

    /// Remove up to `n` pending requests and lower `planned` by the number
    /// actually removed.
    #[instrument(skip(self), fields(spec = %self.key))]
    pub fn trim(&self, n: u32) -> u32 {
        let mut state = self.lock();
        if state.spec.placement != PlacementType::Dynamic {
            return 0;
        }
        let removed = self.ctx.queue.remove_n(&self.key, n as usize);
        for request in &removed {
            state.release(request.instance_number());
        }
        let trimmed = removed.len() as u32;
        let planned = state.policy.trim(trimmed);
        state.spec.planned = planned;
        info!(requested = n, trimmed, planned, "Pending requests trimmed");
        trimmed
    }

    /// Stop reconciling.
    ///
    /// Sets the shutting-down flag first so in-flight work becomes a no-op,
    /// then drops pending work and discovery, then tears down instances
    /// unless told not to or the placement is EXTERNAL. Returns the number
    /// of instances torn down.
    #[instrument(skip(self), fields(spec = %self.key))]
    pub async fn stop(&self, destroy_instances: bool) -> usize {
        let (records, managed) = {
            let mut state = self.lock();
            if state.shutting_down {
                return 0;
            }
            state.shutting_down = true;
            state.active = false;

            for request in self.ctx.queue.remove(&self.key) {
                state.release(request.instance_number());
            }
            if let Some(discovery) = state.discovery.take() {
                discovery.abort();
            }
            for (_, monitor) in state.monitors.drain() {
                monitor.terminate();
            }
            state.redeploys.clear();
            let records = std::mem::take(&mut state.instances);
            for record in &records {
                state.release(record.instance_number());
            }
            (records, state.spec.is_managed())
        };
        self.ctx.queue.unregister_hook(&self.key);

        if !destroy_instances || !managed {
            info!(instances = records.len(), "Reconciliation stopped, instances left running");
            return 0;
        }

        let mut destroyed = 0;
        for record in &records {
            if destroy_instance(record).await {
                destroyed += 1;
                self.uncount(record);
                self.notify(LifecycleAction::Terminated, Some(record), None);
            }
        }
        info!(destroyed, "Reconciliation stopped");
        destroyed
    }
}

impl std::fmt::Debug for ReconciliationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("ReconciliationManager")
            .field("key", &self.key)
            .field("planned", &state.policy.planned())
            .field("actual", &state.instances.len())
            .field("active", &state.active)
            .field("shutting_down", &state.shutting_down)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl DeploymentManager for ReconciliationManager {
    fn key(&self) -> SpecKey {
        self.key.clone()
    }

    fn is_active(&self) -> bool {
        let state = self.lock();
        state.active && !state.shutting_down
    }

    /// An executor tore an instance down.
    ///
    /// A redeploy in progress turns this into its re-provision, a decrement
    /// finishes its teardown, and an instance that was still active removed
    /// itself: a mandated decrement.
    async fn instance_terminated(&self, instance_id: InstanceId) {
        let route = {
            let mut state = self.lock();
            if state.redeploys.contains_key(&instance_id) {
                Termination::Redeploy
            } else if state.decremented.iter().any(|r| r.instance_id == instance_id) {
                Termination::Teardown
            } else if let Some(position) = state.position(instance_id) {
                let actual = state.instances.len() as u32;
                if let Ok(planned) = state.policy.try_decrement(actual, true) {
                    state.spec.planned = planned;
                }
                let record = state.instances.remove(position);
                state.stop_monitor(instance_id);
                state.release(record.instance_number());
                self.uncount(&record);
                Termination::SelfRemoval(record)
            } else {
                Termination::Unknown
            }
        };

        match route {
            Termination::Redeploy => self.handle_failure(instance_id),
            Termination::Teardown => self.finish_teardown(instance_id),
            Termination::SelfRemoval(record) => {
                info!(spec = %self.key, instance_id = %instance_id, "Instance removed itself");
                self.notify(LifecycleAction::Terminated, Some(&record), None);
            }
            Termination::Unknown => {
                debug!(spec = %self.key, instance_id = %instance_id, "Termination of an untracked instance");
            }
        }
    }
}

fn spec_hash(spec: &ServiceSpec) -> Option<SpecHash> {
    serde_json::to_value(spec)
        .ok()
        .map(|json| SpecHash::from_json(&json))
}

/// Issue the teardown call. An unacknowledged destroy counts as done when a
/// follow-up liveness check finds the instance gone.
async fn destroy_instance(record: &InstanceRecord) -> bool {
    match record.handle.destroy().await {
        Ok(()) => true,
        Err(e) => {
            let gone = record.handle.ping().await.is_err();
            if gone {
                debug!(instance_id = %record.instance_id, error = %e, "Destroy unacknowledged, instance is gone");
            } else {
                warn!(instance_id = %record.instance_id, error = %e, "Instance survived destroy");
            }
            gone
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use fleet_id::ControllerId;
    use fleet_proto::{Executor, LeaseRegistrar};
    use fleet_reconcile::ScaleError;
    use fleet_testing::{FakeExecutor, RecordingListener, SpecBuilder};

    use crate::selector::LeastLoadedSelector;

    struct Harness {
        ctx: ManagerContext,
        events: Arc<RecordingListener>,
    }

    impl Harness {
        fn new() -> Self {
            let registry = Arc::new(ExecutorRegistry::new(
                ControllerId::new(),
                Duration::from_secs(30),
            ));
            let queue = Arc::new(DispatchQueue::new(
                registry.clone(),
                Arc::new(LeastLoadedSelector),
                4,
            ));
            let notifier = Arc::new(EventNotifier::new());
            let events = RecordingListener::new();
            notifier.register(events.clone());
            Self {
                ctx: ManagerContext {
                    queue,
                    registry,
                    notifier,
                    monitors: FaultMonitorFactory::default(),
                },
                events,
            }
        }

        async fn executor(&self, capacity: usize) -> Arc<FakeExecutor> {
            let executor = FakeExecutor::new(capacity);
            self.ctx
                .registry
                .register(executor.registration(capacity as u32))
                .await
                .unwrap();
            executor
        }

        fn manager(&self, spec: ServiceSpec) -> Arc<ReconciliationManager> {
            ReconciliationManager::new(spec, self.ctx.clone())
        }
    }

    fn numbers(manager: &ReconciliationManager) -> Vec<u64> {
        let mut numbers: Vec<_> = manager
            .instances()
            .iter()
            .filter_map(InstanceRecord::instance_number)
            .collect();
        numbers.sort_unstable();
        numbers
    }

    #[tokio::test]
    async fn test_shortfall_stays_pending_without_executors() {
        let h = Harness::new();
        let manager = h.manager(SpecBuilder::new("worker").planned(3).build());

        manager.start(Vec::new());
        h.ctx.queue.process().await;

        let status = manager.status();
        assert_eq!(status.actual, 0);
        assert_eq!(status.pending, 3);
        assert_eq!(status.convergence, ConvergenceStatus::Converging);
    }

    #[tokio::test]
    async fn test_process_converges_on_planned() {
        let h = Harness::new();
        h.executor(8).await;
        let manager = h.manager(SpecBuilder::new("worker").planned(3).build());

        manager.start(Vec::new());
        h.ctx.queue.process().await;

        let status = manager.status();
        assert_eq!(status.actual, 3);
        assert_eq!(status.pending, 0);
        assert!(status.convergence.is_converged());
        assert_eq!(numbers(&manager), vec![1, 2, 3]);
        assert_eq!(h.events.count(LifecycleAction::Provisioned), 3);

        // A second verify finds nothing to do.
        assert_eq!(manager.verify(), 0);
    }

    #[tokio::test]
    async fn test_failure_reprovisions_same_number_elsewhere() {
        let h = Harness::new();
        let a = h.executor(4).await;
        let b = h.executor(4).await;
        let manager = h.manager(SpecBuilder::new("worker").fast_heartbeat().build());

        manager.start(Vec::new());
        h.ctx.queue.process().await;
        let failed = manager.instances().remove(0);
        let proxy = a
            .proxy(failed.instance_id)
            .or_else(|| b.proxy(failed.instance_id))
            .unwrap();

        proxy.kill();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(manager.actual(), 0);
        assert_eq!(h.ctx.queue.count(manager.key()), 1);

        h.ctx.queue.process().await;
        let replacement = manager.instances().remove(0);
        assert_eq!(replacement.instance_number(), failed.instance_number());
        assert_eq!(replacement.bean_config.host_history, vec![failed.node_id]);
        assert_ne!(replacement.node_id, failed.node_id);
        assert_eq!(h.events.count(LifecycleAction::Failed), 1);
    }

    #[tokio::test]
    async fn test_increment_respects_ceiling() {
        let h = Harness::new();
        let manager = h.manager(SpecBuilder::new("worker").planned(2).limits(&[2]).build());
        manager.start(Vec::new());

        assert!(manager.increment(true).is_none());
        assert!(manager.increment(false).is_none());
        assert_eq!(manager.planned(), 2);

        let roomy = h.manager(SpecBuilder::new("roomy").planned(1).limits(&[2]).build());
        roomy.start(Vec::new());
        assert_eq!(roomy.increment(false).map(|s| s.planned), Some(2));
        assert_eq!(h.ctx.queue.count(roomy.key()), 2);
    }

    #[tokio::test]
    async fn test_elastic_decrement_stops_at_baseline() {
        let h = Harness::new();
        h.executor(8).await;
        let manager = h.manager(SpecBuilder::new("worker").planned(2).build());
        manager.start(Vec::new());
        h.ctx.queue.process().await;

        let id = manager.instances()[0].instance_id;
        assert!(matches!(
            manager.decrement(id, false, true),
            Err(ManagerError::Scale(ScaleError::AtBaseline { .. }))
        ));

        manager.increment(false);
        h.ctx.queue.process().await;
        assert_eq!(manager.actual(), 3);

        let spec = manager.decrement(id, false, true).unwrap();
        assert_eq!(spec.planned, 2);
        assert_eq!(manager.actual(), 2);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let status = manager.status();
        assert_eq!(status.decremented, 0);
        assert_eq!(h.events.count(LifecycleAction::Terminated), 1);

        // Already gone: a no-op.
        assert_eq!(manager.decrement(id, true, true).unwrap().planned, 2);
    }

    #[tokio::test]
    async fn test_trim_removes_pending_only() {
        let h = Harness::new();
        let manager = h.manager(SpecBuilder::new("worker").planned(4).build());
        manager.start(Vec::new());

        assert_eq!(manager.trim(3), 3);
        assert_eq!(manager.planned(), 1);
        assert_eq!(h.ctx.queue.count(manager.key()), 1);
        assert_eq!(manager.trim(5), 1);
        assert_eq!(manager.planned(), 0);
    }

    #[tokio::test]
    async fn test_set_specification_rules() {
        let h = Harness::new();
        let executor = h.executor(8).await;
        let spec = SpecBuilder::new("worker").planned(3).build();
        let manager = h.manager(spec.clone());
        manager.start(Vec::new());
        h.ctx.queue.process().await;

        assert!(!manager.set_specification(spec.clone()).await.unwrap());

        let mut fixed = spec.clone();
        fixed.placement = PlacementType::Fixed;
        assert!(matches!(
            manager.set_specification(fixed).await,
            Err(ManagerError::PlacementImmutable { .. })
        ));

        let other = SpecBuilder::new("other").build();
        assert!(matches!(
            manager.set_specification(other).await,
            Err(ManagerError::KeyMismatch { .. })
        ));

        let mut smaller = spec;
        smaller.planned = 1;
        assert!(manager.set_specification(smaller).await.unwrap());
        assert_eq!(manager.actual(), 1);
        assert_eq!(numbers(&manager), vec![1]);
        assert_eq!(executor.updates(manager.key()), 1);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(executor.running().len(), 1);
    }

    #[tokio::test]
    async fn test_stop_tears_down_and_rejects_work() {
        let h = Harness::new();
        let executor = h.executor(8).await;
        let manager = h.manager(SpecBuilder::new("worker").planned(2).build());
        manager.start(Vec::new());
        h.ctx.queue.process().await;

        assert_eq!(manager.stop(true).await, 2);
        assert!(executor.running().is_empty());
        assert!(!manager.is_active());
        assert_eq!(manager.verify(), 0);
        assert!(manager.increment(true).is_none());
        assert!(matches!(
            manager.decrement(fleet_id::InstanceId::new(), true, true),
            Err(ManagerError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_external_placement_is_tracked_only() {
        let h = Harness::new();
        let executor = h.executor(8).await;
        let manager = h.manager(
            SpecBuilder::new("worker")
                .planned(2)
                .placement(PlacementType::External)
                .build(),
        );

        manager.start(Vec::new());
        h.ctx.queue.process().await;

        assert_eq!(h.ctx.queue.count(manager.key()), 0);
        assert_eq!(executor.calls(), 0);
        assert!(manager.status().convergence.is_converged());
    }

    #[tokio::test]
    async fn test_fixed_placement_fills_every_node() {
        let h = Harness::new();
        let a = h.executor(4).await;
        let b = h.executor(4).await;
        let manager = h.manager(
            SpecBuilder::new("agent")
                .planned(1)
                .placement(PlacementType::Fixed)
                .build(),
        );

        manager.start(Vec::new());
        h.ctx.queue.process().await;

        assert_eq!(a.running().len(), 1);
        assert_eq!(b.running().len(), 1);
        assert!(manager.status().convergence.is_converged());

        // A late executor gets its instance on the next pass.
        let c = h.executor(4).await;
        h.ctx.queue.process().await;
        assert_eq!(c.running().len(), 1);
        assert_eq!(manager.actual(), 3);
    }

    #[tokio::test]
    async fn test_self_removal_lowers_planned() {
        let h = Harness::new();
        h.executor(8).await;
        let manager = h.manager(SpecBuilder::new("worker").planned(2).build());
        manager.start(Vec::new());
        h.ctx.queue.process().await;

        let id = manager.instances()[0].instance_id;
        manager.instance_terminated(id).await;

        assert_eq!(manager.planned(), 1);
        assert_eq!(manager.actual(), 1);
        assert_eq!(manager.verify(), 0);
    }

    #[tokio::test]
    async fn test_sticky_clean_redeploy_stays_on_node() {
        let h = Harness::new();
        h.executor(4).await;
        h.executor(4).await;
        let manager = h.manager(SpecBuilder::new("worker").build());
        manager.start(Vec::new());
        h.ctx.queue.process().await;
        let before = manager.instances().remove(0);

        manager
            .redeploy(before.instance_id, true, true, None)
            .await
            .unwrap();
        h.ctx.queue.process().await;

        let after = manager.instances().remove(0);
        assert_ne!(after.instance_id, before.instance_id);
        assert_eq!(after.node_id, before.node_id);
        assert_eq!(after.instance_number(), before.instance_number());
        assert!(after.bean_config.host_history.is_empty());
        assert_eq!(h.events.count(LifecycleAction::Failed), 0);
    }

    #[tokio::test]
    async fn test_redeploy_keeps_its_observer() {
        let h = Harness::new();
        h.executor(4).await;
        let manager = h.manager(SpecBuilder::new("worker").build());
        manager.start(Vec::new());
        h.ctx.queue.process().await;
        let before = manager.instances().remove(0);

        let seen: Arc<Mutex<Vec<ProvisionOutcome>>> = Arc::default();
        let observer: ProvisionListener = {
            let seen = seen.clone();
            Arc::new(move |outcome| seen.lock().unwrap().push(outcome))
        };
        manager
            .redeploy(before.instance_id, false, false, Some(observer))
            .await
            .unwrap();
        h.ctx.queue.process().await;

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 1);
        let ProvisionOutcome::Provisioned(after) = &seen[0] else {
            panic!("expected a provisioned outcome, got {:?}", seen[0]);
        };
        assert_ne!(after.instance_id, before.instance_id);
        assert_eq!(after.instance_number(), before.instance_number());
        assert_eq!(after.bean_config.host_history, before.bean_config.host_history);
        assert_eq!(h.events.count(LifecycleAction::Failed), 0);

        // A late teardown callback for the old instance changes nothing.
        manager.instance_terminated(before.instance_id).await;
        assert_eq!(manager.planned(), 1);
        assert_eq!(manager.actual(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_process_and_verify_run_concurrently() {
        let h = Harness::new();
        h.executor(1).await;
        let manager = h.manager(SpecBuilder::new("worker").planned(200).build());
        manager.start(Vec::new());

        let verifier = {
            let manager = manager.clone();
            std::thread::spawn(move || {
                for _ in 0..2_000 {
                    manager.verify();
                    manager.status();
                }
            })
        };
        let dispatcher = {
            let queue = h.ctx.queue.clone();
            tokio::spawn(async move {
                for _ in 0..200 {
                    queue.process().await;
                }
            })
        };

        let finished = tokio::time::timeout(Duration::from_secs(30), async move {
            dispatcher.await.unwrap();
            tokio::task::spawn_blocking(move || verifier.join().unwrap())
                .await
                .unwrap();
        })
        .await;
        assert!(finished.is_ok(), "dispatch and verify stopped making progress");

        let status = manager.status();
        assert_eq!(status.actual, 1);
        assert_eq!(status.pending, 199);
    }

    #[tokio::test]
    async fn test_relocate_moves_to_preferred_node() {
        let h = Harness::new();
        let a = h.executor(4).await;
        let b = h.executor(4).await;
        let manager = h.manager(SpecBuilder::new("worker").build());
        manager.start(Vec::new());
        h.ctx.queue.process().await;
        let before = manager.instances().remove(0);
        let target = if before.node_id == a.node_id() {
            b.node_id()
        } else {
            a.node_id()
        };

        let after = manager
            .relocate(before.instance_id, None, Some(target))
            .await
            .unwrap();

        assert_eq!(after.node_id, target);
        assert_eq!(manager.instances()[0].instance_id, after.instance_id);
        assert!(matches!(
            manager.relocate(before.instance_id, None, None).await,
            Err(ManagerError::UnknownInstance(_))
        ));
    }

    #[tokio::test]
    async fn test_relocate_failure_leaves_original() {
        let h = Harness::new();
        h.executor(4).await;
        let manager = h.manager(SpecBuilder::new("worker").build());
        manager.start(Vec::new());
        h.ctx.queue.process().await;
        let before = manager.instances().remove(0);

        let result = manager.relocate(before.instance_id, None, None).await;

        assert!(matches!(result, Err(ManagerError::RelocationFailed(_))));
        assert_eq!(manager.instances()[0].instance_id, before.instance_id);
    }

    #[tokio::test]
    async fn test_lost_node_fails_its_instances() {
        let h = Harness::new();
        let executor = FakeExecutor::new(4);
        let lease = h.ctx.registry.register(executor.registration(4)).await.unwrap();
        let manager = h.manager(SpecBuilder::new("worker").planned(2).build());
        manager.start(Vec::new());
        h.ctx.queue.process().await;
        assert_eq!(manager.actual(), 2);

        h.ctx.registry.cancel(lease.lease_id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let status = manager.status();
        assert_eq!(status.actual, 0);
        assert_eq!(status.pending, 2);
        assert_eq!(h.events.count(LifecycleAction::Failed), 2);
    }
}
