//! Dispatch queue: provision work not yet satisfied by an executor.
//!
//! Requests for DYNAMIC specifications live in a pending multiset keyed by
//! specification. FIXED requests are per node (each carries a required
//! node) and live in a separate set; their owners register a refresh hook
//! that re-templates them on every pass so new matching executors get an
//! instance too.
//!
//! `process()` re-attempts every pending request against the live executor
//! pool. It runs whenever new capacity becomes known, which is how a
//! transient shortage heals without polling. Executor and deployment
//! manager calls never happen while the queue lock is held: managers call
//! into the queue under their own lock.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use fleet_id::{NodeId, RequestId};
use fleet_proto::{DeploymentRef, InstanceRecord, PlacementType, ServiceSpec, SpecKey};
use futures_util::stream::{self, StreamExt};
use tokio::sync::Notify;
use tracing::{debug, info, instrument, warn};

use crate::registry::{ExecutorRegistry, ExecutorView};
use crate::selector::ResourceSelector;

/// Receives the outcome of a provision request.
pub type ProvisionListener = Arc<dyn Fn(ProvisionOutcome) + Send + Sync>;

/// Re-templates a specification's FIXED requests before a pass.
pub type RefreshHook = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Provision,
    Relocate,
    /// Failed with a non-retryable error; parked until the specification changes.
    Uninstantiable,
}

#[derive(Debug, Clone)]
pub enum ProvisionOutcome {
    Provisioned(InstanceRecord),
    /// No executor took the request.
    Failed { spec: ServiceSpec, reason: String },
    Uninstantiable { spec: ServiceSpec, reason: String },
}

impl ProvisionOutcome {
    /// Why the request was not satisfied; `None` when it was.
    pub fn reason(&self) -> Option<&str> {
        match self {
            ProvisionOutcome::Provisioned(_) => None,
            ProvisionOutcome::Failed { reason, .. }
            | ProvisionOutcome::Uninstantiable { reason, .. } => Some(reason),
        }
    }
}

/// One unit of provision work.
#[derive(Clone)]
pub struct ProvisionRequest {
    pub id: RequestId,
    /// Snapshot taken when the request was built.
    pub spec: ServiceSpec,
    pub listener: ProvisionListener,
    pub deployment: DeploymentRef,
    pub exclude: HashSet<NodeId>,
    pub require: Option<NodeId>,
    pub kind: RequestKind,
    pub created_at: DateTime<Utc>,
}

impl ProvisionRequest {
    pub fn new(spec: ServiceSpec, deployment: DeploymentRef, listener: ProvisionListener) -> Self {
        Self {
            id: RequestId::new(),
            spec,
            listener,
            deployment,
            exclude: HashSet::new(),
            require: None,
            kind: RequestKind::Provision,
            created_at: Utc::now(),
        }
    }

    pub fn excluding(mut self, node_id: NodeId) -> Self {
        self.exclude.insert(node_id);
        self
    }

    pub fn requiring(mut self, node_id: Option<NodeId>) -> Self {
        self.require = node_id;
        self
    }

    pub fn with_kind(mut self, kind: RequestKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn key(&self) -> SpecKey {
        self.spec.key()
    }

    pub fn instance_number(&self) -> Option<u64> {
        self.spec.instance_number()
    }

    fn is_fixed(&self) -> bool {
        self.spec.placement == PlacementType::Fixed && self.require.is_some()
    }
}

impl std::fmt::Debug for ProvisionRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisionRequest")
            .field("id", &self.id)
            .field("key", &self.key())
            .field("instance_number", &self.instance_number())
            .field("exclude", &self.exclude)
            .field("require", &self.require)
            .field("kind", &self.kind)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// Counters from one `process()` pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProcessStats {
    pub attempted: usize,
    pub provisioned: usize,
    pub requeued: usize,
    pub uninstantiable: usize,
    pub dropped: usize,
}

struct Pending {
    request: ProvisionRequest,
    priority: u8,
    seq: u64,
}

enum Attempt {
    Provisioned(InstanceRecord),
    Unsatisfied(String),
    Uninstantiable(String),
}

#[derive(Default)]
struct QueueState {
    dynamic: HashMap<SpecKey, Vec<Pending>>,
    fixed: HashMap<SpecKey, Vec<Pending>>,
    in_flight: HashMap<SpecKey, u32>,
    in_flight_on: HashMap<(SpecKey, NodeId), u32>,
    /// Bumped by `remove`; requests from an older generation are not requeued.
    generation: HashMap<SpecKey, u64>,
    /// Latest specification and listener from `update_all`.
    patches: HashMap<SpecKey, (ServiceSpec, ProvisionListener)>,
    hooks: HashMap<SpecKey, RefreshHook>,
    seq: u64,
}

impl QueueState {
    fn generation(&self, key: &SpecKey) -> u64 {
        self.generation.get(key).copied().unwrap_or(0)
    }

    fn push(&mut self, request: ProvisionRequest, priority: u8) {
        self.seq += 1;
        let pending = Pending {
            request,
            priority,
            seq: self.seq,
        };
        let key = pending.request.key();
        let set = if pending.request.is_fixed() {
            &mut self.fixed
        } else {
            &mut self.dynamic
        };
        set.entry(key).or_default().push(pending);
    }

    fn start_flight(&mut self, request: &ProvisionRequest) {
        let key = request.key();
        *self.in_flight.entry(key.clone()).or_insert(0) += 1;
        if let Some(node) = request.require {
            *self.in_flight_on.entry((key, node)).or_insert(0) += 1;
        }
    }

    fn finish_flight(&mut self, request: &ProvisionRequest) {
        let key = request.key();
        if let Some(count) = self.in_flight.get_mut(&key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.in_flight.remove(&key);
            }
        }
        if let Some(node) = request.require {
            let slot = (key, node);
            if let Some(count) = self.in_flight_on.get_mut(&slot) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.in_flight_on.remove(&slot);
                }
            }
        }
    }

    fn patch(&self, request: &mut ProvisionRequest) {
        if let Some((spec, listener)) = self.patches.get(&request.key()) {
            request.spec = spec.with_bean_config(request.spec.bean_config.clone());
            request.listener = Arc::clone(listener);
        }
    }

    fn pending(&self, key: &SpecKey) -> impl Iterator<Item = &Pending> {
        self.dynamic
            .get(key)
            .into_iter()
            .chain(self.fixed.get(key))
            .flatten()
    }
}

fn take_ready(list: &mut Vec<Pending>) -> Vec<Pending> {
    let (ready, parked): (Vec<_>, Vec<_>) = std::mem::take(list)
        .into_iter()
        .partition(|p| p.request.kind != RequestKind::Uninstantiable);
    *list = parked;
    ready
}

/// Controller-side holding area for provision work.
pub struct DispatchQueue {
    registry: Arc<ExecutorRegistry>,
    selector: Arc<dyn ResourceSelector>,
    concurrency: usize,
    wake: Arc<Notify>,
    state: Mutex<QueueState>,
}

impl DispatchQueue {
    pub fn new(
        registry: Arc<ExecutorRegistry>,
        selector: Arc<dyn ResourceSelector>,
        concurrency: usize,
    ) -> Self {
        let wake = registry.capacity_notify();
        Self {
            registry,
            selector,
            concurrency: concurrency.max(1),
            wake,
            state: Mutex::new(QueueState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Ask the worker for a `process()` pass.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Enqueue a request. Lower `priority` values are dispatched first.
    pub fn add(&self, request: ProvisionRequest, priority: u8) {
        debug!(
            request_id = %request.id,
            spec = %request.key(),
            instance_number = ?request.instance_number(),
            require = ?request.require,
            priority,
            "Provision request queued"
        );
        self.lock().push(request, priority);
    }

    /// Remove every pending request of a specification.
    ///
    /// In-flight requests of the specification are dropped when they come
    /// back unsatisfied.
    pub fn remove(&self, key: &SpecKey) -> Vec<ProvisionRequest> {
        let mut state = self.lock();
        *state.generation.entry(key.clone()).or_insert(0) += 1;
        state.patches.remove(key);
        let mut removed: Vec<_> = state.dynamic.remove(key).unwrap_or_default();
        removed.extend(state.fixed.remove(key).unwrap_or_default());
        removed.into_iter().map(|p| p.request).collect()
    }

    /// Remove up to `n` pending DYNAMIC requests, newest first.
    pub fn remove_n(&self, key: &SpecKey, n: usize) -> Vec<ProvisionRequest> {
        let mut state = self.lock();
        let Some(list) = state.dynamic.get_mut(key) else {
            return Vec::new();
        };
        list.sort_by_key(|p| (p.priority, p.seq));
        let keep = list.len().saturating_sub(n);
        let removed: Vec<_> = list.drain(keep..).rev().map(|p| p.request).collect();
        if list.is_empty() {
            state.dynamic.remove(key);
        }
        removed
    }

    /// Remove the pending requests of a specification bound to `node_id`.
    pub fn remove_on(&self, key: &SpecKey, node_id: NodeId) -> Vec<ProvisionRequest> {
        let mut state = self.lock();
        let QueueState { dynamic, fixed, .. } = &mut *state;
        let mut removed = Vec::new();
        for list in [dynamic.get_mut(key), fixed.get_mut(key)].into_iter().flatten() {
            let (bound, rest): (Vec<_>, Vec<_>) = std::mem::take(list)
                .into_iter()
                .partition(|p| p.request.require == Some(node_id));
            *list = rest;
            removed.extend(bound.into_iter().map(|p| p.request));
        }
        removed
    }

    /// Pending plus in-flight requests of a specification.
    pub fn count(&self, key: &SpecKey) -> u32 {
        let state = self.lock();
        let pending = state.pending(key).count() as u32;
        pending + state.in_flight.get(key).copied().unwrap_or(0)
    }

    /// Pending plus in-flight requests of a specification bound to `node_id`.
    pub fn count_on(&self, key: &SpecKey, node_id: NodeId) -> u32 {
        let state = self.lock();
        let pending = state
            .pending(key)
            .filter(|p| p.request.require == Some(node_id))
            .count() as u32;
        pending
            + state
                .in_flight_on
                .get(&(key.clone(), node_id))
                .copied()
                .unwrap_or(0)
    }

    /// Parked requests of a specification.
    pub fn uninstantiable(&self, key: &SpecKey) -> u32 {
        self.lock()
            .pending(key)
            .filter(|p| p.request.kind == RequestKind::Uninstantiable)
            .count() as u32
    }

    /// Patch every pending request of `spec` with the new specification and
    /// listener, keeping each request's own bean config. Parked requests get
    /// another chance. Returns how many were patched.
    pub fn update_all(&self, spec: &ServiceSpec, listener: ProvisionListener) -> usize {
        let key = spec.key();
        let mut state = self.lock();
        state
            .patches
            .insert(key.clone(), (spec.clone(), Arc::clone(&listener)));

        let QueueState { dynamic, fixed, .. } = &mut *state;
        let mut patched = 0;
        for list in [dynamic.get_mut(&key), fixed.get_mut(&key)].into_iter().flatten() {
            for pending in list.iter_mut() {
                let request = &mut pending.request;
                request.spec = spec.with_bean_config(request.spec.bean_config.clone());
                request.listener = Arc::clone(&listener);
                if request.kind == RequestKind::Uninstantiable {
                    request.kind = RequestKind::Provision;
                }
                patched += 1;
            }
        }
        debug!(spec = %key, patched, "Patched pending requests");
        patched
    }

    /// Run `hook` at the start of every pass.
    pub fn register_hook(&self, key: SpecKey, hook: RefreshHook) {
        self.lock().hooks.insert(key, hook);
    }

    pub fn unregister_hook(&self, key: &SpecKey) {
        self.lock().hooks.remove(key);
    }

    /// Re-attempt every pending request against the live executor pool.
    #[instrument(skip(self))]
    pub async fn process(&self) -> ProcessStats {
        let hooks: Vec<RefreshHook> = self.lock().hooks.values().cloned().collect();
        for hook in hooks {
            hook();
        }

        let mut stats = ProcessStats::default();
        if self.registry.is_empty() {
            debug!("No executors registered, nothing to dispatch");
            return stats;
        }

        // Ready requests count as in flight from the moment they leave the
        // pending set, so `count()` never misses them.
        let ready: Vec<(Pending, u64)> = {
            let mut state = self.lock();
            let QueueState { dynamic, fixed, .. } = &mut *state;
            let mut ready: Vec<Pending> = Vec::new();
            for list in dynamic.values_mut().chain(fixed.values_mut()) {
                ready.extend(take_ready(list));
            }
            dynamic.retain(|_, list| !list.is_empty());
            fixed.retain(|_, list| !list.is_empty());

            ready
                .into_iter()
                .map(|pending| {
                    state.start_flight(&pending.request);
                    let generation = state.generation(&pending.request.key());
                    (pending, generation)
                })
                .collect()
        };

        // Deployment managers take their own lock; ask them with the queue
        // lock released.
        let (mut batch, inactive): (Vec<_>, Vec<_>) = ready
            .into_iter()
            .partition(|(pending, _)| pending.request.deployment.is_active());
        if !inactive.is_empty() {
            let mut state = self.lock();
            for (pending, _) in &inactive {
                debug!(request_id = %pending.request.id, "Dropping request of inactive deployment");
                state.finish_flight(&pending.request);
            }
            stats.dropped += inactive.len();
        }
        batch.sort_by_key(|(p, _)| (p.priority, p.seq));

        if batch.is_empty() {
            return stats;
        }
        stats.attempted = batch.len();

        let results: Vec<(Pending, u64, Attempt, bool)> = stream::iter(batch)
            .map(|(pending, generation)| async move {
                let attempt = self.attempt(&pending.request).await;
                let active = pending.request.deployment.is_active();
                (pending, generation, attempt, active)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut notifications: Vec<(ProvisionListener, ProvisionOutcome)> = Vec::new();
        // Provisioned requests stay in flight until their owner has seen the
        // record, so the instance is never missing from both counts.
        let mut landed: Vec<ProvisionRequest> = Vec::new();
        {
            let mut state = self.lock();
            for (mut pending, generation, attempt, active) in results {
                let current = generation == state.generation(&pending.request.key());
                if !matches!(attempt, Attempt::Provisioned(_)) {
                    state.finish_flight(&pending.request);
                }

                match attempt {
                    Attempt::Provisioned(record) => {
                        stats.provisioned += 1;
                        notifications.push((
                            Arc::clone(&pending.request.listener),
                            ProvisionOutcome::Provisioned(record),
                        ));
                        landed.push(pending.request);
                    }
                    Attempt::Unsatisfied(reason) => {
                        if current && active {
                            debug!(request_id = %pending.request.id, reason = %reason, "Request stays pending");
                            state.patch(&mut pending.request);
                            let Pending { request, priority, .. } = pending;
                            state.push(request, priority);
                            stats.requeued += 1;
                        } else {
                            stats.dropped += 1;
                        }
                    }
                    Attempt::Uninstantiable(reason) => {
                        stats.uninstantiable += 1;
                        let spec = pending.request.spec.clone();
                        notifications.push((
                            Arc::clone(&pending.request.listener),
                            ProvisionOutcome::Uninstantiable { spec, reason },
                        ));
                        if current {
                            pending.request.kind = RequestKind::Uninstantiable;
                            let Pending { request, priority, .. } = pending;
                            state.push(request, priority);
                        }
                    }
                }
            }
        }

        for (listener, outcome) in notifications {
            listener(outcome);
        }
        if !landed.is_empty() {
            let mut state = self.lock();
            for request in &landed {
                state.finish_flight(request);
            }
        }

        if stats.provisioned > 0 || stats.uninstantiable > 0 {
            info!(
                attempted = stats.attempted,
                provisioned = stats.provisioned,
                requeued = stats.requeued,
                uninstantiable = stats.uninstantiable,
                "Dispatch pass complete"
            );
        }
        stats
    }

    /// Dispatch a request immediately, bypassing the pending set.
    pub async fn dispatch_now(&self, request: &ProvisionRequest) -> ProvisionOutcome {
        match self.attempt(request).await {
            Attempt::Provisioned(record) => ProvisionOutcome::Provisioned(record),
            Attempt::Unsatisfied(reason) => ProvisionOutcome::Failed {
                spec: request.spec.clone(),
                reason,
            },
            Attempt::Uninstantiable(reason) => ProvisionOutcome::Uninstantiable {
                spec: request.spec.clone(),
                reason,
            },
        }
    }

    /// Try eligible executors until one accepts, none is left, or one fails
    /// for good.
    async fn attempt(&self, request: &ProvisionRequest) -> Attempt {
        let key = request.key();
        let mut tried = request.exclude.clone();

        loop {
            let candidates: Vec<ExecutorView> = match request.require {
                Some(node) => self.registry.get(node).into_iter().collect(),
                None => self.registry.snapshot(),
            };
            let Some(node_id) = self.selector.select(&request.spec, &candidates, &tried) else {
                return Attempt::Unsatisfied(format!("no eligible executor for {key}"));
            };
            if !tried.insert(node_id) {
                return Attempt::Unsatisfied(format!("selector returned excluded node {node_id}"));
            }
            let Some(view) = candidates.into_iter().find(|v| v.node_id == node_id) else {
                return Attempt::Unsatisfied(format!("selected node {node_id} is not a candidate"));
            };

            match view
                .executor
                .instantiate(request.spec.clone(), Arc::clone(&request.deployment))
                .await
            {
                Ok(Some(record)) => {
                    self.registry.record_placement(node_id, &key);
                    info!(
                        request_id = %request.id,
                        spec = %key,
                        instance_id = %record.instance_id,
                        instance_number = ?record.instance_number(),
                        node_id = %node_id,
                        "Instance provisioned"
                    );
                    return Attempt::Provisioned(record);
                }
                Ok(None) => {
                    debug!(request_id = %request.id, node_id = %node_id, "Executor declined");
                }
                Err(e) if e.retryable => {
                    warn!(request_id = %request.id, node_id = %node_id, error = %e, "Instantiation failed, trying another executor");
                }
                Err(e) => {
                    warn!(request_id = %request.id, node_id = %node_id, error = %e, "Specification cannot be instantiated");
                    return Attempt::Uninstantiable(e.reason);
                }
            }
        }
    }
}

impl std::fmt::Debug for DispatchQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("DispatchQueue")
            .field("dynamic", &state.dynamic.values().map(Vec::len).sum::<usize>())
            .field("fixed", &state.fixed.values().map(Vec::len).sum::<usize>())
            .field("in_flight", &state.in_flight.values().sum::<u32>())
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use fleet_id::ControllerId;
    use fleet_proto::{Executor, LeaseRegistrar};
    use fleet_testing::{FakeExecutor, InstantiateBehavior, NullDeployment, SpecBuilder};

    use crate::selector::LeastLoadedSelector;

    fn queue() -> (Arc<ExecutorRegistry>, DispatchQueue) {
        let registry = Arc::new(ExecutorRegistry::new(ControllerId::new(), Duration::from_secs(30)));
        let queue = DispatchQueue::new(registry.clone(), Arc::new(LeastLoadedSelector), 4);
        (registry, queue)
    }

    fn recording() -> (ProvisionListener, Arc<Mutex<Vec<ProvisionOutcome>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener: ProvisionListener = Arc::new(move |outcome: ProvisionOutcome| {
            sink.lock().unwrap().push(outcome);
        });
        (listener, seen)
    }

    fn request(spec: &ServiceSpec, n: u64, listener: &ProvisionListener) -> ProvisionRequest {
        ProvisionRequest::new(
            spec.snapshot_for(n),
            NullDeployment::new(spec.key()),
            listener.clone(),
        )
    }

    #[tokio::test]
    async fn test_process_without_executors_keeps_requests() {
        let (_registry, queue) = queue();
        let spec = SpecBuilder::new("worker").planned(3).build();
        let (listener, seen) = recording();
        for n in 1..=3 {
            queue.add(request(&spec, n, &listener), 5);
        }

        let stats = queue.process().await;

        assert_eq!(stats.attempted, 0);
        assert_eq!(queue.count(&spec.key()), 3);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_process_provisions_and_requeues_declines() {
        let (registry, queue) = queue();
        let executor = FakeExecutor::new(1);
        registry.register(executor.registration(1)).await.unwrap();

        let spec = SpecBuilder::new("worker").planned(3).build();
        let (listener, seen) = recording();
        for n in 1..=3 {
            queue.add(request(&spec, n, &listener), 5);
        }

        let stats = queue.process().await;

        assert_eq!(stats.provisioned, 1);
        assert_eq!(stats.requeued, 2);
        assert_eq!(queue.count(&spec.key()), 2);
        assert_eq!(executor.running().len(), 1);
        assert!(matches!(seen.lock().unwrap()[0], ProvisionOutcome::Provisioned(_)));
    }

    #[tokio::test]
    async fn test_fatal_failure_parks_until_update() {
        let (registry, queue) = queue();
        let executor = FakeExecutor::new(4);
        executor.set_behavior(InstantiateBehavior::Fail { retryable: false });
        registry.register(executor.registration(4)).await.unwrap();

        let spec = SpecBuilder::new("worker").build();
        let (listener, seen) = recording();
        queue.add(request(&spec, 1, &listener), 5);

        let stats = queue.process().await;
        assert_eq!(stats.uninstantiable, 1);
        assert_eq!(queue.uninstantiable(&spec.key()), 1);
        assert_eq!(queue.count(&spec.key()), 1);
        assert!(matches!(
            seen.lock().unwrap()[0],
            ProvisionOutcome::Uninstantiable { .. }
        ));

        // Parked requests are skipped.
        let calls = executor.calls();
        queue.process().await;
        assert_eq!(executor.calls(), calls);

        executor.set_behavior(InstantiateBehavior::Accept);
        let (patched_listener, patched_seen) = recording();
        assert_eq!(queue.update_all(&spec, patched_listener), 1);
        assert_eq!(queue.uninstantiable(&spec.key()), 0);

        queue.process().await;
        assert_eq!(queue.count(&spec.key()), 0);
        assert_eq!(patched_seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_retryable_failure_tries_next_executor() {
        let (registry, queue) = queue();
        let broken = FakeExecutor::new(4);
        broken.set_behavior(InstantiateBehavior::Fail { retryable: true });
        let healthy = FakeExecutor::new(4);
        registry.register(broken.registration(4)).await.unwrap();
        registry.register(healthy.registration(4)).await.unwrap();

        let spec = SpecBuilder::new("worker").build();
        let (listener, _seen) = recording();
        queue.add(request(&spec, 1, &listener), 5);

        let stats = queue.process().await;

        assert_eq!(stats.provisioned, 1);
        assert_eq!(healthy.running().len(), 1);
    }

    #[test]
    fn test_remove_n_trims_only_what_exists() {
        let (_registry, queue) = queue();
        let spec = SpecBuilder::new("worker").planned(5).build();
        let (listener, _) = recording();
        queue.add(request(&spec, 1, &listener), 5);
        queue.add(request(&spec, 2, &listener), 5);

        let removed = queue.remove_n(&spec.key(), 5);

        assert_eq!(removed.len(), 2);
        assert_eq!(removed[0].instance_number(), Some(2));
        assert_eq!(queue.count(&spec.key()), 0);
    }

    #[tokio::test]
    async fn test_require_restricts_to_one_node() {
        let (registry, queue) = queue();
        let a = FakeExecutor::new(4);
        let b = FakeExecutor::new(4);
        registry.register(a.registration(4)).await.unwrap();
        registry.register(b.registration(4)).await.unwrap();

        let spec = SpecBuilder::new("worker").build();
        let (listener, _) = recording();
        let req = request(&spec, 1, &listener).requiring(Some(b.node_id()));

        let outcome = queue.dispatch_now(&req).await;

        match outcome {
            ProvisionOutcome::Provisioned(record) => assert_eq!(record.node_id, b.node_id()),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(a.running().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_now_fails_when_only_node_is_excluded() {
        let (registry, queue) = queue();
        let only = FakeExecutor::new(4);
        registry.register(only.registration(4)).await.unwrap();

        let spec = SpecBuilder::new("worker").build();
        let (listener, _) = recording();
        let req = request(&spec, 1, &listener).excluding(only.node_id());

        assert!(matches!(
            queue.dispatch_now(&req).await,
            ProvisionOutcome::Failed { .. }
        ));
    }

    #[tokio::test]
    async fn test_hooks_run_before_each_pass() {
        let (_registry, queue) = queue();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let key = SpecKey::new("test", "daemon");
        queue.register_hook(
            key.clone(),
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        queue.process().await;
        queue.process().await;
        queue.unregister_hook(&key);
        queue.process().await;

        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_remove_clears_both_sets() {
        let (_registry, queue) = queue();
        let node = NodeId::new();
        let fixed = SpecBuilder::new("daemon")
            .placement(PlacementType::Fixed)
            .build();
        let (listener, _) = recording();
        queue.add(request(&fixed, 1, &listener).requiring(Some(node)), 5);
        queue.add(request(&fixed, 2, &listener), 5);

        assert_eq!(queue.count_on(&fixed.key(), node), 1);
        assert_eq!(queue.remove(&fixed.key()).len(), 2);
        assert_eq!(queue.count(&fixed.key()), 0);
    }
}
