//! Service container: the lifecycle of a single instance on this node.
//!
//! ```text
//! Created ──activate──▶ Loading ──started──▶ Active ──terminate──▶ Terminating ──▶ Terminated
//!    │                     │
//!    └──declined───────────┴──failed / cancelled──────────────────────────────────▶ Terminated
//! ```
//!
//! Startup code runs on its own task, bounded by the host's activation
//! pool and a hard timeout. The caller of [`ServiceContainer::activate`]
//! waits for that task or for the container to be told to tear down,
//! whichever comes first.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use fleet_id::{InstanceId, NodeId};
use fleet_proto::{
    DeploymentRef, InstanceRecord, InstantiationError, RemoteError, ServiceProxy, ServiceSpec,
    SpecKey,
};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinError;
use tracing::{debug, info, instrument, warn};

use crate::error::{ContainerError, RuntimeError};
use crate::reservation::{Reservation, ReservationLedger};
use crate::runtime::{ServiceHandle, ServiceRuntime};

/// Container lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Loading,
    Active,
    Terminating,
    Terminated,
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ContainerState::Created => "created",
            ContainerState::Loading => "loading",
            ContainerState::Active => "active",
            ContainerState::Terminating => "terminating",
            ContainerState::Terminated => "terminated",
        };
        write!(f, "{s}")
    }
}

/// Called once per container when an active instance goes away.
pub type TerminationListener = Arc<dyn Fn(InstanceId, &SpecKey) + Send + Sync>;

/// Node-level settings every container needs.
#[derive(Debug, Clone)]
pub struct ContainerSettings {
    pub node_id: NodeId,
    pub host_address: String,
    pub activation_timeout: Duration,
}

/// Accrues active time for resource-cost accounting.
#[derive(Debug, Default)]
struct CostMeter {
    started: Option<Instant>,
    accrued: Duration,
}

impl CostMeter {
    fn start(&mut self) {
        self.started.get_or_insert_with(Instant::now);
    }

    fn stop(&mut self) {
        if let Some(started) = self.started.take() {
            self.accrued += started.elapsed();
        }
    }

    fn elapsed(&self) -> Duration {
        self.accrued + self.started.map(|s| s.elapsed()).unwrap_or_default()
    }
}

struct Inner {
    state: ContainerState,
    spec: Option<ServiceSpec>,
    deployment: Option<DeploymentRef>,
    handle: Option<ServiceHandle>,
    reserved: bool,
    meter: CostMeter,
}

enum Startup {
    Done(Result<Result<ServiceHandle, RuntimeError>, JoinError>),
    TimedOut,
    Cancelled,
}

/// One instance's container.
pub struct ServiceContainer {
    instance_id: InstanceId,
    settings: ContainerSettings,
    runtime: Arc<dyn ServiceRuntime>,
    ledger: Arc<ReservationLedger>,
    workers: Arc<Semaphore>,
    inner: Mutex<Inner>,
    listeners: Mutex<Vec<TerminationListener>>,
    cancel: watch::Sender<bool>,
    exited: watch::Sender<bool>,
    weak_self: Weak<Self>,
}

impl ServiceContainer {
    pub fn new(
        settings: ContainerSettings,
        runtime: Arc<dyn ServiceRuntime>,
        ledger: Arc<ReservationLedger>,
        workers: Arc<Semaphore>,
    ) -> Arc<Self> {
        let (cancel, _) = watch::channel(false);
        let (exited, _) = watch::channel(false);
        Arc::new_cyclic(|weak_self| Self {
            instance_id: InstanceId::new(),
            settings,
            runtime,
            ledger,
            workers,
            inner: Mutex::new(Inner {
                state: ContainerState::Created,
                spec: None,
                deployment: None,
                handle: None,
                reserved: false,
                meter: CostMeter::default(),
            }),
            listeners: Mutex::new(Vec::new()),
            cancel,
            exited,
            weak_self: weak_self.clone(),
        })
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    pub fn state(&self) -> ContainerState {
        self.lock().state
    }

    pub fn spec(&self) -> Option<ServiceSpec> {
        self.lock().spec.clone()
    }

    pub fn key(&self) -> Option<SpecKey> {
        self.lock().spec.as_ref().map(ServiceSpec::key)
    }

    /// Time spent active so far.
    pub fn uptime(&self) -> Duration {
        self.lock().meter.elapsed()
    }

    /// Accrued cost in CPU-core seconds.
    pub fn cost(&self) -> f64 {
        let inner = self.lock();
        let cores = inner
            .spec
            .as_ref()
            .map(|s| s.constraints.cpu_cores)
            .unwrap_or_default();
        inner.meter.elapsed().as_secs_f64() * cores
    }

    pub fn add_listener(&self, listener: TerminationListener) {
        match self.listeners.lock() {
            Ok(mut listeners) => listeners.push(listener),
            Err(poisoned) => poisoned.into_inner().push(listener),
        }
    }

    /// Signal that flips to `true` once the instance is gone.
    pub fn exit_signal(&self) -> watch::Receiver<bool> {
        self.exited.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Start one instance of `spec`.
    ///
    /// Returns `Ok(None)` without doing any work when the node already hosts
    /// as many instances of `spec` as allowed.
    #[instrument(skip(self, spec, deployment), fields(instance_id = %self.instance_id, spec = %spec.key()))]
    pub async fn activate(
        &self,
        spec: ServiceSpec,
        deployment: DeploymentRef,
    ) -> Result<Option<InstanceRecord>, InstantiationError> {
        {
            let mut inner = self.lock();
            if inner.state != ContainerState::Created {
                return Err(InstantiationError::fatal(
                    ContainerError::AlreadyActivated(self.instance_id.to_string()).to_string(),
                ));
            }

            match self.ledger.try_reserve(&spec) {
                Reservation::Granted => {}
                declined => {
                    inner.state = ContainerState::Terminated;
                    debug!(?declined, "Declined activation");
                    return Ok(None);
                }
            }

            inner.state = ContainerState::Loading;
            inner.reserved = true;
            inner.spec = Some(spec.clone());
            inner.deployment = Some(deployment);
        }

        let handle = match self.run_startup(spec.clone()).await {
            Ok(handle) => handle,
            Err(err) => {
                warn!(error = %err, retryable = err.retryable, "Activation failed");
                self.abandon(&spec);
                return Err(err);
            }
        };

        let Some(this) = self.weak_self.upgrade() else {
            self.abandon(&spec);
            return Err(InstantiationError::retryable("container dropped during activation"));
        };

        {
            let mut inner = self.lock();
            if inner.state == ContainerState::Loading {
                inner.state = ContainerState::Active;
                inner.handle = Some(handle.clone());
                inner.meter.start();
                info!(boot_id = %handle.boot_id, "Instance active");

                return Ok(Some(InstanceRecord {
                    instance_id: self.instance_id,
                    key: spec.key(),
                    handle: Arc::new(ContainerProxy { container: this }),
                    bean_config: spec.bean_config.clone(),
                    host_address: self.settings.host_address.clone(),
                    node_id: self.settings.node_id,
                }));
            }
        }

        // Torn down while startup was finishing.
        if let Err(e) = self.runtime.stop(&handle).await {
            warn!(error = %e, "Failed to stop instance started during teardown");
        }
        self.abandon(&spec);
        Err(InstantiationError::retryable("container terminated during activation"))
    }

    async fn run_startup(&self, spec: ServiceSpec) -> Result<ServiceHandle, InstantiationError> {
        let mut cancel = self.cancel.subscribe();
        let timeout = self.settings.activation_timeout;

        let permit = tokio::select! {
            permit = Arc::clone(&self.workers).acquire_owned() => permit
                .map_err(|_| InstantiationError::retryable("activation pool closed"))?,
            _ = cancelled(&mut cancel) => {
                return Err(InstantiationError::retryable("container terminated before activation"));
            }
        };

        let runtime = Arc::clone(&self.runtime);
        let instance_id = self.instance_id;
        let mut task = tokio::spawn(async move {
            let _permit = permit;
            runtime.start(&spec, instance_id).await
        });

        let startup = tokio::select! {
            joined = tokio::time::timeout(timeout, &mut task) => match joined {
                Ok(result) => Startup::Done(result),
                Err(_) => Startup::TimedOut,
            },
            _ = cancelled(&mut cancel) => Startup::Cancelled,
        };

        match startup {
            Startup::Done(Ok(Ok(handle))) => Ok(handle),
            Startup::Done(Ok(Err(e))) => Err(e.into()),
            Startup::Done(Err(join)) if join.is_panic() => Err(InstantiationError::fatal(
                format!("startup code panicked: {join}"),
            )),
            Startup::Done(Err(join)) => Err(InstantiationError::retryable(format!(
                "startup task aborted: {join}"
            ))),
            Startup::TimedOut => {
                task.abort();
                Err(InstantiationError::retryable(format!(
                    "startup timed out after {timeout:?}"
                )))
            }
            Startup::Cancelled => {
                task.abort();
                Err(InstantiationError::retryable("container terminated during activation"))
            }
        }
    }

    /// Error edge out of `Loading`.
    fn abandon(&self, spec: &ServiceSpec) {
        let mut inner = self.lock();
        if inner.reserved {
            self.ledger.release(spec);
            inner.reserved = false;
        }
        inner.state = ContainerState::Terminated;
        inner.handle = None;
        inner.deployment = None;
    }

    /// Live-patch the running instance.
    ///
    /// Returns false when `spec` names a different specification; the
    /// caller must terminate and activate anew.
    pub fn update(&self, spec: ServiceSpec, deployment: DeploymentRef) -> bool {
        let mut inner = self.lock();
        if !matches!(inner.state, ContainerState::Loading | ContainerState::Active) {
            return false;
        }
        let Some(current) = inner.spec.as_ref() else {
            return false;
        };
        if current.key() != spec.key() {
            return false;
        }

        let mut spec = spec;
        if spec.bean_config.instance_id.is_none() {
            spec.bean_config.instance_id = current.bean_config.instance_id;
        }
        if inner.reserved {
            self.ledger.adjust(current, &spec);
        }
        debug!(instance_id = %self.instance_id, spec = %spec.key(), "Patched instance in place");
        inner.spec = Some(spec);
        inner.deployment = Some(deployment);
        true
    }

    /// Tear the instance down on request.
    ///
    /// Idempotent. Returns true only for the call that performed teardown.
    #[instrument(skip(self), fields(instance_id = %self.instance_id))]
    pub async fn terminate(&self) -> bool {
        let (handle, spec, deployment) = {
            let mut inner = self.lock();
            match inner.state {
                ContainerState::Created => {
                    inner.state = ContainerState::Terminated;
                    return false;
                }
                ContainerState::Loading => {
                    inner.state = ContainerState::Terminating;
                    self.cancel.send_replace(true);
                    return false;
                }
                ContainerState::Terminating | ContainerState::Terminated => return false,
                ContainerState::Active => {
                    inner.state = ContainerState::Terminating;
                    inner.meter.stop();
                    (
                        inner.handle.clone(),
                        inner.spec.clone(),
                        inner.deployment.clone(),
                    )
                }
            }
        };

        if let Some(handle) = &handle {
            let result = if handle.destroyable {
                self.runtime.destroy(handle).await
            } else {
                self.runtime.stop(handle).await
            };
            if let Err(e) = result {
                warn!(error = %e, "Teardown call failed, continuing");
            }
        }

        self.release_reservation(spec.as_ref());
        if let Some(spec) = &spec {
            self.notify_listeners(&spec.key());
        }
        if let Some(deployment) = deployment {
            deployment.instance_terminated(self.instance_id).await;
        }

        self.finish();
        info!("Instance terminated");
        true
    }

    /// The instance died on its own.
    ///
    /// Listeners on this node are told; the deployment manager learns about
    /// it through its fault monitor, which watches the exit signal.
    pub fn crashed(&self) -> bool {
        let spec = {
            let mut inner = self.lock();
            if inner.state != ContainerState::Active {
                return false;
            }
            inner.state = ContainerState::Terminating;
            inner.meter.stop();
            inner.spec.clone()
        };

        warn!(instance_id = %self.instance_id, "Instance exited unexpectedly");
        self.release_reservation(spec.as_ref());
        if let Some(spec) = &spec {
            self.notify_listeners(&spec.key());
        }
        self.finish();
        true
    }

    fn release_reservation(&self, spec: Option<&ServiceSpec>) {
        let mut inner = self.lock();
        if let (true, Some(spec)) = (inner.reserved, spec) {
            self.ledger.release(spec);
            inner.reserved = false;
        }
    }

    fn notify_listeners(&self, key: &SpecKey) {
        let listeners: Vec<_> = match self.listeners.lock() {
            Ok(listeners) => listeners.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        for listener in listeners {
            listener(self.instance_id, key);
        }
    }

    fn finish(&self) {
        {
            let mut inner = self.lock();
            inner.handle = None;
            inner.deployment = None;
            inner.state = ContainerState::Terminated;
        }
        self.exited.send_replace(true);
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        let handle = {
            let inner = self.lock();
            match (inner.state, inner.handle.clone()) {
                (ContainerState::Active, Some(handle)) => handle,
                (state, _) => {
                    return Err(RemoteError::Unreachable(format!("instance is {state}")));
                }
            }
        };

        match self.runtime.check_health(&handle).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(RemoteError::Unreachable("instance is not healthy".to_string())),
            Err(e) => Err(RemoteError::Uncategorized(e.to_string())),
        }
    }
}

impl std::fmt::Debug for ServiceContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceContainer")
            .field("instance_id", &self.instance_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// The handle controllers hold to an instance on this node.
struct ContainerProxy {
    container: Arc<ServiceContainer>,
}

#[async_trait]
impl ServiceProxy for ContainerProxy {
    async fn destroy(&self) -> Result<(), RemoteError> {
        self.container.terminate().await;
        Ok(())
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        self.container.ping().await
    }

    fn exit_signal(&self) -> Option<watch::Receiver<bool>> {
        Some(self.container.exit_signal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use fleet_proto::DESTROY_INTERFACE;
    use fleet_testing::{NullDeployment, SpecBuilder};

    use crate::runtime::{MockRuntime, MockStart};

    fn settings(timeout: Duration) -> ContainerSettings {
        ContainerSettings {
            node_id: NodeId::new(),
            host_address: "10.1.0.1".to_string(),
            activation_timeout: timeout,
        }
    }

    fn container(runtime: Arc<MockRuntime>, ledger: Arc<ReservationLedger>) -> Arc<ServiceContainer> {
        ServiceContainer::new(
            settings(Duration::from_secs(5)),
            runtime,
            ledger,
            Arc::new(Semaphore::new(2)),
        )
    }

    #[tokio::test]
    async fn test_activate_returns_record_with_instance_number() {
        let runtime = Arc::new(MockRuntime::with_delay(Duration::ZERO));
        let ledger = Arc::new(ReservationLedger::new(10));
        let spec = SpecBuilder::new("worker").planned(2).build().snapshot_for(2);
        let deployment = NullDeployment::new(spec.key());

        let c = container(runtime, ledger.clone());
        let record = c.activate(spec, deployment).await.unwrap().unwrap();

        assert_eq!(record.instance_id, c.instance_id());
        assert_eq!(record.instance_number(), Some(2));
        assert_eq!(c.state(), ContainerState::Active);
        assert_eq!(ledger.total(), 1);
    }

    #[tokio::test]
    async fn test_activate_declines_over_cap() {
        let runtime = Arc::new(MockRuntime::with_delay(Duration::ZERO));
        let ledger = Arc::new(ReservationLedger::new(10));
        let spec = SpecBuilder::new("worker").planned(1).build();
        let deployment = NullDeployment::new(spec.key());

        let first = container(runtime.clone(), ledger.clone());
        assert!(first.activate(spec.clone(), deployment.clone()).await.unwrap().is_some());

        let second = container(runtime.clone(), ledger);
        assert!(second.activate(spec, deployment).await.unwrap().is_none());
        assert_eq!(second.state(), ContainerState::Terminated);
        assert_eq!(runtime.boot_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_start_releases_reservation() {
        let runtime = Arc::new(MockRuntime::failing(false));
        let ledger = Arc::new(ReservationLedger::new(10));
        let spec = SpecBuilder::new("worker").build();
        let deployment = NullDeployment::new(spec.key());

        let c = container(runtime, ledger.clone());
        let err = c.activate(spec, deployment).await.unwrap_err();

        assert!(!err.retryable);
        assert_eq!(c.state(), ContainerState::Terminated);
        assert_eq!(ledger.total(), 0);
    }

    #[tokio::test]
    async fn test_panicking_startup_is_contained() {
        let runtime = Arc::new(MockRuntime::with_delay(Duration::ZERO));
        runtime.set_start_mode(MockStart::Panic);
        let ledger = Arc::new(ReservationLedger::new(10));
        let spec = SpecBuilder::new("worker").build();

        let c = container(runtime, ledger.clone());
        let err = c
            .activate(spec.clone(), NullDeployment::new(spec.key()))
            .await
            .unwrap_err();

        assert!(!err.retryable);
        assert!(err.reason.contains("panicked"));
        assert_eq!(ledger.total(), 0);
    }

    #[tokio::test]
    async fn test_hanging_startup_times_out() {
        let runtime = Arc::new(MockRuntime::with_delay(Duration::ZERO));
        runtime.set_start_mode(MockStart::Hang);
        let ledger = Arc::new(ReservationLedger::new(10));
        let spec = SpecBuilder::new("worker").build();

        let c = ServiceContainer::new(
            settings(Duration::from_millis(50)),
            runtime,
            ledger.clone(),
            Arc::new(Semaphore::new(1)),
        );
        let err = c
            .activate(spec.clone(), NullDeployment::new(spec.key()))
            .await
            .unwrap_err();

        assert!(err.retryable);
        assert!(err.reason.contains("timed out"));
        assert_eq!(ledger.total(), 0);
    }

    #[tokio::test]
    async fn test_terminate_during_loading_cancels_activation() {
        let runtime = Arc::new(MockRuntime::with_delay(Duration::ZERO));
        runtime.set_start_mode(MockStart::Hang);
        let ledger = Arc::new(ReservationLedger::new(10));
        let spec = SpecBuilder::new("worker").build();

        let c = container(runtime, ledger.clone());
        let activating = tokio::spawn({
            let c = Arc::clone(&c);
            let spec = spec.clone();
            async move { c.activate(spec.clone(), NullDeployment::new(spec.key())).await }
        });

        while c.state() != ContainerState::Loading {
            tokio::task::yield_now().await;
        }
        assert!(!c.terminate().await);

        let err = activating.await.unwrap().unwrap_err();
        assert!(err.reason.contains("terminated"));
        assert_eq!(c.state(), ContainerState::Terminated);
        assert_eq!(ledger.total(), 0);
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent_and_ordered() {
        let runtime = Arc::new(MockRuntime::with_delay(Duration::ZERO));
        let ledger = Arc::new(ReservationLedger::new(10));
        let spec = SpecBuilder::new("worker").interface(DESTROY_INTERFACE).build();
        let deployment = NullDeployment::new(spec.key());

        let c = container(runtime.clone(), ledger.clone());
        let notified = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&notified);
        let observed_ledger = Arc::clone(&ledger);
        c.add_listener(Arc::new(move |_: InstanceId, _: &SpecKey| {
            // reservations are already released when listeners run
            assert_eq!(observed_ledger.total(), 0);
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        c.activate(spec, deployment.clone()).await.unwrap().unwrap();
        let exit = c.exit_signal();

        assert!(c.terminate().await);
        assert!(!c.terminate().await);

        assert_eq!(notified.load(Ordering::SeqCst), 1);
        assert_eq!(deployment.calls(), 1);
        assert_eq!(runtime.destroy_calls(), 1);
        assert_eq!(runtime.stop_calls(), 0);
        assert_eq!(c.state(), ContainerState::Terminated);
        assert!(*exit.borrow());
    }

    #[tokio::test]
    async fn test_terminate_without_destroy_interface_stops() {
        let runtime = Arc::new(MockRuntime::with_delay(Duration::ZERO));
        let spec = SpecBuilder::new("worker").build();
        let c = container(runtime.clone(), Arc::new(ReservationLedger::new(10)));

        c.activate(spec.clone(), NullDeployment::new(spec.key()))
            .await
            .unwrap()
            .unwrap();
        c.terminate().await;

        assert_eq!(runtime.destroy_calls(), 0);
        assert_eq!(runtime.stop_calls(), 1);
    }

    #[tokio::test]
    async fn test_update_in_place_only_for_same_identity() {
        let runtime = Arc::new(MockRuntime::with_delay(Duration::ZERO));
        let spec = SpecBuilder::new("worker").build().snapshot_for(3);
        let deployment = NullDeployment::new(spec.key());
        let c = container(runtime.clone(), Arc::new(ReservationLedger::new(10)));
        c.activate(spec.clone(), deployment.clone()).await.unwrap().unwrap();

        let mut patched = SpecBuilder::new("worker").build();
        patched
            .bean_config
            .init_params
            .insert("mode".to_string(), "fast".to_string());
        assert!(c.update(patched, deployment.clone()));

        let current = c.spec().unwrap();
        assert_eq!(current.instance_number(), Some(3));
        assert_eq!(current.bean_config.init_params["mode"], "fast");
        assert_eq!(runtime.boot_count(), 1);

        let other = SpecBuilder::new("other").build();
        assert!(!c.update(other, deployment));
    }

    #[tokio::test]
    async fn test_proxy_ping_and_destroy() {
        let runtime = Arc::new(MockRuntime::with_delay(Duration::ZERO));
        let spec = SpecBuilder::new("worker").build();
        let c = container(runtime.clone(), Arc::new(ReservationLedger::new(10)));
        let record = c
            .activate(spec.clone(), NullDeployment::new(spec.key()))
            .await
            .unwrap()
            .unwrap();

        record.handle.ping().await.unwrap();
        runtime.crash(record.instance_id);
        assert!(record.handle.ping().await.is_err());

        record.handle.destroy().await.unwrap();
        assert_eq!(c.state(), ContainerState::Terminated);
    }

    #[tokio::test]
    async fn test_crash_signals_exit_without_deployment_callback() {
        let runtime = Arc::new(MockRuntime::with_delay(Duration::ZERO));
        let ledger = Arc::new(ReservationLedger::new(10));
        let spec = SpecBuilder::new("worker").build();
        let deployment = NullDeployment::new(spec.key());
        let c = container(runtime, ledger.clone());
        let record = c.activate(spec, deployment.clone()).await.unwrap().unwrap();
        let exit = record.handle.exit_signal().unwrap();

        assert!(c.crashed());
        assert!(!c.crashed());
        assert!(*exit.borrow());
        assert_eq!(deployment.calls(), 0);
        assert_eq!(ledger.total(), 0);
    }
}
