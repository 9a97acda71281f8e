//! Controller background worker.
//!
//! Drives the periodic side of reconciliation: a `verify()` pass over every
//! deployed specification, lease reaping, and a dispatch pass whenever the
//! registry reports new capacity or a manager enqueues work.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, instrument, warn};

use crate::deploy::Deployer;
use crate::dispatch::DispatchQueue;
use crate::registry::ExecutorRegistry;

/// Worker timing.
#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    pub reconcile_interval: Duration,
    pub reap_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: fleet_reconcile::DEFAULT_RECONCILE_INTERVAL,
            reap_interval: Duration::from_secs(5),
        }
    }
}

impl From<&crate::config::Config> for WorkerConfig {
    fn from(config: &crate::config::Config) -> Self {
        Self {
            reconcile_interval: config.reconcile_interval,
            reap_interval: config.lease_reap_interval,
        }
    }
}

pub struct ControllerWorker {
    deployer: Arc<Deployer>,
    queue: Arc<DispatchQueue>,
    registry: Arc<ExecutorRegistry>,
    wake: Arc<Notify>,
    config: WorkerConfig,
}

impl ControllerWorker {
    pub fn new(
        deployer: Arc<Deployer>,
        queue: Arc<DispatchQueue>,
        registry: Arc<ExecutorRegistry>,
        config: WorkerConfig,
    ) -> Self {
        let wake = registry.capacity_notify();
        Self {
            deployer,
            queue,
            registry,
            wake,
            config,
        }
    }

    /// Run until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            reconcile_interval_secs = self.config.reconcile_interval.as_secs(),
            reap_interval_secs = self.config.reap_interval.as_secs(),
            "Starting controller worker"
        );

        let mut reconcile = tokio::time::interval(self.config.reconcile_interval);
        let mut reap = tokio::time::interval(self.config.reap_interval);
        reconcile.tick().await;
        reap.tick().await;

        loop {
            tokio::select! {
                _ = reconcile.tick() => {
                    let enqueued = self.deployer.verify_all();
                    if enqueued > 0 {
                        info!(enqueued, "Reconciliation pass queued work");
                    }
                    self.process().await;
                }
                _ = reap.tick() => {
                    let expired = self.registry.reap_expired(Utc::now());
                    if !expired.is_empty() {
                        warn!(expired = expired.len(), "Reaped expired executor leases");
                    }
                }
                _ = self.wake.notified() => {
                    self.process().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Controller worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn process(&self) {
        let stats = self.queue.process().await;
        if stats.attempted > 0 {
            debug!(
                attempted = stats.attempted,
                provisioned = stats.provisioned,
                requeued = stats.requeued,
                dropped = stats.dropped,
                "Dispatch pass"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use fleet_events::EventNotifier;
    use fleet_id::ControllerId;
    use fleet_proto::{LeaseRegistrar, LivenessStrategy};
    use fleet_testing::{FakeExecutor, SpecBuilder};

    use crate::fault::FaultMonitorFactory;
    use crate::manager::ManagerContext;
    use crate::selector::LeastLoadedSelector;

    #[tokio::test]
    async fn test_registration_wakes_dispatch() {
        let registry = Arc::new(ExecutorRegistry::new(
            ControllerId::new(),
            Duration::from_secs(30),
        ));
        let queue = Arc::new(DispatchQueue::new(
            registry.clone(),
            Arc::new(LeastLoadedSelector),
            4,
        ));
        let deployer = Arc::new(Deployer::new(
            ManagerContext {
                queue: queue.clone(),
                registry: registry.clone(),
                notifier: Arc::new(EventNotifier::new()),
                monitors: FaultMonitorFactory::default(),
            },
            LivenessStrategy::default(),
        ));
        let worker = ControllerWorker::new(
            deployer.clone(),
            queue,
            registry.clone(),
            WorkerConfig {
                reconcile_interval: Duration::from_secs(60),
                reap_interval: Duration::from_secs(60),
            },
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move { worker.run(shutdown_rx).await });

        let key = deployer
            .submit(SpecBuilder::new("worker").planned(2).build())
            .unwrap();
        let executor = FakeExecutor::new(4);
        registry.register(executor.registration(4)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(deployer.count(&key), Some(2));

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
