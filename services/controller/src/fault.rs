//! Fault monitors: per-instance liveness watchers.
//!
//! Every instance record gets exactly one monitor, picked by
//! [`FaultMonitorFactory`] from the specification's liveness strategy. A
//! monitor raises its failure callback at most once, however many signals
//! arrive, and never after `terminate()`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fleet_id::{InstanceId, NodeId};
use fleet_proto::{LivenessStrategy, ServiceProxy};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Raised once when a monitored instance is considered failed.
pub type FailureCallback = Arc<dyn Fn(Arc<dyn ServiceProxy>, InstanceId) + Send + Sync>;

/// Liveness watcher for one instance.
pub trait FaultMonitor: Send + Sync {
    /// Start watching `handle`.
    fn monitor(&self, handle: Arc<dyn ServiceProxy>, instance_id: InstanceId);

    /// Stop watching; no callback fires afterwards.
    fn terminate(&self);
}

/// Builds the monitor for a record.
#[derive(Debug, Clone, Default)]
pub struct FaultMonitorFactory {
    self_node: Option<NodeId>,
}

impl FaultMonitorFactory {
    /// `self_node` is the controller's own node; records hosted there are
    /// never monitored.
    pub fn new(self_node: Option<NodeId>) -> Self {
        Self { self_node }
    }

    pub fn create(
        &self,
        liveness: &LivenessStrategy,
        node_id: NodeId,
        callback: FailureCallback,
    ) -> Arc<dyn FaultMonitor> {
        if self.self_node == Some(node_id) {
            debug!(node_id = %node_id, "Not monitoring a self registration");
            return Arc::new(NoopMonitor);
        }

        let probe = match *liveness {
            LivenessStrategy::Heartbeat { interval_ms, misses } => Probe {
                interval: Duration::from_millis(interval_ms.max(1)),
                misses: misses.max(1),
                watch_exit: true,
            },
            LivenessStrategy::HandleLoss { interval_ms } => Probe {
                interval: Duration::from_millis(interval_ms.max(1)),
                misses: 1,
                watch_exit: false,
            },
            LivenessStrategy::ProcessExit => Probe {
                // Fall back to slow handle-loss pings when the proxy has no
                // exit signal.
                interval: Duration::from_secs(5),
                misses: 1,
                watch_exit: true,
            },
        };
        Arc::new(LivenessMonitor::new(probe, callback))
    }
}

/// Monitor for records that must not be watched.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMonitor;

impl FaultMonitor for NoopMonitor {
    fn monitor(&self, _handle: Arc<dyn ServiceProxy>, _instance_id: InstanceId) {}

    fn terminate(&self) {}
}

#[derive(Debug, Clone, Copy)]
struct Probe {
    interval: Duration,
    misses: u32,
    watch_exit: bool,
}

/// Shared one-shot latch between the watch task and `terminate()`.
struct Latch {
    fired: AtomicBool,
    callback: FailureCallback,
}

impl Latch {
    fn fire(&self, handle: Arc<dyn ServiceProxy>, instance_id: InstanceId) {
        if !self.fired.swap(true, Ordering::SeqCst) {
            (self.callback)(handle, instance_id);
        }
    }

    /// Disarm without firing.
    fn disarm(&self) {
        self.fired.store(true, Ordering::SeqCst);
    }
}

/// Ping-and-exit-signal monitor.
pub struct LivenessMonitor {
    probe: Probe,
    latch: Arc<Latch>,
    stop: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LivenessMonitor {
    fn new(probe: Probe, callback: FailureCallback) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            probe,
            latch: Arc::new(Latch {
                fired: AtomicBool::new(false),
                callback,
            }),
            stop,
            task: Mutex::new(None),
        }
    }
}

impl FaultMonitor for LivenessMonitor {
    fn monitor(&self, handle: Arc<dyn ServiceProxy>, instance_id: InstanceId) {
        let probe = self.probe;
        let latch = Arc::clone(&self.latch);
        let mut stop = self.stop.subscribe();
        let mut exit = if probe.watch_exit {
            handle.exit_signal()
        } else {
            None
        };

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(probe.interval);
            interval.tick().await;
            let mut missed = 0u32;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match handle.ping().await {
                            Ok(()) => missed = 0,
                            Err(e) => {
                                missed += 1;
                                debug!(instance_id = %instance_id, missed, error = %e, "Liveness check missed");
                                if missed >= probe.misses {
                                    warn!(instance_id = %instance_id, missed, "Instance failed liveness checks");
                                    latch.fire(handle, instance_id);
                                    return;
                                }
                            }
                        }
                    }
                    exited = wait_exit(&mut exit) => {
                        if exited {
                            warn!(instance_id = %instance_id, "Instance process exited");
                            latch.fire(handle, instance_id);
                            return;
                        }
                        exit = None;
                    }
                    _ = stop.changed() => return,
                }
            }
        });

        let previous = match self.task.lock() {
            Ok(mut slot) => slot.replace(task),
            Err(poisoned) => poisoned.into_inner().replace(task),
        };
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn terminate(&self) {
        self.latch.disarm();
        self.stop.send_replace(true);
        let task = match self.task.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(task) = task {
            task.abort();
        }
    }
}

impl Drop for LivenessMonitor {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Resolves `true` when the exit signal turns on, `false` if its sender is
/// gone, and never when there is no signal.
async fn wait_exit(exit: &mut Option<watch::Receiver<bool>>) -> bool {
    match exit {
        Some(rx) => rx.wait_for(|exited| *exited).await.is_ok(),
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use fleet_testing::FakeProxy;

    fn counting() -> (FailureCallback, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let callback: FailureCallback =
            Arc::new(move |_: Arc<dyn ServiceProxy>, _: InstanceId| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        (callback, fired)
    }

    fn heartbeat() -> LivenessStrategy {
        LivenessStrategy::Heartbeat {
            interval_ms: 10,
            misses: 2,
        }
    }

    #[tokio::test]
    async fn test_heartbeat_fires_after_misses() {
        let (callback, fired) = counting();
        let proxy = FakeProxy::new();
        let monitor = FaultMonitorFactory::default().create(&heartbeat(), NodeId::new(), callback);
        monitor.monitor(proxy.clone(), InstanceId::new());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        proxy.kill();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fires_at_most_once_with_concurrent_signals() {
        let (callback, fired) = counting();
        let proxy = FakeProxy::with_exit_signal();
        let monitor = FaultMonitorFactory::default().create(&heartbeat(), NodeId::new(), callback);
        monitor.monitor(proxy.clone(), InstanceId::new());

        // Exit signal and failing pings arrive together.
        proxy.exit();
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_process_exit_strategy_uses_exit_signal() {
        let (callback, fired) = counting();
        let proxy = FakeProxy::with_exit_signal();
        let monitor = FaultMonitorFactory::default().create(
            &LivenessStrategy::ProcessExit,
            NodeId::new(),
            callback,
        );
        monitor.monitor(proxy.clone(), InstanceId::new());

        proxy.exit();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(proxy.ping_count(), 0);
    }

    #[tokio::test]
    async fn test_terminate_suppresses_callback() {
        let (callback, fired) = counting();
        let proxy = FakeProxy::new();
        let monitor = FaultMonitorFactory::default().create(
            &LivenessStrategy::HandleLoss { interval_ms: 10 },
            NodeId::new(),
            callback,
        );
        monitor.monitor(proxy.clone(), InstanceId::new());

        monitor.terminate();
        proxy.kill();
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_self_node_is_not_monitored() {
        let (callback, fired) = counting();
        let node = NodeId::new();
        let proxy = FakeProxy::new();
        let monitor = FaultMonitorFactory::new(Some(node)).create(&heartbeat(), node, callback);
        monitor.monitor(proxy.clone(), InstanceId::new());

        proxy.kill();
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(proxy.ping_count(), 0);
    }
}
