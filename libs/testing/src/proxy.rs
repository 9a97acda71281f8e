use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use fleet_proto::{RemoteError, ServiceProxy};
use tokio::sync::watch;

/// Service proxy whose liveness is controlled by the test.
#[derive(Debug)]
pub struct FakeProxy {
    alive: AtomicBool,
    destroys: AtomicUsize,
    pings: AtomicUsize,
    exit_tx: watch::Sender<bool>,
    observe_exit: bool,
}

impl FakeProxy {
    pub fn new() -> Arc<Self> {
        Self::build(false)
    }

    /// A proxy that also exposes an exit signal.
    pub fn with_exit_signal() -> Arc<Self> {
        Self::build(true)
    }

    fn build(observe_exit: bool) -> Arc<Self> {
        let (exit_tx, _) = watch::channel(false);
        Arc::new(Self {
            alive: AtomicBool::new(true),
            destroys: AtomicUsize::new(0),
            pings: AtomicUsize::new(0),
            exit_tx,
            observe_exit,
        })
    }

    /// Make subsequent pings fail.
    pub fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    /// Report a process exit.
    pub fn exit(&self) {
        self.kill();
        self.exit_tx.send_replace(true);
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn destroy_count(&self) -> usize {
        self.destroys.load(Ordering::SeqCst)
    }

    pub fn ping_count(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ServiceProxy for FakeProxy {
    async fn destroy(&self) -> Result<(), RemoteError> {
        self.destroys.fetch_add(1, Ordering::SeqCst);
        self.alive.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        if self.is_alive() {
            Ok(())
        } else {
            Err(RemoteError::Unreachable("fake instance is down".to_string()))
        }
    }

    fn exit_signal(&self) -> Option<watch::Receiver<bool>> {
        self.observe_exit.then(|| self.exit_tx.subscribe())
    }
}
