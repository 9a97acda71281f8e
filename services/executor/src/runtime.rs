//! Service runtime interface and mock implementation.
//!
//! The runtime interface abstracts what actually runs an instance:
//! - Starting user startup code
//! - Stopping or destroying a running instance
//! - Health checks
//!
//! A mock implementation is provided for testing and development.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use fleet_id::{BootId, InstanceId};
use fleet_proto::{ServiceSpec, DESTROY_INTERFACE};
use tracing::{debug, info};

use crate::error::RuntimeError;

/// Handle to a running instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceHandle {
    pub instance_id: InstanceId,

    /// Unique per start.
    pub boot_id: BootId,

    /// Whether the instance exports the administrative teardown interface.
    pub destroyable: bool,
}

/// Service runtime interface.
#[async_trait]
pub trait ServiceRuntime: Send + Sync {
    /// Run the startup code for one instance of `spec`.
    async fn start(&self, spec: &ServiceSpec, instance_id: InstanceId)
        -> Result<ServiceHandle, RuntimeError>;

    /// Stop an instance from the outside.
    async fn stop(&self, handle: &ServiceHandle) -> Result<(), RuntimeError>;

    /// Ask the instance to tear itself down through its exported interface.
    async fn destroy(&self, handle: &ServiceHandle) -> Result<(), RuntimeError>;

    /// Check if an instance is healthy.
    async fn check_health(&self, handle: &ServiceHandle) -> Result<bool, RuntimeError>;
}

/// How the mock runtime behaves on start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockStart {
    Succeed,
    Fail { retryable: bool },
    /// Never return; exercises the activation timeout.
    Hang,
    Panic,
}

/// Mock runtime for testing and development.
pub struct MockRuntime {
    /// Counter for started instances.
    boot_counter: AtomicU64,

    start_mode: Mutex<MockStart>,

    start_delay: Duration,

    /// Instances started and not yet stopped.
    running: Mutex<HashSet<InstanceId>>,

    destroy_calls: AtomicU64,
    stop_calls: AtomicU64,
}

impl MockRuntime {
    /// Create a new mock runtime.
    pub fn new() -> Self {
        Self::with_delay(Duration::from_millis(100))
    }

    /// Create a mock runtime whose starts take `start_delay`.
    pub fn with_delay(start_delay: Duration) -> Self {
        Self {
            boot_counter: AtomicU64::new(0),
            start_mode: Mutex::new(MockStart::Succeed),
            start_delay,
            running: Mutex::new(HashSet::new()),
            destroy_calls: AtomicU64::new(0),
            stop_calls: AtomicU64::new(0),
        }
    }

    /// Create a mock runtime that fails all starts.
    pub fn failing(retryable: bool) -> Self {
        let runtime = Self::with_delay(Duration::ZERO);
        runtime.set_start_mode(MockStart::Fail { retryable });
        runtime
    }

    pub fn set_start_mode(&self, mode: MockStart) {
        if let Ok(mut current) = self.start_mode.lock() {
            *current = mode;
        }
    }

    /// Simulate an instance dying on its own.
    pub fn crash(&self, instance_id: InstanceId) -> bool {
        self.running
            .lock()
            .map(|mut running| running.remove(&instance_id))
            .unwrap_or(false)
    }

    pub fn running_count(&self) -> usize {
        self.running.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn boot_count(&self) -> u64 {
        self.boot_counter.load(Ordering::SeqCst)
    }

    pub fn destroy_calls(&self) -> u64 {
        self.destroy_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> u64 {
        self.stop_calls.load(Ordering::SeqCst)
    }

    fn mode(&self) -> MockStart {
        self.start_mode
            .lock()
            .map(|m| *m)
            .unwrap_or(MockStart::Succeed)
    }

    fn forget(&self, instance_id: InstanceId) {
        if let Ok(mut running) = self.running.lock() {
            running.remove(&instance_id);
        }
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ServiceRuntime for MockRuntime {
    async fn start(
        &self,
        spec: &ServiceSpec,
        instance_id: InstanceId,
    ) -> Result<ServiceHandle, RuntimeError> {
        info!(
            instance_id = %instance_id,
            spec = %spec.key(),
            instance_number = ?spec.instance_number(),
            "[MOCK] Starting instance"
        );

        if !self.start_delay.is_zero() {
            tokio::time::sleep(self.start_delay).await;
        }

        match self.mode() {
            MockStart::Succeed => {}
            MockStart::Fail { retryable } => {
                return Err(RuntimeError::StartFailed {
                    reason: "mock runtime configured to fail".to_string(),
                    retryable,
                })
            }
            MockStart::Hang => std::future::pending::<()>().await,
            MockStart::Panic => panic!("mock startup code panicked"),
        }

        self.boot_counter.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut running) = self.running.lock() {
            running.insert(instance_id);
        }

        let handle = ServiceHandle {
            instance_id,
            boot_id: BootId::new(),
            destroyable: spec.exports(DESTROY_INTERFACE),
        };
        debug!(instance_id = %instance_id, boot_id = %handle.boot_id, "[MOCK] Instance started");
        Ok(handle)
    }

    async fn stop(&self, handle: &ServiceHandle) -> Result<(), RuntimeError> {
        info!(instance_id = %handle.instance_id, boot_id = %handle.boot_id, "[MOCK] Stopping instance");
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.forget(handle.instance_id);
        Ok(())
    }

    async fn destroy(&self, handle: &ServiceHandle) -> Result<(), RuntimeError> {
        info!(instance_id = %handle.instance_id, "[MOCK] Destroying instance");
        self.destroy_calls.fetch_add(1, Ordering::SeqCst);
        self.forget(handle.instance_id);
        Ok(())
    }

    async fn check_health(&self, handle: &ServiceHandle) -> Result<bool, RuntimeError> {
        debug!(instance_id = %handle.instance_id, "[MOCK] Checking instance health");
        Ok(self
            .running
            .lock()
            .map(|r| r.contains(&handle.instance_id))
            .unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_testing::SpecBuilder;

    #[tokio::test]
    async fn test_mock_runtime_start() {
        let runtime = MockRuntime::with_delay(Duration::ZERO);
        let spec = SpecBuilder::new("worker").interface(DESTROY_INTERFACE).build();
        let id = InstanceId::new();

        let handle = runtime.start(&spec, id).await.unwrap();
        assert_eq!(handle.instance_id, id);
        assert!(handle.destroyable);
        assert_eq!(runtime.running_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_runtime_stop_and_health() {
        let runtime = MockRuntime::with_delay(Duration::ZERO);
        let spec = SpecBuilder::new("worker").build();

        let handle = runtime.start(&spec, InstanceId::new()).await.unwrap();
        assert!(!handle.destroyable);
        assert!(runtime.check_health(&handle).await.unwrap());

        runtime.stop(&handle).await.unwrap();
        assert!(!runtime.check_health(&handle).await.unwrap());
    }

    #[tokio::test]
    async fn test_mock_runtime_crash() {
        let runtime = MockRuntime::with_delay(Duration::ZERO);
        let spec = SpecBuilder::new("worker").build();
        let handle = runtime.start(&spec, InstanceId::new()).await.unwrap();

        assert!(runtime.crash(handle.instance_id));
        assert!(!runtime.check_health(&handle).await.unwrap());
    }

    #[tokio::test]
    async fn test_mock_runtime_failing() {
        let runtime = MockRuntime::failing(false);
        let spec = SpecBuilder::new("worker").build();

        let result = runtime.start(&spec, InstanceId::new()).await;
        assert!(matches!(
            result,
            Err(RuntimeError::StartFailed {
                retryable: false,
                ..
            })
        ));
    }
}
