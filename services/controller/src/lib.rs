//! Fleet Controller Library
//!
//! The controller keeps every deployed specification's running instance
//! count at its planned value across a pool of leased executors.
//!
//! ## Modules
//!
//! - `deploy`: specification submission and the manager table
//! - `dispatch`: pending provision work and dispatch passes
//! - `fault`: per-instance liveness monitors
//! - `local`: in-process executor nodes
//! - `manager`: the per-specification reconciliation loop
//! - `registry`: leased executors and membership events
//! - `selector`: node selection for provision requests
//! - `worker`: periodic reconciliation and lease reaping

pub mod config;
pub mod deploy;
pub mod dispatch;
pub mod error;
pub mod fault;
pub mod local;
pub mod manager;
pub mod registry;
pub mod selector;
pub mod worker;

pub use config::Config;
pub use deploy::Deployer;
pub use dispatch::{DispatchQueue, ProvisionListener, ProvisionOutcome, ProvisionRequest};
pub use error::{DeployError, ManagerError};
pub use fault::{FaultMonitor, FaultMonitorFactory};
pub use local::LocalNode;
pub use manager::{ManagerContext, ManagerStatus, ReconciliationManager};
pub use registry::{ExecutorRegistry, ExecutorView, MembershipEvent};
pub use selector::{LeastLoadedSelector, ResourceSelector};
pub use worker::{ControllerWorker, WorkerConfig};
