//! # fleet-proto
//!
//! The data model shared by the controller and its executors, and the narrow
//! interfaces they invoke on each other.
//!
//! The interfaces are plain `async_trait` traits. Any transport that offers
//! explicit timeouts and at-most-once or at-least-once delivery can sit
//! behind them; the in-process implementations in `fleet-controller` and
//! `fleet-executor` call each other directly.
//!
//! - [`Executor`]: controller → executor instantiation and live update
//! - [`ServiceProxy`]: controller → running instance teardown and liveness
//! - [`DeploymentManager`]: executor → controller, per specification
//! - [`LeaseRegistrar`]: executor → controller membership leases

mod capability;
mod error;
mod record;
mod remote;
mod spec;

pub use capability::{DeployedService, ResourceCapability};
pub use error::{InstantiationError, RemoteError};
pub use record::{InstanceRecord, ServiceProxy};
pub use remote::{
    DeploymentManager, DeploymentRef, Executor, ExecutorRegistration, Lease, LeaseRegistrar,
};
pub use spec::{
    BeanConfig, Constraints, LivenessStrategy, PlacementType, ServiceSpec, SpecKey,
    DESTROY_INTERFACE,
};
