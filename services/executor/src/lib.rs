//! Fleet Executor Library
//!
//! An executor hosts service containers on one node. Controllers ask it to
//! instantiate specifications; it enforces per-node caps, runs startup code
//! under a timeout, reports its capacity and keeps a lease with every
//! controller it has registered with.
//!
//! ## Modules
//!
//! - `container`: per-instance lifecycle state machine
//! - `host`: the node's [`fleet_proto::Executor`] implementation
//! - `membership`: lease registration, renewal and capacity updates
//! - `reservation`: per-node caps and reserved resources
//! - `resources`: host measurements and the capacity watch channel
//! - `runtime`: the seam to whatever actually runs service code
//! - `state`: local SQLite state persistence

pub mod config;
pub mod container;
pub mod error;
pub mod host;
pub mod membership;
pub mod reservation;
pub mod resources;
pub mod runtime;
pub mod state;

pub use config::Config;
pub use container::{ContainerState, ServiceContainer};
pub use error::{ContainerError, MembershipError, RuntimeError};
pub use host::ContainerHost;
pub use membership::{MembershipClient, MembershipConfig};
pub use resources::{ResourceMonitor, SystemResources};
pub use runtime::{MockRuntime, MockStart, ServiceHandle, ServiceRuntime};
