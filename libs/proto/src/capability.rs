//! Executor resource capability snapshots.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use fleet_id::NodeId;
use serde::{Deserialize, Serialize};

use crate::spec::{Constraints, SpecKey};

/// Point-in-time view of what an executor can host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceCapability {
    pub node_id: NodeId,
    pub host_address: String,
    pub cpu_cores: u32,
    /// Cores already reserved by running instances.
    pub reserved_cpu: f64,
    pub total_memory_bytes: u64,
    pub available_memory_bytes: u64,
    /// Overall utilization in `0.0..=1.0`.
    pub utilization: f64,
    /// Utilization at or above which the node stops accepting work.
    pub threshold: f64,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    pub measured_at: DateTime<Utc>,
}

impl ResourceCapability {
    /// Whether utilization is below the declared threshold.
    pub fn is_within_range(&self) -> bool {
        self.utilization < self.threshold
    }

    pub fn available_cpu(&self) -> f64 {
        (f64::from(self.cpu_cores) - self.reserved_cpu).max(0.0)
    }

    /// Whether one more instance with these constraints fits.
    pub fn satisfies(&self, constraints: &Constraints) -> bool {
        if let Some(pinned) = constraints.pinned_node {
            if pinned != self.node_id {
                return false;
            }
        }
        self.available_cpu() >= constraints.cpu_cores
            && self.available_memory_bytes >= constraints.memory_bytes
            && constraints
                .attributes
                .iter()
                .all(|(k, v)| self.attributes.get(k) == Some(v))
    }
}

/// An executor's per-specification instance count, as reported upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployedService {
    pub key: SpecKey,
    pub instances: u32,
}
