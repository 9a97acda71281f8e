//! Service specifications.

use std::collections::BTreeMap;

use fleet_id::NodeId;
use serde::{Deserialize, Serialize};

/// Interface name a service exports when it accepts administrative teardown.
pub const DESTROY_INTERFACE: &str = "fleet.admin.Destroy";

/// Identity of a specification: its deployment group and logical name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SpecKey {
    pub group: String,
    pub name: String,
}

impl SpecKey {
    pub fn new(group: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for SpecKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.group, self.name)
    }
}

/// How instances of a specification are placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementType {
    /// The controller selects a node per instance; the count is elastic.
    #[default]
    Dynamic,
    /// `planned` instances on every node that satisfies the constraints.
    Fixed,
    /// Instances are started elsewhere; the controller only tracks them.
    External,
}

impl std::fmt::Display for PlacementType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PlacementType::Dynamic => "dynamic",
            PlacementType::Fixed => "fixed",
            PlacementType::External => "external",
        };
        write!(f, "{s}")
    }
}

/// Declared liveness-check strategy, used to pick a fault monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LivenessStrategy {
    /// Ping every `interval_ms`; fail after `misses` consecutive misses.
    Heartbeat { interval_ms: u64, misses: u32 },
    /// Fail on the first unreachable ping (remote reference lost).
    HandleLoss { interval_ms: u64 },
    /// Fail when the hosting process reports the instance exited.
    ProcessExit,
}

impl Default for LivenessStrategy {
    fn default() -> Self {
        LivenessStrategy::Heartbeat {
            interval_ms: 1_000,
            misses: 3,
        }
    }
}

/// SLA and resource constraints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Constraints {
    /// CPU cores each instance reserves on its node.
    #[serde(default)]
    pub cpu_cores: f64,

    /// Memory each instance reserves on its node.
    #[serde(default)]
    pub memory_bytes: u64,

    /// Node attributes that must match exactly.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,

    /// Service-limit entries; their sum caps `planned`.
    #[serde(default)]
    pub service_limits: Vec<u32>,

    /// Node the instances must run on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned_node: Option<NodeId>,
}

impl Constraints {
    /// Ceiling on `planned`, or `None` when no limits are declared.
    pub fn ceiling(&self) -> Option<u32> {
        if self.service_limits.is_empty() {
            None
        } else {
            Some(
                self.service_limits
                    .iter()
                    .fold(0u32, |acc, limit| acc.saturating_add(*limit)),
            )
        }
    }
}

/// Per-instance configuration overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeanConfig {
    /// Instance number within the specification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<u64>,

    /// Nodes this instance has previously failed on, oldest first.
    #[serde(default)]
    pub host_history: Vec<NodeId>,

    #[serde(default)]
    pub init_params: BTreeMap<String, String>,
}

impl BeanConfig {
    /// Append a node to the host-visit history.
    pub fn record_visit(&mut self, node: NodeId) {
        self.host_history.push(node);
    }

    /// How many times the history mentions `node`.
    pub fn visits(&self, node: &NodeId) -> usize {
        self.host_history.iter().filter(|n| *n == node).count()
    }
}

/// Description of a deployable unit and its desired instance count.
///
/// Values are cloned at every request boundary; nothing shares a
/// specification by reference across tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    pub group: String,

    #[serde(default)]
    pub interfaces: Vec<String>,

    /// Desired instance count (per node for FIXED placement).
    pub planned: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_per_node: Option<u32>,

    #[serde(default)]
    pub placement: PlacementType,

    #[serde(default)]
    pub constraints: Constraints,

    #[serde(default)]
    pub liveness: LivenessStrategy,

    #[serde(default)]
    pub bean_config: BeanConfig,
}

impl ServiceSpec {
    /// A dynamic specification with one planned instance.
    pub fn new(group: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: group.into(),
            interfaces: Vec::new(),
            planned: 1,
            max_per_node: None,
            placement: PlacementType::Dynamic,
            constraints: Constraints::default(),
            liveness: LivenessStrategy::default(),
            bean_config: BeanConfig::default(),
        }
    }

    pub fn key(&self) -> SpecKey {
        SpecKey::new(self.group.clone(), self.name.clone())
    }

    /// Instance number carried in the bean config, if any.
    pub fn instance_number(&self) -> Option<u64> {
        self.bean_config.instance_id
    }

    /// Copy of this specification bound to an instance number.
    pub fn snapshot_for(&self, instance_number: u64) -> Self {
        let mut snapshot = self.clone();
        snapshot.bean_config.instance_id = Some(instance_number);
        snapshot
    }

    /// Copy of this specification carrying an explicit bean config.
    pub fn with_bean_config(&self, bean_config: BeanConfig) -> Self {
        let mut snapshot = self.clone();
        snapshot.bean_config = bean_config;
        snapshot
    }

    /// Whether the service exports the named interface.
    pub fn exports(&self, interface: &str) -> bool {
        self.interfaces.iter().any(|i| i == interface)
    }

    /// Whether the controller provisions instances of this specification.
    pub fn is_managed(&self) -> bool {
        self.placement != PlacementType::External
    }
}
