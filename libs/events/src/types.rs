//! Lifecycle event definitions.

use chrono::{DateTime, Utc};
use fleet_id::{EventId, InstanceId, NodeId};
use serde::{Deserialize, Serialize};

/// Event type names as constants.
pub mod event_types {
    pub const INSTANCE_PROVISIONED: &str = "instance.provisioned";
    pub const INSTANCE_FAILED: &str = "instance.failed";
    pub const INSTANCE_TERMINATED: &str = "instance.terminated";
}

/// The lifecycle transition an event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleAction {
    Provisioned,
    Failed,
    Terminated,
}

impl LifecycleAction {
    /// The dotted event type name for this action.
    pub fn event_type(&self) -> &'static str {
        match self {
            LifecycleAction::Provisioned => event_types::INSTANCE_PROVISIONED,
            LifecycleAction::Failed => event_types::INSTANCE_FAILED,
            LifecycleAction::Terminated => event_types::INSTANCE_TERMINATED,
        }
    }
}

impl std::fmt::Display for LifecycleAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LifecycleAction::Provisioned => "provisioned",
            LifecycleAction::Failed => "failed",
            LifecycleAction::Terminated => "terminated",
        };
        write!(f, "{s}")
    }
}

/// Serializable view of an instance record carried by events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSummary {
    pub instance_id: InstanceId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_number: Option<u64>,
    pub node_id: NodeId,
    pub host_address: String,
}

/// A lifecycle transition of one instance of a service specification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    /// Notifier-local monotonic identifier.
    pub event_id: EventId,

    pub occurred_at: DateTime<Utc>,

    /// Logical service name of the specification.
    pub service: String,

    /// Deployment group the specification belongs to.
    pub group: String,

    /// The instance concerned; absent for failures that never produced one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<InstanceSummary>,

    pub action: LifecycleAction,

    /// Free-form reason, e.g. the instantiation failure message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl LifecycleEvent {
    /// The dotted event type name (e.g. `instance.failed`).
    pub fn event_type(&self) -> &'static str {
        self.action.event_type()
    }
}
