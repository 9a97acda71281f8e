//! Instance records and the handle to a running instance.

use std::sync::Arc;

use async_trait::async_trait;
use fleet_events::InstanceSummary;
use fleet_id::{InstanceId, NodeId};
use tokio::sync::watch;

use crate::error::RemoteError;
use crate::spec::{BeanConfig, SpecKey};

/// Opaque remote handle to a running instance.
#[async_trait]
pub trait ServiceProxy: Send + Sync {
    /// Tear the instance down. Callers treat this as fire-and-forget.
    async fn destroy(&self) -> Result<(), RemoteError>;

    /// Liveness probe.
    async fn ping(&self) -> Result<(), RemoteError>;

    /// Signal that flips to `true` once the hosting process reports the
    /// instance exited. `None` when the transport cannot observe exits.
    fn exit_signal(&self) -> Option<watch::Receiver<bool>> {
        None
    }
}

/// One running instance of a specification.
#[derive(Clone)]
pub struct InstanceRecord {
    pub instance_id: InstanceId,
    pub key: SpecKey,
    pub handle: Arc<dyn ServiceProxy>,
    /// Bean config the instance was started with; carries its number.
    pub bean_config: BeanConfig,
    pub host_address: String,
    pub node_id: NodeId,
}

impl InstanceRecord {
    pub fn instance_number(&self) -> Option<u64> {
        self.bean_config.instance_id
    }

    /// Serializable view for events and status reports.
    pub fn summary(&self) -> InstanceSummary {
        InstanceSummary {
            instance_id: self.instance_id,
            instance_number: self.instance_number(),
            node_id: self.node_id,
            host_address: self.host_address.clone(),
        }
    }
}

impl std::fmt::Debug for InstanceRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceRecord")
            .field("instance_id", &self.instance_id)
            .field("key", &self.key)
            .field("instance_number", &self.instance_number())
            .field("host_address", &self.host_address)
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}
