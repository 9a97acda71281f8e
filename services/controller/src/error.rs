//! Controller error types.

use fleet_id::{InstanceId, NodeId};
use fleet_proto::{PlacementType, SpecKey};
use fleet_reconcile::ScaleError;
use thiserror::Error;

/// Reconciliation manager failures.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("instance {0} is not managed here")]
    UnknownInstance(InstanceId),

    #[error("placement type is immutable: {current} cannot become {requested}")]
    PlacementImmutable {
        current: PlacementType,
        requested: PlacementType,
    },

    #[error("specification {found} does not belong to manager for {expected}")]
    KeyMismatch { expected: SpecKey, found: SpecKey },

    #[error(transparent)]
    Scale(#[from] ScaleError),

    #[error("relocation failed: {0}")]
    RelocationFailed(String),

    #[error("manager is shutting down")]
    ShuttingDown,
}

/// Deployment submission failures. Every variant is a synchronous rejection.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("invalid specification: {0}")]
    Invalid(String),

    #[error("specification {0} is already deployed")]
    AlreadyDeployed(SpecKey),

    #[error("specification {0} is not deployed")]
    NotFound(SpecKey),

    #[error("pinned node {0} is not registered")]
    PinnedNodeUnknown(NodeId),

    #[error(transparent)]
    Manager(#[from] ManagerError),
}
