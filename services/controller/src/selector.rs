//! Resource selection.
//!
//! The dispatch layer never picks nodes itself beyond applying a request's
//! exclude/require constraints; it asks a [`ResourceSelector`].

use std::collections::HashSet;

use fleet_id::NodeId;
use fleet_proto::ServiceSpec;

use crate::registry::ExecutorView;

/// Pluggable node selection.
pub trait ResourceSelector: Send + Sync {
    /// Pick a node for one instance of `spec`, never one in `exclude`.
    fn select(
        &self,
        spec: &ServiceSpec,
        candidates: &[ExecutorView],
        exclude: &HashSet<NodeId>,
    ) -> Option<NodeId>;
}

/// Picks the least loaded eligible executor.
///
/// Eligible executors satisfy the constraints, are within their capacity
/// range, have room under their service limit and under the
/// specification's per-node cap. Each appearance of a node in the
/// instance's host-visit history ranks it behind nodes with fewer failures.
/// Ties go to the lowest node id so selection is deterministic.
#[derive(Debug, Default, Clone, Copy)]
pub struct LeastLoadedSelector;

impl LeastLoadedSelector {
    fn eligible(spec: &ServiceSpec, view: &ExecutorView) -> bool {
        let per_node_cap = spec.max_per_node.unwrap_or(u32::MAX).min(spec.planned);
        view.capability.is_within_range()
            && view.capability.satisfies(&spec.constraints)
            && view.placed() < view.service_limit
            && view.count(&spec.key()) < per_node_cap
    }
}

impl ResourceSelector for LeastLoadedSelector {
    fn select(
        &self,
        spec: &ServiceSpec,
        candidates: &[ExecutorView],
        exclude: &HashSet<NodeId>,
    ) -> Option<NodeId> {
        candidates
            .iter()
            .filter(|view| !exclude.contains(&view.node_id))
            .filter(|view| Self::eligible(spec, view))
            .min_by(|a, b| {
                spec.bean_config
                    .visits(&a.node_id)
                    .cmp(&spec.bean_config.visits(&b.node_id))
                    .then_with(|| a.load().total_cmp(&b.load()))
                    .then_with(|| a.node_id.cmp(&b.node_id))
            })
            .map(|view| view.node_id)
    }
}
