//! Proximity interest: which active representations belong on a client.

use std::collections::BTreeSet;

use glam::Vec3;

use crate::hierarchy::NodeId;

// ---------------------------------------------------------------------------
// Predicate
// ---------------------------------------------------------------------------

/// `true` if an object of `radius` at `object` should be loaded by a client
/// whose player stands at `viewer` with `render_range`.
///
/// An infinite radius always qualifies.
pub fn within_range(viewer: Vec3, object: Vec3, radius: f32, render_range: f32) -> bool {
    viewer.distance(object) < radius + render_range
}

// ---------------------------------------------------------------------------
// InterestTransitions
// ---------------------------------------------------------------------------

/// Top-level representations that entered or left one client's range this
/// tick. Collected first and applied afterwards so the scanned root is never
/// mutated mid-scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterestTransitions {
    /// Not loaded yet, now in range.
    pub entered: Vec<NodeId>,
    /// Loaded, now out of range.
    pub exited: Vec<NodeId>,
}

impl InterestTransitions {
    /// Classify each `(node, in_range)` candidate against the loaded set.
    pub fn compute<I>(candidates: I, is_loaded: impl Fn(NodeId) -> bool) -> Self
    where
        I: IntoIterator<Item = (NodeId, bool)>,
    {
        let mut out = Self::default();
        for (node, in_range) in candidates {
            match (is_loaded(node), in_range) {
                (true, false) => out.exited.push(node),
                (false, true) => out.entered.push(node),
                _ => {}
            }
        }
        out
    }
}

/// `nodes` deduplicated, in a stable order.
pub(crate) fn sorted(nodes: impl IntoIterator<Item = NodeId>) -> Vec<NodeId> {
    nodes.into_iter().collect::<BTreeSet<_>>().into_iter().collect()
}
