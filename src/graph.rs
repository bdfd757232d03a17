//! The immutable graph snapshot: one consistent view of every node.

use std::collections::VecDeque;
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;

use crate::model::NodeId;
use crate::nodes::NodeSnapshot;

/// An immutable mapping from node id to node snapshot.
///
/// Snapshots share untouched nodes by `Arc`: deriving a new snapshot
/// clones the top-level table (reference bumps only) and replaces just
/// the entries the edit touched. A snapshot is never mutated after
/// construction.
#[derive(Clone, Debug, Default)]
pub struct GraphSnapshot {
    nodes: FxHashMap<NodeId, Arc<NodeSnapshot>>,
}

impl GraphSnapshot {
    /// An empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps a prepared node table.
    pub fn from_nodes(nodes: FxHashMap<NodeId, Arc<NodeSnapshot>>) -> Self {
        Self { nodes }
    }

    /// The snapshot stored under `id`.
    pub fn get_node_snapshot(&self, id: &NodeId) -> Option<&Arc<NodeSnapshot>> {
        self.nodes.get(id)
    }

    /// The data value stored under `id`.
    pub fn get_node_data(&self, id: &NodeId) -> Option<&Value> {
        self.nodes.get(id).and_then(|node| node.data())
    }

    /// Whether a node exists under `id`.
    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Iterates every node id.
    pub fn all_node_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.keys()
    }

    /// Iterates every `(id, snapshot)` pair.
    pub fn nodes(&self) -> impl Iterator<Item = (&NodeId, &Arc<NodeSnapshot>)> {
        self.nodes.iter()
    }

    /// Number of stored nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph stores nothing.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Copies the node table, for deriving an edited snapshot.
    pub(crate) fn nodes_cloned(&self) -> FxHashMap<NodeId, Arc<NodeSnapshot>> {
        self.nodes.clone()
    }

    /// The set of ids reachable from `roots` by following outbound and
    /// parameterized edges. Roots without a stored node contribute
    /// nothing; dangling edge targets are included as visited but cannot
    /// be expanded further.
    pub fn reachable_from<'a>(&self, roots: impl IntoIterator<Item = &'a NodeId>) -> FxHashSet<NodeId> {
        let mut seen = FxHashSet::default();
        let mut frontier: VecDeque<NodeId> = VecDeque::new();
        for root in roots {
            if self.contains(root) && seen.insert(root.clone()) {
                frontier.push_back(root.clone());
            }
        }
        while let Some(id) = frontier.pop_front() {
            let Some(node) = self.nodes.get(&id) else {
                continue;
            };
            for reference in node.refs().iter_children() {
                if self.contains(&reference.id) && seen.insert(reference.id.clone()) {
                    frontier.push_back(reference.id.clone());
                }
            }
        }
        seen
    }
}
