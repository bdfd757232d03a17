//! Serialization of a graph snapshot into the portable representation.

use std::collections::BTreeMap;

use crate::graph::GraphSnapshot;
use crate::model::NodeId;
use crate::serializable::{SerializedGraph, SerializedMeta, SerializedNode, SerializedRef};

/// Emits one record per node, with reference maps flattened to ordered
/// `{id, path}` arrays. `extra_root_ids` (retained roots other than the
/// query root) ride along under `__META` so retention round-trips.
///
/// Output is deterministic: records are keyed in sorted order and the
/// reference arrays follow the maps' sorted iteration.
pub fn extract(graph: &GraphSnapshot, extra_root_ids: &[NodeId]) -> SerializedGraph {
    let mut nodes = BTreeMap::new();
    for (id, node) in graph.nodes() {
        let refs = node.refs();
        nodes.insert(
            id.clone(),
            SerializedNode {
                kind: node.kind(),
                data: node.data().cloned(),
                inbound: refs.iter_inbound().map(SerializedRef::from).collect(),
                outbound: refs.outbound.values().map(SerializedRef::from).collect(),
                parameterized: refs
                    .parameterized
                    .values()
                    .flatten()
                    .map(SerializedRef::from)
                    .collect(),
            },
        );
    }
    let meta = if extra_root_ids.is_empty() {
        None
    } else {
        let mut extra: Vec<NodeId> = extra_root_ids.to_vec();
        extra.sort();
        Some(SerializedMeta {
            extra_root_ids: extra,
        })
    };
    SerializedGraph { meta, nodes }
}
