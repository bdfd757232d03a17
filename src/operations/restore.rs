//! Reconstruction of a graph snapshot from its serialized form.

use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::warn;

use crate::error::{CacheError, Result};
use crate::graph::GraphSnapshot;
use crate::model::NodeId;
use crate::nodes::NodeSnapshot;
use crate::serializable::{SerializedGraph, SerializedRef};

/// A reconstructed graph plus the bookkeeping a cache needs to adopt it.
#[derive(Debug)]
pub struct RestoreResult {
    /// The rebuilt graph. Shared targets regain `Arc` identity: a node
    /// referenced from many paths is one allocation again.
    pub snapshot: GraphSnapshot,
    /// Every restored node id (restoring counts as editing everything).
    pub edited_node_ids: FxHashSet<NodeId>,
    /// Retained root ids recovered from `__META`.
    pub extra_root_ids: Vec<NodeId>,
}

/// Validates and rebuilds a serialized graph.
///
/// Every id referenced from any `inbound`/`outbound`/`parameterized`
/// array must name a record in the map; an unknown id fails the whole
/// restore with a structural error naming it.
pub fn restore(serialized: &SerializedGraph) -> Result<RestoreResult> {
    for (id, record) in &serialized.nodes {
        validate_refs(serialized, id, &record.inbound)?;
        validate_refs(serialized, id, &record.outbound)?;
        validate_refs(serialized, id, &record.parameterized)?;
    }

    let mut nodes: FxHashMap<NodeId, Arc<NodeSnapshot>> = FxHashMap::default();
    let mut edited = FxHashSet::default();
    for (id, record) in &serialized.nodes {
        let mut node = NodeSnapshot::with_data(record.kind, record.data.clone());
        {
            let refs = node.refs_mut();
            for r in &record.inbound {
                refs.add_inbound(r.id.clone(), r.path.clone());
            }
            for r in &record.outbound {
                refs.add_outbound(r.id.clone(), r.path.clone());
            }
            for r in &record.parameterized {
                refs.add_parameterized(r.id.clone(), r.path.clone());
            }
        }
        nodes.insert(id.clone(), Arc::new(node));
        edited.insert(id.clone());
    }

    let extra_root_ids = match &serialized.meta {
        Some(meta) => {
            for id in &meta.extra_root_ids {
                if !serialized.nodes.contains_key(id) {
                    // Tolerated: the root may have been evicted before
                    // extraction. Retention is still restored.
                    warn!(id = %id, "retained root id has no node record");
                }
            }
            meta.extra_root_ids.clone()
        }
        None => Vec::new(),
    };

    Ok(RestoreResult {
        snapshot: GraphSnapshot::from_nodes(nodes),
        edited_node_ids: edited,
        extra_root_ids,
    })
}

fn validate_refs(serialized: &SerializedGraph, owner: &NodeId, refs: &[SerializedRef]) -> Result<()> {
    for r in refs {
        if !serialized.nodes.contains_key(&r.id) {
            return Err(CacheError::Serialization(format!(
                "unknown node id `{}` referenced from `{owner}`",
                r.id
            )));
        }
    }
    Ok(())
}
