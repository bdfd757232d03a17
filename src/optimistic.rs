//! The ordered queue of pending optimistic updates.

use std::collections::BTreeSet;
use std::sync::Arc;

use rustc_hash::FxHashSet;
use tracing::debug;

use crate::context::CacheContext;
use crate::error::Result;
use crate::graph::GraphSnapshot;
use crate::model::{JsonObject, NodeId};
use crate::operations::write::SnapshotEditor;
use crate::query::Operation;

/// Identifier correlating the optimistic updates of one logical change,
/// so they can be rolled back together.
pub type ChangeId = String;

/// One recorded optimistic edit, replayable over any baseline.
#[derive(Clone, Debug)]
pub enum CacheDelta {
    /// A query-shaped payload write.
    Write {
        /// The operation the payload was written against.
        operation: Operation,
        /// The payload, as originally supplied.
        payload: JsonObject,
    },
    /// A schema-less merge against one node, as produced by `modify`.
    Merge {
        /// Target node.
        id: NodeId,
        /// Fields to merge.
        payload: JsonObject,
        /// Field names (or parameterized node ids) to delete.
        deleted: BTreeSet<String>,
    },
    /// Whole-node eviction, as produced by `modify`/`evict`.
    Delete {
        /// Target node.
        id: NodeId,
    },
}

#[derive(Clone, Debug)]
struct QueueEntry {
    change_id: ChangeId,
    deltas: Arc<Vec<CacheDelta>>,
}

/// An ordered list of pending optimistic updates.
///
/// The queue itself is a value: enqueue and remove return new queues,
/// sharing entry storage with the original. Replaying the queue over a
/// baseline is deterministic and order-preserving, and removing an entry
/// then replaying reproduces the state as if it was never enqueued.
#[derive(Clone, Debug, Default)]
pub struct OptimisticUpdateQueue {
    entries: Vec<QueueEntry>,
}

impl OptimisticUpdateQueue {
    /// Whether any updates are pending.
    pub fn has_updates(&self) -> bool {
        !self.entries.is_empty()
    }

    /// Number of pending entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Change ids currently enqueued, in order.
    pub fn change_ids(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.change_id.as_str())
    }

    /// Returns a queue with `deltas` appended as one atomic entry.
    pub fn enqueue(&self, change_id: ChangeId, deltas: Vec<CacheDelta>) -> Self {
        let mut entries = self.entries.clone();
        entries.push(QueueEntry {
            change_id,
            deltas: Arc::new(deltas),
        });
        Self { entries }
    }

    /// Returns a queue without the entry for `change_id`. Unknown ids
    /// return an unchanged queue; concurrent rollbacks of the same id
    /// are expected and harmless.
    pub fn remove(&self, change_id: &str) -> Self {
        let entries: Vec<QueueEntry> = self
            .entries
            .iter()
            .filter(|e| e.change_id != change_id)
            .cloned()
            .collect();
        Self { entries }
    }

    /// Replays every queued update, in order, over `baseline`.
    ///
    /// Returns the resulting graph and the union of node ids the replay
    /// edited. Replaying twice over the same baseline yields deep-equal
    /// graphs.
    pub fn apply(
        &self,
        context: &CacheContext,
        baseline: &GraphSnapshot,
        retained: &FxHashSet<NodeId>,
    ) -> Result<(GraphSnapshot, FxHashSet<NodeId>)> {
        let mut graph = baseline.clone();
        let mut edited = FxHashSet::default();
        for entry in &self.entries {
            debug!(change_id = %entry.change_id, deltas = entry.deltas.len(), "replaying optimistic entry");
            for delta in entry.deltas.iter() {
                let result = apply_delta(context, &graph, delta, retained)?;
                edited.extend(result.edited_node_ids);
                graph = result.snapshot;
            }
        }
        Ok((graph, edited))
    }
}

struct DeltaResult {
    snapshot: GraphSnapshot,
    edited_node_ids: FxHashSet<NodeId>,
}

fn apply_delta(
    context: &CacheContext,
    graph: &GraphSnapshot,
    delta: &CacheDelta,
    retained: &FxHashSet<NodeId>,
) -> Result<DeltaResult> {
    let mut editor = SnapshotEditor::new(context, graph, retained);
    match delta {
        CacheDelta::Write { operation, payload } => {
            editor.merge_operation(operation, payload)?;
        }
        CacheDelta::Merge {
            id,
            payload,
            deleted,
        } => {
            editor.merge_node(id, payload, deleted)?;
        }
        CacheDelta::Delete { id } => {
            editor.delete(id);
        }
    }
    let result = editor.commit();
    Ok(DeltaResult {
        snapshot: result.snapshot,
        edited_node_ids: result.edited_node_ids,
    })
}
