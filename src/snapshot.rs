//! The atomically swapped unit of cache state.

use std::sync::Arc;

use crate::graph::GraphSnapshot;
use crate::optimistic::OptimisticUpdateQueue;

/// The triple swapped atomically at the end of every committed
/// transaction: the confirmed baseline graph, the optimistic overlay,
/// and the queue of pending optimistic updates.
///
/// When the queue is empty the optimistic graph *is* the baseline —
/// the same `Arc`, not merely an equal graph. Collaborators rely on that
/// pointer identity to skip recomputation.
#[derive(Clone, Debug)]
pub struct CacheSnapshot {
    /// Confirmed state.
    pub baseline: Arc<GraphSnapshot>,
    /// Baseline with every queued optimistic update replayed, in order.
    pub optimistic: Arc<GraphSnapshot>,
    /// Pending speculative updates.
    pub optimistic_queue: OptimisticUpdateQueue,
}

impl CacheSnapshot {
    /// Assembles a snapshot from its parts.
    pub fn new(
        baseline: Arc<GraphSnapshot>,
        optimistic: Arc<GraphSnapshot>,
        optimistic_queue: OptimisticUpdateQueue,
    ) -> Self {
        Self {
            baseline,
            optimistic,
            optimistic_queue,
        }
    }

    /// An empty cache: both lanes share one empty graph.
    pub fn empty() -> Self {
        let graph = Arc::new(GraphSnapshot::new());
        Self {
            baseline: Arc::clone(&graph),
            optimistic: graph,
            optimistic_queue: OptimisticUpdateQueue::default(),
        }
    }

    /// The graph a reader should consult for the given lane.
    pub fn graph(&self, optimistic: bool) -> &Arc<GraphSnapshot> {
        if optimistic {
            &self.optimistic
        } else {
            &self.baseline
        }
    }

    /// Whether both lanes are the same graph (queue drained).
    pub fn is_stable(&self) -> bool {
        Arc::ptr_eq(&self.baseline, &self.optimistic)
    }
}
