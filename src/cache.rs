//! The cache facade: snapshot swaps, transactions, watchers, retention,
//! garbage collection, and serialization.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::context::{CacheConfig, CacheContext};
use crate::error::{CacheError, Result};
use crate::graph::GraphSnapshot;
use crate::model::{JsonObject, NodeId, Reference};
use crate::operations::read::{read, ReadResult};
use crate::operations::{extract, migrate, restore, MigrationMap};
use crate::optimistic::{ChangeId, OptimisticUpdateQueue};
use crate::query::Operation;
use crate::result_cache::ResultCache;
use crate::serializable::SerializedGraph;
use crate::snapshot::CacheSnapshot;
use crate::transaction::{
    CacheTransaction, EvictOptions, ModifyOptions, TransactionOutcome,
};

/// Watcher callback: invoked with the new diff result and the previously
/// delivered one.
pub type WatchCallback = Box<dyn FnMut(&ReadResult, Option<&ReadResult>) + Send>;

/// Per-transaction veto hook over watcher deliveries. Returning `false`
/// suppresses the delivery (and leaves the watcher's last result as-is).
pub type OnWatchUpdated = Box<dyn Fn(&ReadResult, Option<&ReadResult>) -> bool + Send>;

/// Options for [`Cache::watch`].
pub struct WatchOptions {
    /// Deliver the current result immediately on registration.
    pub immediate: bool,
    /// Observe the optimistic view instead of the baseline.
    pub optimistic: bool,
    /// The delivery callback.
    pub callback: WatchCallback,
}

/// Options for [`Cache::transaction_with`].
#[derive(Default)]
pub struct TransactionOptions {
    /// Present for optimistic transactions: the change id the edits
    /// accumulate under (and roll back by).
    pub optimistic_id: Option<ChangeId>,
    /// Notify watchers after commit. Defaults to `true` via
    /// [`TransactionOptions::broadcast`].
    pub skip_broadcast: bool,
    /// Veto hook over this commit's watcher deliveries.
    pub on_watch_updated: Option<OnWatchUpdated>,
}

impl TransactionOptions {
    /// Options for an optimistic transaction under `change_id`.
    pub fn optimistic(change_id: impl Into<ChangeId>) -> Self {
        Self {
            optimistic_id: Some(change_id.into()),
            ..Self::default()
        }
    }

    /// Whether watchers will be notified after commit.
    pub fn broadcast(&self) -> bool {
        !self.skip_broadcast
    }
}

struct WatchEntry {
    id: u64,
    operation: Operation,
    optimistic: bool,
    callback: WatchCallback,
    last: Option<Arc<ReadResult>>,
}

#[derive(Default)]
struct WatchRegistry {
    entries: Vec<WatchEntry>,
    next_id: u64,
}

/// Disposer for a watch registration. Dropping the handle keeps the
/// watcher alive; call [`dispose`](WatchHandle::dispose) to remove it.
pub struct WatchHandle {
    registry: Arc<Mutex<WatchRegistry>>,
    id: u64,
}

impl WatchHandle {
    /// Removes the watcher from the notification set. Does not roll back
    /// any snapshot.
    pub fn dispose(self) {
        let mut registry = self.registry.lock();
        registry.entries.retain(|entry| entry.id != self.id);
    }
}

struct CacheState {
    snapshot: CacheSnapshot,
    /// Explicit (and implicit, via direct writes) root retention counts.
    retained: FxHashMap<NodeId, usize>,
    /// Fields invalidated via `modify`, forcing watcher re-delivery.
    dirty: FxHashMap<NodeId, FxHashSet<String>>,
}

/// A normalized, query-addressable object-graph cache.
///
/// All operations are synchronous and run to completion; one mutex
/// guards the `{baseline, optimistic, queue}` swap so it is never
/// partially visible. The cache assumes a single logical thread —
/// re-entrant operations from inside a transaction body or a watcher
/// callback are rejected (or warned and degraded) rather than deadlocked.
pub struct Cache {
    context: Arc<CacheContext>,
    state: Mutex<CacheState>,
    watchers: Arc<Mutex<WatchRegistry>>,
    result_cache: ResultCache,
    in_transaction: AtomicBool,
    broadcasting: AtomicBool,
}

impl Cache {
    /// Builds a cache from a configuration.
    pub fn new(config: CacheConfig) -> Self {
        let context = Arc::new(CacheContext::new(config));
        Self {
            result_cache: ResultCache::new(context.result_cache_capacity),
            context,
            state: Mutex::new(CacheState {
                snapshot: CacheSnapshot::empty(),
                retained: FxHashMap::default(),
                dirty: FxHashMap::default(),
            }),
            watchers: Arc::new(Mutex::new(WatchRegistry::default())),
            in_transaction: AtomicBool::new(false),
            broadcasting: AtomicBool::new(false),
        }
    }

    /// The cache's shared context (entity identification policy).
    pub fn context(&self) -> &Arc<CacheContext> {
        &self.context
    }

    /// Reads a selection from the cache.
    ///
    /// Never fails: missing data is reported through `complete` and
    /// `missing` on the result. Results are memoized; repeated reads of
    /// an unchanged operation return the same allocation.
    pub fn read(&self, operation: &Operation, optimistic: bool) -> Arc<ReadResult> {
        if self.in_transaction.load(Ordering::SeqCst) {
            warn!("read issued against the cache from inside a transaction; use the transaction");
            return Arc::new(ReadResult {
                result: None,
                complete: false,
                missing: vec![crate::operations::read::MissingField {
                    path: crate::model::Path::root(),
                    message: "read issued from inside a transaction".to_owned(),
                }],
                entity_ids: FxHashSet::default(),
                from_optimistic_transaction: false,
            });
        }
        let snapshot = self.state.lock().snapshot.clone();
        self.read_cached(operation, &snapshot, optimistic)
    }

    /// Writes a payload for a selection, notifying watchers.
    pub fn write(&self, operation: &Operation, payload: &JsonObject) -> Result<Option<Reference>> {
        self.transaction(|tx| tx.write(operation, payload))
    }

    /// Writes a payload, optionally suppressing watcher notification.
    pub fn write_with(
        &self,
        operation: &Operation,
        payload: &JsonObject,
        broadcast: bool,
    ) -> Result<Option<Reference>> {
        let options = TransactionOptions {
            skip_broadcast: !broadcast,
            ..TransactionOptions::default()
        };
        self.transaction_with(options, |tx| tx.write(operation, payload))
    }

    /// Runs `body` in a non-optimistic transaction with default options.
    pub fn transaction<R>(
        &self,
        body: impl FnOnce(&mut CacheTransaction) -> Result<R>,
    ) -> Result<R> {
        self.transaction_with(TransactionOptions::default(), body)
    }

    /// Runs `body` in a transaction and atomically swaps in the committed
    /// snapshot.
    ///
    /// With an `optimistic_id`, edits apply on top of the optimistic
    /// state and accumulate into one replayable queue entry; otherwise
    /// they rewrite the baseline and the optimistic view is rebuilt by
    /// replaying the unchanged queue.
    ///
    /// # Errors
    ///
    /// Fails fast with [`CacheError::InTransaction`] when called from
    /// inside another transaction. Errors from `body` propagate and leave
    /// the committed snapshot untouched.
    pub fn transaction_with<R>(
        &self,
        options: TransactionOptions,
        body: impl FnOnce(&mut CacheTransaction) -> Result<R>,
    ) -> Result<R> {
        if self.in_transaction.swap(true, Ordering::SeqCst) {
            return Err(CacheError::InTransaction("transaction"));
        }
        let _guard = FlagGuard(&self.in_transaction);

        let mut state = self.state.lock();
        let retained: FxHashSet<NodeId> = state
            .retained
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(id, _)| id.clone())
            .collect();
        let mut tx = CacheTransaction::new(
            Arc::clone(&self.context),
            state.snapshot.clone(),
            retained,
            options.optimistic_id.clone(),
        );
        let value = body(&mut tx)?;
        let TransactionOutcome {
            snapshot,
            edited_node_ids,
            written_operations,
            implicit_retains,
            invalidated,
        } = tx.commit();
        debug_assert!(
            snapshot.optimistic_queue.has_updates() || snapshot.is_stable(),
            "an empty optimistic queue must leave one shared graph"
        );

        for id in implicit_retains {
            *state.retained.entry(id).or_insert(0) += 1;
        }
        for (id, fields) in invalidated {
            state.dirty.entry(id).or_default().extend(fields);
        }
        state.snapshot = snapshot.clone();
        drop(state);
        drop(_guard);

        self.result_cache.invalidate(&edited_node_ids);
        debug!(
            edited = edited_node_ids.len(),
            written = written_operations.len(),
            optimistic = options.optimistic_id.is_some(),
            "transaction committed"
        );
        if options.broadcast() {
            self.broadcast_watches(
                options.optimistic_id.is_some(),
                options.on_watch_updated.as_deref(),
            );
        }
        if let Some(hook) = &self.context.on_change {
            hook(&snapshot, &edited_node_ids);
        }
        Ok(value)
    }

    /// Rolls back a previously committed optimistic update by change id.
    /// Unknown ids are a no-op.
    pub fn rollback(&self, change_id: &str) -> Result<()> {
        self.transaction(|tx| tx.rollback(change_id))
    }

    /// Runs per-field modifiers against one node. Returns whether
    /// anything changed.
    pub fn modify(&self, options: ModifyOptions<'_>) -> Result<bool> {
        let broadcast = options.broadcast;
        let tx_options = TransactionOptions {
            skip_broadcast: !broadcast,
            ..TransactionOptions::default()
        };
        self.transaction_with(tx_options, |tx| tx.modify(options))
    }

    /// Removes a whole node or one field of a node. Returns whether
    /// anything changed.
    pub fn evict(&self, options: EvictOptions) -> Result<bool> {
        let broadcast = options.broadcast;
        let tx_options = TransactionOptions {
            skip_broadcast: !broadcast,
            ..TransactionOptions::default()
        };
        self.transaction_with(tx_options, |tx| tx.evict(options))
    }

    /// Registers a watcher over an operation. The returned handle's
    /// `dispose` removes it; watcher callbacks fire synchronously after
    /// each committed transaction whose outcome changes their diff.
    pub fn watch(&self, operation: &Operation, options: WatchOptions) -> Result<WatchHandle> {
        if self.in_transaction.load(Ordering::SeqCst) {
            return Err(CacheError::InTransaction("watch"));
        }
        let snapshot = self.state.lock().snapshot.clone();
        let mut entry = WatchEntry {
            id: 0,
            operation: operation.clone(),
            optimistic: options.optimistic,
            callback: options.callback,
            last: None,
        };
        if options.immediate {
            let diff = self.read_cached(operation, &snapshot, options.optimistic);
            (entry.callback)(&diff, None);
            entry.last = Some(diff);
        }
        let mut registry = self.watchers.lock();
        entry.id = registry.next_id;
        registry.next_id += 1;
        let id = entry.id;
        registry.entries.push(entry);
        Ok(WatchHandle {
            registry: Arc::clone(&self.watchers),
            id,
        })
    }

    /// Increments the retain count of a root id, shielding it (and its
    /// transitive children) from garbage collection. Returns the new
    /// count.
    pub fn retain(&self, id: &NodeId) -> usize {
        if self.in_transaction.load(Ordering::SeqCst) {
            warn!(id = %id, "retain inside a transaction ignored");
            return 0;
        }
        let mut state = self.state.lock();
        let count = state.retained.entry(id.clone()).or_insert(0);
        *count += 1;
        *count
    }

    /// Decrements the retain count of a root id; floors at zero. Returns
    /// the new count.
    pub fn release(&self, id: &NodeId) -> usize {
        if self.in_transaction.load(Ordering::SeqCst) {
            warn!(id = %id, "release inside a transaction ignored");
            return 0;
        }
        let mut state = self.state.lock();
        match state.retained.get_mut(id) {
            Some(count) if *count > 1 => {
                *count -= 1;
                *count
            }
            Some(_) => {
                state.retained.remove(id);
                0
            }
            None => 0,
        }
    }

    /// Removes every node unreachable from the query root and the
    /// retained roots, from both graphs. Returns the deleted ids,
    /// sorted. Watchers do not fire: collected nodes were, by
    /// construction, invisible to every read.
    pub fn gc(&self) -> Vec<NodeId> {
        if self.in_transaction.load(Ordering::SeqCst) {
            warn!("gc inside a transaction ignored");
            return Vec::new();
        }
        let mut state = self.state.lock();
        let query_root = NodeId::query_root();
        let roots: Vec<NodeId> = std::iter::once(query_root)
            .chain(
                state
                    .retained
                    .iter()
                    .filter(|(_, count)| **count > 0)
                    .map(|(id, _)| id.clone()),
            )
            .collect();

        let optimistic_keep = state.snapshot.optimistic.reachable_from(roots.iter());
        let mut deleted: Vec<NodeId> = state
            .snapshot
            .optimistic
            .all_node_ids()
            .filter(|id| !optimistic_keep.contains(*id))
            .cloned()
            .collect();

        let stable = state.snapshot.is_stable();
        let (baseline, optimistic) = if stable {
            if deleted.is_empty() {
                return Vec::new();
            }
            let pruned = Arc::new(prune_graph(&state.snapshot.optimistic, &optimistic_keep));
            (Arc::clone(&pruned), pruned)
        } else {
            let baseline_keep = state.snapshot.baseline.reachable_from(roots.iter());
            deleted.extend(
                state
                    .snapshot
                    .baseline
                    .all_node_ids()
                    .filter(|id| !baseline_keep.contains(*id))
                    .cloned(),
            );
            if deleted.is_empty() {
                return Vec::new();
            }
            (
                Arc::new(prune_graph(&state.snapshot.baseline, &baseline_keep)),
                Arc::new(prune_graph(&state.snapshot.optimistic, &optimistic_keep)),
            )
        };

        deleted.sort();
        deleted.dedup();
        state.snapshot = CacheSnapshot::new(
            baseline,
            optimistic,
            state.snapshot.optimistic_queue.clone(),
        );
        for id in &deleted {
            state.dirty.remove(id);
        }
        drop(state);

        let deleted_set: FxHashSet<NodeId> = deleted.iter().cloned().collect();
        self.result_cache.invalidate(&deleted_set);
        info!(collected = deleted.len(), "garbage collection complete");
        deleted
    }

    /// Serializes the chosen graph, including retained-root metadata.
    ///
    /// # Errors
    ///
    /// Fails with [`CacheError::InTransaction`] when called from inside a
    /// transaction.
    pub fn extract(&self, optimistic: bool) -> Result<SerializedGraph> {
        if self.in_transaction.load(Ordering::SeqCst) {
            return Err(CacheError::InTransaction("extract"));
        }
        let state = self.state.lock();
        let extra: Vec<NodeId> = state
            .retained
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(id, _)| id.clone())
            .collect();
        Ok(extract(state.snapshot.graph(optimistic), &extra))
    }

    /// Replaces the cache's contents with a restored graph, applying
    /// optional migrations, and re-delivers watchers.
    ///
    /// # Errors
    ///
    /// Structural problems in the serialized graph (unknown reference
    /// ids, bad type tags upstream of deserialization) fail the whole
    /// restore; so does calling from inside a transaction.
    pub fn restore(
        &self,
        serialized: &SerializedGraph,
        migrations: Option<&MigrationMap>,
    ) -> Result<()> {
        if self.in_transaction.load(Ordering::SeqCst) {
            return Err(CacheError::InTransaction("restore"));
        }
        let result = restore(serialized)?;
        let mut graph = result.snapshot;
        if let Some(migrations) = migrations {
            graph = migrate(graph, self.context.as_ref(), migrations);
        }
        let graph = Arc::new(graph);
        {
            let mut state = self.state.lock();
            state.snapshot = CacheSnapshot::new(
                Arc::clone(&graph),
                graph,
                OptimisticUpdateQueue::default(),
            );
            state.retained = result
                .extra_root_ids
                .into_iter()
                .map(|id| (id, 1))
                .collect();
            state.dirty.clear();
        }
        self.result_cache.reset();
        info!(nodes = result.edited_node_ids.len(), "cache restored");
        self.broadcast_watches(false, None);
        Ok(())
    }

    /// Derives the node id a value identifies, per the configured policy.
    pub fn identify(&self, value: &Value) -> Option<NodeId> {
        self.context.entity_id_for_value(value)
    }

    /// Drops all cached state and re-delivers watchers against the empty
    /// cache.
    pub fn reset(&self) -> Result<()> {
        if self.in_transaction.load(Ordering::SeqCst) {
            return Err(CacheError::InTransaction("reset"));
        }
        {
            let mut state = self.state.lock();
            state.snapshot = CacheSnapshot::empty();
            state.retained.clear();
            state.dirty.clear();
        }
        self.result_cache.reset();
        self.broadcast_watches(false, None);
        Ok(())
    }

    /// The current cache snapshot (baseline, optimistic, queue).
    pub fn snapshot(&self) -> CacheSnapshot {
        self.state.lock().snapshot.clone()
    }

    fn read_cached(
        &self,
        operation: &Operation,
        snapshot: &CacheSnapshot,
        optimistic: bool,
    ) -> Arc<ReadResult> {
        // With an empty queue both lanes are one graph; share the cache
        // entry under the baseline key.
        let lane = optimistic && snapshot.optimistic_queue.has_updates();
        self.result_cache
            .fetch_or_compute(operation.key(), lane, || {
                read(operation, snapshot.graph(lane))
            })
    }

    /// Re-evaluates every watcher against the current snapshot, invoking
    /// callbacks (in registration order) whose results changed by deep
    /// equality or whose nodes were invalidated.
    fn broadcast_watches(
        &self,
        from_optimistic_transaction: bool,
        on_watch_updated: Option<&(dyn Fn(&ReadResult, Option<&ReadResult>) -> bool + Send)>,
    ) {
        if self.broadcasting.swap(true, Ordering::SeqCst) {
            // A watcher callback triggered a nested commit; the outer
            // broadcast will deliver against the newest snapshot.
            return;
        }
        let _guard = FlagGuard(&self.broadcasting);

        let (snapshot, dirty) = {
            let mut state = self.state.lock();
            (state.snapshot.clone(), std::mem::take(&mut state.dirty))
        };
        let mut registry = self.watchers.lock();
        for entry in registry.entries.iter_mut() {
            let diff = self.read_cached(&entry.operation, &snapshot, entry.optimistic);
            let forced =
                !dirty.is_empty() && diff.entity_ids.iter().any(|id| dirty.contains_key(id));
            let changed = entry
                .last
                .as_ref()
                .map(|last| !last.results_equal(&diff))
                .unwrap_or(true);
            if !changed && !forced {
                continue;
            }
            let mut delivered = (*diff).clone();
            delivered.from_optimistic_transaction =
                from_optimistic_transaction && entry.optimistic;
            if let Some(hook) = on_watch_updated {
                if !hook(&delivered, entry.last.as_deref()) {
                    continue;
                }
            }
            let delivered = Arc::new(delivered);
            (entry.callback)(&delivered, entry.last.as_deref());
            entry.last = Some(delivered);
        }
    }
}

/// Clears an atomic flag on drop, so early returns and errors cannot
/// leave the cache wedged.
struct FlagGuard<'a>(&'a AtomicBool);

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Retains only `keep` in `graph`, pruning inbound bookkeeping that
/// pointed at collected nodes.
fn prune_graph(graph: &GraphSnapshot, keep: &FxHashSet<NodeId>) -> GraphSnapshot {
    let mut nodes = graph.nodes_cloned();
    nodes.retain(|id, _| keep.contains(id));
    let dangling: Vec<NodeId> = nodes
        .iter()
        .filter(|(_, node)| {
            node.refs()
                .iter_inbound()
                .any(|r| !keep.contains(&r.id))
        })
        .map(|(id, _)| id.clone())
        .collect();
    for id in dangling {
        if let Some(node) = nodes.get(&id) {
            let mut fresh = node.as_ref().clone();
            fresh
                .refs_mut()
                .inbound
                .retain(|_, r| keep.contains(&r.id));
            nodes.insert(id, Arc::new(fresh));
        }
    }
    GraphSnapshot::from_nodes(nodes)
}
