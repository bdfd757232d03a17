//! Scoped batches of edits, committed atomically.
//!
//! A transaction collects writes, modifications, and evictions against a
//! private working copy of the cache snapshot. Observers see nothing
//! until commit, at which point per-typename entity updaters run exactly
//! once per edited entity and the finished snapshot is handed back for
//! the atomic swap.
//!
//! If a change id was supplied, edits are made on top of the optimistic
//! state and accumulate into one replayable queue entry; otherwise they
//! are made against the baseline (with any pending optimistic updates
//! replayed over the result).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;
use tracing::debug;

use crate::context::CacheContext;
use crate::error::Result;
use crate::graph::GraphSnapshot;
use crate::model::{as_reference, JsonObject, NodeId, Reference};
use crate::nodes::{NodeKind, NodeSnapshot};
use crate::operations::read::{read, ReadResult};
use crate::operations::write::SnapshotEditor;
use crate::optimistic::{CacheDelta, ChangeId};
use crate::query::Operation;
use crate::snapshot::CacheSnapshot;

/// The verdict a field modifier returns for one stored variant.
///
/// A dedicated enum rather than sentinel values, so dispatch never
/// depends on identity comparisons.
#[derive(Debug)]
pub enum FieldModify {
    /// Replace the field's value.
    Set(Value),
    /// Remove the field (all variants of a node removed remove the node).
    Delete,
    /// Leave the value, but force watchers of this node to re-deliver.
    Invalidate,
    /// Leave the field untouched.
    Keep,
}

/// A field modifier: invoked with the variant's current value and a
/// details handle for reading and referencing other cached data.
pub type FieldModifierFn<'m> =
    Box<dyn Fn(Option<&Value>, &mut ModifierDetails<'_>) -> FieldModify + 'm>;

/// Which fields of the target node a `modify` call touches.
pub enum ModifyFields<'m> {
    /// One modifier applied to every stored field of the node.
    All(FieldModifierFn<'m>),
    /// Modifiers for specific fields, by schema field name.
    Fields(BTreeMap<String, FieldModifierFn<'m>>),
}

/// Options for [`CacheTransaction::modify`].
pub struct ModifyOptions<'m> {
    /// Target node; defaults to the query root.
    pub id: Option<NodeId>,
    /// The modifiers to run.
    pub fields: ModifyFields<'m>,
    /// Operate on the optimistic graph instead of the baseline.
    pub optimistic: bool,
    /// Whether the surrounding cache should notify watchers afterwards.
    pub broadcast: bool,
}

impl<'m> ModifyOptions<'m> {
    /// Options targeting `id` with the given fields.
    pub fn new(id: Option<NodeId>, fields: ModifyFields<'m>) -> Self {
        Self {
            id,
            fields,
            optimistic: false,
            broadcast: true,
        }
    }
}

/// Options for [`CacheTransaction::evict`].
#[derive(Default)]
pub struct EvictOptions {
    /// Target node; defaults to the query root.
    pub id: Option<NodeId>,
    /// Evict a single field instead of the whole node.
    pub field_name: Option<String>,
    /// Whether the surrounding cache should notify watchers afterwards.
    pub broadcast: bool,
}

/// Read/reference facilities handed to field modifiers.
pub struct ModifierDetails<'d> {
    context: &'d CacheContext,
    graph: &'d GraphSnapshot,
    node_id: &'d NodeId,
    temp: &'d mut FxHashMap<NodeId, NodeSnapshot>,
    /// Schema field name the modifier is running for.
    pub field_name: String,
    /// Stored variant offered: the field name, or a parameterized node id.
    pub store_field_name: String,
    merged: bool,
}

impl ModifierDetails<'_> {
    /// Reads a field of the node being modified.
    pub fn read_field(&self, name: &str) -> Option<Value> {
        self.read_field_from(name, None)
    }

    /// Reads a field of `from` (or of the node being modified), seeing
    /// through pending `to_reference` merges.
    pub fn read_field_from(&self, name: &str, from: Option<&Reference>) -> Option<Value> {
        let target = from
            .map(|r| r.id().clone())
            .unwrap_or_else(|| self.node_id.clone());
        let node = self
            .temp
            .get(&target)
            .or_else(|| self.graph.get_node_snapshot(&target).map(Arc::as_ref))?;
        if let Some(Value::Object(obj)) = node.data() {
            if let Some(value) = obj.get(name) {
                if !value.is_null() {
                    return Some(value.clone());
                }
            }
        }
        if let Some(reference) = node.refs().outbound_at(name) {
            return self.graph.get_node_data(&reference.id).cloned();
        }
        if let Some(first) = node
            .refs()
            .parameterized_at(name)
            .and_then(|refs| refs.first())
        {
            return self.graph.get_node_data(&first.id).cloned();
        }
        if target.is_query_root() && name == "__typename" {
            return Some(Value::String("Query".to_owned()));
        }
        node.data()
            .and_then(Value::as_object)
            .and_then(|obj| obj.get(name))
            .cloned()
    }

    /// Whether `value` is readable: a reference to a known node, or a
    /// plain object.
    pub fn can_read(&self, value: &Value) -> bool {
        match as_reference(value) {
            Some(id) => self.temp.contains_key(&id) || self.graph.contains(&id),
            None => value.is_object(),
        }
    }

    /// Derives a reference handle for `value`. With `merge_into_store`,
    /// the value's fields are additionally merged into the entity it
    /// identifies, as part of the same atomic edit.
    pub fn to_reference(&mut self, value: &Value, merge_into_store: bool) -> Option<Reference> {
        let id = self.context.entity_id_for_value(value)?;
        if merge_into_store && as_reference(value).is_none() {
            if let Value::Object(obj) = value {
                let graph = self.graph;
                let entry = self.temp.entry(id.clone()).or_insert_with(|| {
                    graph
                        .get_node_snapshot(&id)
                        .map(|arc| arc.as_ref().clone())
                        .unwrap_or_else(|| NodeSnapshot::empty(NodeKind::Entity))
                });
                let mut data = entry
                    .data()
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                for (key, field_value) in obj {
                    data.insert(key.clone(), field_value.clone());
                }
                *entry.data_mut() = Some(Value::Object(data));
                self.merged = true;
            }
        }
        Some(Reference::new(id))
    }
}

/// The outcome of a committed transaction, ready for the atomic swap.
pub struct TransactionOutcome {
    /// The finished cache snapshot.
    pub snapshot: CacheSnapshot,
    /// Every node edited over the course of the transaction.
    pub edited_node_ids: FxHashSet<NodeId>,
    /// Operations whose payloads were written.
    pub written_operations: Vec<Operation>,
    /// Roots written directly (other than the query root), to be retained.
    pub(crate) implicit_retains: Vec<NodeId>,
    /// Fields invalidated via [`FieldModify::Invalidate`].
    pub(crate) invalidated: FxHashMap<NodeId, FxHashSet<String>>,
}

/// Collects a set of edits against a version of the cache, committing
/// them as one new cache snapshot.
pub struct CacheTransaction {
    context: Arc<CacheContext>,
    snapshot: CacheSnapshot,
    parent_snapshot: CacheSnapshot,
    retained: FxHashSet<NodeId>,
    optimistic_change_id: Option<ChangeId>,
    edited_node_ids: FxHashSet<NodeId>,
    deltas: Vec<CacheDelta>,
    written_operations: Vec<Operation>,
    implicit_retains: Vec<NodeId>,
    invalidated: FxHashMap<NodeId, FxHashSet<String>>,
}

impl CacheTransaction {
    pub(crate) fn new(
        context: Arc<CacheContext>,
        snapshot: CacheSnapshot,
        retained: FxHashSet<NodeId>,
        optimistic_change_id: Option<ChangeId>,
    ) -> Self {
        Self {
            context,
            parent_snapshot: snapshot.clone(),
            snapshot,
            retained,
            optimistic_change_id,
            edited_node_ids: FxHashSet::default(),
            deltas: Vec::new(),
            written_operations: Vec::new(),
            implicit_retains: Vec::new(),
            invalidated: FxHashMap::default(),
        }
    }

    /// Whether this transaction edits the optimistic layer.
    pub fn is_optimistic(&self) -> bool {
        self.optimistic_change_id.is_some()
    }

    /// Reads against the transaction's current view: the optimistic
    /// graph for optimistic transactions, the baseline otherwise.
    pub fn read(&self, operation: &Operation) -> ReadResult {
        read(operation, self.snapshot.graph(self.is_optimistic()))
    }

    /// Merges a payload with the transaction's current values.
    pub fn write(&mut self, operation: &Operation, payload: &JsonObject) -> Result<Option<Reference>> {
        if self.is_optimistic() {
            self.write_optimistic(operation, payload)
        } else {
            self.write_baseline(operation, payload)
        }
    }

    /// Rolls back a previously enqueued optimistic update. Unknown
    /// change ids are a no-op; concurrent rollbacks of the same id are
    /// expected under optimistic-UI races.
    pub fn rollback(&mut self, change_id: &str) -> Result<()> {
        let remaining = self.snapshot.optimistic_queue.remove(change_id);
        if remaining.len() == self.snapshot.optimistic_queue.len() {
            return Ok(());
        }
        debug!(change_id, "rolling back optimistic update");
        // We cannot know which nodes the removed entry touched; treat
        // everything in the outgoing optimistic view as edited.
        self.edited_node_ids
            .extend(self.snapshot.optimistic.all_node_ids().cloned());
        self.snapshot.optimistic_queue = remaining;
        let baseline = Arc::clone(&self.snapshot.baseline);
        let optimistic = self.build_optimistic(&baseline)?;
        self.snapshot = CacheSnapshot::new(
            baseline,
            optimistic,
            self.snapshot.optimistic_queue.clone(),
        );
        Ok(())
    }

    /// Runs the per-typename modifiers against one node.
    ///
    /// Each modifier is invoked once per stored variant of its field:
    /// the static value, and each parameterized variant (whose
    /// `store_field_name` is the parameterized node id). Returns whether
    /// anything changed.
    pub fn modify(&mut self, options: ModifyOptions<'_>) -> Result<bool> {
        let id = options.id.clone().unwrap_or_else(NodeId::query_root);
        // With no optimistic layering in play the lanes are one graph;
        // editing "optimistically" then would silently diverge them.
        let lane = options.optimistic
            && (self.is_optimistic() || self.snapshot.optimistic_queue.has_updates());
        let graph = Arc::clone(self.snapshot.graph(lane));
        let Some(node) = graph.get_node_snapshot(&id).map(Arc::clone) else {
            return Ok(false);
        };

        let mut temp: FxHashMap<NodeId, NodeSnapshot> = FxHashMap::default();
        let mut payload = JsonObject::new();
        let mut deleted: BTreeSet<String> = BTreeSet::new();
        let mut modified = false;
        let mut invalidated = false;
        let mut all_deleted = false;

        let data_keys: Vec<String> = node
            .data()
            .and_then(Value::as_object)
            .map(|obj| obj.keys().cloned().collect())
            .unwrap_or_default();

        let pairs: Vec<(String, &FieldModifierFn<'_>)> = match &options.fields {
            ModifyFields::All(modifier) => data_keys
                .iter()
                .map(|key| (key.clone(), modifier))
                .collect(),
            ModifyFields::Fields(map) => {
                map.iter().map(|(key, m)| (key.clone(), m)).collect()
            }
        };

        if pairs.is_empty() {
            if let ModifyFields::All(modifier) = &options.fields {
                // Data-less node: offer the whole (absent) value once so a
                // delete-everything modifier can still evict it.
                let mut details = ModifierDetails {
                    context: self.context.as_ref(),
                    graph: graph.as_ref(),
                    node_id: &id,
                    temp: &mut temp,
                    field_name: String::new(),
                    store_field_name: String::new(),
                    merged: false,
                };
                if let FieldModify::Delete = modifier(node.data(), &mut details) {
                    all_deleted = true;
                    modified = true;
                }
                modified |= details.merged;
            }
        }

        for (key, modifier) in pairs {
            for variant in field_variants(&graph, &node, &id, &key) {
                let store_key = variant.store_key.clone().unwrap_or_else(|| key.clone());
                let mut details = ModifierDetails {
                    context: self.context.as_ref(),
                    graph: graph.as_ref(),
                    node_id: &id,
                    temp: &mut temp,
                    field_name: key.clone(),
                    store_field_name: store_key.clone(),
                    merged: false,
                };
                let verdict = modifier(variant.value.as_ref(), &mut details);
                modified |= details.merged;
                drop(details);
                match verdict {
                    FieldModify::Keep => {}
                    FieldModify::Delete => {
                        // Parameterized variants are addressed by node id;
                        // static and reference variants by field name.
                        let delete_key = if variant.parameterized {
                            store_key
                        } else {
                            key.clone()
                        };
                        deleted.insert(delete_key);
                        modified = true;
                    }
                    FieldModify::Invalidate => {
                        self.edited_node_ids.insert(id.clone());
                        self.invalidated
                            .entry(id.clone())
                            .or_default()
                            .insert(key.clone());
                        invalidated = true;
                    }
                    FieldModify::Set(value) => {
                        if variant.value.as_ref() != Some(&value) {
                            payload.insert(key.clone(), value);
                            modified = true;
                        }
                    }
                }
            }
        }

        if !data_keys.is_empty() && data_keys.iter().all(|key| deleted.contains(key)) {
            all_deleted = true;
            modified = true;
        }

        if !modified && !invalidated {
            return Ok(false);
        }

        let mut editor = SnapshotEditor::new(self.context.as_ref(), graph.as_ref(), &self.retained);
        let no_deletions = BTreeSet::new();
        for (merge_id, snapshot) in &temp {
            if let Some(Value::Object(obj)) = snapshot.data() {
                editor.merge_node(merge_id, obj, &no_deletions)?;
            }
        }
        if all_deleted {
            editor.delete(&id);
            if options.optimistic {
                self.deltas.push(CacheDelta::Delete { id: id.clone() });
            }
        } else {
            editor.merge_node(&id, &payload, &deleted)?;
            if options.optimistic {
                self.deltas.push(CacheDelta::Merge {
                    id: id.clone(),
                    payload: payload.clone(),
                    deleted: deleted.clone(),
                });
            }
        }
        let result = editor.commit();
        self.edited_node_ids.extend(result.edited_node_ids);

        let edited_graph = Arc::new(result.snapshot);
        if lane {
            self.snapshot = CacheSnapshot::new(
                Arc::clone(&self.snapshot.baseline),
                edited_graph,
                self.snapshot.optimistic_queue.clone(),
            );
        } else {
            let optimistic = self.build_optimistic(&edited_graph)?;
            self.snapshot = CacheSnapshot::new(
                edited_graph,
                optimistic,
                self.snapshot.optimistic_queue.clone(),
            );
        }
        Ok(modified)
    }

    /// Removes a whole node, or one named field of a node. Sugar for
    /// [`modify`](Self::modify) with a delete-returning modifier.
    pub fn evict(&mut self, options: EvictOptions) -> Result<bool> {
        let delete_all: FieldModifierFn<'static> = Box::new(|_, _| FieldModify::Delete);
        let fields = match options.field_name {
            Some(name) => {
                let mut map: BTreeMap<String, FieldModifierFn<'static>> = BTreeMap::new();
                map.insert(name, delete_all);
                ModifyFields::Fields(map)
            }
            None => ModifyFields::All(delete_all),
        };
        self.modify(ModifyOptions {
            id: options.id,
            fields,
            optimistic: false,
            broadcast: options.broadcast,
        })
    }

    /// Completes the transaction: entity updaters fire once per edited
    /// entity, then the accumulated deltas (if optimistic) are enqueued.
    pub(crate) fn commit(mut self) -> TransactionOutcome {
        self.trigger_entity_updaters();
        let mut snapshot = std::mem::replace(&mut self.snapshot, CacheSnapshot::empty());
        if let Some(change_id) = &self.optimistic_change_id {
            let deltas = std::mem::take(&mut self.deltas);
            snapshot.optimistic_queue = snapshot.optimistic_queue.enqueue(change_id.clone(), deltas);
        }
        TransactionOutcome {
            snapshot,
            edited_node_ids: self.edited_node_ids,
            written_operations: self.written_operations,
            implicit_retains: self.implicit_retains,
            invalidated: self.invalidated,
        }
    }

    fn write_baseline(
        &mut self,
        operation: &Operation,
        payload: &JsonObject,
    ) -> Result<Option<Reference>> {
        let baseline = Arc::clone(&self.snapshot.baseline);
        let mut editor = SnapshotEditor::new(self.context.as_ref(), baseline.as_ref(), &self.retained);
        let reference = editor.merge_operation(operation, payload)?;
        let result = editor.commit();
        self.record_write(operation, result.edited_node_ids);

        let baseline = Arc::new(result.snapshot);
        let optimistic = self.build_optimistic(&baseline)?;
        self.snapshot = CacheSnapshot::new(
            baseline,
            optimistic,
            self.snapshot.optimistic_queue.clone(),
        );
        Ok(Some(reference))
    }

    fn write_optimistic(
        &mut self,
        operation: &Operation,
        payload: &JsonObject,
    ) -> Result<Option<Reference>> {
        self.deltas.push(CacheDelta::Write {
            operation: operation.clone(),
            payload: payload.clone(),
        });
        let optimistic = Arc::clone(&self.snapshot.optimistic);
        let mut editor =
            SnapshotEditor::new(self.context.as_ref(), optimistic.as_ref(), &self.retained);
        let reference = editor.merge_operation(operation, payload)?;
        let result = editor.commit();
        self.record_write(operation, result.edited_node_ids);

        self.snapshot = CacheSnapshot::new(
            Arc::clone(&self.snapshot.baseline),
            Arc::new(result.snapshot),
            self.snapshot.optimistic_queue.clone(),
        );
        Ok(Some(reference))
    }

    fn record_write(&mut self, operation: &Operation, edited: FxHashSet<NodeId>) {
        self.edited_node_ids.extend(edited);
        self.written_operations.push(operation.clone());
        if !operation.root_id().is_query_root() {
            // Directly written roots survive GC regardless of
            // reachability.
            self.implicit_retains.push(operation.root_id().clone());
        }
    }

    /// Replays the (unchanged) queue over a new baseline.
    fn build_optimistic(&mut self, baseline: &Arc<GraphSnapshot>) -> Result<Arc<GraphSnapshot>> {
        if !self.snapshot.optimistic_queue.has_updates() {
            return Ok(Arc::clone(baseline));
        }
        let (graph, edited) =
            self.snapshot
                .optimistic_queue
                .apply(self.context.as_ref(), baseline, &self.retained)?;
        self.edited_node_ids.extend(edited);
        Ok(Arc::new(graph))
    }

    /// Runs configured entity updaters, once per edited entity whose data
    /// carries a registered typename. Updaters observe post-edit,
    /// pre-commit state and may issue further edits into this same
    /// transaction.
    fn trigger_entity_updaters(&mut self) {
        if self.context.entity_updaters.is_empty() {
            return;
        }
        let optimistic = self.is_optimistic();
        let current_graph = Arc::clone(self.snapshot.graph(optimistic));
        let previous_graph = Arc::clone(self.parent_snapshot.graph(optimistic));

        let mut ids: Vec<NodeId> = self.edited_node_ids.iter().cloned().collect();
        ids.sort();

        let mut pending: Vec<(String, Option<Value>, Option<Value>)> = Vec::new();
        for id in ids {
            let current = current_graph.get_node_snapshot(&id);
            let previous = previous_graph.get_node_snapshot(&id);
            let Some(either) = current.or(previous) else {
                continue;
            };
            if either.kind() != NodeKind::Entity {
                continue;
            }
            let Some(typename) = self.context.typename_of(&id, either.data()) else {
                continue;
            };
            if !self.context.entity_updaters.contains_key(&typename) {
                continue;
            }
            // An evicted or unreferenced entity reads as removed.
            let current_data = current.and_then(|node| {
                if id.is_query_root() || node.refs().has_inbound() {
                    node.data().cloned()
                } else {
                    None
                }
            });
            let previous_data = previous.and_then(|node| node.data().cloned());
            pending.push((typename, current_data, previous_data));
        }

        let context = Arc::clone(&self.context);
        for (typename, current, previous) in pending {
            if let Some(updater) = context.entity_updaters.get(&typename) {
                updater(self, current.as_ref(), previous.as_ref());
            }
        }
    }
}

struct FieldVariant {
    /// `None` for the static value; the target node id for reference and
    /// parameterized variants.
    store_key: Option<String>,
    value: Option<Value>,
    parameterized: bool,
}

/// Enumerates the stored variants of one field, mirroring how the data
/// is actually laid out: at most one static value or reference, plus any
/// number of parameterized variants.
fn field_variants(
    graph: &GraphSnapshot,
    node: &NodeSnapshot,
    id: &NodeId,
    key: &str,
) -> Vec<FieldVariant> {
    let mut out = Vec::new();
    let datum = node
        .data()
        .and_then(Value::as_object)
        .and_then(|obj| obj.get(key));

    if let Some(reference) = node.refs().outbound_at(key) {
        out.push(FieldVariant {
            store_key: Some(reference.id.to_string()),
            value: graph.get_node_data(&reference.id).cloned(),
            parameterized: false,
        });
    } else if matches!(datum, Some(value) if !value.is_null()) {
        out.push(FieldVariant {
            store_key: None,
            value: datum.cloned(),
            parameterized: false,
        });
    }
    if let Some(refs) = node.refs().parameterized_at(key) {
        for reference in refs.iter().filter(|r| r.path.len() == 1) {
            out.push(FieldVariant {
                store_key: Some(reference.id.to_string()),
                value: graph.get_node_data(&reference.id).cloned(),
                parameterized: true,
            });
        }
    }
    if out.is_empty() {
        if id.is_query_root() && key == "__typename" {
            out.push(FieldVariant {
                store_key: None,
                value: Some(Value::String("Query".to_owned())),
                parameterized: false,
            });
        } else if matches!(datum, Some(Value::Null)) {
            out.push(FieldVariant {
                store_key: None,
                value: Some(Value::Null),
                parameterized: false,
            });
        }
    }
    out
}
