//! The copy-on-write snapshot editor.
//!
//! Given a baseline graph, a selection, and a payload, the editor builds
//! a new graph that shares every untouched node with the baseline and
//! replaces only the nodes reachable from the write. Along the way it
//! extracts entities into their own nodes, rewires references (removing
//! the inbound half from the old target before installing the new one),
//! and sweeps subgraphs the rewiring orphaned.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;
use tracing::{debug, warn};

use crate::context::CacheContext;
use crate::error::{CacheError, Result};
use crate::graph::GraphSnapshot;
use crate::model::{
    JsonObject, NodeId, NodeReference, Path, PathSegment, Reference, PARAMETERIZED_SEPARATOR,
};
use crate::nodes::{NodeKind, NodeSnapshot};
use crate::query::{canonical_args, Operation, Selection};
use crate::util;

/// Outcome of one editing pass.
#[derive(Debug)]
pub struct WriteResult {
    /// The derived graph, sharing untouched nodes with the baseline.
    pub snapshot: GraphSnapshot,
    /// Every node the edit dirtied, created, or removed.
    pub edited_node_ids: FxHashSet<NodeId>,
    /// Handle to the node the payload was written against.
    pub written_reference: Option<Reference>,
}

/// Derives the synthetic node id of a parameterized field value from its
/// container, field path, and canonicalized arguments. Identical
/// arguments collide onto the same id by construction.
pub fn node_id_for_parameterized_value(
    container: &NodeId,
    path: &Path,
    args: &JsonObject,
) -> NodeId {
    let rendered_path = serde_json::to_string(path).unwrap_or_default();
    NodeId::from(format!(
        "{container}{sep}{rendered_path}{sep}{args}",
        sep = PARAMETERIZED_SEPARATOR,
        args = canonical_args(args),
    ))
}

/// Writes `payload` against `operation` over `baseline`, returning the
/// derived graph. Convenience over [`SnapshotEditor`] for callers without
/// retention state.
pub fn write(
    context: &CacheContext,
    baseline: &GraphSnapshot,
    operation: &Operation,
    payload: &JsonObject,
) -> Result<WriteResult> {
    let retained = FxHashSet::default();
    let mut editor = SnapshotEditor::new(context, baseline, &retained);
    let reference = editor.merge_operation(operation, payload)?;
    let mut result = editor.commit();
    result.written_reference = Some(reference);
    Ok(result)
}

/// How far a merge descends into payload values.
#[derive(Clone, Copy)]
enum Descend<'s> {
    /// Selection-guided: only requested fields, leaves stored verbatim.
    Selection(Option<&'s Selection>),
    /// Schema-less: every field, as used by `modify` merges and replay.
    All,
}

/// A pending change to one static reference edge. The previous target is
/// resolved when the edit is applied, so duplicate payload occurrences of
/// the same reference collapse cleanly.
#[derive(Debug)]
struct RefEdit {
    container: NodeId,
    path: Path,
    next: Option<NodeId>,
}

/// Copy-on-write editor over one baseline [`GraphSnapshot`].
///
/// Nodes are cloned into a working set the first time they are touched;
/// the baseline itself is never mutated. `commit` folds the working set
/// into a new graph, applying deferred reference rewiring and the orphan
/// sweep first. If any merge returns an error the editor can simply be
/// dropped — nothing has been installed.
pub struct SnapshotEditor<'a> {
    context: &'a CacheContext,
    parent: &'a GraphSnapshot,
    retained: &'a FxHashSet<NodeId>,
    /// `Some` = live working copy, `None` = deleted.
    working: FxHashMap<NodeId, Option<NodeSnapshot>>,
    edited: FxHashSet<NodeId>,
    /// Deferred static-edge rewiring, keyed for dedup and determinism.
    ref_edits: BTreeMap<(NodeId, String), RefEdit>,
    /// Deferred parameterized-edge removals.
    param_removals: Vec<(NodeId, NodeReference)>,
}

impl<'a> SnapshotEditor<'a> {
    /// Starts an editing pass over `parent`. Ids in `retained` are exempt
    /// from the orphan sweep.
    pub fn new(
        context: &'a CacheContext,
        parent: &'a GraphSnapshot,
        retained: &'a FxHashSet<NodeId>,
    ) -> Self {
        Self {
            context,
            parent,
            retained,
            working: FxHashMap::default(),
            edited: FxHashSet::default(),
            ref_edits: BTreeMap::new(),
            param_removals: Vec::new(),
        }
    }

    /// Merges a query-shaped payload rooted at the operation's root node.
    pub fn merge_operation(
        &mut self,
        operation: &Operation,
        payload: &JsonObject,
    ) -> Result<Reference> {
        let root = operation.root_id().clone();
        self.ensure_node(&root, NodeKind::Entity);
        self.merge_selection(&root, &Path::root(), operation.selection(), payload)?;
        Ok(Reference::new(root))
    }

    /// Schema-less merge of `payload` into the node `id`, deleting the
    /// named fields. A deleted name that is a parameterized node id
    /// removes that single argument variant; a plain field name removes
    /// the static value and every variant of the field.
    pub fn merge_node(
        &mut self,
        id: &NodeId,
        payload: &JsonObject,
        deleted: &BTreeSet<String>,
    ) -> Result<()> {
        self.ensure_node(id, NodeKind::Entity);
        for (name, value) in payload {
            let path = Path::root().child(PathSegment::Field(name.clone()));
            self.merge_value(id, path, Some(value), Descend::All)?;
        }
        for field in deleted {
            if field.contains(PARAMETERIZED_SEPARATOR) {
                self.delete(&NodeId::from(field.as_str()));
                continue;
            }
            let path = Path::from_fields([field.as_str()]);
            self.remove_references_where(id, |p| p.starts_with(&path));
            let node = self.ensure_node(id, NodeKind::Entity);
            if util::remove_at(node.data_mut(), &path) {
                self.edited.insert(id.clone());
            }
        }
        Ok(())
    }

    /// Evicts the node `id`: severs every edge touching it, drops its
    /// data, and sweeps any children the severing orphaned. The entry
    /// itself lingers, empty and unreachable, until the next `gc`.
    pub fn delete(&mut self, id: &NodeId) -> bool {
        let Some(node) = self.node(id) else {
            return false;
        };
        let kind = node.kind();
        let children: Vec<NodeReference> = node.refs().iter_children().cloned().collect();
        let referrers: Vec<NodeReference> = node.refs().iter_inbound().cloned().collect();

        let mut candidates = Vec::new();
        for child in &children {
            if let Some(target) = self.touch_node(&child.id) {
                target.refs_mut().remove_inbound(id, &child.path);
                if !target.refs().has_inbound() {
                    candidates.push(child.id.clone());
                }
            }
        }
        for referrer in &referrers {
            if let Some(source) = self.touch_node(&referrer.id) {
                if source.refs_mut().remove_outbound(&referrer.path).is_some() {
                    // Static edge: drop the placeholder too, so reads
                    // report the field as missing rather than null.
                    util::remove_at(source.data_mut(), &referrer.path);
                } else {
                    source.refs_mut().remove_parameterized(id, &referrer.path);
                }
                self.edited.insert(referrer.id.clone());
            }
        }

        debug!(node = %id, "node evicted");
        self.working.insert(id.clone(), Some(NodeSnapshot::empty(kind)));
        self.edited.insert(id.clone());
        self.sweep_orphans(candidates);
        true
    }

    /// Completes the pass: applies deferred rewiring, sweeps orphans, and
    /// folds the working set into a new graph.
    pub fn commit(mut self) -> WriteResult {
        let mut candidates = self.apply_reference_edits();
        candidates.extend(self.apply_parameterized_removals());
        self.sweep_orphans(candidates);

        let mut nodes = self.parent.nodes_cloned();
        for (id, slot) in self.working {
            match slot {
                Some(node) => match self.parent.get_node_snapshot(&id) {
                    // Writing back an identical node would needlessly
                    // break structural sharing; keep the old allocation.
                    Some(previous) if **previous == node => {}
                    _ => {
                        nodes.insert(id, Arc::new(node));
                    }
                },
                None => {
                    nodes.remove(&id);
                }
            }
        }
        WriteResult {
            snapshot: GraphSnapshot::from_nodes(nodes),
            edited_node_ids: self.edited,
            written_reference: None,
        }
    }

    // ---- payload walk -------------------------------------------------

    fn merge_selection(
        &mut self,
        container: &NodeId,
        prefix: &Path,
        selection: &Selection,
        payload: &JsonObject,
    ) -> Result<()> {
        for (name, field) in selection.iter() {
            let value = payload.get(field.response_key(name));
            let path = prefix.child(PathSegment::Field(name.clone()));
            if let Some(args) = &field.args {
                self.merge_parameterized(container, path, args, value, field.children.as_ref())?;
            } else {
                self.merge_value(container, path, value, Descend::Selection(field.children.as_ref()))?;
            }
        }
        Ok(())
    }

    fn merge_value(
        &mut self,
        container: &NodeId,
        path: Path,
        value: Option<&Value>,
        descend: Descend<'_>,
    ) -> Result<()> {
        let Some(value) = value else {
            warn!(container = %container, path = %path, "payload missing value for selected field");
            return Ok(());
        };

        if value.is_null() {
            self.remove_references_where(container, |p| p.starts_with(&path));
            self.set_node_value(container, &path, Value::Null);
            return Ok(());
        }

        match descend {
            Descend::Selection(None) => {
                // Leaf field: the value is stored verbatim, so nothing
                // beneath this path can remain a reference.
                self.remove_references_where(container, |p| p.starts_with(&path));
                self.set_node_value(container, &path, value.clone());
                Ok(())
            }
            Descend::Selection(Some(children)) => match value {
                Value::Object(obj) => {
                    if let Some(entity_id) = self.context.entity_id_for_value(value) {
                        self.merge_entity(
                            container,
                            path,
                            entity_id,
                            obj,
                            Descend::Selection(Some(children)),
                        )
                    } else {
                        self.merge_nested_object(container, path, |editor, path| {
                            editor.merge_selection(container, path, children, obj)
                        })
                    }
                }
                Value::Array(items) => {
                    self.merge_array(container, path, items, Descend::Selection(Some(children)))
                }
                _ => Err(CacheError::Payload {
                    path: path.to_string(),
                    reason: format!(
                        "expected an object or array for a field with a sub-selection, found `{value}`"
                    ),
                }),
            },
            Descend::All => match value {
                Value::Object(obj) => {
                    if let Some(entity_id) = self.context.entity_id_for_value(value) {
                        self.merge_entity(container, path, entity_id, obj, Descend::All)
                    } else {
                        self.merge_nested_object(container, path, |editor, path| {
                            for (name, nested) in obj {
                                let child = path.child(PathSegment::Field(name.clone()));
                                editor.merge_value(container, child, Some(nested), Descend::All)?;
                            }
                            Ok(())
                        })
                    }
                }
                Value::Array(items) => self.merge_array(container, path, items, Descend::All),
                _ => {
                    self.remove_references_where(container, |p| p.starts_with(&path));
                    self.set_node_value(container, &path, value.clone());
                    Ok(())
                }
            },
        }
    }

    fn merge_entity(
        &mut self,
        container: &NodeId,
        path: Path,
        entity_id: NodeId,
        obj: &JsonObject,
        descend: Descend<'_>,
    ) -> Result<()> {
        // Stale deeper edges from when this path held an inline object.
        self.remove_references_where(container, |p| p.starts_with(&path) && *p != path);
        self.ref_edits.insert(
            (container.clone(), path.key()),
            RefEdit {
                container: container.clone(),
                path: path.clone(),
                next: Some(entity_id.clone()),
            },
        );
        // The container keeps only a placeholder; the edge is the truth.
        self.set_node_value(container, &path, Value::Null);

        self.ensure_node(&entity_id, NodeKind::Entity);
        if obj.len() == 1 && obj.get("__ref").is_some_and(Value::is_string) {
            // A bare reference handle carries no field data to merge.
            return Ok(());
        }
        match descend {
            Descend::Selection(Some(children)) => {
                self.merge_selection(&entity_id, &Path::root(), children, obj)
            }
            Descend::Selection(None) | Descend::All => {
                for (name, nested) in obj {
                    let child = Path::root().child(PathSegment::Field(name.clone()));
                    self.merge_value(&entity_id, child, Some(nested), Descend::All)?;
                }
                Ok(())
            }
        }
    }

    fn merge_nested_object(
        &mut self,
        container: &NodeId,
        path: Path,
        merge: impl FnOnce(&mut Self, &Path) -> Result<()>,
    ) -> Result<()> {
        match self.node_value_at(container, &path) {
            Some(Value::Object(_)) => {}
            Some(_) => {
                // The previous value (scalar, null, or reference) cannot
                // be merged into; replace it wholesale.
                self.remove_references_where(container, |p| p.starts_with(&path));
                self.set_node_value(container, &path, Value::Object(JsonObject::new()));
            }
            // Nothing stored yet: leave materialization to the leaves,
            // so purely parameterized paths add no container data.
            None => {}
        }
        merge(self, &path)
    }

    fn merge_array(
        &mut self,
        container: &NodeId,
        path: Path,
        items: &[Value],
        descend: Descend<'_>,
    ) -> Result<()> {
        let previous = match self.node_value_at(container, &path) {
            Some(Value::Array(existing)) => Some(existing.clone()),
            _ => None,
        };
        match previous {
            Some(mut existing) => {
                if existing.len() > items.len() {
                    // Truncation: edges under removed tail indices die.
                    let keep = items.len();
                    self.remove_references_where(container, |p| {
                        p.starts_with(&path)
                            && matches!(p.get(path.len()), Some(PathSegment::Index(i)) if *i >= keep)
                    });
                    existing.truncate(keep);
                    self.set_node_value(container, &path, Value::Array(existing));
                }
            }
            None => {
                // Previous value was not an array; nothing beneath it can
                // survive the replacement.
                self.remove_references_where(container, |p| p.starts_with(&path));
                self.set_node_value(container, &path, Value::Array(Vec::new()));
            }
        }
        for (index, item) in items.iter().enumerate() {
            let element = path.child(PathSegment::Index(index));
            self.merge_value(container, element, Some(item), descend)?;
        }
        Ok(())
    }

    fn merge_parameterized(
        &mut self,
        container: &NodeId,
        path: Path,
        args: &JsonObject,
        value: Option<&Value>,
        children: Option<&Selection>,
    ) -> Result<()> {
        let Some(value) = value else {
            warn!(container = %container, path = %path, "payload missing value for parameterized field");
            return Ok(());
        };
        let pid = node_id_for_parameterized_value(container, &path, args);
        self.ensure_node(&pid, NodeKind::ParameterizedValue);
        if self
            .ensure_node(container, NodeKind::Entity)
            .refs_mut()
            .add_parameterized(pid.clone(), path.clone())
        {
            self.edited.insert(container.clone());
        }
        self.ensure_node(&pid, NodeKind::ParameterizedValue)
            .refs_mut()
            .add_inbound(container.clone(), path.clone());
        self.merge_value(&pid, Path::root(), Some(value), Descend::Selection(children))
    }

    // ---- reference rewiring and orphan collection ---------------------

    /// Queues removal edits for every edge of `container` whose path
    /// satisfies `matches`.
    fn remove_references_where(&mut self, container: &NodeId, matches: impl Fn(&Path) -> bool) {
        let Some(node) = self.node(container) else {
            return;
        };
        let static_removals: Vec<Path> = node
            .refs()
            .outbound
            .values()
            .filter(|r| matches(&r.path))
            .map(|r| r.path.clone())
            .collect();
        let param_removals: Vec<NodeReference> = node
            .refs()
            .parameterized
            .values()
            .flatten()
            .filter(|r| matches(&r.path))
            .cloned()
            .collect();
        for path in static_removals {
            self.ref_edits.insert(
                (container.clone(), path.key()),
                RefEdit {
                    container: container.clone(),
                    path,
                    next: None,
                },
            );
        }
        for reference in param_removals {
            self.param_removals.push((container.clone(), reference));
        }
    }

    fn apply_reference_edits(&mut self) -> Vec<NodeId> {
        let edits = std::mem::take(&mut self.ref_edits);
        let mut candidates = Vec::new();
        for (_, edit) in edits {
            let RefEdit {
                container,
                path,
                next,
            } = edit;
            let previous = self
                .node(&container)
                .and_then(|n| n.refs().outbound_at(&path.key()))
                .map(|r| r.id.clone());
            if previous == next {
                // Duplicate occurrences of an existing reference: make
                // sure the inbound half is present, nothing else to do.
                if let Some(target_id) = next {
                    let present = self
                        .node(&target_id)
                        .map(|n| n.refs().inbound.contains_key(&path.in_key(&container)))
                        .unwrap_or(false);
                    if !present {
                        if let Some(target) = self.touch_node(&target_id) {
                            target.refs_mut().add_inbound(container.clone(), path.clone());
                        }
                    }
                }
                continue;
            }
            if let Some(previous_id) = previous {
                if let Some(source) = self.touch_node(&container) {
                    source.refs_mut().remove_outbound(&path);
                }
                if let Some(target) = self.touch_node(&previous_id) {
                    target.refs_mut().remove_inbound(&container, &path);
                    if !target.refs().has_inbound() {
                        candidates.push(previous_id.clone());
                    }
                }
                self.edited.insert(container.clone());
                self.edited.insert(previous_id);
            }
            if let Some(next_id) = next {
                self.ensure_node(&container, NodeKind::Entity)
                    .refs_mut()
                    .add_outbound(next_id.clone(), path.clone());
                self.ensure_node(&next_id, NodeKind::Entity)
                    .refs_mut()
                    .add_inbound(container.clone(), path.clone());
                self.edited.insert(container.clone());
            }
        }
        candidates
    }

    fn apply_parameterized_removals(&mut self) -> Vec<NodeId> {
        let removals = std::mem::take(&mut self.param_removals);
        let mut candidates = Vec::new();
        for (container, reference) in removals {
            if let Some(source) = self.touch_node(&container) {
                if source
                    .refs_mut()
                    .remove_parameterized(&reference.id, &reference.path)
                {
                    self.edited.insert(container.clone());
                }
            }
            if let Some(target) = self.touch_node(&reference.id) {
                target.refs_mut().remove_inbound(&container, &reference.path);
                if !target.refs().has_inbound() {
                    candidates.push(reference.id.clone());
                }
            }
        }
        candidates
    }

    /// Cascading removal of nodes left without inbound edges. The query
    /// root and explicitly retained ids are never swept.
    fn sweep_orphans(&mut self, mut stack: Vec<NodeId>) {
        while let Some(id) = stack.pop() {
            if id.is_query_root() || self.retained.contains(&id) {
                continue;
            }
            let Some(node) = self.node(&id) else {
                continue;
            };
            if node.refs().has_inbound() {
                continue;
            }
            let children: Vec<NodeReference> = node.refs().iter_children().cloned().collect();
            debug!(node = %id, "orphaned node removed");
            self.working.insert(id.clone(), None);
            self.edited.insert(id.clone());
            for child in children {
                if let Some(target) = self.touch_node(&child.id) {
                    target.refs_mut().remove_inbound(&id, &child.path);
                    if !target.refs().has_inbound() {
                        stack.push(child.id.clone());
                    }
                }
            }
        }
    }

    // ---- working-set plumbing -----------------------------------------

    /// The current view of a node: working copy if touched, baseline
    /// otherwise, `None` once deleted in this pass.
    fn node(&self, id: &NodeId) -> Option<&NodeSnapshot> {
        match self.working.get(id) {
            Some(Some(node)) => Some(node),
            Some(None) => None,
            None => self.parent.get_node_snapshot(id).map(|arc| arc.as_ref()),
        }
    }

    fn node_value_at(&self, id: &NodeId, path: &Path) -> Option<&Value> {
        util::get_at(self.node(id).and_then(|n| n.data()), path)
    }

    /// Clones an existing node into the working set; `None` when the node
    /// does not exist or was deleted in this pass.
    fn touch_node(&mut self, id: &NodeId) -> Option<&mut NodeSnapshot> {
        match self.working.get(id) {
            Some(Some(_)) => {}
            Some(None) => return None,
            None => {
                let seeded = self.parent.get_node_snapshot(id)?.as_ref().clone();
                self.working.insert(id.clone(), Some(seeded));
            }
        }
        match self.working.get_mut(id) {
            Some(Some(node)) => Some(node),
            _ => None,
        }
    }

    /// Clones or creates the node `id` in the working set. Fresh nodes
    /// (and resurrections of deleted ones) count as edited.
    fn ensure_node(&mut self, id: &NodeId, kind: NodeKind) -> &mut NodeSnapshot {
        if !matches!(self.working.get(id), Some(Some(_))) {
            let resurrect = matches!(self.working.get(id), Some(None));
            let seeded = if resurrect {
                None
            } else {
                self.parent
                    .get_node_snapshot(id)
                    .map(|arc| arc.as_ref().clone())
            };
            if seeded.is_none() {
                self.edited.insert(id.clone());
            }
            self.working
                .insert(id.clone(), Some(seeded.unwrap_or_else(|| NodeSnapshot::empty(kind))));
        }
        match self.working.get_mut(id) {
            Some(Some(node)) => node,
            _ => unreachable!("node was seeded above"),
        }
    }

    fn set_node_value(&mut self, id: &NodeId, path: &Path, value: Value) {
        let node = self.ensure_node(id, NodeKind::Entity);
        if util::set_at(node.data_mut(), path, value) {
            self.edited.insert(id.clone());
        }
    }
}
