//! Selection-guided reads with structural missing-field detection.

use std::sync::Arc;

use rustc_hash::FxHashSet;
use serde_json::Value;

use crate::graph::GraphSnapshot;
use crate::model::{JsonObject, NodeId, Path, PathSegment};
use crate::nodes::NodeSnapshot;
use crate::operations::write::node_id_for_parameterized_value;
use crate::query::{Operation, Selection};

/// One requested-but-absent field, with the response path it was
/// requested at.
#[derive(Clone, Debug, PartialEq)]
pub struct MissingField {
    /// Response path of the absent value.
    pub path: Path,
    /// Human-readable description of what was absent.
    pub message: String,
}

/// The outcome of reading a selection against one graph.
///
/// Missing fields are data, not errors: `complete` is `false` whenever
/// any requested field, at any depth, had no stored value and no edge to
/// supply one.
#[derive(Clone, Debug)]
pub struct ReadResult {
    /// The assembled response, keyed by response keys. `None` when the
    /// root node does not exist.
    pub result: Option<Arc<Value>>,
    /// Whether every requested field was found.
    pub complete: bool,
    /// Path-qualified descriptions of everything that was absent.
    pub missing: Vec<MissingField>,
    /// Every node id the read visited (or would have visited), for
    /// invalidation bookkeeping.
    pub entity_ids: FxHashSet<NodeId>,
    /// Set on results delivered by an optimistic transaction's broadcast.
    pub from_optimistic_transaction: bool,
}

impl ReadResult {
    /// Whether two results would look identical to a consumer.
    pub fn results_equal(&self, other: &Self) -> bool {
        if self.complete != other.complete {
            return false;
        }
        match (&self.result, &other.result) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b) || a == b,
            _ => false,
        }
    }
}

/// Reads `operation` against `graph`.
pub fn read(operation: &Operation, graph: &GraphSnapshot) -> ReadResult {
    let mut walk = ReadWalk {
        graph,
        missing: Vec::new(),
        entity_ids: FxHashSet::default(),
        visiting: Vec::new(),
    };
    let root = operation.root_id();
    let value = walk.resolve_node(root, Some(operation.selection()), &Path::root());
    let complete = value.is_some() && walk.missing.is_empty();
    ReadResult {
        result: value.map(Arc::new),
        complete,
        missing: walk.missing,
        entity_ids: walk.entity_ids,
        from_optimistic_transaction: false,
    }
}

struct ReadWalk<'a> {
    graph: &'a GraphSnapshot,
    missing: Vec<MissingField>,
    entity_ids: FxHashSet<NodeId>,
    /// Guards selection-less resolution against reference cycles.
    visiting: Vec<NodeId>,
}

impl ReadWalk<'_> {
    fn resolve_node(
        &mut self,
        id: &NodeId,
        selection: Option<&Selection>,
        abs: &Path,
    ) -> Option<Value> {
        self.entity_ids.insert(id.clone());
        let Some(node) = self.graph.get_node_snapshot(id) else {
            self.push_missing(abs, format!("no node `{id}` in the graph"));
            return None;
        };
        let node = Arc::clone(node);
        match selection {
            Some(selection) => {
                self.resolve_value(id, &node, &Path::root(), node.data(), Some(selection), abs)
            }
            None => self.resolve_opaque(id, &node, abs),
        }
    }

    /// Resolves the value at `path` inside `container`'s data, following
    /// a static edge when one is anchored there.
    fn resolve_value(
        &mut self,
        container: &NodeId,
        node: &NodeSnapshot,
        path: &Path,
        cursor: Option<&Value>,
        children: Option<&Selection>,
        abs: &Path,
    ) -> Option<Value> {
        if let Some(reference) = node.refs().outbound_at(&path.key()) {
            let target = reference.id.clone();
            return self.resolve_node(&target, children, abs);
        }
        match cursor {
            // No stored value: parameterized children may still resolve,
            // so descend through the selection; its static leaves report
            // their own missing entries.
            None => match children {
                Some(selection) => Some(Value::Object(self.resolve_selection(
                    container, node, path, abs, selection, None,
                ))),
                None => {
                    self.push_missing(abs, format!("no value at [{abs}] of node `{container}`"));
                    None
                }
            },
            Some(Value::Null) => Some(Value::Null),
            Some(Value::Array(items)) => {
                let mut out = Vec::with_capacity(items.len());
                for (index, item) in items.iter().enumerate() {
                    let element = path.child(PathSegment::Index(index));
                    let element_abs = abs.child(PathSegment::Index(index));
                    let resolved = self.resolve_value(
                        container,
                        node,
                        &element,
                        Some(item),
                        children,
                        &element_abs,
                    );
                    out.push(resolved.unwrap_or(Value::Null));
                }
                Some(Value::Array(out))
            }
            Some(Value::Object(obj)) => match children {
                Some(selection) => Some(Value::Object(self.resolve_selection(
                    container,
                    node,
                    path,
                    abs,
                    selection,
                    Some(obj),
                ))),
                None => Some(Value::Object(obj.clone())),
            },
            Some(other) => Some(other.clone()),
        }
    }

    fn resolve_selection(
        &mut self,
        container: &NodeId,
        node: &NodeSnapshot,
        prefix: &Path,
        abs: &Path,
        selection: &Selection,
        data: Option<&JsonObject>,
    ) -> JsonObject {
        let mut out = JsonObject::new();
        for (name, field) in selection.iter() {
            let response_key = field.response_key(name).to_owned();
            let abs_child = abs.child(PathSegment::Field(response_key.clone()));
            let path = prefix.child(PathSegment::Field(name.clone()));
            if let Some(args) = &field.args {
                let pid = node_id_for_parameterized_value(container, &path, args);
                if self.graph.contains(&pid) {
                    if let Some(value) =
                        self.resolve_node(&pid, field.children.as_ref(), &abs_child)
                    {
                        out.insert(response_key, value);
                    }
                } else {
                    // Track the would-be node so later writes to it
                    // invalidate consumers of this read.
                    self.entity_ids.insert(pid);
                    self.push_missing(
                        &abs_child,
                        format!(
                            "no parameterized value for `{name}` at [{abs_child}] of node `{container}`"
                        ),
                    );
                }
            } else {
                let cursor = data.and_then(|obj| obj.get(name));
                if let Some(value) = self.resolve_value(
                    container,
                    node,
                    &path,
                    cursor,
                    field.children.as_ref(),
                    &abs_child,
                ) {
                    out.insert(response_key, value);
                }
            }
        }
        out
    }

    /// Materializes a node without a selection, overlaying every stored
    /// edge onto the data. Reference cycles are cut with a missing entry
    /// rather than recursing forever.
    fn resolve_opaque(&mut self, id: &NodeId, node: &NodeSnapshot, abs: &Path) -> Option<Value> {
        if self.visiting.contains(id) {
            self.push_missing(abs, format!("reference cycle through node `{id}`"));
            return None;
        }
        self.visiting.push(id.clone());
        let mut value = node.data().cloned();
        for reference in node.refs().iter_children() {
            let child_abs = join_paths(abs, &reference.path);
            let target = reference.id.clone();
            let path = reference.path.clone();
            let resolved = self.resolve_node(&target, None, &child_abs);
            if path.is_empty() {
                value = resolved;
            } else {
                crate::util::set_at(&mut value, &path, resolved.unwrap_or(Value::Null));
            }
        }
        self.visiting.pop();
        value
    }

    fn push_missing(&mut self, path: &Path, message: String) {
        self.missing.push(MissingField {
            path: path.clone(),
            message,
        });
    }
}

fn join_paths(base: &Path, tail: &Path) -> Path {
    base.segments().chain(tail.segments()).cloned().collect()
}
