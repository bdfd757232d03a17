//! The selection-tree boundary consumed from the query layer.
//!
//! Parsing and variable expansion live outside this crate; operations
//! arrive here as trees of concrete field selections. The structures are
//! deliberately plain so an adapter can build them from any query
//! language, and deterministic so they can serve as cache keys.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::model::{JsonObject, NodeId};

/// One requested field: optional response-key alias, optional concrete
/// arguments, and an optional sub-selection.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Field {
    /// Response key the payload uses, when it differs from the field name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    /// Concrete argument values; presence makes the field parameterized.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<JsonObject>,
    /// Sub-selection for object-valued fields; `None` marks a leaf.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Selection>,
}

impl Field {
    /// A leaf field with no alias, arguments, or children.
    pub fn leaf() -> Self {
        Self::default()
    }

    /// Sets the response-key alias.
    pub fn aliased(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Sets concrete argument values.
    pub fn with_args(mut self, args: JsonObject) -> Self {
        self.args = Some(args);
        self
    }

    /// Sets the sub-selection.
    pub fn with_children(mut self, children: Selection) -> Self {
        self.children = Some(children);
        self
    }

    /// Key under which the payload carries this field's value.
    pub fn response_key<'a>(&'a self, name: &'a str) -> &'a str {
        self.alias.as_deref().unwrap_or(name)
    }
}

/// A set of requested fields, keyed by schema field name.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Selection {
    fields: BTreeMap<String, Field>,
}

impl Selection {
    /// An empty selection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a field, replacing any previous entry of the same name.
    pub fn field(mut self, name: impl Into<String>, field: Field) -> Self {
        self.fields.insert(name.into(), field);
        self
    }

    /// Adds a leaf field.
    pub fn leaf(self, name: impl Into<String>) -> Self {
        self.field(name, Field::leaf())
    }

    /// Looks up a field by schema name.
    pub fn get(&self, name: &str) -> Option<&Field> {
        self.fields.get(name)
    }

    /// Iterates fields in deterministic (sorted) order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Field)> {
        self.fields.iter()
    }

    /// Whether the selection requests nothing.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// A fully expanded operation: a root node id plus a selection tree.
///
/// The cache key is derived once, at construction, from the canonical
/// JSON rendering of the selection; structurally equal operations
/// therefore collide on the same key, which is what the result cache
/// relies on.
#[derive(Clone, Debug)]
pub struct Operation {
    root_id: NodeId,
    selection: Arc<Selection>,
    key: Arc<str>,
}

impl Operation {
    /// Builds an operation rooted at `root_id`.
    pub fn new(root_id: NodeId, selection: Selection) -> Self {
        let rendered = serde_json::to_string(&selection).unwrap_or_default();
        let key = format!("{root_id}\u{2756}{rendered}").into();
        Self {
            root_id,
            selection: Arc::new(selection),
            key,
        }
    }

    /// Builds an operation against the query root.
    pub fn query(selection: Selection) -> Self {
        Self::new(NodeId::query_root(), selection)
    }

    /// The node the selection is resolved against.
    pub fn root_id(&self) -> &NodeId {
        &self.root_id
    }

    /// The selection tree.
    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    /// Deterministic cache key for this operation.
    pub fn key(&self) -> &Arc<str> {
        &self.key
    }
}

impl PartialEq for Operation {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Operation {}

/// Canonical rendering of a parameterized field's arguments.
///
/// `serde_json`'s map type keeps keys sorted, so structurally equal
/// argument sets render identically and collide onto the same
/// parameterized-value node.
pub fn canonical_args(args: &JsonObject) -> String {
    serde_json::to_string(args).unwrap_or_default()
}
