use std::borrow::Borrow;
use std::fmt;

use serde::de::{SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use smallvec::SmallVec;

/// JSON object payloads, as produced by `serde_json` (sorted keys).
pub type JsonObject = serde_json::Map<String, Value>;

/// Identifier of the well-known query root node.
pub const QUERY_ROOT_ID: &str = "ROOT_QUERY";

/// Sentinel identifier for "no such entity".
pub const NONEXISTENT_ID: &str = "__NONEXISTENT";

/// Separator embedded in parameterized-value node identifiers.
///
/// Chosen so it cannot collide with application-supplied entity ids.
pub const PARAMETERIZED_SEPARATOR: char = '\u{2756}'; // ❖

/// Opaque identifier of one node in the graph.
///
/// Entity ids are derived from application data via the configured
/// identification policy; parameterized-value ids are synthesized from
/// `(container, path, canonical arguments)`.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Wraps a raw identifier string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The well-known query root id.
    pub fn query_root() -> Self {
        Self(QUERY_ROOT_ID.to_owned())
    }

    /// The reserved "no such entity" sentinel.
    pub fn nonexistent() -> Self {
        Self(NONEXISTENT_ID.to_owned())
    }

    /// Returns `true` for the query root id.
    pub fn is_query_root(&self) -> bool {
        self.0 == QUERY_ROOT_ID
    }

    /// Returns `true` for synthesized parameterized-value ids.
    pub fn is_parameterized(&self) -> bool {
        self.0.contains(PARAMETERIZED_SEPARATOR)
    }

    /// The raw identifier string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Borrow<str> for NodeId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// One step of a field path: an object key or an array index.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum PathSegment {
    /// Object member access by field name.
    Field(String),
    /// Array element access by index.
    Index(usize),
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Field(name) => f.write_str(name),
            PathSegment::Index(index) => write!(f, "{index}"),
        }
    }
}

/// A path from a node's data root to one of its values.
///
/// Paths key the reference maps: the dotted rendering (`a.0.b`) is the
/// outbound-edge key, and the first segment groups parameterized edges.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct Path(SmallVec<[PathSegment; 4]>);

impl Path {
    /// The empty path, addressing a node's whole data value.
    pub fn root() -> Self {
        Self(SmallVec::new())
    }

    /// Builds a path from field names only.
    pub fn from_fields<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(
            fields
                .into_iter()
                .map(|f| PathSegment::Field(f.into()))
                .collect(),
        )
    }

    /// Number of segments.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether this is the empty (whole-data) path.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Appends a field segment.
    pub fn push_field(&mut self, name: impl Into<String>) {
        self.0.push(PathSegment::Field(name.into()));
    }

    /// Appends an index segment.
    pub fn push_index(&mut self, index: usize) {
        self.0.push(PathSegment::Index(index));
    }

    /// Removes and returns the last segment.
    pub fn pop(&mut self) -> Option<PathSegment> {
        self.0.pop()
    }

    /// Returns a new path with `segment` appended.
    pub fn child(&self, segment: PathSegment) -> Self {
        let mut next = self.clone();
        next.0.push(segment);
        next
    }

    /// Iterates the segments in order.
    pub fn segments(&self) -> impl Iterator<Item = &PathSegment> {
        self.0.iter()
    }

    /// First segment, if any.
    pub fn first(&self) -> Option<&PathSegment> {
        self.0.first()
    }

    /// Dotted rendering used as the outbound-edge key. Empty path renders
    /// as the empty string.
    pub fn key(&self) -> String {
        self.to_string()
    }

    /// Inbound-edge key: the referrer id followed by the dotted path.
    pub fn in_key(&self, id: &NodeId) -> String {
        format!("{id}.{self}")
    }

    /// Parameterized-edge grouping key: the first segment's rendering.
    pub fn param_key(&self) -> String {
        self.first().map(|s| s.to_string()).unwrap_or_default()
    }

    /// Whether `self` starts with every segment of `prefix`.
    pub fn starts_with(&self, prefix: &Path) -> bool {
        self.0.len() >= prefix.0.len() && self.0[..prefix.0.len()] == prefix.0[..]
    }

    /// Segment at `position`, if present.
    pub fn get(&self, position: usize) -> Option<&PathSegment> {
        self.0.get(position)
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{segment}")?;
        }
        Ok(())
    }
}

impl FromIterator<PathSegment> for Path {
    fn from_iter<T: IntoIterator<Item = PathSegment>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

// Paths serialize as mixed arrays (`["one", 0, "two"]`) so the extract
// format matches what external tooling expects.
impl Serialize for Path {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.0.len()))?;
        for segment in &self.0 {
            match segment {
                PathSegment::Field(name) => seq.serialize_element(name)?,
                PathSegment::Index(index) => seq.serialize_element(index)?,
            }
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for Path {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct PathVisitor;

        impl<'de> Visitor<'de> for PathVisitor {
            type Value = Path;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a sequence of field names and array indices")
            }

            fn visit_seq<A: SeqAccess<'de>>(
                self,
                mut seq: A,
            ) -> std::result::Result<Path, A::Error> {
                let mut segments = SmallVec::new();
                while let Some(value) = seq.next_element::<Value>()? {
                    let segment = match value {
                        Value::String(name) => PathSegment::Field(name),
                        Value::Number(n) => {
                            let index = n.as_u64().ok_or_else(|| {
                                serde::de::Error::custom("path index must be a non-negative integer")
                            })?;
                            PathSegment::Index(index as usize)
                        }
                        other => {
                            return Err(serde::de::Error::custom(format!(
                                "unsupported path segment: {other}"
                            )))
                        }
                    };
                    segments.push(segment);
                }
                Ok(Path(segments))
            }
        }

        deserializer.deserialize_seq(PathVisitor)
    }
}

/// A directed edge between two nodes, recorded from both ends.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NodeReference {
    /// The node on the far end of the edge.
    pub id: NodeId,
    /// Path at which the edge is anchored in the referrer's data.
    pub path: Path,
}

impl NodeReference {
    /// Builds a reference to `id` anchored at `path`.
    pub fn new(id: NodeId, path: Path) -> Self {
        Self { id, path }
    }
}

/// Opaque handle to a normalized entity, as returned by writes and
/// `to_reference`.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Reference {
    id: NodeId,
}

impl Reference {
    /// Wraps an entity id in a handle.
    pub fn new(id: NodeId) -> Self {
        Self { id }
    }

    /// The entity id this handle points at.
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// Renders the handle as a `{"__ref": id}` JSON value.
    pub fn to_value(&self) -> Value {
        let mut obj = JsonObject::new();
        obj.insert("__ref".to_owned(), Value::String(self.id.to_string()));
        Value::Object(obj)
    }
}

/// Recognizes `{"__ref": "<id>"}` values produced by [`Reference::to_value`].
pub fn as_reference(value: &Value) -> Option<NodeId> {
    let obj = value.as_object()?;
    if obj.len() != 1 {
        return None;
    }
    obj.get("__ref").and_then(Value::as_str).map(NodeId::from)
}
