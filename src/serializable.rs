//! Serde model for the extract/restore wire format.
//!
//! One record per node, keyed by node id, with reference maps flattened
//! to `{id, path}` arrays. The optional `__META` record carries retained
//! root ids so retention state round-trips with the graph.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::{Deserializer, Error as DeError};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::model::{NodeId, NodeReference, Path};
use crate::nodes::NodeKind;

/// One serialized edge endpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SerializedRef {
    /// Target (or referrer) node id.
    pub id: NodeId,
    /// Path at which the edge is anchored.
    pub path: Path,
}

impl From<&NodeReference> for SerializedRef {
    fn from(reference: &NodeReference) -> Self {
        Self {
            id: reference.id.clone(),
            path: reference.path.clone(),
        }
    }
}

/// One serialized node record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SerializedNode {
    /// Variant tag: `0` entity, `1` parameterized value.
    #[serde(rename = "type")]
    pub kind: NodeKind,
    /// Stored data. Absent when the node exists only by reference;
    /// an explicit `null` is preserved as a value.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "some_value"
    )]
    pub data: Option<Value>,
    /// Inbound edges, in deterministic order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inbound: Vec<SerializedRef>,
    /// Outbound static edges, in deterministic order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outbound: Vec<SerializedRef>,
    /// Parameterized-value edges, in deterministic order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameterized: Vec<SerializedRef>,
}

/// Auxiliary record keyed `__META` in the serialized map.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SerializedMeta {
    /// Retained root ids other than the query root.
    #[serde(rename = "extraRootIds", default, skip_serializing_if = "Vec::is_empty")]
    pub extra_root_ids: Vec<NodeId>,
}

/// The complete serialized graph: node records keyed by id, plus the
/// optional `__META` record.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SerializedGraph {
    /// Retention metadata, when any roots are explicitly retained.
    #[serde(rename = "__META", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<SerializedMeta>,
    /// Node records keyed by node id.
    #[serde(flatten)]
    pub nodes: BTreeMap<NodeId, SerializedNode>,
}

// `Option<Value>` would fold an explicit JSON null into `None`, erasing
// the "explicitly nulled" / "no data" distinction; route null to
// `Some(Value::Null)` instead. Absent keys still default to `None`.
fn some_value<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

impl Serialize for NodeKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let tag: u8 = match self {
            NodeKind::Entity => 0,
            NodeKind::ParameterizedValue => 1,
        };
        serializer.serialize_u8(tag)
    }
}

impl<'de> Deserialize<'de> for NodeKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct TagVisitor;

        impl serde::de::Visitor<'_> for TagVisitor {
            type Value = NodeKind;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a node type tag (0 or 1)")
            }

            fn visit_u64<E: DeError>(self, value: u64) -> Result<NodeKind, E> {
                match value {
                    0 => Ok(NodeKind::Entity),
                    1 => Ok(NodeKind::ParameterizedValue),
                    other => Err(E::custom(format!("unknown node type tag {other}"))),
                }
            }

            fn visit_i64<E: DeError>(self, value: i64) -> Result<NodeKind, E> {
                u64::try_from(value)
                    .map_err(|_| E::custom(format!("unknown node type tag {value}")))
                    .and_then(|v| self.visit_u64(v))
            }
        }

        deserializer.deserialize_u64(TagVisitor)
    }
}
