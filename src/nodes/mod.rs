//! Node snapshots: the atomic units of graph storage.
//!
//! A node is either an entity (the static field values of one identified
//! object) or a parameterized value (the result of a field invoked with
//! arguments, stored out-of-line from its owning entity). Both carry the
//! same reference bookkeeping.

mod references;

pub use references::References;

use serde_json::Value;

/// Discriminates the two node snapshot variants, including in the
/// serialized form (entity = 0, parameterized value = 1).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeKind {
    /// Static field values of one identified entity.
    Entity,
    /// Out-of-line result of a field invoked with arguments.
    ParameterizedValue,
}

/// Static field values observed for a single entity, plus reference
/// bookkeeping. Entity-valued fields hold `null` placeholders in `data`;
/// the true edges live in [`References`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EntitySnapshot {
    /// Field values. `None` means the entity exists only by reference.
    pub data: Option<Value>,
    /// Reference bookkeeping.
    pub refs: References,
}

impl EntitySnapshot {
    /// Builds an entity snapshot around `data`.
    pub fn new(data: Option<Value>) -> Self {
        Self {
            data,
            refs: References::default(),
        }
    }
}

/// The value of one parameterized field invocation.
///
/// Stored outside the owning entity so multiple argument variants of the
/// same field can coexist; overlaid onto the entity's static values at
/// read time.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParameterizedValueSnapshot {
    /// The field's value for this specific argument set.
    pub data: Option<Value>,
    /// Reference bookkeeping.
    pub refs: References,
}

impl ParameterizedValueSnapshot {
    /// Builds a parameterized-value snapshot around `data`.
    pub fn new(data: Option<Value>) -> Self {
        Self {
            data,
            refs: References::default(),
        }
    }
}

/// One stored node: an entity or a parameterized value.
#[derive(Clone, Debug, PartialEq)]
pub enum NodeSnapshot {
    /// An identified entity.
    Entity(EntitySnapshot),
    /// A parameterized field value.
    ParameterizedValue(ParameterizedValueSnapshot),
}

impl NodeSnapshot {
    /// A data-less node of the given kind.
    pub fn empty(kind: NodeKind) -> Self {
        match kind {
            NodeKind::Entity => NodeSnapshot::Entity(EntitySnapshot::default()),
            NodeKind::ParameterizedValue => {
                NodeSnapshot::ParameterizedValue(ParameterizedValueSnapshot::default())
            }
        }
    }

    /// Builds a node of `kind` around `data`.
    pub fn with_data(kind: NodeKind, data: Option<Value>) -> Self {
        match kind {
            NodeKind::Entity => NodeSnapshot::Entity(EntitySnapshot::new(data)),
            NodeKind::ParameterizedValue => {
                NodeSnapshot::ParameterizedValue(ParameterizedValueSnapshot::new(data))
            }
        }
    }

    /// This node's variant tag.
    pub fn kind(&self) -> NodeKind {
        match self {
            NodeSnapshot::Entity(_) => NodeKind::Entity,
            NodeSnapshot::ParameterizedValue(_) => NodeKind::ParameterizedValue,
        }
    }

    /// Shared view of the stored value.
    pub fn data(&self) -> Option<&Value> {
        match self {
            NodeSnapshot::Entity(e) => e.data.as_ref(),
            NodeSnapshot::ParameterizedValue(p) => p.data.as_ref(),
        }
    }

    /// Mutable slot for the stored value.
    pub fn data_mut(&mut self) -> &mut Option<Value> {
        match self {
            NodeSnapshot::Entity(e) => &mut e.data,
            NodeSnapshot::ParameterizedValue(p) => &mut p.data,
        }
    }

    /// Shared view of the reference bookkeeping.
    pub fn refs(&self) -> &References {
        match self {
            NodeSnapshot::Entity(e) => &e.refs,
            NodeSnapshot::ParameterizedValue(p) => &p.refs,
        }
    }

    /// Mutable view of the reference bookkeeping.
    pub fn refs_mut(&mut self) -> &mut References {
        match self {
            NodeSnapshot::Entity(e) => &mut e.refs,
            NodeSnapshot::ParameterizedValue(p) => &mut p.refs,
        }
    }
}
