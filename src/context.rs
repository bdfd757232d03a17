//! Configuration and shared state used throughout the cache's operation.

use std::collections::HashMap;

use rustc_hash::FxHashSet;
use serde_json::Value;

use crate::model::{as_reference, JsonObject, NodeId};
use crate::snapshot::CacheSnapshot;
use crate::transaction::CacheTransaction;

/// Declares which fields identify entities of one typename.
#[derive(Clone, Debug, PartialEq)]
pub struct KeySpec {
    /// Fields whose values are folded into the entity id. Every listed
    /// field must be present on a value for it to be identified.
    pub key_fields: Vec<String>,
}

/// Custom entity-identification hook. Returning `None` leaves the value
/// un-normalized (stored inline in its container).
pub type EntityIdMapper = Box<dyn Fn(&JsonObject) -> Option<String> + Send + Sync>;

/// Callback invoked once per edited entity of a registered typename at
/// commit time, with the transaction, the current data, and the previous
/// data. Edits made through the transaction join the same commit.
pub type EntityUpdater = Box<dyn Fn(&mut CacheTransaction, Option<&Value>, Option<&Value>) + Send + Sync>;

/// Hook observing every committed snapshot swap.
pub type OnChangeHook = Box<dyn Fn(&CacheSnapshot, &FxHashSet<NodeId>) + Send + Sync>;

/// Configuration for a cache instance.
///
/// The default configuration identifies entities by `__typename` plus
/// `id`/`_id`, keeps a bounded result cache, and registers no callbacks.
#[derive(Default)]
pub struct CacheConfig {
    /// Per-typename key fields overriding the default id derivation.
    pub key_specs: HashMap<String, KeySpec>,
    /// Custom identification hook; takes precedence over `key_specs`.
    pub entity_id_mapper: Option<EntityIdMapper>,
    /// Per-typename entity-change callbacks.
    pub entity_updaters: HashMap<String, EntityUpdater>,
    /// Snapshot-swap observer.
    pub on_change: Option<OnChangeHook>,
    /// Capacity of the memoized read-result cache. Zero disables it.
    pub result_cache_capacity: usize,
}

impl CacheConfig {
    /// Default result-cache capacity.
    pub const DEFAULT_RESULT_CACHE_CAPACITY: usize = 5000;

    /// A configuration with defaults suitable for most embedders.
    pub fn new() -> Self {
        Self {
            result_cache_capacity: Self::DEFAULT_RESULT_CACHE_CAPACITY,
            ..Self::default()
        }
    }

    /// Registers key fields for one typename.
    pub fn key_fields<I, S>(mut self, typename: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.key_specs.insert(
            typename.into(),
            KeySpec {
                key_fields: fields.into_iter().map(Into::into).collect(),
            },
        );
        self
    }

    /// Registers an entity updater for one typename.
    pub fn entity_updater(mut self, typename: impl Into<String>, updater: EntityUpdater) -> Self {
        self.entity_updaters.insert(typename.into(), updater);
        self
    }

    /// Installs the snapshot-swap observer.
    pub fn on_change(mut self, hook: OnChangeHook) -> Self {
        self.on_change = Some(hook);
        self
    }
}

/// Immutable configuration shared by every operation of one cache.
pub struct CacheContext {
    key_specs: HashMap<String, KeySpec>,
    entity_id_mapper: Option<EntityIdMapper>,
    pub(crate) entity_updaters: HashMap<String, EntityUpdater>,
    pub(crate) on_change: Option<OnChangeHook>,
    pub(crate) result_cache_capacity: usize,
}

impl CacheContext {
    /// Builds a context from a configuration.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            key_specs: config.key_specs,
            entity_id_mapper: config.entity_id_mapper,
            entity_updaters: config.entity_updaters,
            on_change: config.on_change,
            result_cache_capacity: config.result_cache_capacity,
        }
    }

    /// Derives the entity id for a payload value, if it identifies one.
    ///
    /// Reference handles (`{"__ref": id}`) resolve to their id. Objects
    /// run through the custom mapper when configured, then the typename
    /// key-field specs, then the default `__typename` + `id`/`_id` rule.
    pub fn entity_id_for_value(&self, value: &Value) -> Option<NodeId> {
        if let Some(id) = as_reference(value) {
            return Some(id);
        }
        let obj = value.as_object()?;

        if let Some(mapper) = &self.entity_id_mapper {
            return mapper(obj).map(NodeId::from);
        }

        let typename = obj.get("__typename").and_then(Value::as_str);
        if let Some(typename) = typename {
            if let Some(spec) = self.key_specs.get(typename) {
                return key_field_id(typename, spec, obj);
            }
        }

        let id = obj.get("id").or_else(|| obj.get("_id"))?;
        if id.is_null() {
            return None;
        }
        let plain = match id {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        };
        match (typename, plain) {
            (Some(typename), Some(plain)) => Some(NodeId::from(format!("{typename}:{plain}"))),
            (Some(typename), None) => {
                let rendered = serde_json::to_string(id).ok()?;
                Some(NodeId::from(format!("{typename}:{rendered}")))
            }
            (None, Some(plain)) => Some(NodeId::from(plain)),
            (None, None) => None,
        }
    }

    /// The typename carried by an entity's data, if any. The query root
    /// reports `Query` even without explicit data.
    pub(crate) fn typename_of(&self, id: &NodeId, data: Option<&Value>) -> Option<String> {
        let explicit = data
            .and_then(Value::as_object)
            .and_then(|obj| obj.get("__typename"))
            .and_then(Value::as_str)
            .map(str::to_owned);
        match explicit {
            Some(name) => Some(name),
            None if id.is_query_root() => Some("Query".to_owned()),
            None => None,
        }
    }
}

fn key_field_id(typename: &str, spec: &KeySpec, obj: &JsonObject) -> Option<NodeId> {
    let mut keys = JsonObject::new();
    for field in &spec.key_fields {
        keys.insert(field.clone(), obj.get(field)?.clone());
    }
    let rendered = serde_json::to_string(&keys).ok()?;
    Some(NodeId::from(format!("{typename}:{rendered}")))
}
