//! Restore-time migrations: per-typename field defaulters applied to
//! entity data when adopting a serialized graph written by an older
//! schema.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::context::CacheContext;
use crate::graph::GraphSnapshot;
use crate::model::JsonObject;
use crate::nodes::NodeKind;

/// Computes a field's migrated value from its current one. Returning
/// `None` leaves the field untouched.
pub type FieldMigration = Box<dyn Fn(Option<&Value>) -> Option<Value> + Send + Sync>;

/// Field migrations grouped by typename.
#[derive(Default)]
pub struct MigrationMap {
    entities: HashMap<String, HashMap<String, FieldMigration>>,
}

impl MigrationMap {
    /// An empty migration map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a migration for one field of one typename.
    pub fn field(
        mut self,
        typename: impl Into<String>,
        field: impl Into<String>,
        migration: FieldMigration,
    ) -> Self {
        self.entities
            .entry(typename.into())
            .or_default()
            .insert(field.into(), migration);
        self
    }

    /// Whether any migrations are registered.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

/// Applies `migrations` to every matching entity in `graph`, returning a
/// graph that shares untouched nodes with the input.
///
/// Migrations rewrite static entity data only; reference bookkeeping is
/// untouched, so migrated values must not introduce or remove entities.
pub fn migrate(
    graph: GraphSnapshot,
    context: &CacheContext,
    migrations: &MigrationMap,
) -> GraphSnapshot {
    if migrations.is_empty() {
        return graph;
    }
    let mut nodes = graph.nodes_cloned();
    for (id, node) in graph.nodes() {
        if node.kind() != NodeKind::Entity {
            continue;
        }
        let Some(typename) = context.typename_of(id, node.data()) else {
            continue;
        };
        let Some(fields) = migrations.entities.get(&typename) else {
            continue;
        };

        let mut data = match node.data() {
            Some(Value::Object(obj)) => obj.clone(),
            Some(_) => continue,
            None => JsonObject::new(),
        };
        let mut changed = false;
        for (field, migration) in fields {
            if let Some(next) = migration(data.get(field)) {
                if data.get(field) != Some(&next) {
                    data.insert(field.clone(), next);
                    changed = true;
                }
            }
        }
        if changed {
            let mut updated = node.as_ref().clone();
            *updated.data_mut() = Some(Value::Object(data));
            nodes.insert(id.clone(), Arc::new(updated));
        }
    }
    GraphSnapshot::from_nodes(nodes)
}
