#![allow(dead_code)]

use serde_json::Value;
use umbra::operations::{self, WriteResult};
use umbra::{
    CacheConfig, CacheContext, Field, GraphSnapshot, JsonObject, NodeId, Operation, Selection,
};

/// Unwraps a JSON value into an object payload.
pub fn obj(value: Value) -> JsonObject {
    match value {
        Value::Object(map) => map,
        other => panic!("expected an object payload, got {other}"),
    }
}

/// A selection of leaf fields.
pub fn leaves(names: &[&str]) -> Selection {
    names.iter().fold(Selection::new(), |s, name| s.leaf(*name))
}

/// A field selecting an object with the given leaf fields.
pub fn entity_field(names: &[&str]) -> Field {
    Field::leaf().with_children(leaves(names))
}

/// Installs the env-filtered log subscriber once, so `RUST_LOG=debug`
/// surfaces editor and transaction tracing during test runs.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Context with the default identification policy (typename + id).
pub fn context() -> CacheContext {
    init_tracing();
    CacheContext::new(CacheConfig::new())
}

pub fn write_over(
    context: &CacheContext,
    baseline: &GraphSnapshot,
    operation: &Operation,
    payload: Value,
) -> WriteResult {
    operations::write(context, baseline, operation, &obj(payload)).expect("write")
}

pub fn node_data<'g>(graph: &'g GraphSnapshot, id: &str) -> Option<&'g Value> {
    graph.get_node_data(&NodeId::from(id))
}

/// `(path key, target id)` pairs of a node's static outbound edges.
pub fn outbound_pairs(graph: &GraphSnapshot, id: &str) -> Vec<(String, String)> {
    let node = graph
        .get_node_snapshot(&NodeId::from(id))
        .unwrap_or_else(|| panic!("no node `{id}`"));
    node.refs()
        .outbound
        .values()
        .map(|r| (r.path.key(), r.id.to_string()))
        .collect()
}

/// `(referrer id, path key)` pairs of a node's inbound edges.
pub fn inbound_pairs(graph: &GraphSnapshot, id: &str) -> Vec<(String, String)> {
    let node = graph
        .get_node_snapshot(&NodeId::from(id))
        .unwrap_or_else(|| panic!("no node `{id}`"));
    node.refs()
        .iter_inbound()
        .map(|r| (r.id.to_string(), r.path.key()))
        .collect()
}

pub fn sorted_ids<'a>(ids: impl IntoIterator<Item = &'a NodeId>) -> Vec<String> {
    let mut out: Vec<String> = ids.into_iter().map(|id| id.to_string()).collect();
    out.sort();
    out
}

/// Checks the load-bearing invariant: every outbound or parameterized
/// edge `A -> B` at path `p` has the matching inbound edge on `B`, and
/// every inbound edge has its forward half.
pub fn assert_reference_symmetry(graph: &GraphSnapshot) {
    for (id, node) in graph.nodes() {
        for r in node.refs().iter_children() {
            let target = graph
                .get_node_snapshot(&r.id)
                .unwrap_or_else(|| panic!("edge {id} -> {} dangles", r.id));
            assert!(
                target
                    .refs()
                    .iter_inbound()
                    .any(|back| back.id == *id && back.path == r.path),
                "missing inbound on `{}` for {id} at [{}]",
                r.id,
                r.path
            );
        }
        for r in node.refs().iter_inbound() {
            let referrer = graph
                .get_node_snapshot(&r.id)
                .unwrap_or_else(|| panic!("inbound {id} <- {} dangles", r.id));
            let forward = referrer
                .refs()
                .iter_children()
                .any(|out| out.id == *id && out.path == r.path);
            assert!(
                forward,
                "missing forward edge on `{}` for {id} at [{}]",
                r.id, r.path
            );
        }
    }
}
