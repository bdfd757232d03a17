#![allow(missing_docs)]

mod common;

use common::*;
use serde_json::json;
use umbra::operations::{extract, read, restore};
use umbra::{
    node_id_for_parameterized_value, Cache, CacheConfig, CacheError, Field, GraphSnapshot,
    MigrationMap, NodeId, Operation, Path, Selection, SerializedGraph, QUERY_ROOT_ID,
};

fn populated_graph() -> (umbra::CacheContext, GraphSnapshot, Operation) {
    let context = context();
    let operation = Operation::query(
        Selection::new()
            .field("book", entity_field(&["id", "__typename", "title"]))
            .field(
                "shelf",
                Field::leaf()
                    .with_args(obj(json!({"row": 1})))
                    .with_children(leaves(&["id", "__typename", "label"])),
            )
            .leaf("motd"),
    );
    let result = write_over(
        &context,
        &GraphSnapshot::new(),
        &operation,
        json!({
            "book": {"id": 1, "__typename": "Book", "title": "Umbra"},
            "shelf": [
                {"id": 7, "__typename": "Shelf", "label": "left"},
                {"id": 8, "__typename": "Shelf", "label": "right"},
            ],
            "motd": null,
        }),
    );
    (context, result.snapshot, operation)
}

#[test]
fn extraction_is_shaped_per_node() {
    let (_context, graph, _operation) = populated_graph();
    let serialized = extract(&graph, &[]);
    let rendered = serde_json::to_value(&serialized).expect("render");

    // Entity record: type tag 0, placeholder data, outbound edge.
    assert_eq!(rendered[QUERY_ROOT_ID]["type"], json!(0));
    assert_eq!(
        rendered[QUERY_ROOT_ID]["data"],
        json!({"book": null, "motd": null})
    );
    assert_eq!(
        rendered[QUERY_ROOT_ID]["outbound"],
        json!([{"id": "Book:1", "path": ["book"]}])
    );

    // Parameterized record: type tag 1, hole placeholders, element edges.
    let pid = node_id_for_parameterized_value(
        &NodeId::from(QUERY_ROOT_ID),
        &Path::from_fields(["shelf"]),
        &obj(json!({"row": 1})),
    );
    let record = &rendered[pid.as_str()];
    assert_eq!(record["type"], json!(1));
    assert_eq!(record["data"], json!([null, null]));
    assert_eq!(
        record["inbound"],
        json!([{"id": QUERY_ROOT_ID, "path": ["shelf"]}])
    );
    assert_eq!(
        record["outbound"],
        json!([
            {"id": "Shelf:7", "path": [0]},
            {"id": "Shelf:8", "path": [1]},
        ])
    );
}

#[test]
fn round_trip_preserves_graph_and_results() {
    let (_context, graph, operation) = populated_graph();
    let serialized = extract(&graph, &[]);

    // Through JSON text, as a persistence layer would do it.
    let text = serde_json::to_string(&serialized).expect("serialize");
    let parsed: SerializedGraph = serde_json::from_str(&text).expect("parse");
    assert_eq!(parsed, serialized);

    let restored = restore(&parsed).expect("restore");
    assert_eq!(extract(&restored.snapshot, &[]), serialized);

    let before = read(&operation, &graph);
    let after = read(&operation, &restored.snapshot);
    assert!(after.complete, "missing: {:?}", after.missing);
    assert_eq!(before.result.as_deref(), after.result.as_deref());
    assert_reference_symmetry(&restored.snapshot);
}

#[test]
fn restore_rebuilds_shared_reference_identity() {
    let context = context();
    // One entity referenced from two fields.
    let operation = Operation::query(
        Selection::new()
            .field("first", entity_field(&["id"]))
            .field("second", entity_field(&["id"])),
    );
    let result = write_over(
        &context,
        &GraphSnapshot::new(),
        &operation,
        json!({"first": {"id": "shared"}, "second": {"id": "shared"}}),
    );
    let restored = restore(&extract(&result.snapshot, &[])).expect("restore");

    let root = restored
        .snapshot
        .get_node_snapshot(&NodeId::from(QUERY_ROOT_ID))
        .expect("root");
    let first = &root.refs().outbound_at("first").expect("first edge").id;
    let second = &root.refs().outbound_at("second").expect("second edge").id;
    let a = restored.snapshot.get_node_snapshot(first).expect("shared");
    let b = restored.snapshot.get_node_snapshot(second).expect("shared");
    assert!(std::sync::Arc::ptr_eq(a, b));
}

#[test]
fn unknown_reference_ids_fail_restore_by_name() {
    let (_context, graph, _operation) = populated_graph();
    let mut serialized = extract(&graph, &[]);
    serialized.nodes.remove(&NodeId::from("Book:1"));

    let error = restore(&serialized).expect_err("dangling reference");
    match error {
        CacheError::Serialization(message) => {
            assert!(message.contains("Book:1"), "message: {message}");
            assert!(message.contains(QUERY_ROOT_ID), "message: {message}");
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn unknown_type_tags_fail_deserialization() {
    let text = format!(r#"{{"{QUERY_ROOT_ID}": {{"type": 9}}}}"#);
    let error = serde_json::from_str::<SerializedGraph>(&text).expect_err("bad tag");
    assert!(error.to_string().contains("unknown node type tag"));
}

#[test]
fn retention_rides_in_meta_and_round_trips() {
    let cache = Cache::new(CacheConfig::new());
    let fragment = Operation::new(NodeId::from("Book:kept"), leaves(&["id", "title"]));
    cache
        .write(&fragment, &obj(json!({"id": "kept", "title": "Kept"})))
        .expect("fragment write");

    let serialized = cache.extract(false).expect("extract");
    let meta = serialized.meta.as_ref().expect("meta present");
    assert_eq!(meta.extra_root_ids, vec![NodeId::from("Book:kept")]);

    // A fresh cache adopting the dump keeps the retention alive.
    let revived = Cache::new(CacheConfig::new());
    revived.restore(&serialized, None).expect("restore");
    assert!(revived.gc().is_empty());
    assert_eq!(
        revived.read(&fragment, false).result.as_deref(),
        Some(&json!({"id": "kept", "title": "Kept"}))
    );
}

#[test]
fn migrations_apply_during_restore() {
    let cache = Cache::new(CacheConfig::new());
    let operation = Operation::query(
        Selection::new().field("book", entity_field(&["id", "__typename", "title"])),
    );
    cache
        .write(
            &operation,
            &obj(json!({"book": {"id": 1, "__typename": "Book", "title": "Old"}})),
        )
        .expect("write");
    let serialized = cache.extract(false).expect("extract");

    let migrations = MigrationMap::new().field(
        "Book",
        "edition",
        Box::new(|current| match current {
            Some(_) => None,
            None => Some(json!(1)),
        }),
    );
    let revived = Cache::new(CacheConfig::new());
    revived
        .restore(&serialized, Some(&migrations))
        .expect("restore");

    let with_edition = Operation::query(
        Selection::new().field("book", entity_field(&["id", "title", "edition"])),
    );
    let read_back = revived.read(&with_edition, false);
    assert!(read_back.complete, "missing: {:?}", read_back.missing);
    assert_eq!(
        read_back
            .result
            .as_deref()
            .and_then(|v| v.get("book"))
            .and_then(|v| v.get("edition")),
        Some(&json!(1))
    );
}

#[test]
fn explicit_null_data_distinct_from_absent_data() {
    let (_context, graph, _operation) = populated_graph();
    let serialized = extract(&graph, &[]);
    let rendered = serde_json::to_value(&serialized).expect("render");

    // The root was written with data, `motd` explicitly null inside it.
    assert_eq!(rendered[QUERY_ROOT_ID]["data"]["motd"], json!(null));

    // An entity that exists only by reference has no data key at all.
    let context = context();
    let reference_only = Operation::query(Selection::new().field(
        "ghost",
        Field::leaf().with_children(Selection::new().field("id", Field::leaf())),
    ));
    let result = write_over(
        &context,
        &graph,
        &reference_only,
        json!({"ghost": {"id": "g1"}}),
    );
    // Strip the ghost's own fields so only the husk remains.
    let mut thinned = extract(&result.snapshot, &[]);
    let ghost = thinned.nodes.get_mut(&NodeId::from("g1")).expect("ghost");
    ghost.data = None;
    let rendered = serde_json::to_value(&thinned).expect("render");
    assert!(rendered["g1"].get("data").is_none());
    let restored = restore(&thinned).expect("restore");
    assert_eq!(restored.snapshot.get_node_data(&NodeId::from("g1")), None);
}
