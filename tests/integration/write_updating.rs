#![allow(missing_docs)]

mod common;

use common::*;
use serde_json::json;
use umbra::operations::read;
use umbra::{Field, GraphSnapshot, NodeId, Operation, Selection, QUERY_ROOT_ID};

fn root_values_operation() -> Operation {
    Operation::query(
        Selection::new()
            .field("foo", entity_field(&["id", "name"]))
            .field("bar", entity_field(&["id", "name"])),
    )
}

#[test]
fn leaf_updates_replace_values_in_place() {
    let context = context();
    let empty = GraphSnapshot::new();
    let operation = Operation::query(leaves(&["a", "b"]));
    let first = write_over(&context, &empty, &operation, json!({"a": 1, "b": "x"}));
    let second = write_over(&context, &first.snapshot, &operation, json!({"a": 2, "b": "x"}));
    assert_eq!(
        node_data(&second.snapshot, QUERY_ROOT_ID),
        Some(&json!({"a": 2, "b": "x"}))
    );
    assert_eq!(
        sorted_ids(&second.edited_node_ids),
        vec![QUERY_ROOT_ID.to_owned()]
    );
}

#[test]
fn nulling_a_reference_orphans_the_target() {
    let context = context();
    let empty = GraphSnapshot::new();
    let baseline = write_over(
        &context,
        &empty,
        &root_values_operation(),
        json!({
            "foo": {"id": 1, "name": "Foo"},
            "bar": {"id": 2, "name": "Bar"},
        }),
    );

    let bar_only = Operation::query(Selection::new().field("bar", entity_field(&["id"])));
    let result = write_over(&context, &baseline.snapshot, &bar_only, json!({"bar": null}));
    let graph = &result.snapshot;

    assert_eq!(
        node_data(graph, QUERY_ROOT_ID),
        Some(&json!({"foo": null, "bar": null}))
    );
    assert_eq!(
        outbound_pairs(graph, QUERY_ROOT_ID),
        vec![("foo".to_owned(), "1".to_owned())]
    );
    // Container and orphan both count as edited.
    assert!(result.edited_node_ids.contains(&NodeId::from(QUERY_ROOT_ID)));
    assert!(result.edited_node_ids.contains(&NodeId::from("2")));
    assert!(!graph.contains(&NodeId::from("2")));
    assert_reference_symmetry(graph);
}

#[test]
fn orphaned_subgraphs_cascade() {
    let context = context();
    let empty = GraphSnapshot::new();
    let operation = Operation::query(
        Selection::new()
            .field(
                "foo",
                Field::leaf().with_children(
                    Selection::new()
                        .leaf("id")
                        .leaf("name")
                        .field("two", entity_field(&["id"])),
                ),
            )
            .field(
                "bar",
                Field::leaf().with_children(
                    Selection::new()
                        .leaf("id")
                        .field("one", entity_field(&["id"]))
                        .field("two", entity_field(&["id"]))
                        .field(
                            "three",
                            Field::leaf().with_children(
                                Selection::new()
                                    .leaf("id")
                                    .field("foo", entity_field(&["id"])),
                            ),
                        ),
                ),
            ),
    );
    let baseline = write_over(
        &context,
        &empty,
        &operation,
        json!({
            "foo": {"id": 1, "name": "Foo", "two": {"id": 222}},
            "bar": {
                "id": 2,
                "one": {"id": 111},
                "two": {"id": 222},
                "three": {"id": 333, "foo": {"id": 1}},
            },
        }),
    );

    let result = write_over(
        &context,
        &baseline.snapshot,
        &operation,
        json!({
            "foo": {"id": 1, "name": "Foo", "two": null},
            "bar": null,
        }),
    );
    let graph = &result.snapshot;

    // `1` only lost some inbound references and survives.
    assert_eq!(
        node_data(graph, "1"),
        Some(&json!({"id": 1, "name": "Foo", "two": null}))
    );
    // Everything reachable only through `2` went with it.
    for gone in ["2", "111", "222", "333"] {
        assert!(!graph.contains(&NodeId::from(gone)), "`{gone}` lingered");
        assert!(
            result.edited_node_ids.contains(&NodeId::from(gone)),
            "`{gone}` not reported as edited"
        );
    }
    assert_eq!(
        outbound_pairs(graph, QUERY_ROOT_ID),
        vec![("foo".to_owned(), "1".to_owned())]
    );
    assert_reference_symmetry(graph);
}

#[test]
fn reference_swaps_rewire_both_halves() {
    let context = context();
    let empty = GraphSnapshot::new();
    let operation = Operation::query(
        Selection::new()
            .field("foo", entity_field(&["id"]))
            .field("bar", entity_field(&["id"])),
    );
    let baseline = write_over(
        &context,
        &empty,
        &operation,
        json!({"foo": {"id": 1}, "bar": {"id": 2}}),
    );

    // Swap the two references.
    let result = write_over(
        &context,
        &baseline.snapshot,
        &operation,
        json!({"foo": {"id": 2}, "bar": {"id": 1}}),
    );
    let graph = &result.snapshot;

    let mut outbound = outbound_pairs(graph, QUERY_ROOT_ID);
    outbound.sort();
    assert_eq!(
        outbound,
        vec![
            ("bar".to_owned(), "1".to_owned()),
            ("foo".to_owned(), "2".to_owned()),
        ]
    );
    assert_eq!(
        inbound_pairs(graph, "1"),
        vec![(QUERY_ROOT_ID.to_owned(), "bar".to_owned())]
    );
    assert_eq!(
        inbound_pairs(graph, "2"),
        vec![(QUERY_ROOT_ID.to_owned(), "foo".to_owned())]
    );
    assert!(graph.contains(&NodeId::from("1")));
    assert!(graph.contains(&NodeId::from("2")));
    assert_reference_symmetry(graph);
}

#[test]
fn truncating_a_list_releases_tail_references() {
    let context = context();
    let empty = GraphSnapshot::new();
    let operation = Operation::query(Selection::new().field("items", entity_field(&["id"])));
    let baseline = write_over(
        &context,
        &empty,
        &operation,
        json!({"items": [{"id": "a"}, {"id": "b"}, {"id": "c"}]}),
    );
    assert_eq!(baseline.snapshot.node_count(), 4);

    let result = write_over(
        &context,
        &baseline.snapshot,
        &operation,
        json!({"items": [{"id": "a"}]}),
    );
    let graph = &result.snapshot;

    assert_eq!(node_data(graph, QUERY_ROOT_ID), Some(&json!({"items": [null]})));
    assert!(graph.contains(&NodeId::from("a")));
    assert!(!graph.contains(&NodeId::from("b")));
    assert!(!graph.contains(&NodeId::from("c")));
    assert_reference_symmetry(graph);

    let read_back = read(&operation, graph);
    assert!(read_back.complete);
    assert_eq!(
        read_back.result.as_deref(),
        Some(&json!({"items": [{"id": "a"}]}))
    );
}

#[test]
fn replacing_an_inline_object_with_an_entity_and_back() {
    let context = context();
    let empty = GraphSnapshot::new();
    let operation = Operation::query(
        Selection::new().field("spot", Field::leaf().with_children(leaves(&["id", "label"]))),
    );
    // First an unidentifiable object (no id): stays inline.
    let inline = write_over(
        &context,
        &empty,
        &operation,
        json!({"spot": {"label": "inline"}}),
    );
    assert_eq!(inline.snapshot.node_count(), 1);

    // Then an entity at the same path: extracted, placeholder left.
    let entity = write_over(
        &context,
        &inline.snapshot,
        &operation,
        json!({"spot": {"id": 9, "label": "norm"}}),
    );
    assert_eq!(
        node_data(&entity.snapshot, QUERY_ROOT_ID),
        Some(&json!({"spot": null}))
    );
    assert_eq!(
        outbound_pairs(&entity.snapshot, QUERY_ROOT_ID),
        vec![("spot".to_owned(), "9".to_owned())]
    );

    // And back to a plain object: edge removed, entity orphaned.
    let back = write_over(
        &context,
        &entity.snapshot,
        &operation,
        json!({"spot": {"label": "inline again"}}),
    );
    assert_eq!(
        node_data(&back.snapshot, QUERY_ROOT_ID),
        Some(&json!({"spot": {"label": "inline again"}}))
    );
    assert!(!back.snapshot.contains(&NodeId::from("9")));
    assert_reference_symmetry(&back.snapshot);
}
