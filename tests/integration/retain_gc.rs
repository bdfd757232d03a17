#![allow(missing_docs)]

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::*;
use serde_json::json;
use umbra::{Cache, CacheConfig, NodeId, Operation, Selection, WatchOptions};

fn cache() -> Cache {
    Cache::new(CacheConfig::new())
}

#[test]
fn retain_and_release_count() {
    let cache = cache();
    let id = NodeId::from("Book:1");
    assert_eq!(cache.retain(&id), 1);
    assert_eq!(cache.retain(&id), 2);
    assert_eq!(cache.release(&id), 1);
    assert_eq!(cache.release(&id), 0);
    // Floors at zero.
    assert_eq!(cache.release(&id), 0);
}

#[test]
fn gc_spares_everything_reachable_from_the_root() {
    let cache = cache();
    let operation = Operation::query(
        Selection::new().field(
            "book",
            entity_field(&["id", "__typename", "title"]),
        ),
    );
    cache
        .write(
            &operation,
            &obj(json!({"book": {"id": 1, "__typename": "Book", "title": "Kept"}})),
        )
        .expect("write");

    assert!(cache.gc().is_empty());
    assert!(cache.read(&operation, false).complete);
}

#[test]
fn gc_collects_retained_subgraphs_once_released() {
    let cache = cache();
    // A fragment write roots a small subgraph off to the side.
    let fragment = Operation::new(
        NodeId::from("Author:a"),
        Selection::new()
            .leaf("id")
            .field("favorite", entity_field(&["id"])),
    );
    cache
        .write(
            &fragment,
            &obj(json!({"id": "a", "favorite": {"id": "fav"}})),
        )
        .expect("fragment write");

    // Implicit retention keeps the root and its children alive.
    assert!(cache.gc().is_empty());

    cache.release(&NodeId::from("Author:a"));
    let mut collected = cache.gc();
    collected.sort();
    assert_eq!(collected, vec![NodeId::from("Author:a"), NodeId::from("fav")]);
    let snapshot = cache.snapshot();
    assert!(!snapshot.baseline.contains(&NodeId::from("Author:a")));
    assert!(!snapshot.baseline.contains(&NodeId::from("fav")));
}

#[test]
fn explicit_retention_overrides_unreachability() {
    let cache = cache();
    let fragment = Operation::new(NodeId::from("Book:solo"), leaves(&["id"]));
    cache
        .write(&fragment, &obj(json!({"id": "solo"})))
        .expect("write");

    // One implicit (write) plus one explicit retention.
    cache.retain(&NodeId::from("Book:solo"));
    cache.release(&NodeId::from("Book:solo"));
    // Still one count outstanding; nothing to collect.
    assert!(cache.gc().is_empty());

    cache.release(&NodeId::from("Book:solo"));
    assert_eq!(cache.gc(), vec![NodeId::from("Book:solo")]);
}

#[test]
fn everything_left_after_gc_is_reachable() {
    let cache = cache();
    let operation = Operation::query(
        Selection::new()
            .field("a", entity_field(&["id"]))
            .field("b", entity_field(&["id"])),
    );
    cache
        .write(
            &operation,
            &obj(json!({"a": {"id": "a1"}, "b": {"id": "b1"}})),
        )
        .expect("write");
    let fragment = Operation::new(NodeId::from("loose"), leaves(&["id"]));
    cache
        .write(&fragment, &obj(json!({"id": "loose"})))
        .expect("loose write");
    cache.release(&NodeId::from("loose"));

    let collected = cache.gc();
    assert_eq!(collected, vec![NodeId::from("loose")]);

    let snapshot = cache.snapshot();
    let root = NodeId::from(umbra::QUERY_ROOT_ID);
    let reachable = snapshot.baseline.reachable_from([&root]);
    for id in snapshot.baseline.all_node_ids() {
        assert!(reachable.contains(id), "`{id}` survived unreachable");
    }
    assert_reference_symmetry(&snapshot.baseline);
}

#[test]
fn gc_alone_never_fires_watchers() {
    let cache = cache();
    let operation = Operation::query(Selection::new().field("book", entity_field(&["id"])));
    cache
        .write(&operation, &obj(json!({"book": {"id": "b"}})))
        .expect("write");

    let deliveries = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&deliveries);
    cache
        .watch(
            &operation,
            WatchOptions {
                immediate: true,
                optimistic: false,
                callback: Box::new(move |_, _| {
                    seen.fetch_add(1, Ordering::SeqCst);
                }),
            },
        )
        .expect("watch");
    assert_eq!(deliveries.load(Ordering::SeqCst), 1);

    // Park some garbage, then collect it.
    let fragment = Operation::new(NodeId::from("junk"), leaves(&["id"]));
    cache
        .write(&fragment, &obj(json!({"id": "junk"})))
        .expect("junk write");
    cache.release(&NodeId::from("junk"));
    let deliveries_before = deliveries.load(Ordering::SeqCst);

    let collected = cache.gc();
    assert_eq!(collected, vec![NodeId::from("junk")]);
    assert_eq!(deliveries.load(Ordering::SeqCst), deliveries_before);
}
