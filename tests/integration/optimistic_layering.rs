#![allow(missing_docs)]

mod common;

use common::*;
use serde_json::json;
use umbra::operations::extract;
use umbra::{Cache, CacheConfig, Operation, TransactionOptions};

fn cache() -> Cache {
    Cache::new(CacheConfig::new())
}

fn counter_operation() -> Operation {
    Operation::query(leaves(&["count", "label"]))
}

#[test]
fn stable_state_shares_one_graph() {
    let cache = cache();
    cache
        .write(&counter_operation(), &obj(json!({"count": 1, "label": "base"})))
        .expect("write");
    let snapshot = cache.snapshot();
    assert!(snapshot.is_stable());
    assert!(!snapshot.optimistic_queue.has_updates());
}

#[test]
fn optimistic_writes_layer_over_an_untouched_baseline() {
    let cache = cache();
    let operation = counter_operation();
    cache
        .write(&operation, &obj(json!({"count": 1, "label": "base"})))
        .expect("baseline write");

    cache
        .transaction_with(TransactionOptions::optimistic("bump"), |tx| {
            tx.write(&operation, &obj(json!({"count": 2, "label": "base"})))
        })
        .expect("optimistic write");

    let snapshot = cache.snapshot();
    assert!(!snapshot.is_stable());
    assert_eq!(snapshot.optimistic_queue.len(), 1);

    let baseline = cache.read(&operation, false);
    let optimistic = cache.read(&operation, true);
    assert_eq!(
        baseline.result.as_deref(),
        Some(&json!({"count": 1, "label": "base"}))
    );
    assert_eq!(
        optimistic.result.as_deref(),
        Some(&json!({"count": 2, "label": "base"}))
    );
}

#[test]
fn baseline_writes_replay_the_queue_over_the_new_baseline() {
    let cache = cache();
    let operation = counter_operation();
    cache
        .write(&operation, &obj(json!({"count": 1, "label": "base"})))
        .expect("baseline write");
    cache
        .transaction_with(TransactionOptions::optimistic("bump"), |tx| {
            tx.write(
                &Operation::query(leaves(&["count"])),
                &obj(json!({"count": 10})),
            )
        })
        .expect("optimistic write");

    // Confirmed data changes underneath the optimistic layer.
    cache
        .write(&operation, &obj(json!({"count": 5, "label": "updated"})))
        .expect("second baseline write");

    let optimistic = cache.read(&operation, true);
    // The layered count wins; the new label shows through.
    assert_eq!(
        optimistic.result.as_deref(),
        Some(&json!({"count": 10, "label": "updated"}))
    );
}

#[test]
fn rollback_restores_the_pre_write_view() {
    let cache = cache();
    let operation = counter_operation();
    cache
        .write(&operation, &obj(json!({"count": 1, "label": "base"})))
        .expect("baseline write");
    let before = cache.read(&operation, true);

    cache
        .transaction_with(TransactionOptions::optimistic("undo-me"), |tx| {
            tx.write(&operation, &obj(json!({"count": 99, "label": "spec"})))
        })
        .expect("optimistic write");
    assert_eq!(
        cache.read(&operation, true).result.as_deref(),
        Some(&json!({"count": 99, "label": "spec"}))
    );

    cache.rollback("undo-me").expect("rollback");
    let after = cache.read(&operation, true);
    assert_eq!(before.result.as_deref(), after.result.as_deref());
    assert!(cache.snapshot().is_stable());
}

#[test]
fn rollback_of_unknown_change_id_is_a_noop() {
    let cache = cache();
    let operation = counter_operation();
    cache
        .write(&operation, &obj(json!({"count": 1, "label": "base"})))
        .expect("write");
    cache.rollback("never-enqueued").expect("rollback is a no-op");
    assert_eq!(
        cache.read(&operation, true).result.as_deref(),
        Some(&json!({"count": 1, "label": "base"}))
    );
}

#[test]
fn rollback_removes_only_the_named_entry() {
    let cache = cache();
    let count = Operation::query(leaves(&["count"]));
    let label = Operation::query(leaves(&["label"]));
    cache
        .write(&counter_operation(), &obj(json!({"count": 1, "label": "base"})))
        .expect("baseline");

    cache
        .transaction_with(TransactionOptions::optimistic("first"), |tx| {
            tx.write(&count, &obj(json!({"count": 100})))
        })
        .expect("first layer");
    cache
        .transaction_with(TransactionOptions::optimistic("second"), |tx| {
            tx.write(&label, &obj(json!({"label": "layered"})))
        })
        .expect("second layer");

    cache.rollback("first").expect("rollback first");
    let view = cache.read(&counter_operation(), true);
    assert_eq!(
        view.result.as_deref(),
        Some(&json!({"count": 1, "label": "layered"}))
    );
    assert_eq!(cache.snapshot().optimistic_queue.len(), 1);
}

#[test]
fn deltas_accumulate_per_change_id() {
    let cache = cache();
    cache
        .write(&counter_operation(), &obj(json!({"count": 1, "label": "base"})))
        .expect("baseline");

    // Two writes inside one optimistic transaction land as one entry.
    cache
        .transaction_with(TransactionOptions::optimistic("combo"), |tx| {
            tx.write(&Operation::query(leaves(&["count"])), &obj(json!({"count": 7})))?;
            tx.write(
                &Operation::query(leaves(&["label"])),
                &obj(json!({"label": "combo"})),
            )
        })
        .expect("combined optimistic write");

    let snapshot = cache.snapshot();
    assert_eq!(snapshot.optimistic_queue.len(), 1);
    assert_eq!(
        cache.read(&counter_operation(), true).result.as_deref(),
        Some(&json!({"count": 7, "label": "combo"}))
    );

    // Rolling the id back removes both edits together.
    cache.rollback("combo").expect("rollback");
    assert_eq!(
        cache.read(&counter_operation(), true).result.as_deref(),
        Some(&json!({"count": 1, "label": "base"}))
    );
}

#[test]
fn replaying_a_queue_twice_is_idempotent() {
    let cache = cache();
    let operation = counter_operation();
    cache
        .write(&operation, &obj(json!({"count": 1, "label": "base"})))
        .expect("baseline");
    cache
        .transaction_with(TransactionOptions::optimistic("layer"), |tx| {
            tx.write(&operation, &obj(json!({"count": 2, "label": "layer"})))
        })
        .expect("optimistic");

    let snapshot = cache.snapshot();
    let retained = rustc_hash::FxHashSet::default();
    let (once, _) = snapshot
        .optimistic_queue
        .apply(cache.context(), &snapshot.baseline, &retained)
        .expect("first replay");
    let (twice, _) = snapshot
        .optimistic_queue
        .apply(cache.context(), &snapshot.baseline, &retained)
        .expect("second replay");
    assert_eq!(extract(&once, &[]), extract(&twice, &[]));
    assert_eq!(extract(&once, &[]), extract(&snapshot.optimistic, &[]));
}
