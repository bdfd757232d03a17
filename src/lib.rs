//! Umbra: a normalized, query-addressable object-graph cache.
//!
//! Entity data is stored exactly once, regardless of how many queries
//! reference it. Arbitrary sub-queries are answered against the store
//! with partial-completeness detection; speculative ("optimistic") edits
//! layer over confirmed state and roll back without disturbing it; and a
//! reference-counted garbage collector reclaims nodes no longer
//! reachable from any live query or explicit retention.
//!
//! The crate is the storage engine only. Query parsing, variable
//! expansion, and transport live outside; operations arrive as
//! pre-expanded [`query::Selection`] trees and payloads as
//! `serde_json` values.
//!
//! ```rust
//! use serde_json::json;
//! use umbra::{Cache, CacheConfig, Field, Operation, Selection};
//!
//! # fn main() -> umbra::Result<()> {
//! let cache = Cache::new(CacheConfig::new());
//! let operation = Operation::query(
//!     Selection::new().field(
//!         "book",
//!         Field::leaf().with_children(Selection::new().leaf("id").leaf("title")),
//!     ),
//! );
//! let payload = json!({"book": {"id": 1, "title": "Umbra"}});
//! cache.write(&operation, payload.as_object().expect("object payload"))?;
//! let result = cache.read(&operation, false);
//! assert!(result.complete);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

mod cache;
mod context;
mod error;
mod graph;
mod model;
mod nodes;
mod optimistic;
mod query;
mod result_cache;
mod serializable;
mod snapshot;
mod transaction;
mod util;

/// The primitive graph operations: write, read, extract, restore,
/// migrate.
pub mod operations;

pub use cache::{
    Cache, OnWatchUpdated, TransactionOptions, WatchCallback, WatchHandle, WatchOptions,
};
pub use context::{
    CacheConfig, CacheContext, EntityIdMapper, EntityUpdater, KeySpec, OnChangeHook,
};
pub use error::{CacheError, Result};
pub use graph::GraphSnapshot;
pub use model::{
    as_reference, JsonObject, NodeId, NodeReference, Path, PathSegment, Reference,
    NONEXISTENT_ID, PARAMETERIZED_SEPARATOR, QUERY_ROOT_ID,
};
pub use nodes::{EntitySnapshot, NodeKind, NodeSnapshot, ParameterizedValueSnapshot, References};
pub use operations::{
    node_id_for_parameterized_value, MigrationMap, MissingField, ReadResult,
};
pub use optimistic::{CacheDelta, ChangeId, OptimisticUpdateQueue};
pub use query::{canonical_args, Field, Operation, Selection};
pub use serializable::{SerializedGraph, SerializedMeta, SerializedNode, SerializedRef};
pub use snapshot::CacheSnapshot;
pub use transaction::{
    CacheTransaction, EvictOptions, FieldModifierFn, FieldModify, ModifierDetails, ModifyFields,
    ModifyOptions, TransactionOutcome,
};
