//! The primitive graph operations: payload writes, selection reads,
//! serialization, and restore-time migration.

pub mod extract;
pub mod migrate;
pub mod read;
pub mod restore;
pub mod write;

pub use extract::extract;
pub use migrate::{migrate, MigrationMap};
pub use read::{read, MissingField, ReadResult};
pub use restore::restore;
pub use write::{node_id_for_parameterized_value, write, SnapshotEditor, WriteResult};
