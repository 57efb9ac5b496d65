//! Data model shared by every service: entities, snapshots, diffs

pub mod entity;
pub mod reducers;
pub mod snapshot;

pub use entity::{field, Entity, Fields};
pub use reducers::{apply_reducers, Reducer, DERIVED_FIELDS};
pub use snapshot::{apply_diff, Diff, DiffEntry, DiffStats, Snapshot};
