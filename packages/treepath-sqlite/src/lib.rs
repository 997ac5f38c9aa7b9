//! SQLite-backed [`RecordStore`](treepath_core::RecordStore) for treepath trees.
//!
//! Rows live in one table keyed by `INTEGER PRIMARY KEY`; the parent, path and optional position
//! columns are named by the [`TreeConfig`](treepath_core::TreeConfig) the store is opened with.

mod store;

pub use store::SqliteStore;
