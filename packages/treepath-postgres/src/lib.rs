#![forbid(unsafe_code)]
//! PostgreSQL-backed [`RecordStore`](treepath_core::RecordStore) for treepath trees.
//!
//! All path and position maintenance stays in `treepath-core`; this crate only translates its
//! predicates and bulk updates into single statements against a vanilla Postgres table.

mod schema;
mod store;

pub use schema::{drop_table, ensure_schema};
pub use store::PgStore;
