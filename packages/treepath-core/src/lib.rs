#![forbid(unsafe_code)]
//! Materialized-path maintenance for tree-shaped records stored in a relational table.
//! Each row stores its full ancestry as a delimited string of ids, so subtree queries are
//! substring matches instead of recursive joins. This crate stays independent of concrete
//! storage engines; backends implement [`RecordStore`].

pub mod config;
pub mod error;
pub mod ids;
pub mod index;
pub mod maintainer;
pub mod node;
pub mod path;
pub mod position;
pub mod query;
pub mod traits;
pub mod tree;

pub use config::{validate_identifier, Attribute, PathRefresh, TreeConfig};
pub use error::{Error, Result};
#[cfg(feature = "uuid")]
pub use ids::UuidKeys;
pub use ids::{KeyGenerator, NodeKey, SequentialKeys};
pub use index::{LoadOptions, LoadOutcome, LoadState, NodeRef, TreeIndex, TreeView};
pub use maintainer::PathMaintainer;
pub use node::{NewNode, Node};
pub use path::PathCodec;
pub use position::{PositionManager, MAX_POSITION};
pub use query::{BulkUpdate, Field, Order, Predicate};
pub use traits::{MemoryStore, RecordStore};
pub use tree::Tree;
