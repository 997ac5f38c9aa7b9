use crate::ids::NodeKey;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A persisted tree row, as far as the tree engine is concerned.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Node<K> {
    pub id: K,
    pub parent_id: Option<K>,
    /// Materialized ancestry; empty until the path has been computed after insert.
    pub path: String,
    pub position: Option<i64>,
}

impl<K: NodeKey> Node<K> {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn has_path(&self) -> bool {
        !self.path.is_empty()
    }
}

/// A row that has not been inserted yet.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NewNode<K> {
    /// Explicit key; the store assigns one when absent.
    pub id: Option<K>,
    pub parent_id: Option<K>,
    pub position: Option<i64>,
}

impl<K> NewNode<K> {
    pub fn root() -> Self {
        Self {
            id: None,
            parent_id: None,
            position: None,
        }
    }

    pub fn child_of(parent: K) -> Self {
        Self {
            id: None,
            parent_id: Some(parent),
            position: None,
        }
    }

    pub fn with_id(mut self, id: K) -> Self {
        self.id = Some(id);
        self
    }

    pub fn at_position(mut self, position: i64) -> Self {
        self.position = Some(position);
        self
    }
}
