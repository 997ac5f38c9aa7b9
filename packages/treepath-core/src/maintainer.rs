use tracing::{debug, warn};

use crate::config::PathRefresh;
use crate::error::{Error, Result};
use crate::node::Node;
use crate::path::PathCodec;
use crate::query::{BulkUpdate, Field, Predicate};
use crate::traits::RecordStore;

/// Keeps the path column in step with the parent column across inserts, updates and deletes.
///
/// Every hook reads the parent row through the store it is handed, so callers decide the
/// transaction boundary; [`Tree`](crate::tree::Tree) wraps each hook in one.
#[derive(Clone, Debug)]
pub struct PathMaintainer {
    codec: PathCodec,
    refresh: PathRefresh,
}

impl PathMaintainer {
    pub fn new(codec: PathCodec, refresh: PathRefresh) -> Self {
        Self { codec, refresh }
    }

    pub fn codec(&self) -> &PathCodec {
        &self.codec
    }

    pub fn refresh(&self) -> PathRefresh {
        self.refresh
    }

    /// Current path of `parent`, locked for the rest of the transaction.
    ///
    /// A missing parent row (or one whose path was never computed) yields the root path.
    pub fn ancestor_path<S: RecordStore>(
        &self,
        store: &mut S,
        parent: Option<&S::Key>,
    ) -> Result<String> {
        let Some(parent) = parent else {
            return Ok(self.codec.root().to_string());
        };
        match store.find_one_for_update(parent)? {
            Some(row) if row.has_path() => Ok(row.path),
            Some(_) => {
                warn!(%parent, "parent row has no path yet; treating child as root");
                Ok(self.codec.root().to_string())
            }
            None => {
                warn!(%parent, "dangling parent reference; treating child as root");
                Ok(self.codec.root().to_string())
            }
        }
    }

    /// Path `node` should have given its parent's current row.
    pub fn compute_path<S: RecordStore>(&self, store: &mut S, node: &Node<S::Key>) -> Result<String> {
        let ancestors = self.ancestor_path(store, node.parent_id.as_ref())?;
        self.codec.encode(&ancestors, &node.id)
    }

    /// Computes and stores the path of a freshly inserted row. The row must already have its key.
    pub fn after_insert<S: RecordStore>(&self, store: &mut S, node: &mut Node<S::Key>) -> Result<()> {
        let path = self.compute_path(store, node)?;
        debug!(id = %node.id, %path, "path assigned");
        store.update(&node.id, &[Field::Path(path.clone())])?;
        node.path = path;
        Ok(())
    }

    /// Recomputes the path of `node` ahead of persisting it over `previous`, rewriting the
    /// paths of the whole subtree when it changes. Returns the number of rows rewritten.
    ///
    /// Moving a node under itself or one of its descendants is rejected.
    pub fn before_update<S: RecordStore>(
        &self,
        store: &mut S,
        previous: &Node<S::Key>,
        node: &mut Node<S::Key>,
    ) -> Result<usize> {
        let parent_changed = previous.parent_id != node.parent_id;
        if !parent_changed && self.refresh == PathRefresh::OnParentChange && previous.has_path() {
            node.path = previous.path.clone();
            return Ok(0);
        }

        if node.parent_id.as_ref() == Some(&node.id) {
            return Err(Error::InvalidOperation(format!(
                "node {} cannot be its own parent",
                node.id
            )));
        }
        let ancestors = self.ancestor_path(store, node.parent_id.as_ref())?;
        if node.parent_id.is_some() && self.codec.contains(&ancestors, &node.id)? {
            return Err(Error::InvalidOperation(format!(
                "node {} cannot move into its own subtree",
                node.id
            )));
        }
        let path = self.codec.encode(&ancestors, &node.id)?;

        let rewritten = if !previous.has_path() {
            store.update(&node.id, &[Field::Path(path.clone())])?;
            1
        } else if previous.path != path {
            store.bulk_update(
                &Predicate::PathStartsWith(previous.path.clone()),
                &BulkUpdate::ReplacePathPrefix {
                    from: previous.path.clone(),
                    to: path.clone(),
                },
            )?
        } else {
            0
        };
        debug!(id = %node.id, from = %previous.path, to = %path, rewritten, "path recomputed");
        node.path = path;
        Ok(rewritten)
    }

    /// Removes every row whose path runs through `node`, the node included, in one statement.
    pub fn after_delete<S: RecordStore>(&self, store: &mut S, node: &Node<S::Key>) -> Result<usize> {
        let segment = self.codec.segment(&node.id)?;
        let removed = store.bulk_delete(&Predicate::PathContains(segment))?;
        debug!(id = %node.id, removed, "subtree deleted");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NewNode;
    use crate::traits::MemoryStore;

    fn maintainer() -> PathMaintainer {
        PathMaintainer::new(PathCodec::default(), PathRefresh::OnParentChange)
    }

    fn insert(store: &mut MemoryStore<i64>, node: NewNode<i64>) -> Node<i64> {
        let id = store.insert(node).unwrap();
        let mut row = store.find_one(&id).unwrap().unwrap();
        maintainer().after_insert(store, &mut row).unwrap();
        row
    }

    #[test]
    fn insert_embeds_parent_path() {
        let mut store = MemoryStore::sequential();
        let root = insert(&mut store, NewNode::root().with_id(5));
        let child = insert(&mut store, NewNode::child_of(5).with_id(9));
        assert_eq!(root.path, ".5.");
        assert_eq!(child.path, ".5.9.");
        assert_eq!(store.find_one(&9).unwrap().unwrap().path, ".5.9.");
    }

    #[test]
    fn dangling_parent_is_treated_as_root() {
        let mut store = MemoryStore::sequential();
        let orphan = insert(&mut store, NewNode::child_of(42).with_id(3));
        assert_eq!(orphan.path, ".3.");
        assert_eq!(orphan.parent_id, Some(42));
    }

    #[test]
    fn unchanged_parent_skips_recompute() {
        let mut store = MemoryStore::sequential();
        let row = insert(&mut store, NewNode::root().with_id(1));
        let mut pending = row.clone();
        assert_eq!(maintainer().before_update(&mut store, &row, &mut pending).unwrap(), 0);

        let always = PathMaintainer::new(PathCodec::default(), PathRefresh::Always);
        let mut stale = row.clone();
        stale.path = ".9.1.".into();
        store.update(&1, &[Field::Path(stale.path.clone())]).unwrap();
        let mut pending = stale.clone();
        assert_eq!(always.before_update(&mut store, &stale, &mut pending).unwrap(), 1);
        assert_eq!(pending.path, ".1.");
    }

    #[test]
    fn delete_removes_subtree_only() {
        let mut store = MemoryStore::sequential();
        let root = insert(&mut store, NewNode::root().with_id(5));
        insert(&mut store, NewNode::child_of(5).with_id(9));
        insert(&mut store, NewNode::child_of(9).with_id(12));
        insert(&mut store, NewNode::root().with_id(55));
        assert_eq!(maintainer().after_delete(&mut store, &root).unwrap(), 3);
        assert_eq!(store.len(), 1);
        assert!(store.find_one(&55).unwrap().is_some());
    }
}
