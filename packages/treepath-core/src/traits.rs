use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::ids::{KeyGenerator, NodeKey};
use crate::node::{NewNode, Node};
use crate::query::{BulkUpdate, Field, Order, Predicate};

/// Record persistence the tree engine runs on top of.
///
/// Implementations own row storage, transactions and locking. Bulk operations must be single
/// statements so a concurrent reader never observes half of a shift or cascade.
pub trait RecordStore {
    type Key: NodeKey;

    /// Persist a new row with an empty path and return its key.
    fn insert(&mut self, node: NewNode<Self::Key>) -> Result<Self::Key>;

    fn find_one(&self, id: &Self::Key) -> Result<Option<Node<Self::Key>>>;

    /// Like [`find_one`](Self::find_one) but locks the row for the rest of the current
    /// transaction where the backend supports row locks.
    fn find_one_for_update(&mut self, id: &Self::Key) -> Result<Option<Node<Self::Key>>> {
        self.find_one(id)
    }

    fn find(&self, filter: &Predicate<Self::Key>, order: Order) -> Result<Vec<Node<Self::Key>>>;

    /// Serializes position upkeep on the sibling group under `parent` (roots when `None`) until
    /// the current transaction ends. Backends whose transactions already exclude other writers
    /// keep the default no-op.
    fn lock_siblings(&mut self, _parent: Option<&Self::Key>) -> Result<()> {
        Ok(())
    }

    fn count(&self, filter: &Predicate<Self::Key>) -> Result<usize> {
        Ok(self.find(filter, Order::Unordered)?.len())
    }

    fn max_position(&self, filter: &Predicate<Self::Key>) -> Result<Option<i64>> {
        Ok(self
            .find(filter, Order::Unordered)?
            .into_iter()
            .filter_map(|n| n.position)
            .max())
    }

    /// Assign columns of one row. Fails with `NotFound` if the row does not exist.
    fn update(&mut self, id: &Self::Key, fields: &[Field<Self::Key>]) -> Result<()>;

    fn bulk_update(&mut self, filter: &Predicate<Self::Key>, update: &BulkUpdate) -> Result<usize>;

    fn bulk_delete(&mut self, filter: &Predicate<Self::Key>) -> Result<usize>;

    /// Run `f` atomically: commit on `Ok`, roll back on `Err`. Nested calls must compose.
    fn transaction<T, F>(&mut self, f: F) -> Result<T>
    where
        Self: Sized,
        F: FnOnce(&mut Self) -> Result<T>;
}

/// In-memory ordered-map store for tests and embedding.
///
/// Transactions snapshot the row map and restore it on error.
pub struct MemoryStore<K: NodeKey> {
    rows: BTreeMap<K, Node<K>>,
    keys: Option<Box<dyn KeyGenerator<Key = K> + Send>>,
}

impl<K: NodeKey> Default for MemoryStore<K> {
    fn default() -> Self {
        Self {
            rows: BTreeMap::new(),
            keys: None,
        }
    }
}

impl MemoryStore<i64> {
    /// Store that hands out `1, 2, 3, ...` for rows inserted without a key.
    pub fn sequential() -> Self {
        Self::with_key_generator(crate::ids::SequentialKeys::default())
    }
}

impl<K: NodeKey> MemoryStore<K> {
    pub fn with_key_generator<G>(keys: G) -> Self
    where
        G: KeyGenerator<Key = K> + Send + 'static,
    {
        Self {
            rows: BTreeMap::new(),
            keys: Some(Box::new(keys)),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Store a row verbatim, bypassing the tree engine. Useful to seed fixtures.
    pub fn put_raw(&mut self, node: Node<K>) {
        if let Some(keys) = self.keys.as_mut() {
            keys.observe(&node.id);
        }
        self.rows.insert(node.id.clone(), node);
    }
}

impl<K: NodeKey> RecordStore for MemoryStore<K> {
    type Key = K;

    fn insert(&mut self, node: NewNode<K>) -> Result<K> {
        let id = match node.id {
            Some(id) => {
                if self.rows.contains_key(&id) {
                    return Err(Error::Storage(format!("duplicate key {id}")));
                }
                if let Some(keys) = self.keys.as_mut() {
                    keys.observe(&id);
                }
                id
            }
            None => {
                let keys = self.keys.as_mut().ok_or_else(|| {
                    Error::InvalidOperation("memory store has no key generator".into())
                })?;
                let mut id = keys.next_key();
                while self.rows.contains_key(&id) {
                    id = keys.next_key();
                }
                id
            }
        };
        self.rows.insert(
            id.clone(),
            Node {
                id: id.clone(),
                parent_id: node.parent_id,
                path: String::new(),
                position: node.position,
            },
        );
        Ok(id)
    }

    fn find_one(&self, id: &K) -> Result<Option<Node<K>>> {
        Ok(self.rows.get(id).cloned())
    }

    fn find(&self, filter: &Predicate<K>, order: Order) -> Result<Vec<Node<K>>> {
        let mut rows: Vec<Node<K>> = self
            .rows
            .values()
            .filter(|n| filter.matches(n))
            .cloned()
            .collect();
        if order == Order::ByPosition {
            // stable: ties keep ascending id order
            rows.sort_by_key(|n| (n.position.is_none(), n.position));
        }
        Ok(rows)
    }

    fn update(&mut self, id: &K, fields: &[Field<K>]) -> Result<()> {
        let row = self
            .rows
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("row {id}")))?;
        for field in fields {
            field.apply(row);
        }
        Ok(())
    }

    fn bulk_update(&mut self, filter: &Predicate<K>, update: &BulkUpdate) -> Result<usize> {
        let mut changed = 0;
        for row in self.rows.values_mut().filter(|n| filter.matches(n)) {
            if update.apply(row) {
                changed += 1;
            }
        }
        Ok(changed)
    }

    fn bulk_delete(&mut self, filter: &Predicate<K>) -> Result<usize> {
        let before = self.rows.len();
        self.rows.retain(|_, n| !filter.matches(n));
        Ok(before - self.rows.len())
    }

    fn transaction<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Self) -> Result<T>,
    {
        let snapshot = self.rows.clone();
        let result = f(self);
        if result.is_err() {
            self.rows = snapshot;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assigns_sequential_keys_after_explicit_ones() {
        let mut store = MemoryStore::sequential();
        assert_eq!(store.insert(NewNode::root()).unwrap(), 1);
        assert_eq!(store.insert(NewNode::root().with_id(7)).unwrap(), 7);
        assert_eq!(store.insert(NewNode::root()).unwrap(), 8);
        assert!(matches!(
            store.insert(NewNode::root().with_id(7)),
            Err(Error::Storage(_))
        ));
    }

    #[test]
    fn keyless_insert_needs_a_generator() {
        let mut store: MemoryStore<String> = MemoryStore::default();
        assert!(matches!(
            store.insert(NewNode::root()),
            Err(Error::InvalidOperation(_))
        ));
        assert_eq!(
            store.insert(NewNode::root().with_id("a".to_string())).unwrap(),
            "a"
        );
    }

    #[test]
    fn failed_transaction_rolls_back() {
        let mut store = MemoryStore::sequential();
        store.insert(NewNode::root()).unwrap();
        let res: Result<()> = store.transaction(|s| {
            s.bulk_delete(&Predicate::All)?;
            Err(Error::InvalidOperation("abort".into()))
        });
        assert!(res.is_err());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn orders_by_position_with_unpositioned_last() {
        let mut store = MemoryStore::sequential();
        store.insert(NewNode::root()).unwrap();
        store.insert(NewNode::root().at_position(2)).unwrap();
        store.insert(NewNode::root().at_position(0)).unwrap();
        let ids: Vec<i64> = store
            .find(&Predicate::All, Order::ByPosition)
            .unwrap()
            .into_iter()
            .map(|n| n.id)
            .collect();
        assert_eq!(ids, vec![3, 2, 1]);
        assert_eq!(store.max_position(&Predicate::All).unwrap(), Some(2));
    }
}
