//! Backend conformance suite.
//!
//! Every function takes a factory producing an empty, fresh store so each check starts from a
//! clean table. Backends call [`run_all`] (or individual checks) from their own tests.

use std::cell::{Cell, RefCell};

use treepath_core::{
    BulkUpdate, Error, Field, LoadOptions, LoadOutcome, NewNode, Node, Order, Predicate,
    RecordStore, Result, Tree, TreeConfig, TreeView,
};

/// Position-related store access, in call order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Access<K> {
    LockSiblings(Option<K>),
    MaxPosition,
    ShiftPosition,
}

/// Wraps a store, counting `find` calls and logging position-related access, to observe
/// whether a load hit the store and whether sibling groups were locked before being scanned.
pub struct CountingStore<S: RecordStore> {
    inner: S,
    finds: Cell<usize>,
    accesses: RefCell<Vec<Access<S::Key>>>,
}

impl<S: RecordStore> CountingStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            finds: Cell::new(0),
            accesses: RefCell::new(Vec::new()),
        }
    }

    pub fn finds(&self) -> usize {
        self.finds.get()
    }

    /// Drains the access log.
    pub fn take_accesses(&self) -> Vec<Access<S::Key>> {
        self.accesses.take()
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: RecordStore + Default> RecordStore for CountingStore<S> {
    type Key = S::Key;

    fn insert(&mut self, node: NewNode<S::Key>) -> Result<S::Key> {
        self.inner.insert(node)
    }

    fn find_one(&self, id: &S::Key) -> Result<Option<Node<S::Key>>> {
        self.inner.find_one(id)
    }

    fn find_one_for_update(&mut self, id: &S::Key) -> Result<Option<Node<S::Key>>> {
        self.inner.find_one_for_update(id)
    }

    fn find(&self, filter: &Predicate<S::Key>, order: Order) -> Result<Vec<Node<S::Key>>> {
        self.finds.set(self.finds.get() + 1);
        self.inner.find(filter, order)
    }

    fn lock_siblings(&mut self, parent: Option<&S::Key>) -> Result<()> {
        self.accesses
            .borrow_mut()
            .push(Access::LockSiblings(parent.cloned()));
        self.inner.lock_siblings(parent)
    }

    fn count(&self, filter: &Predicate<S::Key>) -> Result<usize> {
        self.inner.count(filter)
    }

    fn max_position(&self, filter: &Predicate<S::Key>) -> Result<Option<i64>> {
        self.accesses.borrow_mut().push(Access::MaxPosition);
        self.inner.max_position(filter)
    }

    fn update(&mut self, id: &S::Key, fields: &[Field<S::Key>]) -> Result<()> {
        self.inner.update(id, fields)
    }

    fn bulk_update(&mut self, filter: &Predicate<S::Key>, update: &BulkUpdate) -> Result<usize> {
        if let BulkUpdate::ShiftPosition(_) = update {
            self.accesses.borrow_mut().push(Access::ShiftPosition);
        }
        self.inner.bulk_update(filter, update)
    }

    fn bulk_delete(&mut self, filter: &Predicate<S::Key>) -> Result<usize> {
        self.inner.bulk_delete(filter)
    }

    fn transaction<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Self) -> Result<T>,
    {
        // The inner store is moved into a scratch wrapper for the duration of the closure and
        // moved back before the inner transaction decides between commit and rollback.
        let finds = &self.finds;
        let accesses = &self.accesses;
        self.inner.transaction(|inner| {
            let mut scratch = CountingStore {
                inner: std::mem::take(inner),
                finds: Cell::new(finds.get()),
                accesses: RefCell::new(accesses.take()),
            };
            let res = f(&mut scratch);
            *inner = scratch.inner;
            finds.set(scratch.finds.get());
            *accesses.borrow_mut() = scratch.accesses.into_inner();
            res
        })
    }
}

fn ids(nodes: &[Node<i64>]) -> Vec<i64> {
    nodes.iter().map(|n| n.id).collect()
}

fn positioned() -> TreeConfig {
    TreeConfig::default().with_position_attribute("position")
}

/// Runs every conformance check. `make` returns an empty store laid out for the given config.
pub fn run_all<S, F>(mut make: F)
where
    S: RecordStore<Key = i64>,
    F: FnMut(&TreeConfig) -> S,
{
    root_and_child_paths(&mut make);
    store_assigned_keys(&mut make);
    delete_cascades_to_subtree(&mut make);
    path_matching_is_literal(&mut make);
    positions_shift_within_siblings(&mut make);
    insert_at_position_makes_room(&mut make);
    reparent_rewrites_subtree(&mut make);
    dangling_parent_is_root(&mut make);
    load_tree_assembles_levels(&mut make);
    failed_transaction_rolls_back(&mut make);
    update_of_missing_row_is_not_found(&mut make);
}

pub fn root_and_child_paths<S, F>(make: &mut F)
where
    S: RecordStore<Key = i64>,
    F: FnMut(&TreeConfig) -> S,
{
    let config = TreeConfig::default();
    let mut tree = Tree::new(make(&config), config).unwrap();
    assert_eq!(tree.insert(NewNode::root().with_id(5)).unwrap().path, ".5.");
    assert_eq!(tree.insert(NewNode::child_of(5).with_id(9)).unwrap().path, ".5.9.");
    assert_eq!(
        tree.insert(NewNode::child_of(9).with_id(12)).unwrap().path,
        ".5.9.12."
    );
    assert_eq!(tree.get(&12).unwrap().unwrap().parent_id, Some(9));
    tree.validate_invariants().unwrap();
}

pub fn store_assigned_keys<S, F>(make: &mut F)
where
    S: RecordStore<Key = i64>,
    F: FnMut(&TreeConfig) -> S,
{
    let config = TreeConfig::default();
    let mut tree = Tree::new(make(&config), config).unwrap();
    let root = tree.insert(NewNode::root()).unwrap();
    let child = tree.insert(NewNode::child_of(root.id)).unwrap();
    assert_ne!(root.id, child.id);
    assert_eq!(child.path, format!(".{}.{}.", root.id, child.id));
    tree.validate_invariants().unwrap();
}

pub fn delete_cascades_to_subtree<S, F>(make: &mut F)
where
    S: RecordStore<Key = i64>,
    F: FnMut(&TreeConfig) -> S,
{
    let config = TreeConfig::default();
    let mut tree = Tree::new(make(&config), config).unwrap();
    tree.insert(NewNode::root().with_id(5)).unwrap();
    tree.insert(NewNode::child_of(5).with_id(9)).unwrap();
    tree.insert(NewNode::child_of(9).with_id(12)).unwrap();
    tree.insert(NewNode::root().with_id(55)).unwrap();
    tree.insert(NewNode::child_of(55).with_id(15)).unwrap();

    assert_eq!(tree.delete(&5).unwrap(), 3);
    assert!(tree.get(&9).unwrap().is_none());
    assert!(tree.get(&12).unwrap().is_none());
    assert_eq!(tree.store().count(&Predicate::All).unwrap(), 2);
    tree.validate_invariants().unwrap();
}

pub fn path_matching_is_literal<S, F>(make: &mut F)
where
    S: RecordStore<Key = i64>,
    F: FnMut(&TreeConfig) -> S,
{
    // `_` is a single-character wildcard in SQL LIKE; it must not act as one here.
    let config = TreeConfig::default().with_delimiter("_");
    let mut tree = Tree::new(make(&config), config).unwrap();
    tree.insert(NewNode::root().with_id(1)).unwrap();
    tree.insert(NewNode::root().with_id(10)).unwrap();
    tree.insert(NewNode::child_of(10).with_id(11)).unwrap();

    assert_eq!(tree.delete(&1).unwrap(), 1);
    assert_eq!(tree.get(&11).unwrap().unwrap().path, "_10_11_");
    let moved = tree.reparent(&11, None).unwrap();
    assert_eq!(moved.path, "_11_");
    tree.validate_invariants().unwrap();
}

pub fn positions_shift_within_siblings<S, F>(make: &mut F)
where
    S: RecordStore<Key = i64>,
    F: FnMut(&TreeConfig) -> S,
{
    let config = positioned();
    let mut tree = Tree::new(make(&config), config).unwrap();
    tree.insert(NewNode::root().with_id(1)).unwrap();
    tree.insert(NewNode::root().with_id(2)).unwrap();
    for i in 0..8 {
        tree.insert(NewNode::child_of(1).with_id(10 + i)).unwrap();
    }
    tree.insert(NewNode::child_of(2).with_id(30)).unwrap();

    // 17 at 7 moves to 3: [3, 7] shift up
    tree.set_position(&17, Some(3), true).unwrap();
    assert_eq!(
        ids(&tree.children(&1).unwrap()),
        vec![10, 11, 12, 17, 13, 14, 15, 16]
    );
    // 10 at 0 moves to 2: [0, 2] shift down
    tree.set_position(&10, Some(2), true).unwrap();
    assert_eq!(
        ids(&tree.children(&1).unwrap()),
        vec![11, 12, 10, 17, 13, 14, 15, 16]
    );
    // removal closes the gap behind 12
    tree.set_position(&12, None, false).unwrap();
    assert_eq!(tree.get(&10).unwrap().unwrap().position, Some(1));
    assert_eq!(tree.get(&16).unwrap().unwrap().position, Some(6));
    assert_eq!(tree.get(&30).unwrap().unwrap().position, Some(0));
}

pub fn insert_at_position_makes_room<S, F>(make: &mut F)
where
    S: RecordStore<Key = i64>,
    F: FnMut(&TreeConfig) -> S,
{
    let config = positioned();
    let mut tree = Tree::new(make(&config), config).unwrap();
    tree.insert(NewNode::root().with_id(1)).unwrap();
    for i in 0..3 {
        tree.insert(NewNode::child_of(1).with_id(10 + i)).unwrap();
    }
    tree.insert(NewNode::child_of(1).with_id(20).at_position(0)).unwrap();
    let children = tree.children(&1).unwrap();
    assert_eq!(ids(&children), vec![20, 10, 11, 12]);
    let positions: Vec<Option<i64>> = children.iter().map(|n| n.position).collect();
    assert_eq!(positions, vec![Some(0), Some(1), Some(2), Some(3)]);
    tree.validate_invariants().unwrap();
}

pub fn reparent_rewrites_subtree<S, F>(make: &mut F)
where
    S: RecordStore<Key = i64>,
    F: FnMut(&TreeConfig) -> S,
{
    let config = positioned();
    let mut tree = Tree::new(make(&config), config).unwrap();
    tree.insert(NewNode::root().with_id(1)).unwrap();
    tree.insert(NewNode::child_of(1).with_id(2)).unwrap();
    tree.insert(NewNode::child_of(2).with_id(3)).unwrap();
    tree.insert(NewNode::child_of(3).with_id(4)).unwrap();
    tree.insert(NewNode::root().with_id(5)).unwrap();

    let moved = tree.reparent(&2, Some(5)).unwrap();
    assert_eq!(moved.path, ".5.2.");
    assert_eq!(tree.get(&4).unwrap().unwrap().path, ".5.2.3.4.");
    assert_eq!(ids(&tree.children(&5).unwrap()), vec![2]);
    assert!(tree.children(&1).unwrap().is_empty());

    let err = tree.reparent(&5, Some(4)).unwrap_err();
    assert!(matches!(err, Error::InvalidOperation(_)));
    assert_eq!(tree.get(&5).unwrap().unwrap().path, ".5.");
    assert_eq!(tree.get(&5).unwrap().unwrap().parent_id, None);
    tree.validate_invariants().unwrap();
}

pub fn dangling_parent_is_root<S, F>(make: &mut F)
where
    S: RecordStore<Key = i64>,
    F: FnMut(&TreeConfig) -> S,
{
    let config = TreeConfig::default();
    let mut tree = Tree::new(make(&config), config).unwrap();
    let orphan = tree.insert(NewNode::child_of(404).with_id(7)).unwrap();
    assert_eq!(orphan.path, ".7.");
    assert_eq!(tree.get(&7).unwrap().unwrap().parent_id, Some(404));
}

pub fn load_tree_assembles_levels<S, F>(make: &mut F)
where
    S: RecordStore<Key = i64>,
    F: FnMut(&TreeConfig) -> S,
{
    let config = positioned();
    let mut tree = Tree::new(make(&config), config).unwrap();
    // parent ids deliberately do not grow with depth
    tree.insert(NewNode::root().with_id(50)).unwrap();
    tree.insert(NewNode::child_of(50).with_id(40)).unwrap();
    tree.insert(NewNode::child_of(40).with_id(3)).unwrap();
    tree.insert(NewNode::child_of(3).with_id(2)).unwrap();
    tree.insert(NewNode::child_of(50).with_id(1).at_position(0)).unwrap();

    let mut view = TreeView::new(tree.get(&50).unwrap().unwrap());
    let outcome = tree.load_tree(&mut view, LoadOptions::default()).unwrap();
    assert_eq!(
        outcome,
        LoadOutcome::Loaded {
            fetched: 5,
            attached: 4,
            dropped: 0
        }
    );
    let index = view.index().unwrap();
    let top: Vec<i64> = index.children(index.root()).map(|n| n.id).collect();
    assert_eq!(top, vec![1, 40]);
    let three = index.find(&3).unwrap();
    assert_eq!(index.node(index.parent(three).unwrap()).id, 40);
    let below: Vec<i64> = index.children(three).map(|n| n.id).collect();
    assert_eq!(below, vec![2]);

    assert_eq!(
        tree.load_tree(&mut view, LoadOptions::default()).unwrap(),
        LoadOutcome::Cached
    );
}

pub fn failed_transaction_rolls_back<S, F>(make: &mut F)
where
    S: RecordStore<Key = i64>,
    F: FnMut(&TreeConfig) -> S,
{
    let config = TreeConfig::default();
    let mut tree = Tree::new(make(&config), config).unwrap();
    tree.insert(NewNode::root().with_id(1)).unwrap();
    tree.insert(NewNode::child_of(1).with_id(2)).unwrap();

    let res: Result<()> = tree.store_mut().transaction(|store| {
        store.transaction(|inner| inner.update(&1, &[Field::Path(".x.".into())]))?;
        store.bulk_delete(&Predicate::Id(2))?;
        Err(Error::InvalidOperation("abort".into()))
    });
    assert!(res.is_err());
    assert_eq!(tree.store().count(&Predicate::All).unwrap(), 2);
    assert_eq!(tree.get(&1).unwrap().unwrap().path, ".1.");

    // an inner failure leaves the outer transaction usable
    tree.store_mut()
        .transaction(|store| {
            let inner: Result<()> = store.transaction(|s| {
                s.bulk_delete(&Predicate::Id(2))?;
                Err(Error::InvalidOperation("inner abort".into()))
            });
            assert!(inner.is_err());
            store.update(&1, &[Field::Path(".1.".into())])
        })
        .unwrap();
    assert!(tree.get(&2).unwrap().is_some());
}

pub fn update_of_missing_row_is_not_found<S, F>(make: &mut F)
where
    S: RecordStore<Key = i64>,
    F: FnMut(&TreeConfig) -> S,
{
    let config = TreeConfig::default();
    let mut store = make(&config);
    assert!(matches!(
        store.update(&999, &[Field::Path(".999.".into())]),
        Err(Error::NotFound(_))
    ));
    assert!(store.find_one(&999).unwrap().is_none());
}
