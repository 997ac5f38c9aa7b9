use treepath_core::{LoadOptions, LoadOutcome, MemoryStore, NewNode, Tree, TreeConfig, TreeView};
use treepath_test_support::{run_all, Access, CountingStore};

#[test]
fn memory_store_conforms() {
    run_all(|_| MemoryStore::sequential());
}

#[test]
fn cached_load_does_not_query() {
    let mut tree = Tree::new(
        CountingStore::new(MemoryStore::sequential()),
        TreeConfig::default(),
    )
    .unwrap();
    tree.insert(NewNode::root().with_id(1)).unwrap();
    tree.insert(NewNode::child_of(1).with_id(2)).unwrap();

    let mut view = TreeView::new(tree.get(&1).unwrap().unwrap());
    let before = tree.store().finds();
    tree.load_tree(&mut view, LoadOptions::default()).unwrap();
    assert_eq!(tree.store().finds(), before + 1);

    assert_eq!(
        tree.load_tree(&mut view, LoadOptions::default()).unwrap(),
        LoadOutcome::Cached
    );
    assert_eq!(tree.store().finds(), before + 1);

    tree.insert(NewNode::child_of(1).with_id(3)).unwrap();
    tree.load_tree(&mut view, LoadOptions::forced()).unwrap();
    assert_eq!(view.children().unwrap().len(), 2);
    assert!(tree.store().finds() > before + 1);
}

fn first_lock_precedes_scans(accesses: &[Access<i64>], group: Option<i64>) {
    let lock = accesses
        .iter()
        .position(|a| a == &Access::LockSiblings(group))
        .expect("sibling group was never locked");
    let scan = accesses
        .iter()
        .position(|a| matches!(a, Access::MaxPosition | Access::ShiftPosition))
        .expect("no sibling scan recorded");
    assert!(lock < scan, "{accesses:?}");
}

#[test]
fn sibling_groups_are_locked_before_scans() {
    let mut tree = Tree::new(
        CountingStore::new(MemoryStore::sequential()),
        TreeConfig::default().with_position_attribute("position"),
    )
    .unwrap();

    tree.insert(NewNode::root().with_id(1)).unwrap();
    first_lock_precedes_scans(&tree.store().take_accesses(), None);

    tree.insert(NewNode::child_of(1).with_id(2)).unwrap();
    first_lock_precedes_scans(&tree.store().take_accesses(), Some(1));

    tree.insert(NewNode::child_of(1).with_id(3).at_position(0)).unwrap();
    first_lock_precedes_scans(&tree.store().take_accesses(), Some(1));

    tree.set_position(&3, Some(1), true).unwrap();
    first_lock_precedes_scans(&tree.store().take_accesses(), Some(1));

    tree.reparent(&2, None).unwrap();
    let accesses = tree.store().take_accesses();
    first_lock_precedes_scans(&accesses, Some(1));
    assert!(accesses.contains(&Access::LockSiblings(None)));
}
