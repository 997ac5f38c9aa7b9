use treepath_core::{NewNode, Predicate, RecordStore, Tree, TreeConfig};
use treepath_sqlite::SqliteStore;
use treepath_test_support::run_all;

#[test]
fn in_memory_store_conforms() {
    run_all(|config| SqliteStore::open_in_memory("nodes", config).unwrap());
}

#[test]
fn file_store_conforms() {
    let dir = tempfile::tempdir().unwrap();
    let mut n = 0;
    run_all(|config| {
        n += 1;
        SqliteStore::open(dir.path().join(format!("tree-{n}.db")), "nodes", config).unwrap()
    });
}

#[test]
fn rows_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("tree.db");
    let config = TreeConfig::default()
        .with_parent_attribute("parent")
        .with_path_attribute("lineage")
        .with_delimiter("/");

    {
        let mut tree = Tree::new(
            SqliteStore::open(&file, "categories", &config).unwrap(),
            config.clone(),
        )
        .unwrap();
        let root = tree.insert(NewNode::root()).unwrap();
        tree.insert(NewNode::child_of(root.id)).unwrap();
    }

    let tree = Tree::new(
        SqliteStore::open(&file, "categories", &config).unwrap(),
        config,
    )
    .unwrap();
    let roots = tree.roots().unwrap();
    assert_eq!(roots.len(), 1);
    let children = tree.children(&roots[0].id).unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(
        children[0].path,
        format!("/{}/{}/", roots[0].id, children[0].id)
    );
    assert_eq!(tree.store().table(), "categories");
    assert_eq!(tree.store().count(&Predicate::All).unwrap(), 2);
}
