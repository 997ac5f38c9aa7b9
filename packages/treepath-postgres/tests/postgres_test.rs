use std::cell::RefCell;
use std::rc::Rc;

use postgres::{Client, NoTls};
use uuid::Uuid;

use treepath_core::{Error, NewNode, Predicate, RecordStore, Tree, TreeConfig};
use treepath_postgres::{drop_table, PgStore};
use treepath_test_support::run_all;

fn connect() -> Option<Rc<RefCell<Client>>> {
    let url = std::env::var("TREEPATH_POSTGRES_URL").ok()?;
    let client = Client::connect(&url, NoTls).ok()?;
    Some(Rc::new(RefCell::new(client)))
}

fn unique_table() -> String {
    format!("treepath_{}", Uuid::new_v4().simple())
}

#[test]
fn postgres_store_conforms() {
    let Some(client) = connect() else {
        return;
    };
    let mut tables = Vec::new();
    run_all(|config| {
        let table = unique_table();
        tables.push(table.clone());
        PgStore::new(client.clone(), &table, config).unwrap()
    });
    for table in tables {
        drop_table(&mut client.borrow_mut(), &table).unwrap();
    }
}

#[test]
fn explicit_keys_do_not_collide_with_generated_ones() {
    let Some(client) = connect() else {
        return;
    };
    let table = unique_table();
    let config = TreeConfig::default();
    let mut tree = Tree::new(
        PgStore::new(client.clone(), &table, &config).unwrap(),
        config,
    )
    .unwrap();

    tree.insert(NewNode::root().with_id(40)).unwrap();
    let generated = tree.insert(NewNode::child_of(40)).unwrap();
    assert!(generated.id > 40);
    assert_eq!(generated.path, format!(".40.{}.", generated.id));
    assert_eq!(tree.store().count(&Predicate::All).unwrap(), 2);

    drop(tree);
    drop_table(&mut client.borrow_mut(), &table).unwrap();
}

#[test]
fn ensure_schema_is_idempotent() {
    let Some(client) = connect() else {
        return;
    };
    let table = unique_table();
    let config = TreeConfig::default().with_position_attribute("position");
    let mut first = PgStore::new(client.clone(), &table, &config).unwrap();
    first.insert(NewNode::root().with_id(1)).unwrap();

    let second = PgStore::new(client.clone(), &table, &config).unwrap();
    assert!(second.find_one(&1).unwrap().is_some());

    drop_table(&mut client.borrow_mut(), &table).unwrap();
}

/// Whether another connection can take the advisory lock for `group` right now.
fn group_lock_is_free(table: &str, group: &str) -> bool {
    let url = std::env::var("TREEPATH_POSTGRES_URL").unwrap();
    let (table, group) = (format!("\"{table}\""), group.to_string());
    std::thread::spawn(move || {
        let mut other = Client::connect(&url, NoTls).unwrap();
        let row = other
            .query_one(
                "SELECT pg_try_advisory_xact_lock(hashtext($1::TEXT), hashtext($2::TEXT))",
                &[&table, &group],
            )
            .unwrap();
        row.get::<_, bool>(0)
    })
    .join()
    .unwrap()
}

#[test]
fn sibling_group_lock_is_held_until_commit() {
    let Some(client) = connect() else {
        return;
    };
    let table = unique_table();
    let config = TreeConfig::default().with_position_attribute("position");
    let mut store = PgStore::new(client.clone(), &table, &config).unwrap();

    store
        .transaction(|s| {
            s.lock_siblings(Some(&1))?;
            s.lock_siblings(None)?;
            assert!(!group_lock_is_free(&table, "1"));
            assert!(!group_lock_is_free(&table, ""));
            assert!(group_lock_is_free(&table, "2"));
            Ok(())
        })
        .unwrap();
    assert!(group_lock_is_free(&table, "1"));

    drop(store);
    drop_table(&mut client.borrow_mut(), &table).unwrap();
}

#[test]
fn stores_on_one_connection_share_a_transaction() {
    let Some(client) = connect() else {
        return;
    };
    let (first_table, second_table) = (unique_table(), unique_table());
    let config = TreeConfig::default();
    let mut first = PgStore::new(client.clone(), &first_table, &config).unwrap();
    let mut second = first.for_table(&second_table, &config).unwrap();

    let res: treepath_core::Result<()> = first.transaction(|first| {
        first.insert(NewNode::root().with_id(1))?;
        second.transaction(|second| second.insert(NewNode::root().with_id(1)).map(|_| ()))?;
        Err(Error::InvalidOperation("abort".into()))
    });
    assert!(res.is_err());
    assert!(first.find_one(&1).unwrap().is_none());
    assert!(second.find_one(&1).unwrap().is_none());

    drop((first, second));
    drop_table(&mut client.borrow_mut(), &first_table).unwrap();
    drop_table(&mut client.borrow_mut(), &second_table).unwrap();
}
