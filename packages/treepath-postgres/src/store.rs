use std::cell::{Cell, RefCell};
use std::rc::Rc;

use postgres::types::ToSql;
use postgres::{Client, Row};
use tracing::{debug, trace};

use treepath_core::{
    validate_identifier, Attribute, BulkUpdate, Error, Field, NewNode, Node, Order, Predicate,
    RecordStore, Result, TreeConfig,
};

use crate::schema::ensure_schema;

type Param = Box<dyn ToSql + Sync>;

fn storage_debug<E: std::fmt::Debug>(e: E) -> Error {
    Error::Storage(format!("{e:?}"))
}

fn row_to_node(row: &Row) -> Result<Node<i64>> {
    Ok(Node {
        id: row.try_get(0).map_err(storage_debug)?,
        parent_id: row.try_get(1).map_err(storage_debug)?,
        path: row.try_get(2).map_err(storage_debug)?,
        position: row.try_get(3).map_err(storage_debug)?,
    })
}

/// Appends `value` and returns its `$n` placeholder.
fn bind(params: &mut Vec<Param>, value: impl ToSql + Sync + 'static) -> String {
    params.push(Box::new(value));
    format!("${}", params.len())
}

fn refs(params: &[Param]) -> Vec<&(dyn ToSql + Sync)> {
    params.iter().map(|p| p.as_ref()).collect()
}

/// Postgres `RecordStore` over a single table with `BIGSERIAL` keys.
///
/// Row reads for an update take `FOR UPDATE` locks, and position upkeep on a sibling group is
/// serialized with a transaction-scoped advisory lock keyed by table and parent.
///
/// Stores made with [`PgStore::for_table`] share the connection and its transaction nesting,
/// so a transaction opened on one is joined, as a savepoint, by the others.
pub struct PgStore {
    client: Rc<RefCell<Client>>,
    depth: Rc<Cell<usize>>,
    table: String,
    parent: String,
    path: String,
    position: Option<String>,
}

impl PgStore {
    pub fn new(client: Rc<RefCell<Client>>, table: &str, config: &TreeConfig) -> Result<Self> {
        Self::with_depth(client, Rc::new(Cell::new(0)), table, config)
    }

    /// Store for another table on the same connection and transaction.
    pub fn for_table(&self, table: &str, config: &TreeConfig) -> Result<Self> {
        Self::with_depth(self.client.clone(), self.depth.clone(), table, config)
    }

    fn with_depth(
        client: Rc<RefCell<Client>>,
        depth: Rc<Cell<usize>>,
        table: &str,
        config: &TreeConfig,
    ) -> Result<Self> {
        validate_identifier(table)?;
        if [
            Some(config.column(Attribute::Parent)?),
            Some(config.column(Attribute::Path)?),
            config.position_attribute.as_deref(),
        ]
        .iter()
        .flatten()
        .any(|n| n.eq_ignore_ascii_case("id"))
        {
            return Err(Error::InvalidOperation(
                "\"id\" is reserved for the primary key".into(),
            ));
        }
        ensure_schema(&mut client.borrow_mut(), table, config)?;
        Ok(Self {
            table: format!("\"{table}\""),
            parent: format!("\"{}\"", config.column(Attribute::Parent)?),
            path: format!("\"{}\"", config.column(Attribute::Path)?),
            position: config
                .position_attribute
                .as_deref()
                .map(|c| format!("\"{c}\"")),
            client,
            depth,
        })
    }

    pub fn client(&self) -> Rc<RefCell<Client>> {
        self.client.clone()
    }

    fn position_column(&self) -> Result<&str> {
        self.position
            .as_deref()
            .ok_or_else(|| Error::MissingAttribute("position attribute is not configured".into()))
    }

    fn select_columns(&self) -> String {
        format!(
            "id, {}, {}, {}",
            self.parent,
            self.path,
            self.position.as_deref().unwrap_or("NULL::BIGINT")
        )
    }

    fn render(&self, filter: &Predicate<i64>, params: &mut Vec<Param>) -> String {
        match filter {
            Predicate::All => "TRUE".into(),
            Predicate::Id(id) => format!("id = {}::BIGINT", bind(params, *id)),
            Predicate::PathContains(needle) => {
                let p = bind(params, needle.clone());
                format!("strpos({}, {p}::TEXT) > 0", self.path)
            }
            Predicate::PathStartsWith(prefix) => {
                let p = bind(params, prefix.clone());
                format!("left({}, char_length({p}::TEXT)) = {p}::TEXT", self.path)
            }
            Predicate::ParentIs(None) => format!("{} IS NULL", self.parent),
            Predicate::ParentIs(Some(parent)) => {
                format!("{} = {}::BIGINT", self.parent, bind(params, *parent))
            }
            Predicate::PositionAtLeast(at) => match &self.position {
                Some(c) => format!("{c} >= {}::BIGINT", bind(params, *at)),
                None => "FALSE".into(),
            },
            Predicate::PositionAbove(at) => match &self.position {
                Some(c) => format!("{c} > {}::BIGINT", bind(params, *at)),
                None => "FALSE".into(),
            },
            Predicate::PositionBetween(lo, hi) => match &self.position {
                Some(c) => {
                    let lo = bind(params, *lo);
                    let hi = bind(params, *hi);
                    format!("{c} BETWEEN {lo}::BIGINT AND {hi}::BIGINT")
                }
                None => "FALSE".into(),
            },
            Predicate::And(parts) if parts.is_empty() => "TRUE".into(),
            Predicate::And(parts) => parts
                .iter()
                .map(|p| format!("({})", self.render(p, params)))
                .collect::<Vec<_>>()
                .join(" AND "),
            Predicate::Not(inner) => {
                format!("NOT coalesce(({}), FALSE)", self.render(inner, params))
            }
        }
    }

    fn execute(&self, sql: &str, params: &[Param]) -> Result<usize> {
        trace!(sql, "postgres execute");
        let changed = self
            .client
            .borrow_mut()
            .execute(sql, &refs(params))
            .map_err(storage_debug)?;
        usize::try_from(changed).map_err(|_| Error::Storage("row count overflow".into()))
    }

    fn query(&self, sql: &str, params: &[Param]) -> Result<Vec<Node<i64>>> {
        trace!(sql, "postgres query");
        let rows = self
            .client
            .borrow_mut()
            .query(sql, &refs(params))
            .map_err(storage_debug)?;
        rows.iter().map(row_to_node).collect()
    }

    fn query_scalar(&self, sql: &str, params: &[Param]) -> Result<Option<i64>> {
        trace!(sql, "postgres query");
        let row = self
            .client
            .borrow_mut()
            .query_one(sql, &refs(params))
            .map_err(storage_debug)?;
        row.try_get(0).map_err(storage_debug)
    }

    fn batch(&self, sql: &str) -> Result<()> {
        self.client
            .borrow_mut()
            .batch_execute(sql)
            .map_err(storage_debug)
    }
}

impl RecordStore for PgStore {
    type Key = i64;

    fn insert(&mut self, node: NewNode<i64>) -> Result<i64> {
        let mut params: Vec<Param> = Vec::new();
        let mut columns = vec![self.parent.clone(), self.path.clone()];
        let mut values = vec![
            format!("{}::BIGINT", bind(&mut params, node.parent_id)),
            "''".to_string(),
        ];
        if let Some(id) = node.id {
            columns.push("id".into());
            values.push(format!("{}::BIGINT", bind(&mut params, id)));
        }
        if let Some(position) = node.position {
            columns.push(self.position_column()?.to_string());
            values.push(format!("{}::BIGINT", bind(&mut params, position)));
        }
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) RETURNING id",
            self.table,
            columns.join(", "),
            values.join(", ")
        );
        let id = self
            .query_scalar(&sql, &params)?
            .ok_or_else(|| Error::Storage("insert returned no id".into()))?;

        if node.id.is_some() {
            // keep the sequence ahead of explicitly chosen keys
            let sql = format!(
                "SELECT setval(pg_get_serial_sequence($1, 'id'), \
                 GREATEST((SELECT MAX(id) FROM {t}), 1))",
                t = self.table
            );
            let table: Param = Box::new(self.table.clone());
            self.client
                .borrow_mut()
                .query_one(&sql, &refs(&[table]))
                .map_err(storage_debug)?;
        }
        Ok(id)
    }

    fn find_one(&self, id: &i64) -> Result<Option<Node<i64>>> {
        Ok(self
            .find(&Predicate::Id(*id), Order::Unordered)?
            .into_iter()
            .next())
    }

    fn find_one_for_update(&mut self, id: &i64) -> Result<Option<Node<i64>>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE id = $1 FOR UPDATE",
            self.select_columns(),
            self.table
        );
        let params: Vec<Param> = vec![Box::new(*id)];
        Ok(self.query(&sql, &params)?.into_iter().next())
    }

    fn find(&self, filter: &Predicate<i64>, order: Order) -> Result<Vec<Node<i64>>> {
        let mut params = Vec::new();
        let clause = self.render(filter, &mut params);
        let order_by = match (order, &self.position) {
            (Order::ByPosition, Some(c)) => format!("{c} ASC NULLS LAST, id"),
            _ => "id".into(),
        };
        let sql = format!(
            "SELECT {} FROM {} WHERE {clause} ORDER BY {order_by}",
            self.select_columns(),
            self.table
        );
        self.query(&sql, &params)
    }

    fn lock_siblings(&mut self, parent: Option<&i64>) -> Result<()> {
        let group = parent.map(|p| p.to_string()).unwrap_or_default();
        let params: Vec<Param> = vec![Box::new(self.table.clone()), Box::new(group)];
        self.client
            .borrow_mut()
            .query_one(
                "SELECT pg_advisory_xact_lock(hashtext($1::TEXT), hashtext($2::TEXT))",
                &refs(&params),
            )
            .map_err(storage_debug)?;
        Ok(())
    }

    fn count(&self, filter: &Predicate<i64>) -> Result<usize> {
        let mut params = Vec::new();
        let clause = self.render(filter, &mut params);
        let sql = format!("SELECT COUNT(*) FROM {} WHERE {clause}", self.table);
        let count = self.query_scalar(&sql, &params)?.unwrap_or(0);
        usize::try_from(count).map_err(|_| Error::Storage("row count overflow".into()))
    }

    fn max_position(&self, filter: &Predicate<i64>) -> Result<Option<i64>> {
        let Some(column) = &self.position else {
            return Ok(None);
        };
        let mut params = Vec::new();
        let clause = self.render(filter, &mut params);
        let sql = format!("SELECT MAX({column}) FROM {} WHERE {clause}", self.table);
        self.query_scalar(&sql, &params)
    }

    fn update(&mut self, id: &i64, fields: &[Field<i64>]) -> Result<()> {
        let mut params: Vec<Param> = Vec::new();
        let mut assignments = Vec::new();
        for field in fields {
            let assignment = match field {
                Field::Path(path) => {
                    format!("{} = {}::TEXT", self.path, bind(&mut params, path.clone()))
                }
                Field::Parent(parent) => {
                    format!("{} = {}::BIGINT", self.parent, bind(&mut params, *parent))
                }
                Field::Position(position) => format!(
                    "{} = {}::BIGINT",
                    self.position_column()?,
                    bind(&mut params, *position)
                ),
            };
            assignments.push(assignment);
        }
        if assignments.is_empty() {
            assignments.push("id = id".into());
        }
        let key = bind(&mut params, *id);
        let sql = format!(
            "UPDATE {} SET {} WHERE id = {key}::BIGINT",
            self.table,
            assignments.join(", ")
        );
        match self.execute(&sql, &params)? {
            0 => Err(Error::NotFound(format!("row {id}"))),
            _ => Ok(()),
        }
    }

    fn bulk_update(&mut self, filter: &Predicate<i64>, update: &BulkUpdate) -> Result<usize> {
        let mut params = Vec::new();
        let clause = self.render(filter, &mut params);
        let sql = match update {
            BulkUpdate::ShiftPosition(delta) => {
                let Some(c) = &self.position else {
                    return Ok(0);
                };
                let d = bind(&mut params, *delta);
                format!(
                    "UPDATE {} SET {c} = {c} + {d}::BIGINT WHERE {c} IS NOT NULL AND ({clause})",
                    self.table
                )
            }
            BulkUpdate::ReplacePathPrefix { from, to } => {
                let from = bind(&mut params, from.clone());
                let to = bind(&mut params, to.clone());
                let path = &self.path;
                format!(
                    "UPDATE {} SET {path} = {to}::TEXT || substr({path}, char_length({from}::TEXT) + 1)
                     WHERE left({path}, char_length({from}::TEXT)) = {from}::TEXT AND ({clause})",
                    self.table
                )
            }
        };
        self.execute(&sql, &params)
    }

    fn bulk_delete(&mut self, filter: &Predicate<i64>) -> Result<usize> {
        let mut params = Vec::new();
        let clause = self.render(filter, &mut params);
        let sql = format!("DELETE FROM {} WHERE {clause}", self.table);
        self.execute(&sql, &params)
    }

    fn transaction<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Self) -> Result<T>,
    {
        let depth = self.depth.get();
        let savepoint = format!("treepath_{depth}");
        let (begin, commit, rollback) = if depth == 0 {
            (
                "BEGIN".to_string(),
                "COMMIT".to_string(),
                "ROLLBACK".to_string(),
            )
        } else {
            (
                format!("SAVEPOINT {savepoint}"),
                format!("RELEASE SAVEPOINT {savepoint}"),
                format!("ROLLBACK TO SAVEPOINT {savepoint}; RELEASE SAVEPOINT {savepoint}"),
            )
        };

        self.batch(&begin)?;
        self.depth.set(depth + 1);
        let result = f(self);
        self.depth.set(depth);

        match result {
            Ok(value) => match self.batch(&commit) {
                Ok(()) => Ok(value),
                Err(e) => {
                    let _ = self.batch(&rollback);
                    Err(e)
                }
            },
            Err(err) => {
                debug!(depth, error = %err, "rolling back");
                let _ = self.batch(&rollback);
                Err(err)
            }
        }
    }
}
