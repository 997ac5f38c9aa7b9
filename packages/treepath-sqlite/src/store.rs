use std::path::Path;

use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, Row};
use tracing::{debug, trace};
use treepath_core::{
    validate_identifier, Attribute, BulkUpdate, Error, Field, NewNode, Node, Order, Predicate,
    RecordStore, Result, TreeConfig,
};

fn storage(e: rusqlite::Error) -> Error {
    Error::Storage(e.to_string())
}

fn quoted(name: &str) -> String {
    format!("\"{name}\"")
}

fn row_to_node(row: &Row<'_>) -> rusqlite::Result<Node<i64>> {
    Ok(Node {
        id: row.get(0)?,
        parent_id: row.get(1)?,
        path: row.get(2)?,
        position: row.get(3)?,
    })
}

/// SQLite `RecordStore` over a single table.
///
/// Path predicates compile to `instr`/`substr` comparisons so delimiter characters such as `%`
/// or `_` are matched literally. Transactions start with `BEGIN IMMEDIATE`, taking the write lock
/// up front; nested transactions become savepoints.
pub struct SqliteStore {
    conn: Connection,
    table: String,
    parent: String,
    path: String,
    position: Option<String>,
    depth: usize,
}

impl SqliteStore {
    pub fn open_in_memory(table: &str, config: &TreeConfig) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(storage)?;
        Self::from_connection(conn, table, config)
    }

    pub fn open(path: impl AsRef<Path>, table: &str, config: &TreeConfig) -> Result<Self> {
        let conn = Connection::open(path).map_err(storage)?;
        Self::from_connection(conn, table, config)
    }

    /// Wraps an existing connection and creates the table if it is missing.
    pub fn from_connection(conn: Connection, table: &str, config: &TreeConfig) -> Result<Self> {
        config.validate()?;
        validate_identifier(table)?;
        let position = config.column(Attribute::Position).ok().map(quoted);
        let names = [
            Some(config.column(Attribute::Parent)?),
            Some(config.column(Attribute::Path)?),
            config.position_attribute.as_deref(),
        ];
        if names.iter().flatten().any(|n| n.eq_ignore_ascii_case("id")) {
            return Err(Error::InvalidOperation(
                "\"id\" is reserved for the primary key".into(),
            ));
        }
        let store = Self {
            conn,
            table: table.to_string(),
            parent: quoted(config.column(Attribute::Parent)?),
            path: quoted(config.column(Attribute::Path)?),
            position,
            depth: 0,
        };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn ensure_schema(&self) -> Result<()> {
        let t = &self.table;
        let (parent, path) = (&self.parent, &self.path);
        let mut sql = match &self.position {
            Some(position) => format!(
                "CREATE TABLE IF NOT EXISTS \"{t}\" (
                    id INTEGER PRIMARY KEY,
                    {parent} INTEGER,
                    {path} TEXT NOT NULL DEFAULT '',
                    {position} INTEGER
                );
                CREATE INDEX IF NOT EXISTS \"{t}_siblings\" ON \"{t}\"({parent}, {position});"
            ),
            None => format!(
                "CREATE TABLE IF NOT EXISTS \"{t}\" (
                    id INTEGER PRIMARY KEY,
                    {parent} INTEGER,
                    {path} TEXT NOT NULL DEFAULT ''
                );
                CREATE INDEX IF NOT EXISTS \"{t}_parent\" ON \"{t}\"({parent});"
            ),
        };
        sql.push_str(&format!(
            "CREATE INDEX IF NOT EXISTS \"{t}_path\" ON \"{t}\"({path});"
        ));
        self.conn.execute_batch(&sql).map_err(storage)?;
        debug!(table = %t, "sqlite schema ready");
        Ok(())
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
            self.position.as_deref().unwrap_or("NULL")
        )
    }

    /// Appends `value` and returns its numbered placeholder.
    fn bind(params: &mut Vec<Value>, value: Value) -> String {
        params.push(value);
        format!("?{}", params.len())
    }

    fn render(&self, filter: &Predicate<i64>, params: &mut Vec<Value>) -> String {
        match filter {
            Predicate::All => "1".into(),
            Predicate::Id(id) => format!("id = {}", Self::bind(params, Value::Integer(*id))),
            Predicate::PathContains(needle) => {
                let p = Self::bind(params, Value::Text(needle.clone()));
                format!("instr({}, {p}) > 0", self.path)
            }
            Predicate::PathStartsWith(prefix) => {
                let p = Self::bind(params, Value::Text(prefix.clone()));
                format!("substr({}, 1, length({p})) = {p}", self.path)
            }
            Predicate::ParentIs(None) => format!("{} IS NULL", self.parent),
            Predicate::ParentIs(Some(parent)) => {
                let p = Self::bind(params, Value::Integer(*parent));
                format!("{} = {p}", self.parent)
            }
            Predicate::PositionAtLeast(at) => match &self.position {
                Some(c) => format!("{c} >= {}", Self::bind(params, Value::Integer(*at))),
                None => "0".into(),
            },
            Predicate::PositionAbove(at) => match &self.position {
                Some(c) => format!("{c} > {}", Self::bind(params, Value::Integer(*at))),
                None => "0".into(),
            },
            Predicate::PositionBetween(lo, hi) => match &self.position {
                Some(c) => {
                    let lo = Self::bind(params, Value::Integer(*lo));
                    let hi = Self::bind(params, Value::Integer(*hi));
                    format!("{c} BETWEEN {lo} AND {hi}")
                }
                None => "0".into(),
            },
            Predicate::And(parts) if parts.is_empty() => "1".into(),
            Predicate::And(parts) => parts
                .iter()
                .map(|p| format!("({})", self.render(p, params)))
                .collect::<Vec<_>>()
                .join(" AND "),
            // NULL comparisons are false for `matches`, so NOT must see them as false too
            Predicate::Not(inner) => format!("NOT coalesce(({}), 0)", self.render(inner, params)),
        }
    }

    fn execute(&self, sql: &str, params: Vec<Value>) -> Result<usize> {
        trace!(sql, "sqlite execute");
        self.conn
            .execute(sql, params_from_iter(params))
            .map_err(storage)
    }

    fn query(&self, sql: &str, params: Vec<Value>) -> Result<Vec<Node<i64>>> {
        trace!(sql, "sqlite query");
        let mut stmt = self.conn.prepare(sql).map_err(storage)?;
        let rows = stmt
            .query_map(params_from_iter(params), row_to_node)
            .map_err(storage)?;
        let mut nodes = Vec::new();
        for row in rows {
            nodes.push(row.map_err(storage)?);
        }
        Ok(nodes)
    }

    fn query_scalar(&self, sql: &str, params: Vec<Value>) -> Result<Option<i64>> {
        trace!(sql, "sqlite query");
        self.conn
            .query_row(sql, params_from_iter(params), |row| row.get(0))
            .map_err(storage)
    }
}

impl RecordStore for SqliteStore {
    type Key = i64;

    fn insert(&mut self, node: NewNode<i64>) -> Result<i64> {
        let mut columns = vec![self.parent.clone(), self.path.clone()];
        let mut values = vec![
            node.parent_id.map_or(Value::Null, Value::Integer),
            Value::Text(String::new()),
        ];
        if let Some(id) = node.id {
            columns.push("id".into());
            values.push(Value::Integer(id));
        }
        if let Some(position) = node.position {
            columns.push(self.position_column()?.to_string());
            values.push(Value::Integer(position));
        }
        let placeholders: Vec<String> = (1..=values.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "INSERT INTO \"{}\" ({}) VALUES ({})",
            self.table,
            columns.join(", "),
            placeholders.join(", ")
        );
        self.execute(&sql, values)?;
        Ok(node.id.unwrap_or_else(|| self.conn.last_insert_rowid()))
    }

    fn find_one(&self, id: &i64) -> Result<Option<Node<i64>>> {
        Ok(self
            .find(&Predicate::Id(*id), Order::Unordered)?
            .into_iter()
            .next())
    }

    fn find(&self, filter: &Predicate<i64>, order: Order) -> Result<Vec<Node<i64>>> {
        let mut params = Vec::new();
        let clause = self.render(filter, &mut params);
        let order_by = match (order, &self.position) {
            (Order::ByPosition, Some(c)) => format!("{c} IS NULL, {c}, id"),
            _ => "id".into(),
        };
        let sql = format!(
            "SELECT {} FROM \"{}\" WHERE {clause} ORDER BY {order_by}",
            self.select_columns(),
            self.table
        );
        self.query(&sql, params)
    }

    fn count(&self, filter: &Predicate<i64>) -> Result<usize> {
        let mut params = Vec::new();
        let clause = self.render(filter, &mut params);
        let sql = format!("SELECT COUNT(*) FROM \"{}\" WHERE {clause}", self.table);
        let count = self.query_scalar(&sql, params)?.unwrap_or(0);
        usize::try_from(count).map_err(|_| Error::Storage("row count overflow".into()))
    }

    fn max_position(&self, filter: &Predicate<i64>) -> Result<Option<i64>> {
        let Some(column) = &self.position else {
            return Ok(None);
        };
        let mut params = Vec::new();
        let clause = self.render(filter, &mut params);
        let sql = format!("SELECT MAX({column}) FROM \"{}\" WHERE {clause}", self.table);
        self.query_scalar(&sql, params)
    }

    fn update(&mut self, id: &i64, fields: &[Field<i64>]) -> Result<()> {
        let mut params = Vec::new();
        let mut assignments = Vec::new();
        for field in fields {
            let (column, value) = match field {
                Field::Path(path) => (self.path.as_str(), Value::Text(path.clone())),
                Field::Parent(parent) => (
                    self.parent.as_str(),
                    parent.map_or(Value::Null, Value::Integer),
                ),
                Field::Position(position) => (
                    self.position_column()?,
                    position.map_or(Value::Null, Value::Integer),
                ),
            };
            assignments.push(format!("{column} = {}", Self::bind(&mut params, value)));
        }
        if assignments.is_empty() {
            // still report a missing row
            assignments.push("id = id".into());
        }
        let key = Self::bind(&mut params, Value::Integer(*id));
        let sql = format!(
            "UPDATE \"{}\" SET {} WHERE id = {key}",
            self.table,
            assignments.join(", ")
        );
        match self.execute(&sql, params)? {
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
                let d = Self::bind(&mut params, Value::Integer(*delta));
                format!(
                    "UPDATE \"{}\" SET {c} = {c} + {d} WHERE {c} IS NOT NULL AND ({clause})",
                    self.table
                )
            }
            BulkUpdate::ReplacePathPrefix { from, to } => {
                let from = Self::bind(&mut params, Value::Text(from.clone()));
                let to = Self::bind(&mut params, Value::Text(to.clone()));
                let path = &self.path;
                format!(
                    "UPDATE \"{}\" SET {path} = {to} || substr({path}, length({from}) + 1)
                     WHERE substr({path}, 1, length({from})) = {from} AND ({clause})",
                    self.table
                )
            }
        };
        self.execute(&sql, params)
    }

    fn bulk_delete(&mut self, filter: &Predicate<i64>) -> Result<usize> {
        let mut params = Vec::new();
        let clause = self.render(filter, &mut params);
        let sql = format!("DELETE FROM \"{}\" WHERE {clause}", self.table);
        self.execute(&sql, params)
    }

    fn transaction<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Self) -> Result<T>,
    {
        let savepoint = format!("treepath_{}", self.depth);
        let (begin, commit, rollback) = if self.depth == 0 {
            (
                "BEGIN IMMEDIATE".to_string(),
                "COMMIT".to_string(),
                "ROLLBACK".to_string(),
            )
        } else {
            (
                format!("SAVEPOINT {savepoint}"),
                format!("RELEASE {savepoint}"),
                format!("ROLLBACK TO {savepoint}; RELEASE {savepoint}"),
            )
        };

        self.conn.execute_batch(&begin).map_err(storage)?;
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;

        match result {
            Ok(value) => match self.conn.execute_batch(&commit) {
                Ok(()) => Ok(value),
                Err(e) => {
                    let _ = self.conn.execute_batch(&rollback);
                    Err(storage(e))
                }
            },
            Err(err) => {
                debug!(depth = self.depth, error = %err, "rolling back");
                self.conn.execute_batch(&rollback).map_err(storage)?;
                Err(err)
            }
        }
    }
}
