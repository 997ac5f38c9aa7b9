use postgres::Client;
use tracing::debug;
use treepath_core::{validate_identifier, Attribute, Error, Result, TreeConfig};

const SCHEMA_LOCK_KEY: i64 = 0x7472656570617468; // "treepath"

fn storage_debug<E: std::fmt::Debug>(e: E) -> Error {
    Error::Storage(format!("{e:?}"))
}

fn schema_sql(table: &str, config: &TreeConfig) -> Result<String> {
    let parent = config.column(Attribute::Parent)?;
    let path = config.column(Attribute::Path)?;
    let mut sql = format!(
        r#"
CREATE TABLE IF NOT EXISTS "{table}" (
  id BIGSERIAL PRIMARY KEY,
  "{parent}" BIGINT,
  "{path}" TEXT NOT NULL DEFAULT ''"#
    );
    match config.position_attribute.as_deref() {
        Some(position) => sql.push_str(&format!(
            r#",
  "{position}" BIGINT
);

CREATE INDEX IF NOT EXISTS "{table}_siblings" ON "{table}" ("{parent}", "{position}");
"#
        )),
        None => sql.push_str(&format!(
            r#"
);

CREATE INDEX IF NOT EXISTS "{table}_parent" ON "{table}" ("{parent}");
"#
        )),
    }
    sql.push_str(&format!(
        r#"CREATE INDEX IF NOT EXISTS "{table}_path" ON "{table}" ("{path}");"#
    ));
    Ok(sql)
}

/// Creates `table` laid out for `config` if it does not exist yet.
pub fn ensure_schema(client: &mut Client, table: &str, config: &TreeConfig) -> Result<()> {
    config.validate()?;
    validate_identifier(table)?;
    let sql = schema_sql(table, config)?;

    // concurrent CREATE ... IF NOT EXISTS can still race on the catalog
    client
        .query_one("SELECT pg_advisory_lock($1)", &[&SCHEMA_LOCK_KEY])
        .map_err(storage_debug)?;

    let res = client.batch_execute(&sql).map_err(storage_debug);

    // Released with the connection regardless.
    let _ = client.query_one("SELECT pg_advisory_unlock($1)", &[&SCHEMA_LOCK_KEY]);

    debug!(table, ok = res.is_ok(), "postgres schema ensured");
    res
}

pub fn drop_table(client: &mut Client, table: &str) -> Result<()> {
    validate_identifier(table)?;
    client
        .batch_execute(&format!(r#"DROP TABLE IF EXISTS "{table}""#))
        .map_err(storage_debug)
}
