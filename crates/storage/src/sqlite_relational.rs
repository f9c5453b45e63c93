use std::path::PathBuf;

use anyhow::{Context, Result};
use dbsnap_core::Record;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params, Connection};
use serde_json::{Map, Number, Value};

use crate::relational::{quote_ident, shared_columns, Page, RelationalStore, Written};

/// Rows of a SQLite database, read and written as JSON records.
///
/// Nested JSON values are stored as text. Fields the target table does not
/// have are dropped on write, so older snapshots load into newer schemas.
pub struct SqliteRelationalStore {
    db_path: PathBuf,
}

impl SqliteRelationalStore {
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    async fn write(
        &self,
        table: &str,
        key: &str,
        rows: &[Record],
        upsert: bool,
    ) -> Result<Written> {
        let table = table.to_owned();
        let key = key.to_owned();
        let rows = rows.to_vec();
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = Connection::open(&db_path).context("open source db")?;
            let known = table_columns(&conn, &table)?;
            let quoted_table = quote_ident(&table)?;
            let quoted_key = quote_ident(&key)?;

            let tx = conn.transaction()?;
            let mut written = Written::default();
            for row in &rows {
                let columns = shared_columns(std::slice::from_ref(row), &known);
                if columns.is_empty() {
                    continue;
                }
                let quoted = columns
                    .iter()
                    .map(|c| quote_ident(c))
                    .collect::<Result<Vec<_>>>()?;
                let placeholders: Vec<String> =
                    (1..=columns.len()).map(|i| format!("?{i}")).collect();
                let mut sql = format!(
                    "INSERT INTO {quoted_table} ({}) VALUES ({})",
                    quoted.join(", "),
                    placeholders.join(", ")
                );
                if upsert {
                    let updates: Vec<String> = quoted
                        .iter()
                        .filter(|c| **c != quoted_key)
                        .map(|c| format!("{c} = excluded.{c}"))
                        .collect();
                    if updates.is_empty() {
                        sql.push_str(&format!(" ON CONFLICT ({quoted_key}) DO NOTHING"));
                    } else {
                        sql.push_str(&format!(
                            " ON CONFLICT ({quoted_key}) DO UPDATE SET {}",
                            updates.join(", ")
                        ));
                    }
                }

                let values: Vec<SqlValue> = columns
                    .iter()
                    .map(|c| json_to_sql(row.get(c).unwrap_or(&Value::Null)))
                    .collect();
                let changed = tx
                    .prepare_cached(&sql)?
                    .execute(rusqlite::params_from_iter(values))
                    .with_context(|| format!("write row into {table}"))?;
                if changed == 0 {
                    continue;
                }
                written.rows += 1;
                written.keys.extend(row.key(&key));
            }
            tx.commit()?;
            Ok(written)
        })
        .await?
    }
}

#[async_trait::async_trait]
impl RelationalStore for SqliteRelationalStore {
    async fn range_read(
        &self,
        table: &str,
        order_key: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Page> {
        let table = quote_ident(table)?;
        let order = quote_ident(order_key)?;
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path).context("open source db")?;
            let total = if offset == 0 {
                let count: i64 =
                    conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))?;
                Some(count as u64)
            } else {
                None
            };

            let mut stmt = conn.prepare(&format!(
                "SELECT * FROM {table} ORDER BY {order} LIMIT ?1 OFFSET ?2"
            ))?;
            let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
            let rows = stmt.query_map(params![limit as i64, offset as i64], |row| {
                let mut fields = Map::with_capacity(names.len());
                for (idx, name) in names.iter().enumerate() {
                    fields.insert(name.clone(), sql_to_json(row.get_ref(idx)?));
                }
                Ok(Record::from(fields))
            })?;
            let rows = rows.collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(Page { rows, total })
        })
        .await?
    }

    async fn delete_all(&self, table: &str) -> Result<u64> {
        let table = quote_ident(table)?;
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path).context("open source db")?;
            let removed = conn.execute(&format!("DELETE FROM {table}"), [])?;
            Ok(removed as u64)
        })
        .await?
    }

    async fn insert_batch(
        &self,
        table: &str,
        key: &str,
        rows: &[Record],
    ) -> Result<Written> {
        self.write(table, key, rows, false).await
    }

    async fn upsert_batch(
        &self,
        table: &str,
        conflict_key: &str,
        rows: &[Record],
    ) -> Result<Written> {
        self.write(table, conflict_key, rows, true).await
    }
}

fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)?))?;
    let columns = stmt
        .query_map([], |r| r.get::<_, String>(1))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    if columns.is_empty() {
        anyhow::bail!("table {table} does not exist");
    }
    Ok(columns)
}

fn sql_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Number::from_f64(f).map_or(Value::Null, Value::Number),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(b.iter().map(|byte| format!("{byte:02x}")).collect()),
    }
}

fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => n.as_f64().map_or(SqlValue::Null, SqlValue::Real),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        nested => SqlValue::Text(nested.to_string()),
    }
}
