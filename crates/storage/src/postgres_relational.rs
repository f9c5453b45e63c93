use anyhow::{bail, Context, Result};
use dbsnap_core::{PrimaryKey, Record};
use serde_json::{Map, Value};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Row};

use crate::relational::{column_groups, quote_ident, Page, RelationalStore, Written};

/// Rows of a Postgres schema, moved as JSON so no per-table types are needed.
///
/// Reads use `to_jsonb`, writes go through `jsonb_populate_recordset`, which
/// lets Postgres coerce each field to its column type.
pub struct PostgresRelationalStore {
    pool: PgPool,
}

impl PostgresRelationalStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("connect to source postgres")?;
        Ok(Self { pool })
    }

    async fn table_columns(&self, table: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT column_name::text AS column_name FROM information_schema.columns
             WHERE table_schema = current_schema() AND table_name = $1
             ORDER BY ordinal_position",
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("list columns of {table}"))?;
        if rows.is_empty() {
            bail!("table {table} does not exist");
        }
        Ok(rows.iter().map(|r| r.get("column_name")).collect())
    }

    /// Writes `rows` in one transaction, one statement per set of shared
    /// columns, so a field a row omits is never written as NULL.
    async fn write(
        &self,
        table: &str,
        key: &str,
        rows: &[Record],
        upsert: bool,
    ) -> Result<Written> {
        if rows.is_empty() {
            return Ok(Written::default());
        }
        let known = self.table_columns(table).await?;
        let groups = column_groups(rows, &known);
        if groups.is_empty() {
            return Ok(Written::default());
        }

        let quoted_table = quote_ident(table)?;
        let quoted_key = quote_ident(key)?;
        let mut tx = self.pool.begin().await.context("begin write transaction")?;
        let mut written = Written::default();
        for (columns, members) in groups {
            let quoted = columns
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Result<Vec<_>>>()?;
            let column_list = quoted.join(", ");

            let mut sql = format!(
                "INSERT INTO {quoted_table} ({column_list})
                 SELECT {column_list} FROM jsonb_populate_recordset(NULL::{quoted_table}, $1)"
            );
            if upsert {
                let updates: Vec<String> = quoted
                    .iter()
                    .filter(|c| **c != quoted_key)
                    .map(|c| format!("{c} = EXCLUDED.{c}"))
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
            sql.push_str(&format!(" RETURNING {quoted_key}::text AS written_key"));

            let payload: Vec<&Map<String, Value>> =
                members.iter().map(|r| r.fields()).collect();
            let returned = sqlx::query(&sql)
                .bind(Json(payload))
                .fetch_all(&mut *tx)
                .await
                .with_context(|| format!("write batch into {table}"))?;
            written.rows += returned.len();
            written.keys.extend(
                returned
                    .iter()
                    .filter_map(|r| r.get::<Option<String>, _>("written_key"))
                    .map(PrimaryKey::new),
            );
        }
        tx.commit().await.context("commit write transaction")?;
        Ok(written)
    }
}

#[async_trait::async_trait]
impl RelationalStore for PostgresRelationalStore {
    async fn range_read(
        &self,
        table: &str,
        order_key: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Page> {
        let quoted = quote_ident(table)?;
        let order = quote_ident(order_key)?;
        let total = if offset == 0 {
            let count: i64 = sqlx::query(&format!("SELECT COUNT(*) AS n FROM {quoted}"))
                .fetch_one(&self.pool)
                .await
                .with_context(|| format!("count {table}"))?
                .get("n");
            Some(count as u64)
        } else {
            None
        };

        let rows = sqlx::query(&format!(
            "SELECT to_jsonb(t) AS row FROM {quoted} AS t ORDER BY t.{order} LIMIT $1 OFFSET $2"
        ))
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("read {table} at offset {offset}"))?;

        let rows = rows
            .iter()
            .map(|r| {
                r.try_get::<Json<Map<String, Value>>, _>("row")
                    .map(|Json(fields)| Record::from(fields))
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Page { rows, total })
    }

    async fn delete_all(&self, table: &str) -> Result<u64> {
        let quoted = quote_ident(table)?;
        let result = sqlx::query(&format!("DELETE FROM {quoted}"))
            .execute(&self.pool)
            .await
            .with_context(|| format!("clear {table}"))?;
        Ok(result.rows_affected())
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
