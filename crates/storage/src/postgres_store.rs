use anyhow::{Context, Result};
use chrono::Utc;
use dbsnap_core::{BackupEntry, BackupMetadata, BackupType, RestoreMode, RunReport};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::store::MetadataStore;

const ENTRY_COLUMNS: &str = "id, backup_name, backup_type, file_size_bytes, table_count, record_count,
     storage_path, created_by, created_at, metadata_json";

/// Postgres-backed history catalog.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("connect to postgres")?;
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS backup_history (
                id UUID PRIMARY KEY,
                backup_name TEXT NOT NULL,
                backup_type TEXT NOT NULL,
                file_size_bytes BIGINT NOT NULL DEFAULT 0,
                table_count BIGINT NOT NULL DEFAULT 0,
                record_count BIGINT NOT NULL DEFAULT 0,
                storage_path TEXT NOT NULL,
                created_by TEXT,
                created_at TIMESTAMPTZ NOT NULL,
                metadata_json TEXT
            )",
        )
        .execute(&self.pool)
        .await
        .context("create backup_history table")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS backup_history_type_created
             ON backup_history (backup_type, created_at DESC)",
        )
        .execute(&self.pool)
        .await
        .context("create backup_history index")?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS restore_events (
                id UUID PRIMARY KEY,
                backup_id UUID,
                mode TEXT NOT NULL,
                records_written BIGINT NOT NULL,
                error_count BIGINT NOT NULL,
                report_json TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .context("create restore_events table")?;

        Ok(())
    }
}

#[async_trait::async_trait]
impl MetadataStore for PostgresStore {
    async fn insert_entry(&self, entry: &BackupEntry) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO backup_history ({ENTRY_COLUMNS})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"
        ))
        .bind(entry.id)
        .bind(&entry.backup_name)
        .bind(entry.backup_type.as_str())
        .bind(entry.file_size_bytes)
        .bind(entry.table_count)
        .bind(entry.record_count)
        .bind(&entry.storage_path)
        .bind(&entry.created_by)
        .bind(entry.created_at)
        .bind(
            entry
                .metadata
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_backups(&self, backup_type: Option<BackupType>) -> Result<Vec<BackupEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM backup_history
             WHERE ($1::text IS NULL OR backup_type = $1)
             ORDER BY created_at DESC"
        ))
        .bind(backup_type.map(|t| t.as_str()))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(pg_row_to_entry).collect()
    }

    async fn get_backup(&self, id: Uuid) -> Result<Option<BackupEntry>> {
        let row = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM backup_history WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => Ok(Some(pg_row_to_entry(&r)?)),
            None => Ok(None),
        }
    }

    async fn delete_entries(&self, ids: &[Uuid]) -> Result<u64> {
        let result = sqlx::query("DELETE FROM backup_history WHERE id = ANY($1)")
            .bind(ids.to_vec())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn insert_restore_event(
        &self,
        backup_id: Option<Uuid>,
        mode: RestoreMode,
        report: &RunReport,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO restore_events
             (id, backup_id, mode, records_written, error_count, report_json, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(Uuid::new_v4())
        .bind(backup_id)
        .bind(mode.as_str())
        .bind(report.records_written() as i64)
        .bind(report.errors.len() as i64)
        .bind(serde_json::to_string(report).context("serialize run report")?)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn pg_row_to_entry(row: &sqlx::postgres::PgRow) -> Result<BackupEntry> {
    let backup_type: String = row.try_get("backup_type")?;
    let metadata_json: Option<String> = row.try_get("metadata_json")?;

    Ok(BackupEntry {
        id: row.try_get("id")?,
        backup_name: row.try_get("backup_name")?,
        backup_type: backup_type
            .parse::<BackupType>()
            .map_err(|e| anyhow::anyhow!("unreadable backup_type: {e}"))?,
        file_size_bytes: row.try_get("file_size_bytes")?,
        table_count: row.try_get("table_count")?,
        record_count: row.try_get("record_count")?,
        storage_path: row.try_get("storage_path")?,
        created_by: row.try_get("created_by")?,
        created_at: row.try_get("created_at")?,
        metadata: metadata_json
            .map(|raw| serde_json::from_str::<BackupMetadata>(&raw))
            .transpose()
            .context("parse metadata_json")?,
    })
}
