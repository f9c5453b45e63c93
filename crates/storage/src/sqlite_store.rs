use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use dbsnap_core::{BackupEntry, BackupMetadata, BackupType, RestoreMode, RunReport};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::store::MetadataStore;

const ENTRY_COLUMNS: &str = "id, backup_name, backup_type, file_size_bytes, table_count, record_count,
     storage_path, created_by, created_at, metadata_json";

/// SQLite-backed history catalog. Each method opens a fresh connection.
pub struct SqliteStore {
    db_path: PathBuf,
}

impl SqliteStore {
    pub fn new(db_path: PathBuf) -> Result<Self> {
        let store = Self { db_path };
        store.init_db()?;
        Ok(store)
    }

    fn connect(&self) -> Result<Connection> {
        Connection::open(&self.db_path).context("open metadata db")
    }

    fn init_db(&self) -> Result<()> {
        let conn = self.connect()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS backup_history (
                id TEXT PRIMARY KEY,
                backup_name TEXT NOT NULL,
                backup_type TEXT NOT NULL,
                file_size_bytes INTEGER NOT NULL DEFAULT 0,
                table_count INTEGER NOT NULL DEFAULT 0,
                record_count INTEGER NOT NULL DEFAULT 0,
                storage_path TEXT NOT NULL,
                created_by TEXT,
                created_at TEXT NOT NULL,
                metadata_json TEXT
            );
            CREATE INDEX IF NOT EXISTS backup_history_type_created
                ON backup_history (backup_type, created_at);
            CREATE TABLE IF NOT EXISTS restore_events (
                id TEXT PRIMARY KEY,
                backup_id TEXT,
                mode TEXT NOT NULL,
                records_written INTEGER NOT NULL,
                error_count INTEGER NOT NULL,
                report_json TEXT NOT NULL,
                created_at TEXT NOT NULL
            );",
        )?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl MetadataStore for SqliteStore {
    async fn insert_entry(&self, entry: &BackupEntry) -> Result<()> {
        let entry = entry.clone();
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path).context("open metadata db")?;
            conn.execute(
                &format!(
                    "INSERT INTO backup_history ({ENTRY_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
                ),
                params![
                    entry.id.to_string(),
                    entry.backup_name,
                    entry.backup_type.as_str(),
                    entry.file_size_bytes,
                    entry.table_count,
                    entry.record_count,
                    entry.storage_path,
                    entry.created_by,
                    format_ts(entry.created_at),
                    entry.metadata.as_ref().map(serde_json::to_string).transpose()?
                ],
            )?;
            Ok(())
        })
        .await?
    }

    async fn list_backups(&self, backup_type: Option<BackupType>) -> Result<Vec<BackupEntry>> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path).context("open metadata db")?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {ENTRY_COLUMNS} FROM backup_history
                 WHERE (?1 IS NULL OR backup_type = ?1)
                 ORDER BY created_at DESC"
            ))?;
            let rows = stmt.query_map([backup_type.map(|t| t.as_str())], row_to_entry)?;
            rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
        })
        .await?
    }

    async fn get_backup(&self, id: Uuid) -> Result<Option<BackupEntry>> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path).context("open metadata db")?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {ENTRY_COLUMNS} FROM backup_history WHERE id = ?1"
            ))?;
            let found = stmt.query_row([id.to_string()], row_to_entry).optional()?;
            Ok(found)
        })
        .await?
    }

    async fn delete_entries(&self, ids: &[Uuid]) -> Result<u64> {
        let ids = ids.to_vec();
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = Connection::open(&db_path).context("open metadata db")?;
            let tx = conn.transaction()?;
            let mut removed = 0u64;
            for id in &ids {
                removed += tx.execute("DELETE FROM backup_history WHERE id = ?1", [id.to_string()])?
                    as u64;
            }
            tx.commit()?;
            Ok(removed)
        })
        .await?
    }

    async fn insert_restore_event(
        &self,
        backup_id: Option<Uuid>,
        mode: RestoreMode,
        report: &RunReport,
    ) -> Result<()> {
        let report_json = serde_json::to_string(report).context("serialize run report")?;
        let records_written = report.records_written() as i64;
        let error_count = report.errors.len() as i64;
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path).context("open metadata db")?;
            conn.execute(
                "INSERT INTO restore_events
                 (id, backup_id, mode, records_written, error_count, report_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    Uuid::new_v4().to_string(),
                    backup_id.map(|id| id.to_string()),
                    mode.as_str(),
                    records_written,
                    error_count,
                    report_json,
                    format_ts(Utc::now())
                ],
            )?;
            Ok(())
        })
        .await?
    }
}

fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<BackupEntry> {
    let backup_type: String = row.get(2)?;
    let metadata_json: Option<String> = row.get(9)?;
    Ok(BackupEntry {
        id: parse_uuid(0, &row.get::<_, String>(0)?)?,
        backup_name: row.get(1)?,
        backup_type: backup_type
            .parse::<BackupType>()
            .map_err(|e| conversion_err(2, e.into()))?,
        file_size_bytes: row.get(3)?,
        table_count: row.get(4)?,
        record_count: row.get(5)?,
        storage_path: row.get(6)?,
        created_by: row.get(7)?,
        created_at: parse_ts(8, &row.get::<_, String>(8)?)?,
        metadata: metadata_json
            .map(|raw| serde_json::from_str::<BackupMetadata>(&raw))
            .transpose()
            .map_err(|e| conversion_err(9, Box::new(e)))?,
    })
}

/// Fixed-width UTC timestamps, so text ordering matches time ordering.
fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_uuid(idx: usize, raw: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| conversion_err(idx, Box::new(e)))
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, Box::new(e)))
}

fn conversion_err(
    idx: usize,
    e: Box<dyn std::error::Error + Send + Sync + 'static>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use dbsnap_core::NewBackupEntry;

    fn entry(backup_type: BackupType, age_minutes: i64) -> BackupEntry {
        NewBackupEntry {
            backup_name: format!("backup-{age_minutes}"),
            backup_type,
            file_size_bytes: 10,
            table_count: 2,
            record_count: 5,
            storage_path: format!("{backup_type}/backup-{age_minutes}.json"),
            created_by: None,
            created_at: Utc::now() - Duration::minutes(age_minutes),
            metadata: Some(BackupMetadata {
                format_version: "2.0".into(),
                checksum: "abc".into(),
                table_counts: [("profiles".to_owned(), 5)].into_iter().collect(),
            }),
        }
        .into_entry()
    }

    #[tokio::test]
    async fn lists_newest_first_and_filters_by_type() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::new(tmp.path().join("metadata.db")).expect("store");

        let old = entry(BackupType::Auto, 30);
        let new = entry(BackupType::Auto, 1);
        let manual = entry(BackupType::Manual, 10);
        for e in [&old, &manual, &new] {
            store.insert_entry(e).await.expect("insert");
        }

        let autos = store.list_backups(Some(BackupType::Auto)).await.expect("list");
        let ids: Vec<_> = autos.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![new.id, old.id]);

        let all = store.list_backups(None).await.expect("list all");
        assert_eq!(all.len(), 3);
        assert_eq!(all[1].id, manual.id);

        let fetched = store.get_backup(old.id).await.expect("get").expect("present");
        assert_eq!(fetched.metadata, old.metadata);
        assert_eq!(fetched.storage_path, old.storage_path);
    }

    #[tokio::test]
    async fn delete_entries_counts_only_existing_rows() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::new(tmp.path().join("metadata.db")).expect("store");
        let kept = entry(BackupType::Auto, 1);
        let doomed = entry(BackupType::Auto, 2);
        store.insert_entry(&kept).await.expect("insert");
        store.insert_entry(&doomed).await.expect("insert");

        let removed = store
            .delete_entries(&[doomed.id, Uuid::new_v4()])
            .await
            .expect("delete");
        assert_eq!(removed, 1);
        assert!(store.get_backup(doomed.id).await.expect("get").is_none());
        assert!(store.get_backup(kept.id).await.expect("get").is_some());
    }

    #[tokio::test]
    async fn restore_events_are_recorded() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("metadata.db");
        let store = SqliteStore::new(path.clone()).expect("store");
        store
            .insert_restore_event(None, RestoreMode::Merge, &RunReport::default())
            .await
            .expect("event");

        let conn = Connection::open(path).expect("open");
        let mode: String = conn
            .query_row("SELECT mode FROM restore_events", [], |r| r.get(0))
            .expect("row");
        assert_eq!(mode, "merge");
    }

    #[tokio::test]
    async fn corrupt_history_rows_are_errors() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("metadata.db");
        let store = SqliteStore::new(path.clone()).expect("store");
        let good = entry(BackupType::Auto, 1);
        store.insert_entry(&good).await.expect("insert");

        let conn = Connection::open(&path).expect("open");
        conn.execute(
            "UPDATE backup_history SET created_at = 'last tuesday' WHERE id = ?1",
            params![good.id.to_string()],
        )
        .expect("corrupt timestamp");
        assert!(store.list_backups(None).await.is_err());
        assert!(store.get_backup(good.id).await.is_err());

        conn.execute(
            "INSERT INTO backup_history (id, backup_name, backup_type, storage_path, created_at)
             VALUES ('not-a-uuid', 'x', 'manual', 'manual/x.json', '2024-01-01T00:00:00Z')",
            [],
        )
        .expect("insert bad id");
        conn.execute("DELETE FROM backup_history WHERE id = ?1", params![good.id.to_string()])
            .expect("drop first row");
        assert!(store.list_backups(Some(BackupType::Manual)).await.is_err());
    }
}
