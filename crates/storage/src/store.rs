use anyhow::Result;
use dbsnap_core::{BackupEntry, BackupType, RestoreMode, RunReport};
use uuid::Uuid;

/// Backup history catalog, implemented by both SQLite and Postgres backends.
#[async_trait::async_trait]
pub trait MetadataStore: Send + Sync {
    /// Insert a fully-formed history entry.
    async fn insert_entry(&self, entry: &BackupEntry) -> Result<()>;

    /// List entries ordered by created_at DESC, optionally of one type only.
    async fn list_backups(&self, backup_type: Option<BackupType>) -> Result<Vec<BackupEntry>>;

    /// Get a single entry by id.
    async fn get_backup(&self, id: Uuid) -> Result<Option<BackupEntry>>;

    /// Delete entries by id, returning how many rows went away.
    async fn delete_entries(&self, ids: &[Uuid]) -> Result<u64>;

    /// Record that a restore ran, and what it reported.
    async fn insert_restore_event(
        &self,
        backup_id: Option<Uuid>,
        mode: RestoreMode,
        report: &RunReport,
    ) -> Result<()>;
}
