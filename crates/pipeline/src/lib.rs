//! Snapshot backup and restore over the storage collaborators.
//!
//! [`SnapshotService`] is the entry point the daemon and CLI use: it exports
//! the catalog into one document, replays documents back into the target,
//! and keeps per-type history bounded.

use std::sync::Arc;

use dbsnap_core::{BackupType, Catalog, FormatError, RestoreMode, RunReport, SnapshotDocument};
use dbsnap_storage::{MetadataStore, ObjectStore, RelationalStore, MAX_PAGE_SIZE};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub mod loader;
pub mod reader;
pub mod retention;
pub mod writer;

pub use loader::BatchLoader;
pub use reader::read_all;
pub use retention::RetentionOutcome;
pub use writer::{BackupError, BackupOutcome, SnapshotWriter};

pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_RETENTION_COUNT: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineOptions {
    pub page_size: usize,
    pub batch_size: usize,
    pub retention_count: usize,
    /// Refuse unattended backups when no admin profile can own them.
    pub require_owner: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            page_size: MAX_PAGE_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
            retention_count: DEFAULT_RETENTION_COUNT,
            require_owner: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum RestoreError {
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error("backup {0} not found")]
    NotFound(Uuid),
    #[error("backup {id} has no stored snapshot at {path}")]
    MissingObject { id: Uuid, path: String },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Clone)]
pub struct SnapshotService {
    catalog: Arc<Catalog>,
    source: Arc<dyn RelationalStore>,
    objects: Arc<dyn ObjectStore>,
    metadata: Arc<dyn MetadataStore>,
    options: PipelineOptions,
}

impl SnapshotService {
    pub fn new(
        catalog: Arc<Catalog>,
        source: Arc<dyn RelationalStore>,
        objects: Arc<dyn ObjectStore>,
        metadata: Arc<dyn MetadataStore>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            catalog,
            source,
            objects,
            metadata,
            options,
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn objects(&self) -> &dyn ObjectStore {
        self.objects.as_ref()
    }

    pub fn metadata(&self) -> &dyn MetadataStore {
        self.metadata.as_ref()
    }

    pub fn options(&self) -> PipelineOptions {
        self.options
    }

    /// Takes one snapshot. Automatic snapshots also trigger retention for
    /// their type; a retention failure is logged and does not fail the backup.
    pub async fn run_backup(
        &self,
        backup_type: BackupType,
        principal: Option<String>,
    ) -> Result<BackupOutcome, BackupError> {
        let writer = SnapshotWriter {
            source: self.source.as_ref(),
            objects: self.objects.as_ref(),
            metadata: self.metadata.as_ref(),
            catalog: &self.catalog,
            page_size: self.options.page_size,
            require_owner: self.options.require_owner,
        };
        let outcome = writer.write(backup_type, principal).await?;

        if backup_type == BackupType::Auto {
            match self.enforce_retention(BackupType::Auto).await {
                Ok(retention) if !retention.is_clean() => {
                    warn!(evicted = retention.evicted.len(), "retention finished with errors")
                }
                Ok(_) => {}
                Err(e) => warn!(error = %format!("{e:#}"), "retention after backup failed"),
            }
        }
        Ok(outcome)
    }

    /// Validates `bytes` as a snapshot document and replays it. A document
    /// that fails validation never touches the target.
    pub async fn run_restore(
        &self,
        bytes: &[u8],
        mode: RestoreMode,
    ) -> Result<RunReport, FormatError> {
        let document = SnapshotDocument::from_slice(bytes)?;
        let report = self.replay(&document, mode).await;
        self.record_restore(None, mode, &report).await;
        Ok(report)
    }

    /// Restores a stored snapshot by its history id.
    pub async fn restore_backup(
        &self,
        id: Uuid,
        mode: RestoreMode,
    ) -> Result<RunReport, RestoreError> {
        let entry = self
            .metadata
            .get_backup(id)
            .await?
            .ok_or(RestoreError::NotFound(id))?;
        let bytes = self
            .objects
            .get(&entry.storage_path)
            .await?
            .ok_or_else(|| RestoreError::MissingObject {
                id,
                path: entry.storage_path.clone(),
            })?;
        let document = SnapshotDocument::from_slice(&bytes)?;
        let report = self.replay(&document, mode).await;
        self.record_restore(Some(id), mode, &report).await;
        Ok(report)
    }

    pub async fn enforce_retention(
        &self,
        backup_type: BackupType,
    ) -> anyhow::Result<RetentionOutcome> {
        retention::enforce_retention(
            self.objects.as_ref(),
            self.metadata.as_ref(),
            backup_type,
            self.options.retention_count,
        )
        .await
    }

    pub async fn sweep_dangling_entries(&self) -> anyhow::Result<usize> {
        retention::sweep_dangling_entries(self.objects.as_ref(), self.metadata.as_ref()).await
    }

    async fn replay(&self, document: &SnapshotDocument, mode: RestoreMode) -> RunReport {
        let loader = BatchLoader::new(
            self.source.as_ref(),
            &self.catalog,
            self.options.batch_size,
            self.options.page_size,
        );
        let report = loader.restore(document, mode).await;
        info!(
            %mode,
            succeeded = report.success.len(),
            failed = report.errors.len(),
            skipped = report.skipped.len(),
            warnings = report.warnings.len(),
            records = report.records_written(),
            "restore finished"
        );
        report
    }

    async fn record_restore(&self, backup_id: Option<Uuid>, mode: RestoreMode, report: &RunReport) {
        if let Err(e) = self
            .metadata
            .insert_restore_event(backup_id, mode, report)
            .await
        {
            warn!(error = %format!("{e:#}"), "recording restore event failed");
        }
    }
}
