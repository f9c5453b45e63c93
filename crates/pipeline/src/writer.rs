use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use dbsnap_core::catalog::PROFILE_TABLE;
use dbsnap_core::{
    content_hash, normalize, BackupMetadata, BackupType, Catalog, NewBackupEntry,
    SnapshotDocument, FORMAT_VERSION,
};
use dbsnap_storage::{MetadataStore, ObjectStore, RelationalStore};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::reader::read_all;

const CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("serializing snapshot failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("unattended backup has no admin profile to record as owner")]
    NoOwner,
    #[error("uploading snapshot to {path} failed: {error:#}")]
    Upload { path: String, error: anyhow::Error },
    #[error("recording backup history failed: {0:#}")]
    Metadata(anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupOutcome {
    pub id: Uuid,
    pub file_name: String,
    pub storage_path: String,
    pub file_size_bytes: i64,
    pub table_count: i64,
    pub record_count: i64,
}

pub struct SnapshotWriter<'a> {
    pub source: &'a dyn RelationalStore,
    pub objects: &'a dyn ObjectStore,
    pub metadata: &'a dyn MetadataStore,
    pub catalog: &'a Catalog,
    pub page_size: usize,
    pub require_owner: bool,
}

impl SnapshotWriter<'_> {
    /// Exports every catalog table into one document, uploads it, then
    /// records one history entry.
    ///
    /// A failed upload leaves nothing behind. If the history row cannot be
    /// written the uploaded object is removed again.
    pub async fn write(
        &self,
        backup_type: BackupType,
        principal: Option<String>,
    ) -> Result<BackupOutcome, BackupError> {
        let created_at = Utc::now();
        let mut document = SnapshotDocument::new(created_at);
        let mut table_counts = BTreeMap::new();

        for table in self.catalog.tables() {
            let read = read_all(self.source, &table.name, &table.primary_key, self.page_size).await;
            let rows = match read {
                Ok(rows) => rows,
                Err(e) => {
                    error!(table = %table.name, error = %format!("{e:#}"), "export read failed; table exported empty");
                    Vec::new()
                }
            };
            table_counts.insert(table.name.clone(), rows.len() as i64);
            document.insert_table(table.name.clone(), rows);
        }

        let created_by = match principal {
            Some(principal) => Some(principal),
            None => self.unattended_owner(&document)?,
        };

        let bytes = document.to_json_bytes()?;
        let file_size_bytes = bytes.len() as i64;
        let checksum = content_hash(&bytes);
        let backup_name = format!("backup-{}", format_timestamp_path(created_at));
        let file_name = format!("{backup_name}.json");
        let storage_path = format!("{backup_type}/{file_name}");

        self.objects
            .put(&storage_path, bytes, CONTENT_TYPE, true)
            .await
            .map_err(|error| BackupError::Upload {
                path: storage_path.clone(),
                error,
            })?;

        let record_count = document.record_count() as i64;
        let table_count = document.tables.len() as i64;
        let entry = NewBackupEntry {
            backup_name,
            backup_type,
            file_size_bytes,
            table_count,
            record_count,
            storage_path: storage_path.clone(),
            created_by,
            created_at,
            metadata: Some(BackupMetadata {
                format_version: FORMAT_VERSION.to_owned(),
                checksum,
                table_counts,
            }),
        }
        .into_entry();

        if let Err(e) = self.metadata.insert_entry(&entry).await {
            if let Err(cleanup) = self.objects.remove_many(&[storage_path.clone()]).await {
                warn!(path = %storage_path, error = %format!("{cleanup:#}"), "removing unrecorded snapshot failed");
            }
            return Err(BackupError::Metadata(e));
        }

        info!(
            backup_id = %entry.id,
            %backup_type,
            path = %storage_path,
            tables = table_count,
            records = record_count,
            bytes = file_size_bytes,
            "snapshot written"
        );

        Ok(BackupOutcome {
            id: entry.id,
            file_name,
            storage_path,
            file_size_bytes,
            table_count,
            record_count,
        })
    }

    /// The earliest-created admin profile in the export itself.
    fn unattended_owner(&self, document: &SnapshotDocument) -> Result<Option<String>, BackupError> {
        let owner = document
            .table(PROFILE_TABLE)
            .iter()
            .map(|r| normalize(PROFILE_TABLE, r.clone()))
            .filter(|r| r.role() == Some("admin"))
            .filter_map(|r| {
                let id = r.id()?.to_string();
                Some((r.created_at().map(str::to_owned), id))
            })
            .min_by(|a, b| match (&a.0, &b.0) {
                (Some(x), Some(y)) => x.cmp(y),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            })
            .map(|(_, id)| id);

        match owner {
            Some(id) => Ok(Some(id)),
            None if self.require_owner => Err(BackupError::NoOwner),
            None => {
                warn!("no admin profile found; recording backup without an owner");
                Ok(None)
            }
        }
    }
}

/// RFC 3339 with `:` swapped out so the stamp is safe in object paths.
pub(crate) fn format_timestamp_path(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace(':', "-")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn timestamp_format_is_path_safe() {
        let now = DateTime::parse_from_rfc3339("2026-02-13T01:00:00.250Z")
            .expect("rfc3339")
            .with_timezone(&Utc);
        let stamp = format_timestamp_path(now);
        assert_eq!(stamp, "2026-02-13T01-00-00.250Z");
        assert!(!Path::new(&stamp).has_root());
    }
}
