use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Whether a snapshot was taken by the scheduler or on request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    Auto,
    Manual,
}

impl BackupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupType::Auto => "auto",
            BackupType::Manual => "manual",
        }
    }
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupType {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "auto" | "automatic" => Ok(BackupType::Auto),
            "manual" => Ok(BackupType::Manual),
            other => Err(format!("unknown backup type: {other}")),
        }
    }
}

/// How a restore treats rows already present in the target store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum RestoreMode {
    /// Delete every existing row, then insert.
    #[default]
    Replace,
    /// Upsert by primary key, keeping rows the snapshot does not mention.
    Merge,
}

impl RestoreMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestoreMode::Replace => "replace",
            RestoreMode::Merge => "merge",
        }
    }
}

impl fmt::Display for RestoreMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RestoreMode {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "replace" => Ok(RestoreMode::Replace),
            "merge" => Ok(RestoreMode::Merge),
            other => Err(format!("unknown restore mode: {other}")),
        }
    }
}

/// Extra facts stored alongside a history entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct BackupMetadata {
    pub format_version: String,
    /// SHA-256 of the stored document bytes, hex encoded.
    pub checksum: String,
    pub table_counts: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackupEntry {
    pub id: Uuid,
    pub backup_name: String,
    pub backup_type: BackupType,
    pub file_size_bytes: i64,
    pub table_count: i64,
    pub record_count: i64,
    pub storage_path: String,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub metadata: Option<BackupMetadata>,
}

#[derive(Debug, Clone)]
pub struct NewBackupEntry {
    pub backup_name: String,
    pub backup_type: BackupType,
    pub file_size_bytes: i64,
    pub table_count: i64,
    pub record_count: i64,
    pub storage_path: String,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub metadata: Option<BackupMetadata>,
}

impl NewBackupEntry {
    pub fn into_entry(self) -> BackupEntry {
        BackupEntry {
            id: Uuid::new_v4(),
            backup_name: self.backup_name,
            backup_type: self.backup_type,
            file_size_bytes: self.file_size_bytes,
            table_count: self.table_count,
            record_count: self.record_count,
            storage_path: self.storage_path,
            created_by: self.created_by,
            created_at: self.created_at,
            metadata: self.metadata,
        }
    }
}
