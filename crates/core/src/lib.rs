pub mod backup;
pub mod catalog;
pub mod document;
pub mod hash;
pub mod integrity;
pub mod normalize;
pub mod record;
pub mod report;

pub use backup::{BackupEntry, BackupMetadata, BackupType, NewBackupEntry, RestoreMode};
pub use catalog::{Catalog, CatalogError, ForeignKey, TableSpec};
pub use document::{validate, FormatError, SnapshotDocument, FORMAT_VERSION};
pub use hash::content_hash;
pub use integrity::{filter, AcceptedKeys, FilterOutcome};
pub use normalize::normalize;
pub use record::{PrimaryKey, Record};
pub use report::{ReportBuilder, RunReport, TableError, TableSuccess, TableWarning};
