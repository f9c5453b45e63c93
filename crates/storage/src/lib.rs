pub mod memory;
pub mod object;
pub mod postgres_relational;
pub mod postgres_store;
pub mod relational;
pub mod sqlite_relational;
pub mod sqlite_store;
pub mod store;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

pub use memory::{MemoryObjectStore, MemoryRelationalStore};
pub use object::{FsObjectStore, ObjectStore};
pub use relational::{Page, RelationalStore, Written, MAX_PAGE_SIZE};
pub use store::MetadataStore;

/// History catalog: Postgres when a URL is given, otherwise SQLite under
/// `<root>/state/metadata.db`.
pub async fn open_metadata_store(
    root: &Path,
    database_url: Option<&str>,
) -> Result<Arc<dyn MetadataStore>> {
    match database_url {
        Some(url) if is_postgres_url(url) => {
            Ok(Arc::new(postgres_store::PostgresStore::new(url).await?))
        }
        _ => {
            let state = root.join("state");
            std::fs::create_dir_all(&state).context("create state directory")?;
            Ok(Arc::new(sqlite_store::SqliteStore::new(
                state.join("metadata.db"),
            )?))
        }
    }
}

/// The database being backed up: a Postgres URL or a SQLite file path.
pub async fn open_relational_store(source: &str) -> Result<Arc<dyn RelationalStore>> {
    if is_postgres_url(source) {
        Ok(Arc::new(
            postgres_relational::PostgresRelationalStore::new(source).await?,
        ))
    } else {
        let path = source.strip_prefix("sqlite://").unwrap_or(source);
        Ok(Arc::new(sqlite_relational::SqliteRelationalStore::new(
            path.into(),
        )))
    }
}

/// Snapshot documents live under `<root>/backups`.
pub fn open_object_store(root: &Path) -> Result<Arc<dyn ObjectStore>> {
    Ok(Arc::new(FsObjectStore::new(root.join("backups"))?))
}

fn is_postgres_url(url: &str) -> bool {
    url.starts_with("postgres://") || url.starts_with("postgresql://")
}
