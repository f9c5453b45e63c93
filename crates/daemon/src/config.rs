use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub source: SourceConfig,
    pub backup: BackupConfig,
    pub security: SecurityConfig,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct StorageConfig {
    /// Snapshot objects and the SQLite history catalog live under here.
    pub root: Option<String>,
    /// Postgres URL for the history catalog instead of SQLite.
    pub metadata_url: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct SourceConfig {
    /// The database being backed up: a Postgres URL or a SQLite path.
    pub database_url: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct BackupConfig {
    pub retention_count: Option<usize>,
    pub interval_hours: Option<u64>,
    pub page_size: Option<usize>,
    pub batch_size: Option<usize>,
    pub require_owner: Option<bool>,
    /// Cap on uploaded snapshots, compressed or not.
    pub max_upload_bytes: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct SecurityConfig {
    pub api_token: Option<String>,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("reading config file {path:?}"))?;
    toml::from_str(&contents).with_context(|| format!("parsing config file {path:?}"))
}
