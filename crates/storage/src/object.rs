use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};

/// Bucket-style storage for serialized snapshot documents.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` at `path`. With `fail_if_exists`, an existing object is
    /// an error and is left untouched.
    async fn put(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
        fail_if_exists: bool,
    ) -> Result<()>;

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>>;

    /// Paths under `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Remove every path. Missing objects are not an error; any other failure
    /// is reported after all removals have been attempted.
    async fn remove_many(&self, paths: &[String]) -> Result<()>;
}

/// Objects as files under a root directory. Content types are not persisted.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("create object root: {}", root.display()))?;
        Ok(Self { root })
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        if path.is_empty() || !relative.components().all(|c| matches!(c, Component::Normal(_))) {
            bail!("invalid object path: {path:?}");
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait::async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(
        &self,
        path: &str,
        bytes: Vec<u8>,
        _content_type: &str,
        fail_if_exists: bool,
    ) -> Result<()> {
        let target = self.resolve(path)?;
        tokio::task::spawn_blocking(move || {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create object dir: {}", parent.display()))?;
            }
            let mut options = OpenOptions::new();
            options.write(true);
            if fail_if_exists {
                options.create_new(true);
            } else {
                options.create(true).truncate(true);
            }
            let mut file = options
                .open(&target)
                .with_context(|| format!("open object for write: {}", target.display()))?;
            file.write_all(&bytes)
                .with_context(|| format!("write object: {}", target.display()))?;
            file.sync_all()
                .with_context(|| format!("sync object: {}", target.display()))?;
            Ok(())
        })
        .await?
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let target = self.resolve(path)?;
        tokio::task::spawn_blocking(move || match fs::read(&target) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("read object: {}", target.display())),
        })
        .await?
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let root = self.root.clone();
        let prefix = prefix.to_owned();
        tokio::task::spawn_blocking(move || {
            let mut found = Vec::new();
            walk(&root, &root, &mut found)?;
            found.retain(|p| p.starts_with(&prefix));
            found.sort();
            Ok(found)
        })
        .await?
    }

    async fn remove_many(&self, paths: &[String]) -> Result<()> {
        let targets = paths
            .iter()
            .map(|p| self.resolve(p).map(|t| (p.clone(), t)))
            .collect::<Result<Vec<_>>>()?;
        tokio::task::spawn_blocking(move || {
            let mut failures = Vec::new();
            for (path, target) in targets {
                match fs::remove_file(&target) {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => failures.push(format!("{path}: {e}")),
                }
            }
            if !failures.is_empty() {
                bail!("failed to remove objects: {}", failures.join("; "));
            }
            Ok(())
        })
        .await?
    }
}

fn walk(root: &Path, dir: &Path, found: &mut Vec<String>) -> Result<()> {
    for entry in fs::read_dir(dir).with_context(|| format!("list {}", dir.display()))? {
        let path = entry?.path();
        if path.is_dir() {
            walk(root, &path, found)?;
        } else if let Ok(relative) = path.strip_prefix(root) {
            let key: Vec<_> = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            found.push(key.join("/"));
        }
    }
    Ok(())
}
