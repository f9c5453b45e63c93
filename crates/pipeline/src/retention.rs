use std::collections::HashSet;

use anyhow::{Context, Result};
use dbsnap_core::BackupType;
use dbsnap_storage::{MetadataStore, ObjectStore};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

/// What an eviction pass removed, and which half failed if any.
///
/// Storage removal and history deletion run as two independent phases: a
/// storage failure is recorded but the history rows are still deleted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetentionOutcome {
    pub evicted: Vec<Uuid>,
    pub storage_error: Option<String>,
    pub metadata_error: Option<String>,
}

impl RetentionOutcome {
    pub fn is_clean(&self) -> bool {
        self.storage_error.is_none() && self.metadata_error.is_none()
    }
}

/// Keeps the newest `keep` entries of `backup_type` and evicts the rest.
pub async fn enforce_retention(
    objects: &dyn ObjectStore,
    metadata: &dyn MetadataStore,
    backup_type: BackupType,
    keep: usize,
) -> Result<RetentionOutcome> {
    let mut entries = metadata
        .list_backups(Some(backup_type))
        .await
        .with_context(|| format!("list {backup_type} backups"))?;
    // Listing order is not trusted; ties broken by id for determinism.
    entries.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));

    let doomed: Vec<_> = entries.into_iter().skip(keep).collect();
    if doomed.is_empty() {
        return Ok(RetentionOutcome::default());
    }

    let paths: Vec<String> = doomed.iter().map(|e| e.storage_path.clone()).collect();
    let ids: Vec<Uuid> = doomed.iter().map(|e| e.id).collect();
    let mut outcome = RetentionOutcome {
        evicted: ids.clone(),
        ..RetentionOutcome::default()
    };

    if let Err(e) = objects.remove_many(&paths).await {
        warn!(%backup_type, count = paths.len(), error = %format!("{e:#}"), "removing evicted snapshots failed");
        outcome.storage_error = Some(format!("{e:#}"));
    }

    match metadata.delete_entries(&ids).await {
        Ok(removed) => info!(%backup_type, removed, keep, "retention evicted old backups"),
        Err(e) => {
            warn!(%backup_type, count = ids.len(), error = %format!("{e:#}"), "deleting evicted history rows failed");
            outcome.metadata_error = Some(format!("{e:#}"));
        }
    }

    Ok(outcome)
}

/// Deletes history entries whose stored document no longer exists.
pub async fn sweep_dangling_entries(
    objects: &dyn ObjectStore,
    metadata: &dyn MetadataStore,
) -> Result<usize> {
    let stored: HashSet<String> = objects
        .list("")
        .await
        .context("list stored snapshots")?
        .into_iter()
        .collect();
    let dangling: Vec<Uuid> = metadata
        .list_backups(None)
        .await
        .context("list backup history")?
        .into_iter()
        .filter(|e| !stored.contains(&e.storage_path))
        .map(|e| e.id)
        .collect();

    if dangling.is_empty() {
        return Ok(0);
    }
    let removed = metadata
        .delete_entries(&dangling)
        .await
        .context("delete dangling history rows")?;
    info!(removed, "swept history entries without a stored snapshot");
    Ok(removed as usize)
}
