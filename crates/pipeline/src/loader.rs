//! Replays a snapshot document into the target store, table by table.
//!
//! Per table, in catalog order:
//!
//! ```text
//! Skipped                                   (no rows in the document)
//! Clearing -> Transforming -> Filtering -> Loading -> Succeeded | Failed
//! (replace)                  (dependency-sensitive tables only)
//! ```
//!
//! Keys written by each batch are recorded before the next table starts, so
//! a dependent table is always filtered against its parent's final key set.

use std::collections::HashSet;

use dbsnap_core::{
    filter, normalize, AcceptedKeys, Catalog, Record, ReportBuilder, RestoreMode, RunReport,
    SnapshotDocument, TableSpec,
};
use dbsnap_storage::RelationalStore;
use tracing::{debug, error, info, warn};

use crate::reader::read_all;

pub struct BatchLoader<'a> {
    store: &'a dyn RelationalStore,
    catalog: &'a Catalog,
    batch_size: usize,
    page_size: usize,
}

/// State that lives for one restore run.
struct Run {
    mode: RestoreMode,
    accepted: AcceptedKeys,
    seeded: HashSet<String>,
    report: ReportBuilder,
}

impl<'a> BatchLoader<'a> {
    pub fn new(
        store: &'a dyn RelationalStore,
        catalog: &'a Catalog,
        batch_size: usize,
        page_size: usize,
    ) -> Self {
        Self {
            store,
            catalog,
            batch_size: batch_size.max(1),
            page_size,
        }
    }

    pub async fn restore(&self, document: &SnapshotDocument, mode: RestoreMode) -> RunReport {
        let mut run = Run {
            mode,
            accepted: AcceptedKeys::new(),
            seeded: HashSet::new(),
            report: ReportBuilder::new(),
        };

        for table in self.catalog.tables() {
            self.load_table(table, document.table(&table.name), &mut run)
                .await;
        }

        for unknown in document
            .tables
            .keys()
            .filter(|name| self.catalog.get(name).is_none())
        {
            warn!(table = %unknown, "snapshot table is not in the catalog; ignored");
            run.report
                .warn(unknown, "table is not in the catalog and was not restored");
        }

        run.report.finish()
    }

    async fn load_table(&self, table: &TableSpec, rows: &[Record], run: &mut Run) {
        let name = table.name.as_str();
        if rows.is_empty() {
            debug!(table = name, "no rows in snapshot; skipped");
            run.report.skipped(name);
            return;
        }

        if run.mode == RestoreMode::Replace {
            if let Err(e) = self.store.delete_all(name).await {
                error!(table = name, error = %format!("{e:#}"), "clearing table failed");
                run.report.failed(name, format!("clearing existing rows failed: {e:#}"));
                return;
            }
        }

        let records: Vec<Record> = rows.iter().cloned().map(|r| normalize(name, r)).collect();

        let (records, skipped) = if table.is_dependency_sensitive() {
            if run.mode == RestoreMode::Merge {
                self.seed_existing_parents(table, run).await;
            }
            let outcome = filter(table, records, &run.accepted);
            if let Some(message) = outcome.warning {
                warn!(table = name, skipped = outcome.skipped, "dropped rows with dangling references");
                run.report.warn(name, message);
            }
            (outcome.kept, outcome.skipped)
        } else {
            (records, 0)
        };

        let total_batches = records.len().div_ceil(self.batch_size);
        let mut written = 0usize;
        let mut unwritten = 0usize;
        let mut failed_batches = 0usize;
        let mut failed_rows = 0usize;

        for (idx, batch) in records.chunks(self.batch_size).enumerate() {
            let result = match run.mode {
                RestoreMode::Replace => {
                    self.store
                        .insert_batch(name, &table.primary_key, batch)
                        .await
                }
                RestoreMode::Merge => {
                    self.store
                        .upsert_batch(name, &table.primary_key, batch)
                        .await
                }
            };

            match result {
                Ok(outcome) => {
                    written += outcome.rows;
                    unwritten += batch.len().saturating_sub(outcome.rows);
                    run.accepted.accept(name, outcome.keys);
                }
                Err(e) if run.mode == RestoreMode::Replace => {
                    error!(
                        table = name,
                        batch = idx + 1,
                        written,
                        error = %format!("{e:#}"),
                        "insert failed; abandoning table"
                    );
                    run.report.failed(
                        name,
                        format!(
                            "insert failed on batch {} of {total_batches}; {written} of {} record(s) \
                             were written and remain: {e:#}",
                            idx + 1,
                            records.len()
                        ),
                    );
                    return;
                }
                Err(e) => {
                    warn!(
                        table = name,
                        batch = idx + 1,
                        error = %format!("{e:#}"),
                        "upsert failed; continuing with next batch"
                    );
                    failed_batches += 1;
                    failed_rows += batch.len();
                }
            }
        }

        if failed_batches > 0 {
            run.report.warn(
                name,
                format!(
                    "{failed_batches} of {total_batches} batch(es) failed to upsert; \
                     {failed_rows} record(s) not written"
                ),
            );
        }

        if unwritten > 0 {
            warn!(table = name, unwritten, "store wrote fewer rows than it was given");
            run.report.warn(
                name,
                format!("{unwritten} record(s) were not written by the store"),
            );
        }

        let skipped = skipped + unwritten;
        info!(table = name, written, skipped, mode = %run.mode, "table restored");
        run.report.succeeded(name, written, skipped, run.mode);
    }

    /// In merge mode rows already in the target are valid parents too, so
    /// their keys join the index. Each parent is read at most once per run.
    async fn seed_existing_parents(&self, table: &TableSpec, run: &mut Run) {
        for fk in table.enforced_keys() {
            if !run.seeded.insert(fk.parent.clone()) {
                continue;
            }
            let Some(parent) = self.catalog.get(&fk.parent) else {
                continue;
            };
            let existing =
                read_all(self.store, &parent.name, &parent.primary_key, self.page_size).await;
            match existing {
                Ok(rows) => {
                    let keys = rows.iter().filter_map(|r| r.key(&parent.primary_key));
                    run.accepted.accept(&parent.name, keys);
                }
                Err(e) => {
                    warn!(
                        table = %table.name,
                        parent = %parent.name,
                        error = %format!("{e:#}"),
                        "reading existing parent rows failed"
                    );
                    run.report.warn(
                        &table.name,
                        format!(
                            "could not read existing {} rows to check references: {e:#}",
                            parent.name
                        ),
                    );
                }
            }
        }
    }
}
