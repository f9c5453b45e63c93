//! In-process stores, for tests and dry runs. The relational store can be told
//! to fail specific operations so partial-failure paths can be exercised.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{anyhow, bail, Result};
use dbsnap_core::{PrimaryKey, Record};

use crate::object::ObjectStore;
use crate::relational::{Page, RelationalStore, Written, MAX_PAGE_SIZE};

#[derive(Debug, Default)]
struct Faults {
    reads: HashSet<String>,
    clears: HashSet<String>,
    poisoned: HashMap<String, HashSet<PrimaryKey>>,
}

#[derive(Debug)]
pub struct MemoryRelationalStore {
    tables: Mutex<BTreeMap<String, Vec<Record>>>,
    faults: Mutex<Faults>,
    max_page_size: usize,
    report_totals: bool,
}

impl Default for MemoryRelationalStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRelationalStore {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(BTreeMap::new()),
            faults: Mutex::new(Faults::default()),
            max_page_size: MAX_PAGE_SIZE,
            report_totals: false,
        }
    }

    pub fn with_max_page_size(mut self, max: usize) -> Self {
        self.max_page_size = max.max(1);
        self
    }

    /// Report the table size on the first page, like a counting backend.
    pub fn with_totals(mut self) -> Self {
        self.report_totals = true;
        self
    }

    /// Creates `table` (empty) if it does not exist yet.
    pub fn create_table(&self, table: &str) {
        lock(&self.tables).entry(table.to_owned()).or_default();
    }

    pub fn seed(&self, table: &str, rows: Vec<Record>) {
        lock(&self.tables)
            .entry(table.to_owned())
            .or_default()
            .extend(rows);
    }

    pub fn rows(&self, table: &str) -> Vec<Record> {
        lock(&self.tables).get(table).cloned().unwrap_or_default()
    }

    pub fn count(&self, table: &str) -> usize {
        lock(&self.tables).get(table).map_or(0, Vec::len)
    }

    pub fn fail_reads(&self, table: &str) {
        lock(&self.faults).reads.insert(table.to_owned());
    }

    pub fn fail_clears(&self, table: &str) {
        lock(&self.faults).clears.insert(table.to_owned());
    }

    /// Any write batch containing a row with this key fails as a whole.
    pub fn poison(&self, table: &str, key: impl Into<PrimaryKey>) {
        lock(&self.faults)
            .poisoned
            .entry(table.to_owned())
            .or_default()
            .insert(key.into());
    }

    fn check_batch(&self, table: &str, key: &str, rows: &[Record]) -> Result<()> {
        let faults = lock(&self.faults);
        if let Some(poisoned) = faults.poisoned.get(table) {
            if let Some(bad) = rows
                .iter()
                .filter_map(|r| r.key(key))
                .find(|k| poisoned.contains(k))
            {
                bail!("write rejected for {table} row {bad}");
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl RelationalStore for MemoryRelationalStore {
    fn max_page_size(&self) -> usize {
        self.max_page_size
    }

    /// Pages in insertion order; `_order_key` is not consulted.
    async fn range_read(
        &self,
        table: &str,
        _order_key: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Page> {
        if lock(&self.faults).reads.contains(table) {
            bail!("read failed for {table}");
        }
        let tables = lock(&self.tables);
        let rows = tables
            .get(table)
            .ok_or_else(|| anyhow!("table {table} does not exist"))?;
        let limit = limit.min(self.max_page_size);
        let page = rows.iter().skip(offset).take(limit).cloned().collect();
        let total = (self.report_totals && offset == 0).then_some(rows.len() as u64);
        Ok(Page { rows: page, total })
    }

    async fn delete_all(&self, table: &str) -> Result<u64> {
        if lock(&self.faults).clears.contains(table) {
            bail!("delete failed for {table}");
        }
        let mut tables = lock(&self.tables);
        let rows = tables
            .get_mut(table)
            .ok_or_else(|| anyhow!("table {table} does not exist"))?;
        let removed = rows.len() as u64;
        rows.clear();
        Ok(removed)
    }

    async fn insert_batch(
        &self,
        table: &str,
        key: &str,
        rows: &[Record],
    ) -> Result<Written> {
        self.check_batch(table, key, rows)?;
        let mut tables = lock(&self.tables);
        let existing = tables
            .get_mut(table)
            .ok_or_else(|| anyhow!("table {table} does not exist"))?;

        let mut seen: HashSet<PrimaryKey> = existing.iter().filter_map(|r| r.key(key)).collect();
        for row in rows {
            if let Some(pk) = row.key(key) {
                if !seen.insert(pk.clone()) {
                    bail!("duplicate key {pk} in {table}");
                }
            }
        }
        existing.extend(rows.iter().cloned());
        Ok(Written {
            rows: rows.len(),
            keys: rows.iter().filter_map(|r| r.key(key)).collect(),
        })
    }

    async fn upsert_batch(
        &self,
        table: &str,
        conflict_key: &str,
        rows: &[Record],
    ) -> Result<Written> {
        self.check_batch(table, conflict_key, rows)?;
        let mut tables = lock(&self.tables);
        let existing = tables
            .get_mut(table)
            .ok_or_else(|| anyhow!("table {table} does not exist"))?;

        let mut written = Written::default();
        for row in rows {
            let pk = row.key(conflict_key);
            let slot = pk
                .as_ref()
                .and_then(|pk| existing.iter().position(|r| r.key(conflict_key).as_ref() == Some(pk)));
            match slot {
                Some(idx) => existing[idx] = row.clone(),
                None => existing.push(row.clone()),
            }
            written.rows += 1;
            written.keys.extend(pk);
        }
        Ok(written)
    }
}

#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    fail_removals: Mutex<bool>,
    fail_puts: Mutex<bool>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_removals(&self, fail: bool) {
        *lock(&self.fail_removals) = fail;
    }

    pub fn fail_puts(&self, fail: bool) {
        *lock(&self.fail_puts) = fail;
    }

    pub fn paths(&self) -> Vec<String> {
        lock(&self.objects).keys().cloned().collect()
    }
}

#[async_trait::async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(
        &self,
        path: &str,
        bytes: Vec<u8>,
        _content_type: &str,
        fail_if_exists: bool,
    ) -> Result<()> {
        if *lock(&self.fail_puts) {
            bail!("upload rejected: {path}");
        }
        let mut objects = lock(&self.objects);
        if fail_if_exists && objects.contains_key(path) {
            bail!("object already exists: {path}");
        }
        objects.insert(path.to_owned(), bytes);
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        Ok(lock(&self.objects).get(path).cloned())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(lock(&self.objects)
            .keys()
            .filter(|p| p.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn remove_many(&self, paths: &[String]) -> Result<()> {
        if *lock(&self.fail_removals) {
            bail!("bucket refused removal of {} object(s)", paths.len());
        }
        let mut objects = lock(&self.objects);
        for path in paths {
            objects.remove(path);
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
