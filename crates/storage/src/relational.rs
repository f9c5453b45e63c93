use anyhow::{bail, Result};
use dbsnap_core::{PrimaryKey, Record};

/// Row ceiling the hosted store enforces per request.
pub const MAX_PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone, Default)]
pub struct Page {
    pub rows: Vec<Record>,
    /// Total rows in the table, when the backend reports it.
    pub total: Option<u64>,
}

/// Outcome of one batch write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Written {
    /// Rows the store actually wrote. Rows it had no column for are not counted.
    pub rows: usize,
    /// Key values of the written rows that carry one.
    pub keys: Vec<PrimaryKey>,
}

/// Row-level access to the live database being exported or restored.
#[async_trait::async_trait]
pub trait RelationalStore: Send + Sync {
    /// Largest `limit` honoured by `range_read`.
    fn max_page_size(&self) -> usize {
        MAX_PAGE_SIZE
    }

    /// Rows `[offset, offset + limit)`, ordered by `order_key`.
    async fn range_read(
        &self,
        table: &str,
        order_key: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Page>;

    /// Delete every row, returning how many were removed.
    async fn delete_all(&self, table: &str) -> Result<u64>;

    /// Plain insert of one batch; the batch fails as a whole.
    async fn insert_batch(&self, table: &str, key: &str, rows: &[Record]) -> Result<Written>;

    /// Insert-or-update by `conflict_key`.
    async fn upsert_batch(
        &self,
        table: &str,
        conflict_key: &str,
        rows: &[Record],
    ) -> Result<Written>;
}

/// Quotes a table or column name for interpolation into SQL.
///
/// Names come from snapshot documents, so anything beyond plain identifiers
/// is refused rather than escaped.
pub(crate) fn quote_ident(name: &str) -> Result<String> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        bail!("refusing unsafe identifier: {name:?}");
    }
    Ok(format!("\"{name}\""))
}

/// Union of field names across `rows`, in first-seen order, limited to
/// `known` columns of the target table.
pub(crate) fn shared_columns(rows: &[Record], known: &[String]) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    for row in rows {
        for field in row.fields().keys() {
            if known.iter().any(|k| k == field) && !columns.iter().any(|c| c == field) {
                columns.push(field.clone());
            }
        }
    }
    columns
}

/// Splits `rows` into runs that share one set of `known` columns, keeping
/// first-seen order. Rows with no known column are left out.
pub(crate) fn column_groups<'a>(
    rows: &'a [Record],
    known: &[String],
) -> Vec<(Vec<String>, Vec<&'a Record>)> {
    let mut groups: Vec<(Vec<String>, Vec<&'a Record>)> = Vec::new();
    for row in rows {
        let columns = shared_columns(std::slice::from_ref(row), known);
        if columns.is_empty() {
            continue;
        }
        let existing = groups.iter_mut().find(|(cols, _)| {
            cols.len() == columns.len() && cols.iter().all(|c| columns.contains(c))
        });
        match existing {
            Some((_, members)) => members.push(row),
            None => groups.push((columns, vec![row])),
        }
    }
    groups
}
