use anyhow::{Context, Result};
use dbsnap_core::Record;
use dbsnap_storage::RelationalStore;
use tracing::debug;

/// Reads every row of `table`, one page at a time, ordered by `order_key`.
///
/// Stops on a short page, or once the reported total has been reached. The
/// page size is clamped to what the store accepts. On error nothing is
/// returned: a partially read table is never handed to the caller.
pub async fn read_all(
    store: &dyn RelationalStore,
    table: &str,
    order_key: &str,
    page_size: usize,
) -> Result<Vec<Record>> {
    let page_size = page_size.clamp(1, store.max_page_size().max(1));
    let mut rows = Vec::new();
    let mut total = None;
    let mut pages = 0usize;

    loop {
        let offset = rows.len();
        let page = store
            .range_read(table, order_key, offset, page_size)
            .await
            .with_context(|| format!("read {table} rows {offset}..{}", offset + page_size))?;
        pages += 1;
        total = total.or(page.total);

        let fetched = page.rows.len();
        rows.extend(page.rows);

        if fetched < page_size {
            break;
        }
        if total.is_some_and(|total| rows.len() as u64 >= total) {
            break;
        }
    }

    debug!(table, rows = rows.len(), pages, "table read");
    Ok(rows)
}
