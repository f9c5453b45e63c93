use std::collections::{HashMap, HashSet};

use crate::catalog::TableSpec;
use crate::record::{PrimaryKey, Record};

/// Primary keys written per table during one restore run.
#[derive(Debug, Default, Clone)]
pub struct AcceptedKeys {
    tables: HashMap<String, HashSet<PrimaryKey>>,
}

impl AcceptedKeys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept<I>(&mut self, table: &str, keys: I)
    where
        I: IntoIterator<Item = PrimaryKey>,
    {
        self.tables
            .entry(table.to_owned())
            .or_default()
            .extend(keys);
    }

    pub fn contains(&self, table: &str, key: &PrimaryKey) -> bool {
        self.tables
            .get(table)
            .is_some_and(|keys| keys.contains(key))
    }

    pub fn count(&self, table: &str) -> usize {
        self.tables.get(table).map_or(0, HashSet::len)
    }
}

#[derive(Debug)]
pub struct FilterOutcome {
    pub kept: Vec<Record>,
    pub skipped: usize,
    /// One line for the whole table, present only when rows were dropped.
    pub warning: Option<String>,
}

/// Drops rows whose enforced foreign key points at a row not accepted in this
/// run. Null keys are not references and pass through.
pub fn filter(table: &TableSpec, records: Vec<Record>, accepted: &AcceptedKeys) -> FilterOutcome {
    let enforced: Vec<_> = table.enforced_keys().collect();
    if enforced.is_empty() {
        return FilterOutcome {
            kept: records,
            skipped: 0,
            warning: None,
        };
    }

    let mut dropped_by = vec![0usize; enforced.len()];
    let mut kept = Vec::with_capacity(records.len());
    for record in records {
        let dangling = enforced.iter().position(|fk| {
            record
                .key(&fk.column)
                .is_some_and(|key| !accepted.contains(&fk.parent, &key))
        });
        match dangling {
            Some(idx) => dropped_by[idx] += 1,
            None => kept.push(record),
        }
    }

    let skipped: usize = dropped_by.iter().sum();
    let warning = (skipped > 0).then(|| {
        let relations: Vec<String> = enforced
            .iter()
            .zip(&dropped_by)
            .filter(|(_, n)| **n > 0)
            .map(|(fk, n)| format!("{n} via {}.{} -> {}", table.name, fk.column, fk.parent))
            .collect();
        format!(
            "skipped {skipped} row(s) referencing rows not restored in this run ({})",
            relations.join(", ")
        )
    });

    FilterOutcome {
        kept,
        skipped,
        warning,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn approvals() -> TableSpec {
        TableSpec::new("rating_approvals")
            .requires("rating_id", "employee_ratings")
            .references("approver_id", "profiles")
    }

    fn approval(id: i64, rating: Value) -> Record {
        Record::new()
            .with("id", id)
            .with("rating_id", rating)
            .with("approver_id", "nobody")
    }

    #[test]
    fn keeps_rows_whose_parent_was_accepted() {
        let mut accepted = AcceptedKeys::new();
        accepted.accept("employee_ratings", ["r1", "r2"].map(PrimaryKey::from));

        let out = filter(
            &approvals(),
            vec![
                approval(1, "r1".into()),
                approval(2, "r2".into()),
                approval(3, "gone".into()),
            ],
            &accepted,
        );

        assert_eq!(out.kept.len(), 2);
        assert_eq!(out.skipped, 1);
        let warning = out.warning.expect("warning");
        assert!(warning.contains("skipped 1 row(s)"));
        assert!(warning.contains("rating_approvals.rating_id -> employee_ratings"));
    }

    #[test]
    fn empty_parent_drops_every_row() {
        let out = filter(
            &approvals(),
            (0..4).map(|i| approval(i, format!("r{i}").into())).collect(),
            &AcceptedKeys::new(),
        );
        assert!(out.kept.is_empty());
        assert_eq!(out.skipped, 4);
        assert!(out.warning.is_some());
    }

    #[test]
    fn null_reference_and_unenforced_columns_pass() {
        let out = filter(
            &approvals(),
            vec![approval(1, Value::Null)],
            &AcceptedKeys::new(),
        );
        assert_eq!(out.kept.len(), 1);
        assert_eq!(out.skipped, 0);
        assert!(out.warning.is_none());
    }

    #[test]
    fn tables_without_enforced_keys_are_untouched() {
        let table = TableSpec::new("tickets").references("created_by", "profiles");
        let rows = vec![Record::new().with("id", 1).with("created_by", "ghost")];
        let out = filter(&table, rows.clone(), &AcceptedKeys::new());
        assert_eq!(out.kept, rows);
        assert!(out.warning.is_none());
    }
}
