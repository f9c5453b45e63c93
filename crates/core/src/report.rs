use serde::{Deserialize, Serialize};

use crate::backup::RestoreMode;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableSuccess {
    pub table: String,
    pub records_written: usize,
    pub records_skipped: usize,
    pub mode: RestoreMode,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableError {
    pub table: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableWarning {
    pub table: String,
    pub message: String,
}

/// Per-table outcome of one restore, in processing order.
///
/// Every table lands in exactly one of `success`, `errors` or `skipped`;
/// `warnings` is extra detail alongside those.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunReport {
    pub success: Vec<TableSuccess>,
    pub errors: Vec<TableError>,
    pub skipped: Vec<String>,
    pub warnings: Vec<TableWarning>,
}

impl RunReport {
    pub fn success_for(&self, table: &str) -> Option<&TableSuccess> {
        self.success.iter().find(|s| s.table == table)
    }

    pub fn error_for(&self, table: &str) -> Option<&TableError> {
        self.errors.iter().find(|e| e.table == table)
    }

    pub fn warnings_for<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a TableWarning> {
        self.warnings.iter().filter(move |w| w.table == table)
    }

    pub fn records_written(&self) -> usize {
        self.success.iter().map(|s| s.records_written).sum()
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct ReportBuilder {
    report: RunReport,
}

impl ReportBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn succeeded(
        &mut self,
        table: &str,
        records_written: usize,
        records_skipped: usize,
        mode: RestoreMode,
    ) {
        self.report.success.push(TableSuccess {
            table: table.to_owned(),
            records_written,
            records_skipped,
            mode,
        });
    }

    pub fn failed(&mut self, table: &str, error: impl Into<String>) {
        self.report.errors.push(TableError {
            table: table.to_owned(),
            error: error.into(),
        });
    }

    pub fn skipped(&mut self, table: &str) {
        self.report.skipped.push(table.to_owned());
    }

    pub fn warn(&mut self, table: &str, message: impl Into<String>) {
        self.report.warnings.push(TableWarning {
            table: table.to_owned(),
            message: message.into(),
        });
    }

    pub fn finish(self) -> RunReport {
        self.report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_appends_in_call_order() {
        let mut builder = ReportBuilder::new();
        builder.succeeded("profiles", 3, 0, RestoreMode::Replace);
        builder.skipped("skills");
        builder.warn("rating_approvals", "skipped 1 row(s)");
        builder.succeeded("rating_approvals", 4, 1, RestoreMode::Replace);
        builder.failed("tickets", "insert failed");
        let report = builder.finish();

        let tables: Vec<_> = report.success.iter().map(|s| s.table.as_str()).collect();
        assert_eq!(tables, vec!["profiles", "rating_approvals"]);
        assert_eq!(report.skipped, vec!["skills".to_owned()]);
        assert_eq!(report.records_written(), 7);
        assert_eq!(report.warnings_for("rating_approvals").count(), 1);
        assert_eq!(report.error_for("tickets").map(|e| e.error.as_str()), Some("insert failed"));
        assert!(report.has_errors());
    }
}
