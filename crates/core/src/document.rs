use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::record::Record;

pub const FORMAT_VERSION: &str = "2.0";

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("snapshot document is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("snapshot document is not a JSON object")]
    NotAnObject,
    #[error("snapshot document is missing `{0}`")]
    MissingField(&'static str),
    #[error("table `{table}` must be an array of objects")]
    InvalidTable { table: String },
}

/// A full export: header plus every table's rows.
///
/// Tables are keyed by name. Unknown table names and unknown record fields are
/// carried as-is; only `formatVersion` and `createdAt` are required.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotDocument {
    pub format_version: String,
    pub created_at: String,
    pub tables: BTreeMap<String, Vec<Record>>,
}

impl SnapshotDocument {
    pub fn new(created_at: DateTime<Utc>) -> Self {
        Self {
            format_version: FORMAT_VERSION.to_owned(),
            created_at: created_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            tables: BTreeMap::new(),
        }
    }

    pub fn insert_table(&mut self, name: impl Into<String>, records: Vec<Record>) {
        self.tables.insert(name.into(), records);
    }

    /// Rows for `name`; an absent table and an empty one both read as empty.
    pub fn table(&self, name: &str) -> &[Record] {
        self.tables.get(name).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn record_count(&self) -> usize {
        self.tables.values().map(Vec::len).sum()
    }

    pub fn created_at_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.created_at)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }

    pub fn to_json_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Parses and validates raw document bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, FormatError> {
        let value: Value = serde_json::from_slice(bytes)?;
        validate(value)
    }
}

/// Accepts a document only when its header is complete.
///
/// Nothing beyond the header is checked: a `null` or missing table means there
/// is nothing to import for it. Table entries must still be arrays of objects,
/// since anything else cannot be replayed as rows.
pub fn validate(document: Value) -> Result<SnapshotDocument, FormatError> {
    let Value::Object(mut root) = document else {
        return Err(FormatError::NotAnObject);
    };

    let tables = match root.remove("tables") {
        Some(Value::Object(tables)) => tables,
        _ => return Err(FormatError::MissingField("tables")),
    };
    let format_version =
        header_field(&root, "formatVersion").ok_or(FormatError::MissingField("formatVersion"))?;
    let created_at =
        header_field(&root, "createdAt").ok_or(FormatError::MissingField("createdAt"))?;

    let mut parsed = BTreeMap::new();
    for (table, rows) in tables {
        let records = match rows {
            Value::Null => Vec::new(),
            Value::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    Value::Object(fields) => Ok(Record::from(fields)),
                    _ => Err(FormatError::InvalidTable {
                        table: table.clone(),
                    }),
                })
                .collect::<Result<Vec<_>, _>>()?,
            _ => return Err(FormatError::InvalidTable { table }),
        };
        parsed.insert(table, records);
    }

    Ok(SnapshotDocument {
        format_version,
        created_at,
        tables: parsed,
    })
}

fn header_field(root: &serde_json::Map<String, Value>, name: &str) -> Option<String> {
    match root.get(name) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_complete_header_and_unknown_tables() {
        let doc = validate(json!({
            "formatVersion": "2.0",
            "createdAt": "2026-01-02T03:04:05.000Z",
            "tables": {
                "profiles": [{"id": "p1", "extra": true}],
                "tickets": null,
                "from_the_future": []
            }
        }))
        .expect("valid");

        assert_eq!(doc.table("profiles").len(), 1);
        assert!(doc.table("tickets").is_empty());
        assert!(doc.table("never_exported").is_empty());
        assert_eq!(doc.record_count(), 1);
        assert!(doc.created_at_utc().is_some());
    }

    #[test]
    fn rejects_missing_header_fields() {
        let missing_created = validate(json!({"formatVersion": "2.0", "tables": {}}));
        assert!(matches!(
            missing_created,
            Err(FormatError::MissingField("createdAt"))
        ));

        let missing_version = validate(json!({"createdAt": "2026-01-01T00:00:00Z", "tables": {}}));
        assert!(matches!(
            missing_version,
            Err(FormatError::MissingField("formatVersion"))
        ));

        let missing_tables = validate(json!({"formatVersion": "2.0", "createdAt": "x"}));
        assert!(matches!(
            missing_tables,
            Err(FormatError::MissingField("tables"))
        ));

        let blank_version = validate(json!({"formatVersion": " ", "createdAt": "x", "tables": {}}));
        assert!(blank_version.is_err());
    }

    #[test]
    fn rejects_non_json_and_non_object_rows() {
        assert!(matches!(
            SnapshotDocument::from_slice(b"not json"),
            Err(FormatError::Malformed(_))
        ));
        let bad_rows = validate(json!({
            "formatVersion": "2.0",
            "createdAt": "x",
            "tables": {"profiles": [1, 2]}
        }));
        assert!(matches!(bad_rows, Err(FormatError::InvalidTable { .. })));
    }

    #[test]
    fn serializes_camel_case_header() {
        let created = DateTime::parse_from_rfc3339("2026-02-13T01:00:00Z")
            .expect("rfc3339")
            .with_timezone(&Utc);
        let mut doc = SnapshotDocument::new(created);
        doc.insert_table("profiles", vec![Record::new().with("id", "p1")]);

        let value: Value = serde_json::from_slice(&doc.to_json_bytes().expect("bytes")).expect("json");
        assert_eq!(value["formatVersion"], "2.0");
        assert_eq!(value["createdAt"], "2026-02-13T01:00:00.000Z");
        assert_eq!(value["tables"]["profiles"][0]["id"], "p1");

        let reparsed = SnapshotDocument::from_slice(&doc.to_json_bytes().expect("bytes")).expect("parse");
        assert_eq!(reparsed, doc);
    }
}
