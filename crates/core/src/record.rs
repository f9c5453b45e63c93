use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const ID_FIELD: &str = "id";
pub const ROLE_FIELD: &str = "role";
pub const STATUS_FIELD: &str = "status";
pub const CREATED_AT_FIELD: &str = "created_at";

/// A primary or foreign key value, compared as text so that `7` and `"7"`
/// written by different snapshot versions refer to the same row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrimaryKey(String);

impl PrimaryKey {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// `None` for null, booleans and containers, which never identify a row.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(Self(s.clone())),
            Value::Number(n) => Some(Self(n.to_string())),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PrimaryKey {
    fn from(raw: &str) -> Self {
        Self(raw.to_owned())
    }
}

/// One row. Fields are opaque except for the handful the normalizer and the
/// integrity filter read through the accessors below.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(field.into(), value.into());
        self
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_fields(self) -> Map<String, Value> {
        self.0
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn id(&self) -> Option<PrimaryKey> {
        self.key(ID_FIELD)
    }

    /// Key stored in `column`, if it holds a usable scalar.
    pub fn key(&self, column: &str) -> Option<PrimaryKey> {
        self.0.get(column).and_then(PrimaryKey::from_value)
    }

    pub fn role(&self) -> Option<&str> {
        self.str_field(ROLE_FIELD)
    }

    pub fn status(&self) -> Option<&str> {
        self.str_field(STATUS_FIELD)
    }

    pub fn created_at(&self) -> Option<&str> {
        self.str_field(CREATED_AT_FIELD)
    }

    pub(crate) fn set_str(&mut self, field: &str, value: &str) {
        self.0
            .insert(field.to_owned(), Value::String(value.to_owned()));
    }

    fn str_field(&self, field: &str) -> Option<&str> {
        self.0.get(field).and_then(Value::as_str)
    }
}

impl From<Map<String, Value>> for Record {
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numeric_and_string_keys_compare_equal() {
        let a = Record::new().with("id", 7);
        let b = Record::new().with("rating_id", "7");
        assert_eq!(a.id(), b.key("rating_id"));
    }

    #[test]
    fn null_and_missing_keys_are_none() {
        let r = Record::new().with("rating_id", Value::Null);
        assert_eq!(r.key("rating_id"), None);
        assert_eq!(r.id(), None);
    }

    #[test]
    fn unknown_fields_round_trip_untouched() {
        let raw = json!({"id": "u1", "nested": {"a": [1, 2]}, "role": "admin"});
        let record: Record = serde_json::from_value(raw.clone()).expect("record");
        assert_eq!(record.role(), Some("admin"));
        assert_eq!(serde_json::to_value(&record).expect("value"), raw);
    }
}
