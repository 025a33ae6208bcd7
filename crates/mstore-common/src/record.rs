//! Record data model
//!
//! A [`Record`] keeps caller-visible fields and orchestration metadata in
//! separate places, so metadata can never leak into a plain read or be
//! written to a backend.

use crate::value::{Fields, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Orchestration metadata stamped on every write
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Metadata {
    /// When the record was last written through the storage layer
    pub updated_at: Option<DateTime<Utc>>,
    /// Identity of the last writer, if one was supplied
    pub identity_id: Option<String>,
}

/// A single field whose value changed during a merge
#[derive(Debug, Clone, PartialEq)]
pub struct FieldChange {
    pub field: String,
    /// Previous value, `None` if the field did not exist
    pub old_value: Option<Value>,
    pub new_value: Value,
}

/// A cached record: user fields plus metadata
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Record {
    pub fields: Fields,
    pub metadata: Metadata,
}

impl Record {
    /// Create a record with no metadata
    #[must_use]
    pub fn new(fields: Fields) -> Self {
        Self {
            fields,
            metadata: Metadata {
                updated_at: None,
                identity_id: None,
            },
        }
    }

    /// Get a single field
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Shallow-merge `updates` into this record (last write wins per field).
    ///
    /// Returns the fields whose value actually changed, in field order.
    pub fn merge(&mut self, updates: &Fields) -> Vec<FieldChange> {
        let mut changes = Vec::new();
        for (field, new_value) in updates {
            let old_value = self.fields.insert(field.clone(), new_value.clone());
            if old_value.as_ref() != Some(new_value) {
                changes.push(FieldChange {
                    field: field.clone(),
                    old_value,
                    new_value: new_value.clone(),
                });
            }
        }
        changes
    }

    /// Stamp the write time and, if given, the writer identity
    pub fn stamp(&mut self, identity_id: Option<&str>) {
        self.metadata.updated_at = Some(Utc::now());
        if let Some(identity) = identity_id {
            self.metadata.identity_id = Some(identity.to_string());
        }
    }

    /// Copy of the requested fields that exist on this record
    #[must_use]
    pub fn select(&self, names: &[&str]) -> Fields {
        names
            .iter()
            .filter_map(|name| {
                self.fields
                    .get(*name)
                    .map(|value| ((*name).to_string(), value.clone()))
            })
            .collect()
    }

    /// Consume the record, dropping metadata
    #[must_use]
    pub fn into_fields(self) -> Fields {
        self.fields
    }
}

impl From<Fields> for Record {
    fn from(fields: Fields) -> Self {
        Self::new(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields;

    #[test]
    fn test_merge_reports_only_changed_fields() {
        let mut record = Record::new(fields! { "a" => 1, "b" => "x" });
        let changes = record.merge(&fields! { "a" => 1, "b" => "y", "c" => true });

        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].field, "b");
        assert_eq!(changes[0].old_value, Some(Value::from("x")));
        assert_eq!(changes[0].new_value, Value::from("y"));
        assert_eq!(changes[1].field, "c");
        assert_eq!(changes[1].old_value, None);

        assert_eq!(record.fields, fields! { "a" => 1, "b" => "y", "c" => true });
    }

    #[test]
    fn test_stamp_keeps_previous_identity() {
        let mut record = Record::default();
        record.stamp(Some("alice"));
        let first = record.metadata.updated_at;
        assert!(first.is_some());
        assert_eq!(record.metadata.identity_id.as_deref(), Some("alice"));

        record.stamp(None);
        assert_eq!(record.metadata.identity_id.as_deref(), Some("alice"));
        assert!(record.metadata.updated_at >= first);
    }

    #[test]
    fn test_select_skips_missing() {
        let record = Record::new(fields! { "a" => 1, "b" => 2 });
        assert_eq!(record.select(&["a", "zzz"]), fields! { "a" => 1 });
        assert!(record.select(&[]).is_empty());
    }
}
