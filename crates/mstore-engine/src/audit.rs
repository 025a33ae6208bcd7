//! In-memory audit trail
//!
//! Each record id has its own bounded log. Once a log exceeds
//! `max_entries_per_key`, the oldest entries are dropped.

use chrono::{DateTime, Utc};
use mstore_common::{AuditConfig, Value};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use uuid::Uuid;

/// Action recorded when `store_fields` changes a field
pub const ACTION_STORE: &str = "store_structured";
/// Action recorded when `update_fields` or `atomic_update` changes a field
pub const ACTION_WRITE: &str = "write";
/// Action recorded when a dirty record is flushed to a backend
pub const ACTION_SYNC: &str = "sync_to_backend";
/// Action recorded when a record is deleted
pub const ACTION_DELETE: &str = "delete";

/// What happened, as passed to [`AuditLogger::log`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuditEvent {
    pub action: String,
    pub field: Option<String>,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
    pub identity_id: Option<String>,
    pub context: BTreeMap<String, Value>,
}

impl AuditEvent {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    #[must_use]
    pub fn change(mut self, old_value: Option<Value>, new_value: Value) -> Self {
        self.old_value = old_value;
        self.new_value = Some(new_value);
        self
    }

    #[must_use]
    pub fn identity(mut self, identity_id: Option<&str>) -> Self {
        self.identity_id = identity_id.map(str::to_string);
        self
    }

    #[must_use]
    pub fn context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// A recorded audit entry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEntry {
    pub audit_id: String,
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub field: Option<String>,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
    pub identity_id: Option<String>,
    pub context: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditStats {
    pub enabled: bool,
    pub ids_with_audit: usize,
    pub total_entries: usize,
    pub max_entries_per_key: usize,
}

pub struct AuditLogger {
    enabled: bool,
    max_entries_per_key: usize,
    logs: Mutex<HashMap<String, VecDeque<AuditEntry>>>,
}

impl AuditLogger {
    #[must_use]
    pub fn new(enabled: bool, max_entries_per_key: usize) -> Self {
        Self {
            enabled,
            max_entries_per_key: max_entries_per_key.max(1),
            logs: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn from_config(config: &AuditConfig) -> Self {
        Self::new(config.enabled, config.max_entries_per_key)
    }

    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Append an entry to `id`'s log. Returns the new audit id, or `None`
    /// when auditing is disabled.
    pub fn log(&self, id: &str, event: AuditEvent) -> Option<String> {
        if !self.enabled {
            return None;
        }

        let audit_id = Uuid::new_v4().to_string();
        let entry = AuditEntry {
            audit_id: audit_id.clone(),
            timestamp: Utc::now(),
            action: event.action,
            field: event.field,
            old_value: event.old_value,
            new_value: event.new_value,
            identity_id: event.identity_id,
            context: event.context,
        };

        let mut logs = self.logs.lock();
        let log = logs.entry(id.to_string()).or_default();
        log.push_back(entry);
        while log.len() > self.max_entries_per_key {
            log.pop_front();
        }

        Some(audit_id)
    }

    /// Up to `limit` entries for `id`, most recent first, optionally only
    /// those at or after `since`
    #[must_use]
    pub fn get_log(&self, id: &str, limit: usize, since: Option<DateTime<Utc>>) -> Vec<AuditEntry> {
        let logs = self.logs.lock();
        let Some(log) = logs.get(id) else {
            return Vec::new();
        };
        log.iter()
            .rev()
            .filter(|entry| since.is_none_or(|since| entry.timestamp >= since))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn clear_log(&self, id: &str) {
        self.logs.lock().remove(id);
    }

    pub fn clear_all(&self) {
        self.logs.lock().clear();
    }

    #[must_use]
    pub fn stats(&self) -> AuditStats {
        let logs = self.logs.lock();
        AuditStats {
            enabled: self.enabled,
            ids_with_audit: logs.len(),
            total_entries: logs.values().map(VecDeque::len).sum(),
            max_entries_per_key: self.max_entries_per_key,
        }
    }
}

impl Default for AuditLogger {
    fn default() -> Self {
        Self::from_config(&AuditConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_and_read_newest_first() {
        let audit = AuditLogger::default();
        let first = audit
            .log(
                "doc",
                AuditEvent::new(ACTION_WRITE)
                    .field("status")
                    .change(None, Value::from("ready"))
                    .identity(Some("alice")),
            )
            .unwrap();
        let second = audit
            .log("doc", AuditEvent::new(ACTION_SYNC).context("backend", "primary"))
            .unwrap();
        assert_ne!(first, second);

        let log = audit.get_log("doc", 10, None);
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].audit_id, second);
        assert_eq!(log[0].context["backend"], Value::from("primary"));
        assert_eq!(log[1].field.as_deref(), Some("status"));
        assert_eq!(log[1].identity_id.as_deref(), Some("alice"));
        assert_eq!(log[1].old_value, None);

        assert_eq!(audit.get_log("doc", 1, None)[0].audit_id, second);
        assert!(audit.get_log("other", 10, None).is_empty());
    }

    #[test]
    fn test_bounded_per_key() {
        let audit = AuditLogger::new(true, 3);
        for i in 0..5 {
            audit.log("doc", AuditEvent::new(ACTION_WRITE).change(None, Value::from(i)));
        }

        let log = audit.get_log("doc", 10, None);
        let values: Vec<_> = log.iter().filter_map(|e| e.new_value.clone()).collect();
        assert_eq!(values, vec![Value::from(4), Value::from(3), Value::from(2)]);
    }

    #[test]
    fn test_since_filter() {
        let audit = AuditLogger::default();
        audit.log("doc", AuditEvent::new("old"));
        std::thread::sleep(std::time::Duration::from_millis(5));
        let cutoff = Utc::now();
        audit.log("doc", AuditEvent::new("new"));

        let log = audit.get_log("doc", 10, Some(cutoff));
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].action, "new");
    }

    #[test]
    fn test_disabled_records_nothing() {
        let audit = AuditLogger::new(false, 10);
        assert!(audit.log("doc", AuditEvent::new(ACTION_WRITE)).is_none());
        assert!(audit.get_log("doc", 10, None).is_empty());
        assert!(!audit.stats().enabled);
    }

    #[test]
    fn test_stats_and_clear() {
        let audit = AuditLogger::default();
        audit.log("a", AuditEvent::new(ACTION_WRITE));
        audit.log("a", AuditEvent::new(ACTION_WRITE));
        audit.log("b", AuditEvent::new(ACTION_DELETE));

        let stats = audit.stats();
        assert_eq!(stats.ids_with_audit, 2);
        assert_eq!(stats.total_entries, 3);
        assert_eq!(stats.max_entries_per_key, 1000);

        audit.clear_log("a");
        assert_eq!(audit.stats().total_entries, 1);
        audit.clear_all();
        assert_eq!(audit.stats().ids_with_audit, 0);
    }
}
