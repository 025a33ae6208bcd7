//! Bounded per-key version history

use chrono::{DateTime, Utc};
use mstore_common::Value;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// A stored snapshot of a record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Version {
    pub version_id: String,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
}

/// Version listing entry, without the payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionSummary {
    pub version_id: String,
    pub timestamp: DateTime<Utc>,
    /// RFC 3339 rendering of `timestamp`
    pub datetime: String,
}

impl VersionSummary {
    #[must_use]
    pub fn new(version_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            version_id: version_id.into(),
            timestamp,
            datetime: timestamp.to_rfc3339(),
        }
    }
}

impl From<&Version> for VersionSummary {
    fn from(version: &Version) -> Self {
        Self::new(version.version_id.clone(), version.timestamp)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VersionStats {
    pub keys_with_versions: usize,
    pub total_versions: usize,
    pub average_versions_per_key: f64,
    /// Number of keys holding each version count
    pub distribution: BTreeMap<usize, usize>,
    pub max_versions_per_key: usize,
}

/// Default version id for a snapshot taken at `timestamp`
#[must_use]
pub fn default_version_id(timestamp: DateTime<Utc>) -> String {
    format!("v_{}", timestamp.timestamp_millis())
}

/// Keeps versions per key ascending by timestamp, newest `max_versions_per_key` only
pub struct VersionManager {
    max_versions_per_key: usize,
    versions: Mutex<HashMap<String, Vec<Version>>>,
}

impl VersionManager {
    #[must_use]
    pub fn new(max_versions_per_key: usize) -> Self {
        Self {
            max_versions_per_key: max_versions_per_key.max(1),
            versions: Mutex::new(HashMap::new()),
        }
    }

    /// Store a version and return its id.
    ///
    /// The timestamp defaults to now and the id to `v_<unix millis>`. Once the
    /// key holds more than the limit, the oldest versions are dropped.
    pub fn store_version(
        &self,
        key: &str,
        data: Value,
        timestamp: Option<DateTime<Utc>>,
        version_id: Option<String>,
    ) -> String {
        let timestamp = timestamp.unwrap_or_else(Utc::now);
        let version_id = version_id.unwrap_or_else(|| default_version_id(timestamp));

        let mut versions = self.versions.lock();
        let list = versions.entry(key.to_string()).or_default();
        // Ties keep insertion order
        let pos = list.partition_point(|v| v.timestamp <= timestamp);
        list.insert(
            pos,
            Version {
                version_id: version_id.clone(),
                timestamp,
                data,
            },
        );
        if list.len() > self.max_versions_per_key {
            let excess = list.len() - self.max_versions_per_key;
            list.drain(..excess);
        }

        version_id
    }

    /// Latest version's payload, or the exact `version_id` if given
    #[must_use]
    pub fn load_version(&self, key: &str, version_id: Option<&str>) -> Option<Value> {
        let versions = self.versions.lock();
        let list = versions.get(key)?;
        let version = match version_id {
            Some(id) => list.iter().find(|v| v.version_id == id),
            None => list.last(),
        };
        version.map(|v| v.data.clone())
    }

    /// Up to `limit` summaries, newest first
    #[must_use]
    pub fn list_versions(&self, key: &str, limit: usize) -> Vec<VersionSummary> {
        self.versions.lock().get(key).map_or_else(Vec::new, |list| {
            list.iter().rev().take(limit).map(VersionSummary::from).collect()
        })
    }

    /// Remove one version; true if it existed
    pub fn delete_version(&self, key: &str, version_id: &str) -> bool {
        let mut versions = self.versions.lock();
        let Some(list) = versions.get_mut(key) else {
            return false;
        };
        let before = list.len();
        list.retain(|v| v.version_id != version_id);
        let removed = list.len() != before;
        if list.is_empty() {
            versions.remove(key);
        }
        removed
    }

    /// Remove every version of a key, returning how many were dropped
    pub fn delete_all_versions(&self, key: &str) -> usize {
        self.versions.lock().remove(key).map_or(0, |list| list.len())
    }

    #[must_use]
    pub fn version_count(&self, key: &str) -> usize {
        self.versions.lock().get(key).map_or(0, Vec::len)
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> VersionStats {
        let versions = self.versions.lock();
        let keys_with_versions = versions.len();
        let mut total_versions = 0;
        let mut distribution = BTreeMap::new();
        for list in versions.values() {
            total_versions += list.len();
            *distribution.entry(list.len()).or_insert(0) += 1;
        }
        let average_versions_per_key = if keys_with_versions == 0 {
            0.0
        } else {
            total_versions as f64 / keys_with_versions as f64
        };

        VersionStats {
            keys_with_versions,
            total_versions,
            average_versions_per_key,
            distribution,
            max_versions_per_key: self.max_versions_per_key,
        }
    }

    pub fn clear(&self) {
        self.versions.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_bounded_history_keeps_newest() {
        let manager = VersionManager::new(2);
        manager.store_version("doc", Value::from("A"), Some(at(1)), Some("A".into()));
        manager.store_version("doc", Value::from("B"), Some(at(2)), Some("B".into()));
        manager.store_version("doc", Value::from("C"), Some(at(3)), Some("C".into()));

        let ids: Vec<_> = manager
            .list_versions("doc", 10)
            .into_iter()
            .map(|s| s.version_id)
            .collect();
        assert_eq!(ids, vec!["C", "B"]);
        assert_eq!(manager.load_version("doc", None), Some(Value::from("C")));
        assert!(manager.load_version("doc", Some("A")).is_none());
    }

    #[test]
    fn test_out_of_order_timestamps_stay_sorted() {
        let manager = VersionManager::new(5);
        manager.store_version("k", Value::from(2), Some(at(20)), Some("late".into()));
        manager.store_version("k", Value::from(1), Some(at(10)), Some("early".into()));
        manager.store_version("k", Value::from(3), Some(at(20)), Some("tie".into()));

        let ids: Vec<_> = manager
            .list_versions("k", 10)
            .into_iter()
            .map(|s| s.version_id)
            .collect();
        assert_eq!(ids, vec!["tie", "late", "early"]);
        assert_eq!(manager.load_version("k", None), Some(Value::from(3)));
    }

    #[test]
    fn test_default_id_and_summary() {
        let manager = VersionManager::new(3);
        let ts = at(0) + Duration::milliseconds(250);
        let id = manager.store_version("k", Value::Null, Some(ts), None);
        assert_eq!(id, "v_1700000000250");

        let summary = &manager.list_versions("k", 1)[0];
        assert_eq!(summary.timestamp, ts);
        assert_eq!(summary.datetime, ts.to_rfc3339());
    }

    #[test]
    fn test_delete_and_stats() {
        let manager = VersionManager::new(10);
        manager.store_version("a", Value::from(1), Some(at(1)), Some("1".into()));
        manager.store_version("a", Value::from(2), Some(at(2)), Some("2".into()));
        manager.store_version("b", Value::from(3), Some(at(3)), Some("3".into()));

        let stats = manager.stats();
        assert_eq!(stats.keys_with_versions, 2);
        assert_eq!(stats.total_versions, 3);
        assert!((stats.average_versions_per_key - 1.5).abs() < f64::EPSILON);
        assert_eq!(stats.distribution, BTreeMap::from([(1, 1), (2, 1)]));

        assert!(manager.delete_version("a", "1"));
        assert!(!manager.delete_version("a", "1"));
        assert_eq!(manager.version_count("a"), 1);

        assert_eq!(manager.delete_all_versions("a"), 1);
        assert_eq!(manager.version_count("a"), 0);
        assert_eq!(manager.list_versions("a", 5), Vec::new());

        manager.clear();
        assert_eq!(manager.stats().total_versions, 0);
    }
}
