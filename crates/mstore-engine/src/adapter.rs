//! Plain key/value facade over [`ManagedStorage`]

use crate::backend::{BackendRef, VersionSummary};
use crate::notify::{Callback, CallbackId, EVENT_DATA_CHANGED};
use crate::policy_cache::PolicyDecision;
use crate::storage::{HealthReport, ManagedStorage, StorageStats, WriteReport};
use mstore_common::{Fields, Result, Value};
use std::sync::Arc;
use std::time::Duration;

/// Versions returned by [`KeyValueAdapter::list_versions`]
const VERSION_LIST_LIMIT: usize = 10;

/// Key/value view of a managed store.
///
/// Writes fire the named `data_changed` event with `[key, old, new]`, where
/// `old` is `null` for a new key.
#[derive(Clone)]
pub struct KeyValueAdapter {
    storage: Arc<ManagedStorage>,
}

impl KeyValueAdapter {
    #[must_use]
    pub const fn new(storage: Arc<ManagedStorage>) -> Self {
        Self { storage }
    }

    #[must_use]
    pub fn storage(&self) -> &Arc<ManagedStorage> {
        &self.storage
    }

    pub fn add_backend(&self, name: impl Into<String>, backend: BackendRef, is_primary: bool) {
        self.storage.add_backend(name, backend, is_primary);
    }

    pub fn initialize(&self) -> Result<()> {
        self.storage.initialize()
    }

    pub async fn store_data(&self, key: &str, data: &Fields) -> WriteReport {
        let old = self.load_data(key).await;
        let report = self.storage.store_fields(key, data, None).await;
        self.storage
            .notifier()
            .trigger_event(
                EVENT_DATA_CHANGED,
                vec![Value::from(key), Value::from(old), Value::from(data.clone())],
            )
            .await;
        report
    }

    pub async fn load_data(&self, key: &str) -> Option<Fields> {
        self.storage.load_fields(key, None).await
    }

    pub async fn delete_data(&self, key: &str) -> bool {
        self.storage.delete_record(key).await
    }

    /// Cached keys starting with `prefix`, most recently used first
    #[must_use]
    pub fn list_keys(&self, prefix: &str) -> Vec<String> {
        self.storage
            .cached_keys()
            .into_iter()
            .filter(|key| key.starts_with(prefix))
            .collect()
    }

    pub async fn store_version(&self, key: &str, version_id: &str, data: Value) -> String {
        self.storage
            .store_version(key, data, None, Some(version_id.to_string()))
            .await
    }

    pub async fn load_version(&self, key: &str, version_id: Option<&str>) -> Option<Value> {
        self.storage.load_version(key, version_id).await
    }

    /// Recent versions, oldest first
    pub async fn list_versions(&self, key: &str) -> Vec<VersionSummary> {
        let mut versions = self.storage.list_versions(key, VERSION_LIST_LIMIT).await;
        versions.reverse();
        versions
    }

    pub fn store_relationship(&self, subject: &str, relation: &str, object: &str) {
        self.storage.add_relationship(subject, object, relation);
    }

    #[must_use]
    pub fn get_related(&self, id: &str, relation: &str, reverse: bool) -> Vec<String> {
        self.storage.get_relationships(id, relation, reverse)
    }

    pub fn remove_relationship(&self, subject: &str, relation: &str, object: &str) {
        self.storage.remove_relationship(subject, object, relation);
    }

    pub fn cache_policy_decision(
        &self,
        identity_id: &str,
        action: &str,
        resource: &str,
        decision: bool,
        reason: &str,
        ttl: Option<Duration>,
    ) {
        self.storage
            .cache_policy_decision(identity_id, action, resource, decision, reason, ttl);
    }

    #[must_use]
    pub fn get_cached_policy(&self, identity_id: &str, action: &str, resource: &str) -> Option<PolicyDecision> {
        self.storage.get_cached_policy_decision(identity_id, action, resource)
    }

    /// Register a callback for a named event such as `data_changed`
    pub fn on_event(&self, event_type: &str, callback: Callback<Vec<Value>>) -> CallbackId {
        self.storage.notifier().on_event(event_type, callback)
    }

    pub async fn check_health(&self) -> HealthReport {
        self.storage.check_health().await
    }

    #[must_use]
    pub fn statistics(&self) -> StorageStats {
        self.storage.statistics()
    }

    pub async fn cleanup(&self) {
        self.storage.cleanup().await;
    }
}
