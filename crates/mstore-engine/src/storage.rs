//! Managed storage: cached records reconciled with durable backends
//!
//! [`ManagedStorage`] owns the record cache, the dirty set, the registered
//! backends and the satellites (versions, relationships, policy decisions,
//! audit trail, change notifications).
//!
//! The cache is the authoritative view. Depending on the [`SyncStrategy`],
//! writes are pushed to every backend immediately (write-through) or marked
//! dirty and flushed to the primary backend later (write-back). Only
//! read-through strategies consult the primary backend on a cache miss.

use crate::audit::{ACTION_DELETE, ACTION_STORE, ACTION_WRITE, AuditEntry, AuditEvent, AuditLogger, AuditStats};
use crate::backend::{BackendRef, VersionSummary};
use crate::key_lock::{KeyGuard, KeyLocks};
use crate::lru::{LruCache, LruStats};
use crate::notify::{Callback, CallbackId, ChangeEvent, ChangeNotifier};
use crate::policy_cache::{PolicyCache, PolicyCacheStats, PolicyDecision};
use crate::relationship::{RelationshipManager, RelationshipStats};
use crate::sync::{SyncReport, SyncTask};
use crate::version::{VersionManager, VersionStats};
use chrono::{DateTime, Utc};
use derive_more::Display;
use mstore_common::{Error, FieldChange, Fields, Record, Result, StorageConfig, SyncStrategy, Value};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

/// Cache plus write-back bookkeeping, guarded by one lock so a record and
/// its dirty generation are always read together
pub(crate) struct RecordState {
    cache: LruCache<String, Record>,
    /// key -> generation of the newest unflushed write
    dirty: HashMap<String, u64>,
    /// Dirty records pushed out of the cache, held until flushed
    pending: HashMap<String, Record>,
    generation: u64,
}

impl RecordState {
    fn new(max_items: usize) -> Self {
        Self {
            cache: LruCache::new(max_items),
            dirty: HashMap::new(),
            pending: HashMap::new(),
            generation: 0,
        }
    }

    /// Current record, promoting it in the cache
    fn get(&mut self, key: &str) -> Option<Record> {
        self.cache
            .get(key)
            .or_else(|| self.pending.get(key))
            .cloned()
    }

    fn peek(&self, key: &str) -> Option<&Record> {
        self.cache.peek(key).or_else(|| self.pending.get(key))
    }

    fn contains(&self, key: &str) -> bool {
        self.cache.contains(key) || self.pending.contains_key(key)
    }

    fn put(&mut self, key: &str, record: Record, mark_dirty: bool) {
        if mark_dirty {
            self.generation += 1;
            self.dirty.insert(key.to_string(), self.generation);
        }

        if self.cache.capacity() == 0 {
            if self.dirty.contains_key(key) {
                self.pending.insert(key.to_string(), record);
            }
            return;
        }

        self.pending.remove(key);
        if let Some((evicted_key, evicted)) = self.cache.put(key.to_string(), record)
            && self.dirty.contains_key(&evicted_key)
        {
            debug!("Holding evicted dirty record {evicted_key} until flushed");
            self.pending.insert(evicted_key, evicted);
        }
    }

    /// True once evicted dirty records outnumber the cache capacity
    fn pending_overflow(&self) -> bool {
        self.pending.len() > self.cache.capacity().max(1)
    }

    fn remove(&mut self, key: &str) -> bool {
        self.dirty.remove(key);
        let pending = self.pending.remove(key).is_some();
        self.cache.delete(key) || pending
    }

    pub(crate) fn dirty_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.dirty.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Fields and write generation of a dirty record
    pub(crate) fn snapshot(&mut self, key: &str) -> Option<(Fields, u64)> {
        let generation = *self.dirty.get(key)?;
        if let Some(record) = self.peek(key) {
            return Some((record.fields.clone(), generation));
        }
        self.dirty.remove(key);
        None
    }

    /// Clear the dirty mark if no write newer than `generation` happened
    pub(crate) fn mark_clean(&mut self, key: &str, generation: u64) -> bool {
        if self.dirty.get(key) != Some(&generation) {
            return false;
        }
        self.dirty.remove(key);
        self.pending.remove(key);
        true
    }
}

#[derive(Default)]
struct Backends {
    /// Registration order
    entries: Vec<(String, BackendRef)>,
    primary: Option<String>,
}

pub(crate) struct StorageInner {
    config: StorageConfig,
    pub(crate) state: Mutex<RecordState>,
    backends: RwLock<Backends>,
    versions: VersionManager,
    relationships: RelationshipManager,
    policy: PolicyCache,
    pub(crate) audit: AuditLogger,
    notifier: Arc<ChangeNotifier>,
    pub(crate) key_locks: KeyLocks,
}

impl StorageInner {
    pub(crate) fn primary(&self) -> Option<(String, BackendRef)> {
        let backends = self.backends.read();
        let name = backends.primary.as_ref()?;
        backends
            .entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(n, b)| (n.clone(), Arc::clone(b)))
    }

    fn all_backends(&self) -> Vec<(String, BackendRef)> {
        self.backends.read().entries.clone()
    }

    /// Fetch a record from the primary and cache it clean, unless a newer
    /// write reached the cache first
    async fn load_from_primary(&self, key: &str) -> Option<Record> {
        let (name, backend) = self.primary()?;
        let fields = match backend.load_data(key).await {
            Ok(Some(fields)) => fields,
            Ok(None) => return None,
            Err(e) => {
                warn!("Failed to load {key} from {name}: {e}");
                return None;
            }
        };

        let mut state = self.state.lock();
        if let Some(existing) = state.get(key) {
            return Some(existing);
        }
        let record = Record::new(fields);
        state.put(key, record.clone(), false);
        debug!("Loaded {key} from {name}");
        Some(record)
    }
}

/// Result of a write: what changed and where it went
#[derive(Debug, Clone, PartialEq)]
pub struct WriteReport {
    pub key: String,
    /// Fields whose value changed, in field order
    pub changes: Vec<FieldChange>,
    /// True if the record awaits a flush to the primary backend
    pub dirty: bool,
    /// Backends that accepted a write-through push
    pub written_to: Vec<String>,
    /// Backends that failed a write-through push
    pub failed_backends: Vec<String>,
}

impl WriteReport {
    #[must_use]
    pub fn changed_fields(&self) -> Vec<&str> {
        self.changes.iter().map(|c| c.field.as_str()).collect()
    }

    /// True unless a write-through push failed somewhere
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed_backends.is_empty()
    }
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[display("healthy")]
    Healthy,
    #[display("unhealthy")]
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub backends: BTreeMap<String, bool>,
}

impl HealthReport {
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StorageStats {
    pub sync_strategy: SyncStrategy,
    pub cache: LruStats,
    pub dirty_records: usize,
    /// Dirty records evicted from the cache and not yet flushed
    pub pending_evicted: usize,
    pub backends: Vec<String>,
    pub primary_backend: Option<String>,
    pub versions: VersionStats,
    pub relationships: RelationshipStats,
    pub policy_cache: PolicyCacheStats,
    pub audit: AuditStats,
    pub change_callbacks: usize,
}

/// Write staged under the state lock, finished outside it
struct StagedWrite {
    changes: Vec<FieldChange>,
    fields: Fields,
    dirty: bool,
    pending_overflow: bool,
}

/// Cached record store with pluggable backends
pub struct ManagedStorage {
    inner: Arc<StorageInner>,
    sync_task: Mutex<Option<SyncTask>>,
}

impl ManagedStorage {
    /// Create a storage instance.
    ///
    /// Under write-back the background sync loop starts immediately when
    /// called inside a Tokio runtime; otherwise call [`Self::initialize`]
    /// from within one.
    #[must_use]
    pub fn new(config: StorageConfig) -> Self {
        if let Err(e) = config.validate() {
            warn!("Invalid storage configuration: {e}");
        }
        let inner = StorageInner {
            state: Mutex::new(RecordState::new(config.max_memory_items)),
            backends: RwLock::new(Backends::default()),
            versions: VersionManager::new(config.max_versions_per_key),
            relationships: RelationshipManager::new(),
            policy: PolicyCache::new(config.default_policy_ttl()),
            audit: AuditLogger::from_config(&config.audit),
            notifier: Arc::new(ChangeNotifier::new()),
            key_locks: KeyLocks::default(),
            config,
        };
        let storage = Self {
            inner: Arc::new(inner),
            sync_task: Mutex::new(None),
        };

        if storage.inner.config.sync_strategy.runs_background_sync() {
            match Handle::try_current() {
                Ok(runtime) => storage.start_sync_task(&runtime),
                Err(_) => warn!("No Tokio runtime, background sync deferred until initialize()"),
            }
        }
        storage
    }

    /// (Re)start the background sync loop for write-back
    pub fn initialize(&self) -> Result<()> {
        if !self.inner.config.sync_strategy.runs_background_sync() {
            return Ok(());
        }
        let runtime = Handle::try_current()
            .map_err(|e| Error::internal(format!("background sync needs a Tokio runtime: {e}")))?;
        self.start_sync_task(&runtime);
        Ok(())
    }

    fn start_sync_task(&self, runtime: &Handle) {
        let task = SyncTask::spawn(runtime, Arc::clone(&self.inner), self.inner.config.sync_interval());
        if let Some(previous) = self.sync_task.lock().replace(task) {
            previous.abort();
        }
    }

    #[must_use]
    pub fn config(&self) -> &StorageConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn sync_strategy(&self) -> SyncStrategy {
        self.inner.config.sync_strategy
    }

    // ---- Backends ----

    /// Register a backend. The first one registered, or any marked primary,
    /// becomes the primary. Re-registering a name replaces that backend.
    pub fn add_backend(&self, name: impl Into<String>, backend: BackendRef, is_primary: bool) {
        let name = name.into();
        let mut backends = self.inner.backends.write();
        if let Some(entry) = backends.entries.iter_mut().find(|(n, _)| *n == name) {
            entry.1 = backend;
        } else {
            backends.entries.push((name.clone(), backend));
        }
        if is_primary || backends.primary.is_none() {
            info!("Primary backend is now {name}");
            backends.primary = Some(name);
        } else {
            debug!("Registered backend {name}");
        }
    }

    #[must_use]
    pub fn backend(&self, name: &str) -> Option<BackendRef> {
        self.inner
            .backends
            .read()
            .entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, b)| Arc::clone(b))
    }

    #[must_use]
    pub fn primary_backend_name(&self) -> Option<String> {
        self.inner.backends.read().primary.clone()
    }

    #[must_use]
    pub fn backend_names(&self) -> Vec<String> {
        self.inner
            .backends
            .read()
            .entries
            .iter()
            .map(|(n, _)| n.clone())
            .collect()
    }

    // ---- Records ----

    /// Merge `fields` into the record and stamp it
    pub async fn store_fields(&self, id: &str, fields: &Fields, identity_id: Option<&str>) -> WriteReport {
        let guard = self.write_through_guard(id).await;
        let staged = self.stage_write(id, fields, identity_id);
        self.finish_write(id, staged, guard, ACTION_STORE, identity_id).await
    }

    /// Fields of a record, or only the requested ones that exist.
    ///
    /// On a cache miss only read-through strategies consult the primary
    /// backend; the others report the record absent.
    pub async fn load_fields(&self, id: &str, field_names: Option<&[&str]>) -> Option<Fields> {
        let record = self.lookup(id).await?;
        Some(match field_names {
            Some(names) if !names.is_empty() => record.select(names),
            _ => record.into_fields(),
        })
    }

    /// Like [`Self::load_fields`], with metadata
    pub async fn load_record(&self, id: &str) -> Option<Record> {
        self.lookup(id).await
    }

    /// Merge changed fields into a record, loading it first by the miss
    /// policy when it is not cached
    pub async fn update_fields(&self, id: &str, dirty_fields: &Fields, identity_id: Option<&str>) -> WriteReport {
        self.ensure_cached(id).await;
        let guard = self.write_through_guard(id).await;
        let staged = self.stage_write(id, dirty_fields, identity_id);
        self.finish_write(id, staged, guard, ACTION_WRITE, identity_id).await
    }

    /// Apply `updates` only if every condition field equals its current value.
    ///
    /// The check and the merge happen under one lock on the cached view; a
    /// failed condition leaves everything untouched.
    pub async fn atomic_update(
        &self,
        id: &str,
        updates: &Fields,
        conditions: Option<&Fields>,
        identity_id: Option<&str>,
    ) -> Result<WriteReport> {
        self.ensure_cached(id).await;
        let guard = self.write_through_guard(id).await;
        let staged = self.stage_conditional_write(id, updates, conditions, identity_id)?;
        Ok(self.finish_write(id, staged, guard, ACTION_WRITE, identity_id).await)
    }

    /// Drop a record from the cache and delete it from every backend.
    ///
    /// Returns true if the record was cached. An in-flight flush or
    /// write-through push of the record completes before the delete is
    /// issued, so it cannot write the record back afterwards.
    pub async fn delete_record(&self, id: &str) -> bool {
        let _guard = self.inner.key_locks.lock(id).await;
        let existed = self.inner.state.lock().remove(id);

        for (name, backend) in self.inner.all_backends() {
            if let Err(e) = backend.delete_data(id).await {
                warn!("Failed to delete {id} from {name}: {e}");
            }
        }
        self.inner.audit.log(id, AuditEvent::new(ACTION_DELETE));
        existed
    }

    /// Pull a record from the primary into the cache regardless of strategy.
    ///
    /// A dirty cached record is never overwritten.
    pub async fn preload(&self, id: &str) -> bool {
        self.inner.load_from_primary(id).await.is_some()
    }

    #[must_use]
    pub fn is_cached(&self, id: &str) -> bool {
        self.inner.state.lock().contains(id)
    }

    #[must_use]
    pub fn is_dirty(&self, id: &str) -> bool {
        self.inner.state.lock().dirty.contains_key(id)
    }

    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.inner.state.lock().dirty.len()
    }

    /// Cached keys, most recently used first
    #[must_use]
    pub fn cached_keys(&self) -> Vec<String> {
        self.inner.state.lock().cache.keys()
    }

    async fn lookup(&self, id: &str) -> Option<Record> {
        let cached = self.inner.state.lock().get(id);
        if cached.is_some() {
            return cached;
        }
        if !self.sync_strategy().reads_through() {
            return None;
        }
        self.inner.load_from_primary(id).await
    }

    async fn ensure_cached(&self, id: &str) {
        let cached = self.inner.state.lock().contains(id);
        if !cached && self.sync_strategy().reads_through() {
            self.inner.load_from_primary(id).await;
        }
    }

    /// Write-through pushes of one record reach the backends in the order
    /// their merges were applied to the cache
    async fn write_through_guard(&self, id: &str) -> Option<KeyGuard<'_>> {
        if self.sync_strategy().stages_writes() {
            None
        } else {
            Some(self.inner.key_locks.lock(id).await)
        }
    }

    fn stage_write(&self, id: &str, updates: &Fields, identity_id: Option<&str>) -> StagedWrite {
        let mut state = self.inner.state.lock();
        let record = state.get(id).unwrap_or_default();
        self.apply_write(&mut state, id, record, updates, identity_id)
    }

    fn stage_conditional_write(
        &self,
        id: &str,
        updates: &Fields,
        conditions: Option<&Fields>,
        identity_id: Option<&str>,
    ) -> Result<StagedWrite> {
        let mut state = self.inner.state.lock();
        let record = state.get(id).unwrap_or_default();

        for (field, expected) in conditions.into_iter().flatten() {
            // An absent field compares as null
            let actual = record.get(field).unwrap_or(&Value::Null);
            if actual != expected {
                debug!("Atomic update of {id} rejected on field {field}");
                return Err(Error::ConditionFailed {
                    field: field.clone(),
                    expected: expected.clone(),
                    actual: actual.clone(),
                });
            }
        }

        Ok(self.apply_write(&mut state, id, record, updates, identity_id))
    }

    fn apply_write(
        &self,
        state: &mut RecordState,
        id: &str,
        mut record: Record,
        updates: &Fields,
        identity_id: Option<&str>,
    ) -> StagedWrite {
        let changes = record.merge(updates);
        record.stamp(identity_id);
        let dirty = self.inner.config.sync_strategy.stages_writes();
        let fields = record.fields.clone();
        state.put(id, record, dirty);
        StagedWrite {
            changes,
            fields,
            dirty,
            pending_overflow: state.pending_overflow(),
        }
    }

    async fn finish_write(
        &self,
        id: &str,
        staged: StagedWrite,
        guard: Option<KeyGuard<'_>>,
        action: &str,
        identity_id: Option<&str>,
    ) -> WriteReport {
        let mut written_to = Vec::new();
        let mut failed_backends = Vec::new();

        if !staged.dirty {
            for (name, backend) in self.inner.all_backends() {
                match backend.store_data(id, &staged.fields).await {
                    Ok(true) => written_to.push(name),
                    Ok(false) => {
                        warn!("Backend {name} declined write of {id}");
                        failed_backends.push(name);
                    }
                    Err(e) => {
                        warn!("Failed to write {id} through to {name}: {e}");
                        failed_backends.push(name);
                    }
                }
            }
        }
        drop(guard);

        for change in &staged.changes {
            self.inner.audit.log(
                id,
                AuditEvent::new(action)
                    .field(change.field.as_str())
                    .change(change.old_value.clone(), change.new_value.clone())
                    .identity(identity_id),
            );
            self.inner
                .notifier
                .notify_change(id, &change.field, change.old_value.clone(), change.new_value.clone(), identity_id)
                .await;
        }

        if staged.pending_overflow {
            debug!("Evicted dirty records exceed cache capacity, flushing");
            self.inner.flush_dirty().await;
        }

        WriteReport {
            key: id.to_string(),
            changes: staged.changes,
            dirty: staged.dirty,
            written_to,
            failed_backends,
        }
    }

    // ---- Sync ----

    /// Flush every dirty record to the primary backend now
    pub async fn flush_to_backends(&self) -> SyncReport {
        self.inner.flush_dirty().await
    }

    /// Probe every backend; healthy only if all of them are
    pub async fn check_health(&self) -> HealthReport {
        let mut backends = BTreeMap::new();
        for (name, backend) in self.inner.all_backends() {
            let healthy = backend.health_check().await;
            if !healthy {
                warn!("Backend {name} failed its health check");
            }
            backends.insert(name, healthy);
        }
        let status = if backends.values().all(|healthy| *healthy) {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };
        HealthReport { status, backends }
    }

    /// Stop background sync, flush once, release backends and callbacks
    pub async fn cleanup(&self) {
        let task = self.sync_task.lock().take();
        if let Some(task) = task {
            task.stop().await;
        }

        let report = self.inner.flush_dirty().await;
        if !report.failed.is_empty() {
            warn!("{} dirty records could not be flushed on cleanup", report.failed.len());
        }

        for (name, backend) in self.inner.all_backends() {
            debug!("Cleaning up backend {name}");
            backend.cleanup().await;
        }
        self.inner.notifier.cleanup();
        info!("Managed storage cleaned up");
    }

    #[must_use]
    pub fn statistics(&self) -> StorageStats {
        let (cache, dirty_records, pending_evicted) = {
            let state = self.inner.state.lock();
            (state.cache.stats(), state.dirty.len(), state.pending.len())
        };
        StorageStats {
            sync_strategy: self.sync_strategy(),
            cache,
            dirty_records,
            pending_evicted,
            backends: self.backend_names(),
            primary_backend: self.primary_backend_name(),
            versions: self.inner.versions.stats(),
            relationships: self.inner.relationships.stats(),
            policy_cache: self.inner.policy.stats(),
            audit: self.inner.audit.stats(),
            change_callbacks: self.inner.notifier.callback_count(),
        }
    }

    // ---- Versions ----

    /// Record a version, then push it to the primary backend best-effort
    pub async fn store_version(
        &self,
        id: &str,
        data: Value,
        timestamp: Option<DateTime<Utc>>,
        version_id: Option<String>,
    ) -> String {
        let version_id = self
            .inner
            .versions
            .store_version(id, data.clone(), timestamp, version_id);

        if let Some((name, backend)) = self.inner.primary()
            && let Err(e) = backend.store_version(id, &version_id, &data).await
        {
            warn!("Failed to push version {version_id} of {id} to {name}: {e}");
        }
        version_id
    }

    /// Version payload from memory, falling back to the primary backend
    pub async fn load_version(&self, id: &str, version_id: Option<&str>) -> Option<Value> {
        if let Some(data) = self.inner.versions.load_version(id, version_id) {
            return Some(data);
        }
        let (name, backend) = self.inner.primary()?;
        match backend.load_version(id, version_id).await {
            Ok(data) => data,
            Err(e) => {
                warn!("Failed to load version of {id} from {name}: {e}");
                None
            }
        }
    }

    /// Up to `limit` versions newest first, from memory or else the primary
    pub async fn list_versions(&self, id: &str, limit: usize) -> Vec<VersionSummary> {
        let versions = self.inner.versions.list_versions(id, limit);
        if !versions.is_empty() {
            return versions;
        }
        let Some((name, backend)) = self.inner.primary() else {
            return versions;
        };
        match backend.list_versions(id).await {
            Ok(mut versions) => {
                versions.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
                versions.truncate(limit);
                versions
            }
            Err(e) => {
                warn!("Failed to list versions of {id} from {name}: {e}");
                Vec::new()
            }
        }
    }

    #[must_use]
    pub fn versions(&self) -> &VersionManager {
        &self.inner.versions
    }

    // ---- Relationships ----

    pub fn add_relationship(&self, parent_id: &str, child_id: &str, rel_type: &str) {
        self.inner.relationships.add_relationship(parent_id, child_id, rel_type);
    }

    pub fn remove_relationship(&self, parent_id: &str, child_id: &str, rel_type: &str) {
        self.inner.relationships.remove_relationship(parent_id, child_id, rel_type);
    }

    #[must_use]
    pub fn get_relationships(&self, id: &str, rel_type: &str, reverse: bool) -> Vec<String> {
        self.inner.relationships.get_relationships(id, rel_type, reverse)
    }

    #[must_use]
    pub fn get_all_relationships(&self, id: &str) -> BTreeMap<String, Vec<String>> {
        self.inner.relationships.get_all_relationships(id)
    }

    #[must_use]
    pub fn relationships(&self) -> &RelationshipManager {
        &self.inner.relationships
    }

    // ---- Policy decisions ----

    pub fn cache_policy_decision(
        &self,
        identity_id: &str,
        action: &str,
        resource: &str,
        decision: bool,
        reason: &str,
        ttl: Option<Duration>,
    ) {
        self.inner
            .policy
            .cache_decision(identity_id, action, resource, decision, reason, ttl);
    }

    #[must_use]
    pub fn get_cached_policy_decision(&self, identity_id: &str, action: &str, resource: &str) -> Option<PolicyDecision> {
        self.inner.policy.get_decision(identity_id, action, resource)
    }

    #[must_use]
    pub fn policy_cache(&self) -> &PolicyCache {
        &self.inner.policy
    }

    // ---- Audit ----

    pub fn log_audit(&self, id: &str, event: AuditEvent) -> Option<String> {
        self.inner.audit.log(id, event)
    }

    #[must_use]
    pub fn get_audit_log(&self, id: &str, limit: usize, since: Option<DateTime<Utc>>) -> Vec<AuditEntry> {
        self.inner.audit.get_log(id, limit, since)
    }

    #[must_use]
    pub fn audit(&self) -> &AuditLogger {
        &self.inner.audit
    }

    // ---- Notifications ----

    pub fn add_change_callback(&self, callback: Callback<ChangeEvent>) -> CallbackId {
        self.inner.notifier.add_callback(callback)
    }

    pub fn remove_change_callback(&self, id: CallbackId) -> bool {
        self.inner.notifier.remove_callback(id)
    }

    /// Broadcast a change that did not go through the record API
    pub async fn publish_change(
        &self,
        id: &str,
        field: &str,
        old_value: Option<Value>,
        new_value: Value,
        identity_id: Option<&str>,
    ) {
        self.inner
            .notifier
            .notify_change(id, field, old_value, new_value, identity_id)
            .await;
    }

    #[must_use]
    pub fn notifier(&self) -> &Arc<ChangeNotifier> {
        &self.inner.notifier
    }
}

impl Drop for ManagedStorage {
    fn drop(&mut self) {
        if let Some(task) = self.sync_task.lock().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::ACTION_SYNC;
    use crate::memory::MemoryBackend;
    use crate::backend::StorageBackend;
    use mstore_common::fields;

    fn config(strategy: SyncStrategy) -> StorageConfig {
        StorageConfig::default()
            .with_sync_strategy(strategy)
            .with_sync_interval(Duration::from_millis(50))
    }

    fn storage_with(strategy: SyncStrategy) -> (ManagedStorage, Arc<MemoryBackend>) {
        let storage = ManagedStorage::new(config(strategy));
        let backend = Arc::new(MemoryBackend::new("primary"));
        storage.add_backend("primary", backend.clone(), false);
        (storage, backend)
    }

    #[tokio::test]
    async fn test_write_through_round_trip() {
        let (storage, backend) = storage_with(SyncStrategy::WriteThrough);

        let report = storage.store_fields("x", &fields! { "v" => 1 }, Some("alice")).await;
        assert!(report.is_complete());
        assert!(!report.dirty);
        assert_eq!(report.written_to, vec!["primary"]);

        assert_eq!(storage.load_fields("x", None).await, Some(fields! { "v" => 1 }));
        assert_eq!(backend.load_data("x").await.unwrap(), Some(fields! { "v" => 1 }));
        assert!(!storage.is_dirty("x"));

        let record = storage.load_record("x").await.unwrap();
        assert_eq!(record.metadata.identity_id.as_deref(), Some("alice"));
        assert!(record.metadata.updated_at.is_some());
    }

    #[tokio::test]
    async fn test_write_through_partial_failure_is_reported() {
        let (storage, primary) = storage_with(SyncStrategy::WriteThrough);
        let mirror = Arc::new(MemoryBackend::new("mirror"));
        storage.add_backend("mirror", mirror.clone(), false);
        mirror.set_available(false);

        let report = storage.store_fields("x", &fields! { "v" => 1 }, None).await;
        assert_eq!(report.written_to, vec!["primary"]);
        assert_eq!(report.failed_backends, vec!["mirror"]);
        assert!(primary.load_data("x").await.unwrap().is_some());
        assert_eq!(storage.load_fields("x", None).await, Some(fields! { "v" => 1 }));
    }

    #[tokio::test]
    async fn test_write_back_stages_then_syncs() {
        let (storage, backend) = storage_with(SyncStrategy::WriteBack);

        let report = storage.store_fields("x", &fields! { "v" => 1 }, None).await;
        assert!(report.dirty);
        assert!(backend.is_empty());
        assert!(storage.is_dirty("x"));

        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(backend.load_data("x").await.unwrap(), Some(fields! { "v" => 1 }));
        assert!(!storage.is_dirty("x"));
        let log = storage.get_audit_log("x", 10, None);
        assert_eq!(log[0].action, ACTION_SYNC);
        assert_eq!(log[0].context["backend"], Value::from("primary"));

        storage.cleanup().await;
    }

    #[tokio::test]
    async fn test_write_back_failure_keeps_record_dirty() {
        let (storage, backend) = storage_with(SyncStrategy::WriteBack);
        backend.set_available(false);

        storage.store_fields("x", &fields! { "v" => 1 }, None).await;
        let report = storage.flush_to_backends().await;
        assert_eq!(report.failed, vec!["x"]);
        assert!(storage.is_dirty("x"));

        backend.set_available(true);
        let report = storage.flush_to_backends().await;
        assert_eq!(report.synced, vec!["x"]);
        assert!(!storage.is_dirty("x"));
    }

    #[tokio::test]
    async fn test_write_during_flush_stays_dirty() {
        let storage = Arc::new(ManagedStorage::new(
            config(SyncStrategy::WriteBack).with_sync_interval(Duration::from_secs(3600)),
        ));
        let backend = Arc::new(MemoryBackend::new("slow").with_write_delay(Duration::from_millis(100)));
        storage.add_backend("slow", backend.clone(), true);

        storage.store_fields("x", &fields! { "v" => 1 }, None).await;

        let flusher = Arc::clone(&storage);
        let flush = tokio::spawn(async move { flusher.flush_to_backends().await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        storage.update_fields("x", &fields! { "v" => 2 }, None).await;

        let report = flush.await.unwrap();
        assert_eq!(report.overtaken, vec!["x"]);
        assert!(storage.is_dirty("x"));
        assert_eq!(backend.load_data("x").await.unwrap(), Some(fields! { "v" => 1 }));

        let report = storage.flush_to_backends().await;
        assert_eq!(report.synced, vec!["x"]);
        assert_eq!(backend.load_data("x").await.unwrap(), Some(fields! { "v" => 2 }));
    }

    #[tokio::test]
    async fn test_evicted_dirty_record_is_still_flushed() {
        let storage = ManagedStorage::new(
            config(SyncStrategy::WriteBack)
                .with_max_memory_items(1)
                .with_sync_interval(Duration::from_secs(3600)),
        );
        let backend = Arc::new(MemoryBackend::new("primary"));
        storage.add_backend("primary", backend.clone(), true);

        storage.store_fields("a", &fields! { "v" => 1 }, None).await;
        storage.store_fields("b", &fields! { "v" => 2 }, None).await;

        assert_eq!(storage.cached_keys(), vec!["b"]);
        assert_eq!(storage.statistics().pending_evicted, 1);
        assert_eq!(storage.load_fields("a", None).await, Some(fields! { "v" => 1 }));

        let report = storage.flush_to_backends().await;
        assert_eq!(report.synced.len(), 2);
        assert_eq!(backend.load_data("a").await.unwrap(), Some(fields! { "v" => 1 }));
        assert_eq!(storage.statistics().pending_evicted, 0);
    }

    #[tokio::test]
    async fn test_evicted_dirty_records_are_bounded_without_sync_loop() {
        let storage = ManagedStorage::new(config(SyncStrategy::ReadThrough).with_max_memory_items(2));
        let backend = Arc::new(MemoryBackend::new("primary"));
        storage.add_backend("primary", backend.clone(), true);

        for i in 0..100 {
            storage.store_fields(&format!("k{i}"), &fields! { "v" => i }, None).await;
        }

        let stats = storage.statistics();
        assert!(stats.pending_evicted <= 2, "pending grew to {}", stats.pending_evicted);
        assert!(backend.len() >= 96);
        assert_eq!(storage.load_fields("k0", None).await, Some(fields! { "v" => 0 }));

        storage.flush_to_backends().await;
        assert_eq!(backend.len(), 100);
        assert_eq!(storage.dirty_count(), 0);
    }

    #[tokio::test]
    async fn test_zero_sync_interval_still_flushes() {
        let storage = ManagedStorage::new(config(SyncStrategy::WriteBack).with_sync_interval(Duration::ZERO));
        let backend = Arc::new(MemoryBackend::new("primary"));
        storage.add_backend("primary", backend.clone(), true);

        storage.store_fields("x", &fields! { "v" => 1 }, None).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(backend.load_data("x").await.unwrap(), Some(fields! { "v" => 1 }));
        assert!(!storage.is_dirty("x"));
        storage.cleanup().await;
    }

    #[tokio::test]
    async fn test_write_through_pushes_keep_write_order() {
        let (storage, backend) = storage_with(SyncStrategy::WriteThrough);
        backend.delay_next_write(Duration::from_millis(100));
        let older = fields! { "v" => 1 };
        let newer = fields! { "v" => 2 };

        let first = storage.store_fields("x", &older, None);
        let second = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            storage.store_fields("x", &newer, None).await
        };
        let (first, second) = tokio::join!(first, second);

        assert!(first.is_complete() && second.is_complete());
        assert_eq!(storage.load_fields("x", None).await, Some(fields! { "v" => 2 }));
        assert_eq!(backend.load_data("x").await.unwrap(), Some(fields! { "v" => 2 }));
    }

    #[tokio::test]
    async fn test_delete_during_flush_is_not_undone() {
        let storage = ManagedStorage::new(
            config(SyncStrategy::WriteBack).with_sync_interval(Duration::from_secs(3600)),
        );
        let backend = Arc::new(MemoryBackend::new("slow").with_write_delay(Duration::from_millis(100)));
        storage.add_backend("slow", backend.clone(), true);
        storage.store_fields("x", &fields! { "v" => 1 }, None).await;

        let delete = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            storage.delete_record("x").await
        };
        let (report, deleted) = tokio::join!(storage.flush_to_backends(), delete);

        assert_eq!(report.synced, vec!["x"]);
        assert!(deleted);
        assert!(backend.load_data("x").await.unwrap().is_none());
        assert!(!storage.is_dirty("x"));
        assert!(storage.flush_to_backends().await.is_empty());
    }

    #[tokio::test]
    async fn test_read_through_populates_cache() {
        let (storage, backend) = storage_with(SyncStrategy::ReadThrough);
        backend.insert("y", fields! { "v" => 9 });

        assert_eq!(storage.load_fields("y", None).await, Some(fields! { "v" => 9 }));
        backend.set_available(false);
        assert_eq!(storage.load_fields("y", None).await, Some(fields! { "v" => 9 }));
        assert!(storage.load_fields("missing", None).await.is_none());
    }

    #[tokio::test]
    async fn test_miss_without_read_through_is_absent() {
        let (storage, backend) = storage_with(SyncStrategy::WriteThrough);
        backend.insert("y", fields! { "v" => 9 });

        assert!(storage.load_fields("y", None).await.is_none());
        assert!(storage.preload("y").await);
        assert_eq!(storage.load_fields("y", None).await, Some(fields! { "v" => 9 }));
    }

    #[tokio::test]
    async fn test_load_selected_fields() {
        let (storage, _) = storage_with(SyncStrategy::WriteThrough);
        storage
            .store_fields("x", &fields! { "a" => 1, "b" => 2, "c" => 3 }, None)
            .await;

        assert_eq!(
            storage.load_fields("x", Some(&["a", "c", "zzz"])).await,
            Some(fields! { "a" => 1, "c" => 3 })
        );
    }

    #[tokio::test]
    async fn test_update_audits_each_changed_field() {
        let (storage, _) = storage_with(SyncStrategy::WriteThrough);
        storage.store_fields("x", &fields! { "a" => 1, "b" => 2 }, None).await;

        let report = storage
            .update_fields("x", &fields! { "a" => 1, "b" => 3, "c" => 4 }, Some("bob"))
            .await;
        assert_eq!(report.changed_fields(), vec!["b", "c"]);

        let log = storage.get_audit_log("x", 100, None);
        let writes: Vec<_> = log.iter().filter(|e| e.action == ACTION_WRITE).collect();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].field.as_deref(), Some("c"));
        assert_eq!(writes[1].old_value, Some(Value::from(2)));
        assert_eq!(writes[1].identity_id.as_deref(), Some("bob"));
        assert_eq!(log.iter().filter(|e| e.action == ACTION_STORE).count(), 2);
    }

    #[tokio::test]
    async fn test_update_loads_uncached_record_under_read_through() {
        let (storage, backend) = storage_with(SyncStrategy::ReadThrough);
        backend.insert("x", fields! { "a" => 1 });

        storage.update_fields("x", &fields! { "b" => 2 }, None).await;
        assert_eq!(storage.load_fields("x", None).await, Some(fields! { "a" => 1, "b" => 2 }));
        assert!(storage.is_dirty("x"));
    }

    #[tokio::test]
    async fn test_atomic_update_condition_failure() {
        let (storage, _) = storage_with(SyncStrategy::WriteThrough);
        storage.store_fields("job", &fields! { "status" => "ready" }, None).await;

        let err = storage
            .atomic_update(
                "job",
                &fields! { "status" => "done" },
                Some(&fields! { "status" => "busy" }),
                None,
            )
            .await
            .unwrap_err();
        assert!(err.is_condition_failed());
        assert_eq!(storage.load_fields("job", None).await, Some(fields! { "status" => "ready" }));

        let report = storage
            .atomic_update(
                "job",
                &fields! { "status" => "busy" },
                Some(&fields! { "status" => "ready" }),
                None,
            )
            .await
            .unwrap();
        assert_eq!(report.changed_fields(), vec!["status"]);

        let err = storage
            .atomic_update("nobody", &fields! { "v" => 1 }, Some(&fields! { "v" => 0 }), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConditionFailed { actual: Value::Null, .. }));
        assert!(storage.load_fields("nobody", None).await.is_none());
    }

    #[tokio::test]
    async fn test_atomic_update_null_condition_matches_absent_field() {
        let (storage, _) = storage_with(SyncStrategy::WriteThrough);
        storage.store_fields("job", &fields! { "status" => "ready" }, None).await;

        let report = storage
            .atomic_update(
                "job",
                &fields! { "owner" => "alice" },
                Some(&fields! { "owner" => Value::Null }),
                Some("alice"),
            )
            .await
            .unwrap();
        assert_eq!(report.changed_fields(), vec!["owner"]);

        let err = storage
            .atomic_update(
                "job",
                &fields! { "owner" => "bob" },
                Some(&fields! { "owner" => Value::Null }),
                Some("bob"),
            )
            .await
            .unwrap_err();
        assert!(err.is_condition_failed());
    }

    #[tokio::test]
    async fn test_changes_are_notified() {
        let (storage, _) = storage_with(SyncStrategy::WriteThrough);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        storage.add_change_callback(Callback::from_fn(move |event: &ChangeEvent| {
            sink.lock().push((event.field.clone(), event.new_value.clone()));
            Ok(())
        }));

        storage.store_fields("x", &fields! { "a" => 1 }, None).await;
        storage.store_fields("x", &fields! { "a" => 1, "b" => 2 }, None).await;

        assert_eq!(
            *seen.lock(),
            vec![("a".to_string(), Value::from(1)), ("b".to_string(), Value::from(2))]
        );
    }

    #[tokio::test]
    async fn test_delete_record() {
        let (storage, backend) = storage_with(SyncStrategy::WriteThrough);
        storage.store_fields("x", &fields! { "v" => 1 }, None).await;

        assert!(storage.delete_record("x").await);
        assert!(storage.load_fields("x", None).await.is_none());
        assert!(backend.load_data("x").await.unwrap().is_none());
        assert!(!storage.delete_record("x").await);
    }

    #[tokio::test]
    async fn test_versions_fall_back_to_primary() {
        let (storage, backend) = storage_with(SyncStrategy::WriteThrough);
        let id = storage.store_version("doc", Value::from("A"), None, Some("v1".into())).await;
        assert_eq!(id, "v1");
        assert_eq!(backend.load_version("doc", Some("v1")).await.unwrap(), Some(Value::from("A")));

        backend.store_version("other", "b1", &Value::from("B")).await.unwrap();
        assert_eq!(storage.load_version("other", None).await, Some(Value::from("B")));
        assert_eq!(storage.list_versions("other", 10).await[0].version_id, "b1");
        assert_eq!(storage.list_versions("doc", 10).await.len(), 1);
    }

    #[tokio::test]
    async fn test_primary_selection_and_health() {
        let storage = ManagedStorage::new(config(SyncStrategy::WriteThrough));
        let first = Arc::new(MemoryBackend::new("first"));
        let second = Arc::new(MemoryBackend::new("second"));
        storage.add_backend("first", first.clone(), false);
        storage.add_backend("second", second.clone(), false);
        assert_eq!(storage.primary_backend_name().as_deref(), Some("first"));

        storage.add_backend("second", second.clone(), true);
        assert_eq!(storage.primary_backend_name().as_deref(), Some("second"));
        assert_eq!(storage.backend_names(), vec!["first", "second"]);

        assert!(storage.check_health().await.is_healthy());
        second.set_available(false);
        let health = storage.check_health().await;
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert!(health.backends["first"]);
        assert!(!health.backends["second"]);
    }

    #[tokio::test]
    async fn test_cleanup_flushes_and_clears_callbacks() {
        let (storage, backend) = storage_with(SyncStrategy::WriteBack);
        storage.add_change_callback(Callback::from_fn(|_: &ChangeEvent| Ok(())));
        storage.store_fields("x", &fields! { "v" => 1 }, None).await;

        storage.cleanup().await;

        assert_eq!(backend.load_data("x").await.unwrap(), Some(fields! { "v" => 1 }));
        assert_eq!(storage.statistics().change_callbacks, 0);
        assert_eq!(storage.dirty_count(), 0);
    }

    #[tokio::test]
    async fn test_satellite_pass_throughs() {
        let (storage, _) = storage_with(SyncStrategy::WriteThrough);
        storage.add_relationship("p", "c", "manages");
        storage.add_relationship("p", "c", "manages");
        assert_eq!(storage.get_relationships("p", "manages", false), vec!["c"]);
        storage.remove_relationship("p", "zzz", "manages");
        assert_eq!(storage.get_all_relationships("c")["parents"], vec!["p"]);

        storage.cache_policy_decision("alice", "read", "doc", true, "owner", None);
        assert!(storage.get_cached_policy_decision("alice", "read", "doc").unwrap().decision);

        assert!(storage.log_audit("x", AuditEvent::new("custom")).is_some());

        let stats = storage.statistics();
        assert_eq!(stats.relationships.total_relationships, 1);
        assert_eq!(stats.policy_cache.total_entries, 1);
        assert_eq!(stats.audit.total_entries, 1);
        assert_eq!(stats.backends, vec!["primary"]);
    }

    #[test]
    fn test_new_outside_runtime_defers_sync() {
        let storage = ManagedStorage::new(config(SyncStrategy::WriteBack));
        assert!(storage.sync_task.lock().is_none());
        assert!(storage.initialize().is_err());

        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            storage.initialize().unwrap();
            assert!(storage.sync_task.lock().is_some());
            storage.cleanup().await;
        });
    }
}
