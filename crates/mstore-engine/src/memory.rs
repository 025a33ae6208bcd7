//! In-memory storage backend
//!
//! Reference implementation of [`StorageBackend`]. It can be switched
//! offline with [`MemoryBackend::set_available`] and slowed down with
//! [`MemoryBackend::with_write_delay`] to exercise failure and race paths.

use crate::backend::{StorageBackend, VersionSummary};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mstore_common::{BackendError, BackendResult, Fields, Value};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

struct StoredVersion {
    version_id: String,
    timestamp: DateTime<Utc>,
    data: Value,
}

pub struct MemoryBackend {
    name: String,
    records: RwLock<HashMap<String, Fields>>,
    versions: RwLock<HashMap<String, Vec<StoredVersion>>>,
    available: AtomicBool,
    write_delay: Option<Duration>,
    next_write_delay: Mutex<Option<Duration>>,
    writes: AtomicU64,
}

impl MemoryBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            records: RwLock::new(HashMap::new()),
            versions: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
            write_delay: None,
            next_write_delay: Mutex::new(None),
            writes: AtomicU64::new(0),
        }
    }

    /// Delay every record write by `delay`
    #[must_use]
    pub const fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = Some(delay);
        self
    }

    /// Delay only the next record write by `delay`
    pub fn delay_next_write(&self, delay: Duration) {
        *self.next_write_delay.lock() = Some(delay);
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Simulate the backend going offline (`false`) or coming back
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Successful record writes so far
    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Seed a record directly, bypassing availability checks
    pub fn insert(&self, key: impl Into<String>, fields: Fields) {
        self.records.write().insert(key.into(), fields);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    fn ensure_available(&self) -> BackendResult<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(BackendError::connection(format!(
                "memory backend '{}' is offline",
                self.name
            )))
        }
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn store_data(&self, key: &str, fields: &Fields) -> BackendResult<bool> {
        self.ensure_available()?;
        let delay = self.next_write_delay.lock().take().or(self.write_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
            self.ensure_available()?;
        }
        self.records.write().insert(key.to_string(), fields.clone());
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    async fn load_data(&self, key: &str) -> BackendResult<Option<Fields>> {
        self.ensure_available()?;
        Ok(self.records.read().get(key).cloned())
    }

    async fn delete_data(&self, key: &str) -> BackendResult<bool> {
        self.ensure_available()?;
        self.records.write().remove(key);
        self.versions.write().remove(key);
        Ok(true)
    }

    async fn list_keys(&self, prefix: &str) -> BackendResult<Vec<String>> {
        self.ensure_available()?;
        let mut keys: Vec<String> = self
            .records
            .read()
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn store_version(&self, key: &str, version_id: &str, data: &Value) -> BackendResult<bool> {
        self.ensure_available()?;
        let mut versions = self.versions.write();
        let list = versions.entry(key.to_string()).or_default();
        list.retain(|v| v.version_id != version_id);
        list.push(StoredVersion {
            version_id: version_id.to_string(),
            timestamp: Utc::now(),
            data: data.clone(),
        });
        Ok(true)
    }

    async fn load_version(&self, key: &str, version_id: Option<&str>) -> BackendResult<Option<Value>> {
        self.ensure_available()?;
        let versions = self.versions.read();
        let Some(list) = versions.get(key) else {
            return Ok(None);
        };
        let found = match version_id {
            Some(id) => list.iter().find(|v| v.version_id == id),
            None => list.last(),
        };
        Ok(found.map(|v| v.data.clone()))
    }

    async fn list_versions(&self, key: &str) -> BackendResult<Vec<VersionSummary>> {
        self.ensure_available()?;
        Ok(self
            .versions
            .read()
            .get(key)
            .map(|list| {
                list.iter()
                    .map(|v| VersionSummary::new(v.version_id.clone(), v.timestamp))
                    .collect()
            })
            .unwrap_or_default())
    }
}
