//! Storage backend contract
//!
//! A backend is any durable key/value store the managed storage layer
//! reconciles its cache with. Adapters translate their transport errors into
//! [`BackendError`]; a missing key is `Ok(None)`, never an error.

use async_trait::async_trait;
use mstore_common::{BackendResult, Fields, Value};
use std::sync::Arc;

pub use crate::version::VersionSummary;

/// Durable record store used by `ManagedStorage`
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Write the full field map of a record
    async fn store_data(&self, key: &str, fields: &Fields) -> BackendResult<bool>;

    /// Read a record's fields, `None` if the key does not exist
    async fn load_data(&self, key: &str) -> BackendResult<Option<Fields>>;

    /// Delete a record; deleting a missing key succeeds
    async fn delete_data(&self, key: &str) -> BackendResult<bool>;

    /// Keys starting with `prefix`
    async fn list_keys(&self, prefix: &str) -> BackendResult<Vec<String>>;

    async fn store_version(&self, key: &str, version_id: &str, data: &Value) -> BackendResult<bool>;

    /// A specific version, or the latest when `version_id` is `None`
    async fn load_version(&self, key: &str, version_id: Option<&str>) -> BackendResult<Option<Value>>;

    async fn list_versions(&self, key: &str) -> BackendResult<Vec<VersionSummary>>;

    /// Health check for the backend
    ///
    /// Default implementation succeeds if the keyspace can be listed.
    async fn health_check(&self) -> bool {
        self.list_keys("").await.is_ok()
    }

    /// Release connections and other resources
    async fn cleanup(&self) {}
}

/// Shared handle to a backend
pub type BackendRef = Arc<dyn StorageBackend>;
