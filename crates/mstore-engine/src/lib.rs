//! mstore Engine - Managed record storage
//!
//! This crate implements the in-memory orchestration layer:
//! - LRU record cache
//! - Write-through / write-back / read-through sync strategies
//! - Background flushing of dirty records to the primary backend
//! - Bounded version history
//! - Typed relationship graph
//! - TTL cache for authorization decisions
//! - Audit trail and change notifications

pub mod adapter;
pub mod audit;
pub mod backend;
mod key_lock;
pub mod lru;
pub mod memory;
pub mod notify;
pub mod policy_cache;
pub mod relationship;
pub mod storage;
pub mod sync;
pub mod version;

// Re-exports
pub use adapter::KeyValueAdapter;
pub use audit::{AuditEntry, AuditEvent, AuditLogger, AuditStats};
pub use backend::{BackendRef, StorageBackend, VersionSummary};
pub use lru::{LruCache, LruStats};
pub use memory::MemoryBackend;
pub use notify::{
    BufferStats, Callback, CallbackError, CallbackId, CallbackResult, ChangeBuffer, ChangeEvent,
    ChangeNotifier, EVENT_DATA_CHANGED,
};
pub use policy_cache::{PolicyCache, PolicyCacheStats, PolicyDecision};
pub use relationship::{RelationshipManager, RelationshipStats};
pub use storage::{HealthReport, HealthStatus, ManagedStorage, StorageStats, WriteReport};
pub use sync::SyncReport;
pub use version::{Version, VersionManager, VersionStats};
