//! mstore Common - Shared types and utilities
//!
//! This crate provides the record data model, error definitions and
//! configuration used by every mstore component.

pub mod config;
pub mod error;
pub mod record;
pub mod value;

pub use config::{AuditConfig, NotificationConfig, StorageConfig, SyncStrategy};
pub use error::{BackendError, BackendResult, Error, Result};
pub use record::{FieldChange, Metadata, Record};
pub use value::{Fields, Value};
