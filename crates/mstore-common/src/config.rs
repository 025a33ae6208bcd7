//! Configuration types for mstore
//!
//! [`StorageConfig`] is loaded from an optional TOML file layered under
//! `MSTORE__*` environment variables, e.g. `MSTORE__SYNC_STRATEGY=write_through`
//! or `MSTORE__AUDIT__ENABLED=false`.

use crate::error::{Error, Result};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "MSTORE";

/// When and whether writes propagate to backends, and whether reads fall
/// through on a cache miss
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStrategy {
    /// Push every write to all backends immediately
    #[display("write_through")]
    WriteThrough,
    /// Mark writes dirty, flush to the primary backend periodically
    #[default]
    #[display("write_back")]
    WriteBack,
    /// Load from the primary backend on a cache miss
    #[display("read_through")]
    ReadThrough,
    /// Like read-through; reserved for preloading related records
    #[display("read_ahead")]
    ReadAhead,
}

impl SyncStrategy {
    /// Whether writes are staged in the dirty set instead of pushed
    #[must_use]
    pub const fn stages_writes(self) -> bool {
        !matches!(self, Self::WriteThrough)
    }

    /// Whether a cache miss consults the primary backend
    #[must_use]
    pub const fn reads_through(self) -> bool {
        matches!(self, Self::ReadThrough | Self::ReadAhead)
    }

    /// Whether the periodic background flush runs
    #[must_use]
    pub const fn runs_background_sync(self) -> bool {
        matches!(self, Self::WriteBack)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::WriteThrough => "write_through",
            Self::WriteBack => "write_back",
            Self::ReadThrough => "read_through",
            Self::ReadAhead => "read_ahead",
        }
    }
}

impl FromStr for SyncStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "write_through" => Ok(Self::WriteThrough),
            "write_back" | "write_behind" => Ok(Self::WriteBack),
            "read_through" => Ok(Self::ReadThrough),
            "read_ahead" => Ok(Self::ReadAhead),
            other => Err(Error::invalid_config(format!("unknown sync strategy: {other}"))),
        }
    }
}

/// Audit trail configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Record audit entries at all
    pub enabled: bool,
    /// Oldest entries are dropped beyond this many per key
    pub max_entries_per_key: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries_per_key: 1000,
        }
    }
}

/// Change notification configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Inactivity window before a change buffer flushes automatically
    pub buffer_time_ms: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self { buffer_time_ms: 100 }
    }
}

impl NotificationConfig {
    #[must_use]
    pub const fn buffer_time(&self) -> Duration {
        Duration::from_millis(self.buffer_time_ms)
    }
}

/// Root configuration for a managed storage instance
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// LRU cache capacity in records (0 disables caching)
    pub max_memory_items: usize,
    /// Sync strategy
    pub sync_strategy: SyncStrategy,
    /// Background flush interval for write-back
    pub sync_interval_ms: u64,
    /// Versions kept per key before the oldest is dropped
    pub max_versions_per_key: usize,
    /// TTL applied to cached policy decisions when the caller gives none
    pub default_policy_ttl_secs: u64,
    /// Audit configuration
    pub audit: AuditConfig,
    /// Notification configuration
    pub notifications: NotificationConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_memory_items: 10_000,
            sync_strategy: SyncStrategy::WriteBack,
            sync_interval_ms: 30_000,
            max_versions_per_key: 10,
            default_policy_ttl_secs: 300,
            audit: AuditConfig::default(),
            notifications: NotificationConfig::default(),
        }
    }
}

impl StorageConfig {
    /// Load configuration from an optional file plus environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML document, without environment overrides
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let config: Self = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.sync_strategy.runs_background_sync() && self.sync_interval_ms == 0 {
            return Err(Error::invalid_config(
                "sync_interval_ms must be greater than zero for write_back",
            ));
        }
        if self.max_versions_per_key == 0 {
            return Err(Error::invalid_config(
                "max_versions_per_key must be greater than zero",
            ));
        }
        Ok(())
    }

    #[must_use]
    pub const fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    #[must_use]
    pub const fn default_policy_ttl(&self) -> Duration {
        Duration::from_secs(self.default_policy_ttl_secs)
    }

    /// Set the cache capacity
    #[must_use]
    pub const fn with_max_memory_items(mut self, max_items: usize) -> Self {
        self.max_memory_items = max_items;
        self
    }

    /// Set the sync strategy
    #[must_use]
    pub const fn with_sync_strategy(mut self, strategy: SyncStrategy) -> Self {
        self.sync_strategy = strategy;
        self
    }

    /// Set the background flush interval, rounded up to whole milliseconds
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn with_sync_interval(mut self, interval: Duration) -> Self {
        let millis = interval.as_micros().div_ceil(1000);
        self.sync_interval_ms = if millis > u64::MAX as u128 { u64::MAX } else { millis as u64 };
        self
    }

    /// Set the per-key version limit
    #[must_use]
    pub const fn with_max_versions_per_key(mut self, max_versions: usize) -> Self {
        self.max_versions_per_key = max_versions;
        self
    }

    /// Enable or disable the audit trail
    #[must_use]
    pub const fn with_audit_enabled(mut self, enabled: bool) -> Self {
        self.audit.enabled = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = StorageConfig::default();
        assert_eq!(config.max_memory_items, 10_000);
        assert_eq!(config.sync_strategy, SyncStrategy::WriteBack);
        assert_eq!(config.sync_interval(), Duration::from_secs(30));
        assert_eq!(config.max_versions_per_key, 10);
        assert!(config.audit.enabled);
        assert_eq!(config.notifications.buffer_time(), Duration::from_millis(100));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_partial_document() {
        let config = StorageConfig::from_toml_str(
            r#"
            sync_strategy = "read_through"
            max_memory_items = 64

            [audit]
            enabled = false
            "#,
        )
        .unwrap();

        assert_eq!(config.sync_strategy, SyncStrategy::ReadThrough);
        assert_eq!(config.max_memory_items, 64);
        assert!(!config.audit.enabled);
        // Unspecified values fall back to defaults
        assert_eq!(config.audit.max_entries_per_key, 1000);
        assert_eq!(config.sync_interval_ms, 30_000);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "sync_strategy = \"write_through\"").unwrap();
        writeln!(file, "max_versions_per_key = 3").unwrap();

        let config = StorageConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.sync_strategy, SyncStrategy::WriteThrough);
        assert_eq!(config.max_versions_per_key, 3);
    }

    #[test]
    fn test_load_missing_file_fails() {
        let result = StorageConfig::load(Some(Path::new("/nonexistent/mstore.toml")));
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let config = StorageConfig::default().with_sync_interval(Duration::ZERO);
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let config = config.with_sync_strategy(SyncStrategy::WriteThrough);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_sub_millisecond_interval_rounds_up() {
        let config = StorageConfig::default().with_sync_interval(Duration::from_micros(500));
        assert_eq!(config.sync_interval_ms, 1);
        assert!(config.validate().is_ok());

        let config = StorageConfig::default().with_sync_interval(Duration::from_micros(2001));
        assert_eq!(config.sync_interval(), Duration::from_millis(3));
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!("write-through".parse::<SyncStrategy>().unwrap(), SyncStrategy::WriteThrough);
        assert_eq!("write_behind".parse::<SyncStrategy>().unwrap(), SyncStrategy::WriteBack);
        assert_eq!("READ_AHEAD".parse::<SyncStrategy>().unwrap(), SyncStrategy::ReadAhead);
        assert!("sometimes".parse::<SyncStrategy>().is_err());

        assert!(SyncStrategy::WriteBack.stages_writes());
        assert!(SyncStrategy::ReadThrough.stages_writes());
        assert!(!SyncStrategy::WriteThrough.stages_writes());
        assert!(SyncStrategy::ReadAhead.reads_through());
        assert!(!SyncStrategy::WriteBack.reads_through());
    }
}
