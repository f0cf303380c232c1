//! Engine configuration.

use std::time::Duration;

pub use crate::migration::MigrationConfig;
pub use crate::storage::StorageConfig;
pub use crate::validation::{ValidationConfig, STORAGE_CONTEXT_FIELD_THRESHOLD};

/// Default lifetime of an unreleased field snapshot (2 hours).
pub const DEFAULT_SNAPSHOT_TTL_SECS: u64 = 2 * 60 * 60;

/// Default wait for a row lock (5 seconds).
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5_000;

/// Default grace period between soft and hard delete of a field (30 days).
pub const DEFAULT_HARD_DELETE_GRACE_DAYS: i64 = 30;

/// Configuration for a fieldshift database.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Document store.
    pub storage: StorageConfig,

    /// Data migrations.
    pub migration: MigrationConfig,

    /// Record validation.
    pub validation: ValidationConfig,

    /// Lifetime of an unreleased field snapshot.
    pub snapshot_ttl: Duration,

    /// Wait for a row lock before reporting a concurrent modification.
    pub lock_timeout: Duration,

    /// Time a soft-deleted field is kept before it may be purged.
    pub hard_delete_grace: chrono::Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new(StorageConfig::default())
    }
}

impl EngineConfig {
    /// Create a configuration over the given store.
    pub fn new(storage: StorageConfig) -> Self {
        Self {
            storage,
            migration: MigrationConfig::default(),
            validation: ValidationConfig::default(),
            snapshot_ttl: Duration::from_secs(DEFAULT_SNAPSHOT_TTL_SECS),
            lock_timeout: Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS),
            hard_delete_grace: chrono::Duration::days(DEFAULT_HARD_DELETE_GRACE_DAYS),
        }
    }

    /// Configuration over a temporary store, for tests.
    pub fn temporary() -> Self {
        Self::new(StorageConfig::temporary())
    }

    /// Set the migration configuration.
    pub fn with_migration(mut self, migration: MigrationConfig) -> Self {
        self.migration = migration;
        self
    }

    /// Set the validation configuration.
    pub fn with_validation(mut self, validation: ValidationConfig) -> Self {
        self.validation = validation;
        self
    }

    /// Set the snapshot lifetime.
    pub fn with_snapshot_ttl(mut self, ttl: Duration) -> Self {
        self.snapshot_ttl = ttl;
        self
    }

    /// Set the lock wait.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Set the hard delete grace period.
    pub fn with_hard_delete_grace(mut self, grace: chrono::Duration) -> Self {
        self.hard_delete_grace = grace;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::temporary();
        assert!(config.storage.temporary);
        assert_eq!(config.migration.batch_size, 100);
        assert_eq!(config.migration.max_errors, 10);
        assert_eq!(config.validation.storage_context_max_changed_fields, 3);
        assert_eq!(config.validation.background_validation_limit, 8);
        assert_eq!(config.snapshot_ttl, Duration::from_secs(7200));
        assert_eq!(config.lock_timeout, Duration::from_secs(5));
        assert_eq!(config.hard_delete_grace, chrono::Duration::days(30));
    }

    #[test]
    fn test_builders() {
        let config = EngineConfig::temporary()
            .with_migration(MigrationConfig::default().with_batch_size(7))
            .with_validation(ValidationConfig::default().with_storage_context_max_changed_fields(1))
            .with_lock_timeout(Duration::from_millis(50));
        assert_eq!(config.migration.batch_size, 7);
        assert_eq!(config.validation.storage_context_max_changed_fields, 1);
        assert_eq!(config.lock_timeout, Duration::from_millis(50));
    }
}
