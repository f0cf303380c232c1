//! Migration-specific error types.

use thiserror::Error;

/// Risk of a schema change to existing data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RiskLevel {
    /// No stored value can be lost.
    #[default]
    Low,
    /// Some values may be dropped or reshaped.
    Medium,
    /// Values may be rejected, truncated, or reinterpreted.
    High,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "low"),
            RiskLevel::Medium => write!(f, "medium"),
            RiskLevel::High => write!(f, "high"),
        }
    }
}

/// Fatal migration errors. Per-record conversion problems are reported in
/// `MigrationResult`, never through this type.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// Storage error while reading or writing records.
    #[error("storage error: {0}")]
    Storage(#[from] crate::error::Error),

    /// Record vanished between index lookup and read.
    #[error("record {record_id} disappeared during migration")]
    RecordVanished {
        /// The missing record.
        record_id: u64,
    },

    /// The type change is denied by the compatibility matrix.
    #[error("conversion from {from} to {to} is denied")]
    DeniedConversion {
        /// Old type.
        from: crate::catalog::FieldType,
        /// New type.
        to: crate::catalog::FieldType,
    },

    /// Job checkpoint serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Job checkpoint deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Job checkpoint not found.
    #[error("migration job not found: {0}")]
    JobNotFound(String),
}

impl From<sled::Error> for MigrationError {
    fn from(e: sled::Error) -> Self {
        MigrationError::Storage(crate::error::Error::Storage(e))
    }
}
