//! Core error types.

use crate::migration::MigrationError;
use thiserror::Error;

/// Storage-layer errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying sled error.
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Key decoding error.
    #[error("invalid key format")]
    InvalidKey,

    /// A document the caller expected to exist is missing.
    #[error("not found: {0}")]
    NotFound(String),

    /// A document changed between read and commit.
    #[error("write conflict: {0}")]
    Conflict(String),

    /// A unique index entry is already owned by another record.
    #[error("unique violation on '{slug}': value {value} is already taken by record {owner}")]
    UniqueViolation {
        /// Slug of the unique field.
        slug: String,
        /// Canonical form of the duplicated value.
        value: String,
        /// Record currently holding the value.
        owner: u64,
    },

    /// Transaction error.
    #[error("transaction error: {0}")]
    Transaction(String),

    /// Invalid data format.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Migration job state error.
    #[error("migration state error: {0}")]
    Migration(#[source] Box<MigrationError>),
}

impl From<MigrationError> for Error {
    fn from(e: MigrationError) -> Self {
        match e {
            MigrationError::Storage(inner) => inner,
            other => Error::Migration(Box::new(other)),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        if e.is_data() || e.is_syntax() || e.is_eof() {
            Error::Deserialization(e.to_string())
        } else {
            Error::Serialization(e.to_string())
        }
    }
}
