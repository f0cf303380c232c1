//! Errors surfaced by the coordinators.

use crate::catalog::CatalogError;
use crate::error::Error;
use crate::migration::{MigrationError, MigrationResult};
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors from schema changes.
#[derive(Debug, Error)]
pub enum SchemaChangeError {
    /// The type change is refused. Nothing was written.
    #[error("change denied: {reason}")]
    Denied {
        /// Why the change is refused.
        reason: String,
        /// Strategies that reach the same goal.
        alternatives: Vec<String>,
    },

    /// Another active field of the pipeline already uses the slug.
    #[error("a field with slug '{slug}' already exists in pipeline {pipeline_id}")]
    NameCollision {
        /// Colliding slug.
        slug: String,
        /// Pipeline.
        pipeline_id: u64,
    },

    /// The requested definition is not valid for its type.
    #[error("invalid field definition: {0}")]
    InvalidType(#[from] CatalogError),

    /// The data migration failed; the field definition is unchanged.
    #[error("migration failed: {}", .0.summary())]
    MigrationFailed(Box<MigrationResult>),

    /// Another operation holds the field, or it changed during the operation.
    #[error("concurrent modification: {0}")]
    ConcurrentModification(String),

    /// The actor may not perform the change.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A risky change needs explicit confirmation after a preview.
    #[error("confirmation required: {warning}")]
    ConfirmationRequired {
        /// The data-loss warning to show.
        warning: String,
    },

    /// No such field.
    #[error("field {0} not found")]
    FieldNotFound(u64),

    /// No such pipeline.
    #[error("pipeline {0} not found")]
    PipelineNotFound(u64),

    /// Storage failure; the operation was rolled back.
    #[error(transparent)]
    Storage(#[from] Error),
}

impl From<MigrationError> for SchemaChangeError {
    fn from(e: MigrationError) -> Self {
        match e {
            MigrationError::Storage(inner) => inner.into(),
            MigrationError::DeniedConversion { from, to } => SchemaChangeError::Denied {
                reason: format!("conversion from {} to {} is denied", from, to),
                alternatives: Vec::new(),
            },
            other => SchemaChangeError::Storage(Error::Transaction(other.to_string())),
        }
    }
}

impl SchemaChangeError {
    /// Check if the operation may succeed when retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SchemaChangeError::ConcurrentModification(_))
            || matches!(self, SchemaChangeError::Storage(Error::Conflict(_)))
    }
}

/// Errors from record writes.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// One or more fields failed validation.
    #[error("validation failed for {}", field_list(.0))]
    FieldErrors(BTreeMap<String, Vec<String>>),

    /// The actor may not write the record.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// No such record.
    #[error("record {record_id} not found in pipeline {pipeline_id}")]
    RecordNotFound {
        /// Pipeline.
        pipeline_id: u64,
        /// Record.
        record_id: u64,
    },

    /// No such pipeline.
    #[error("pipeline {0} not found")]
    PipelineNotFound(u64),

    /// Another writer holds the record, or it changed during the write.
    #[error("concurrent modification: {0}")]
    ConcurrentModification(String),

    /// Storage failure; nothing was written.
    #[error(transparent)]
    Storage(#[from] Error),
}

impl ValidationError {
    /// Errors of one field, if any.
    pub fn errors_for(&self, slug: &str) -> Option<&[String]> {
        match self {
            ValidationError::FieldErrors(errors) => errors.get(slug).map(|v| v.as_slice()),
            _ => None,
        }
    }
}

fn field_list(errors: &BTreeMap<String, Vec<String>>) -> String {
    errors.keys().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
}
