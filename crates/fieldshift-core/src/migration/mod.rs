//! Field migration engine.
//!
//! This module provides safe field evolution over stored records:
//! - Type-change classification (Denied / Safe / Risky)
//! - Pure per-type value coercion
//! - Operation-scoped field snapshots and change analysis
//! - Batched migration passes with dry runs and progress reporting
//! - Job checkpoints for crash visibility
//!
//! # Decisions
//!
//! | Verdict | Meaning | Examples | Behavior |
//! |---------|---------|----------|----------|
//! | **Safe** | No value can be lost | text → textarea | Runs without confirmation |
//! | **Risky** | Some values may be dropped or reshaped | text → number | Warns; may need a preview |
//! | **Denied** | No tested conversion | relation → text | Refused before any write |
//!
//! # Example
//!
//! ```ignore
//! use fieldshift_core::migration::{TypeCompatibilityMatrix, MigrationDecision};
//!
//! let matrix = TypeCompatibilityMatrix::standard();
//! let decision = matrix.classify(FieldType::Text, FieldType::Number, &old, &new);
//! if let MigrationDecision::Risky { warning, .. } = &decision {
//!     println!("{}", warning);
//! }
//! ```

pub mod coerce;
pub mod error;
pub mod executor;
pub mod matrix;
pub mod preview;
pub mod snapshot;
pub mod state;

// Classification
pub use matrix::{DataLossKind, MigrationDecision, TypeCompatibilityMatrix, TEXT_TRUNCATION_LIMIT};

// Coercion
pub use coerce::{restrict_to_options, CoerceFn, CoercerRegistry};

// Snapshots
pub use snapshot::{ChangeAnalysis, MigrationType, OperationId, SnapshotStore};

// Execution
pub use executor::{
    MigrationConfig, MigrationExecutor, MigrationProgress, MigrationResult, ProgressCallback,
};
pub use preview::{MigrationPreview, PreviewSample, RiskAssessment};

// State and errors
pub use error::{MigrationError, RiskLevel};
pub use state::{JobStatus, JobStore, MigrationJob};
