//! Record validation.
//!
//! Writes are validated in two tiers:
//! - storage checks and critical rules run before the write is accepted
//! - non-critical rules run afterwards on a bounded background task

pub mod background;
pub mod engine;
pub mod format;
pub mod rules;
pub mod storage;

pub use background::{BackgroundValidator, LogWarningSink, MemoryWarningSink, WarningSink};
pub use engine::{
    ValidationConfig, ValidationContext, ValidationEngine, ValidationOutcome, ValidationReport,
    STORAGE_CONTEXT_FIELD_THRESHOLD,
};
pub use rules::{classify_rules, ClassifiedRule, RuleClassification, RuleEffect, RuleKind};
pub use storage::validate_storage;
