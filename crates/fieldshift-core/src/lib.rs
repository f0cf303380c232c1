//! Fieldshift Core - schema evolution for pipelines of typed fields.
//!
//! This crate provides a document store of pipeline records, field type
//! migrations with compatibility classification, rule-driven record
//! validation, and the coordinators that tie them together under one
//! transaction per operation.

pub mod catalog;
pub mod config;
pub mod coordinator;
pub mod database;
pub mod error;
pub mod graph;
pub mod migration;
pub mod storage;
pub mod validation;

pub use catalog::{
    slugify, BusinessRules, CatalogError, Condition, ConditionGroup, ConditionOperator,
    ConditionalRule, FieldChanges, FieldConfig, FieldDefinition, FieldSpec, FieldType, Pipeline,
    PipelineSchema, RuleAction, StorageConstraints,
};
pub use config::EngineConfig;
pub use coordinator::{
    Actor, FieldDeletion, FieldUpdate, RecordWriteCoordinator, SaveOptions, SavedRecord,
    SchemaChangeCoordinator, SchemaChangeError, UpdateOptions, ValidationError,
};
pub use database::{Database, MaintenanceTask, SharedDatabase};
pub use error::Error;
pub use graph::{Cascade, DependencyGraph};
pub use migration::{
    ChangeAnalysis, CoercerRegistry, MigrationConfig, MigrationDecision, MigrationError,
    MigrationExecutor, MigrationPreview, MigrationResult, MigrationType, TypeCompatibilityMatrix,
};
pub use storage::{Record, StorageConfig, StorageEngine, Transaction};
pub use validation::{ValidationConfig, ValidationContext, ValidationEngine, ValidationOutcome};
