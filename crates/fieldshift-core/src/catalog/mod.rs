//! Schema catalog: pipelines, typed fields, and their business rules.

mod config;
mod field;
mod pipeline;
mod rules;
mod types;

pub use config::{ChoiceOptions, FieldConfig, NumberOptions, SelectOption};
pub use field::{slugify, CatalogError, FieldChanges, FieldDefinition, FieldSpec};
pub use pipeline::{Pipeline, PipelineSchema, SchemaEntry, SchemaProjection};
pub use rules::{
    is_empty_value, value_text, BusinessRules, Condition, ConditionGroup, ConditionOperator,
    ConditionalRule, GroupLogic, LegacyRequirement, RuleAction, StageRequirement,
};
pub use types::{FieldType, StorageConstraints};
