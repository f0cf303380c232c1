//! Field definitions and the requests that create or change them.

use super::config::FieldConfig;
use super::rules::BusinessRules;
use super::types::{FieldType, StorageConstraints};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while building or changing a field definition.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CatalogError {
    /// The field name produces an empty slug.
    #[error("invalid field name '{0}': a name must contain at least one letter or digit")]
    InvalidName(String),

    /// The config variant belongs to another field type.
    #[error("config for '{config_type}' cannot be used on a '{field_type}' field")]
    ConfigMismatch {
        /// Declared field type.
        field_type: FieldType,
        /// Type the config variant belongs to.
        config_type: FieldType,
    },

    /// The config is internally inconsistent.
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

/// Derive a slug from a display name.
///
/// Lowercases, collapses every run of non-alphanumeric characters to a single
/// `_`, and trims leading and trailing underscores.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_separator = false;
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_separator && !slug.is_empty() {
                slug.push('_');
            }
            pending_separator = false;
            slug.push(ch.to_ascii_lowercase());
        } else {
            pending_separator = true;
        }
    }
    slug
}

/// One typed column in a pipeline's schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDefinition {
    /// Field id.
    pub id: u64,
    /// Owning pipeline.
    pub pipeline_id: u64,
    /// Display name.
    pub name: String,
    /// Key under which record data stores this field's value.
    pub slug: String,
    /// Field type.
    pub field_type: FieldType,
    /// Type-specific configuration.
    pub config: FieldConfig,
    /// Storage-level constraints.
    #[serde(default)]
    pub constraints: StorageConstraints,
    /// Business rules.
    #[serde(default)]
    pub business_rules: BusinessRules,
    /// Position in the pipeline's field order.
    pub display_order: u32,
    /// Soft-delete flag.
    #[serde(default)]
    pub is_deleted: bool,
    /// When the field was soft deleted.
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    /// When a soft-deleted field becomes eligible for hard delete.
    #[serde(default)]
    pub scheduled_hard_delete_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
    /// Document version, bumped on every persisted change.
    #[serde(default)]
    pub version: u64,
}

impl FieldDefinition {
    /// Build a field from a creation spec.
    pub fn new(id: u64, pipeline_id: u64, spec: FieldSpec) -> Result<Self, CatalogError> {
        let slug = slugify(&spec.name);
        if slug.is_empty() {
            return Err(CatalogError::InvalidName(spec.name));
        }
        let config = spec
            .config
            .unwrap_or_else(|| FieldConfig::default_for(spec.field_type));
        check_config(spec.field_type, &config)?;

        let now = Utc::now();
        Ok(Self {
            id,
            pipeline_id,
            name: spec.name,
            slug,
            field_type: spec.field_type,
            config,
            constraints: spec.constraints,
            business_rules: spec.business_rules,
            display_order: spec.display_order.unwrap_or(0),
            is_deleted: false,
            deleted_at: None,
            scheduled_hard_delete_at: None,
            created_at: now,
            updated_at: now,
            version: 1,
        })
    }

    /// Check if the field is live.
    pub fn is_active(&self) -> bool {
        !self.is_deleted
    }

    /// Apply a change set in place.
    ///
    /// A type change without an explicit config keeps the option list when
    /// both types carry one, otherwise resets the config to the new type's
    /// default.
    pub fn apply(&mut self, changes: &FieldChanges) -> Result<(), CatalogError> {
        if let Some(name) = &changes.name {
            let slug = slugify(name);
            if slug.is_empty() {
                return Err(CatalogError::InvalidName(name.clone()));
            }
            self.name = name.clone();
            self.slug = slug;
        }

        if let Some(field_type) = changes.field_type {
            if field_type != self.field_type && changes.config.is_none() {
                self.config = carry_config(&self.config, field_type);
            }
            self.field_type = field_type;
        }

        if let Some(config) = &changes.config {
            self.config = config.clone();
        }
        check_config(self.field_type, &self.config)?;

        if let Some(constraints) = &changes.constraints {
            self.constraints = constraints.clone();
        }
        if let Some(rules) = &changes.business_rules {
            self.business_rules = rules.clone();
        }
        if let Some(order) = changes.display_order {
            self.display_order = order;
        }
        self.updated_at = Utc::now();
        Ok(())
    }
}

fn check_config(field_type: FieldType, config: &FieldConfig) -> Result<(), CatalogError> {
    let config_type = config.field_type();
    if config_type != field_type {
        return Err(CatalogError::ConfigMismatch {
            field_type,
            config_type,
        });
    }
    config.validate().map_err(CatalogError::InvalidConfig)
}

fn carry_config(current: &FieldConfig, target: FieldType) -> FieldConfig {
    match (current.choices(), target) {
        (Some(choices), FieldType::Select) => {
            let mut choices = choices.clone();
            choices.max_selections = None;
            choices.default_value = None;
            FieldConfig::Select(choices)
        }
        (Some(choices), FieldType::Multiselect) => {
            let mut choices = choices.clone();
            choices.default_value = None;
            FieldConfig::Multiselect(choices)
        }
        _ => FieldConfig::default_for(target),
    }
}

/// Request to create a field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    /// Display name; the slug is derived from it.
    pub name: String,
    /// Field type.
    pub field_type: FieldType,
    /// Config; defaults to the type's default config.
    pub config: Option<FieldConfig>,
    /// Storage constraints.
    pub constraints: StorageConstraints,
    /// Business rules.
    pub business_rules: BusinessRules,
    /// Position; defaults to the end of the pipeline.
    pub display_order: Option<u32>,
}

impl FieldSpec {
    /// Create a spec with default config and no constraints.
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            config: None,
            constraints: StorageConstraints::default(),
            business_rules: BusinessRules::default(),
            display_order: None,
        }
    }

    /// Set the config.
    pub fn with_config(mut self, config: FieldConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set storage constraints.
    pub fn with_constraints(mut self, constraints: StorageConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    /// Set business rules.
    pub fn with_rules(mut self, rules: BusinessRules) -> Self {
        self.business_rules = rules;
        self
    }

    /// Set the display position.
    pub fn with_display_order(mut self, order: u32) -> Self {
        self.display_order = Some(order);
        self
    }
}

/// Partial update to a field. `None` leaves the attribute untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldChanges {
    /// New display name (and therefore slug).
    pub name: Option<String>,
    /// New type.
    pub field_type: Option<FieldType>,
    /// New config.
    pub config: Option<FieldConfig>,
    /// New storage constraints.
    pub constraints: Option<StorageConstraints>,
    /// New business rules.
    pub business_rules: Option<BusinessRules>,
    /// New display position.
    pub display_order: Option<u32>,
}

impl FieldChanges {
    /// Rename the field.
    pub fn rename(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Change the type.
    pub fn change_type(mut self, field_type: FieldType) -> Self {
        self.field_type = Some(field_type);
        self
    }

    /// Replace the config.
    pub fn with_config(mut self, config: FieldConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Replace storage constraints.
    pub fn with_constraints(mut self, constraints: StorageConstraints) -> Self {
        self.constraints = Some(constraints);
        self
    }

    /// Replace business rules.
    pub fn with_rules(mut self, rules: BusinessRules) -> Self {
        self.business_rules = Some(rules);
        self
    }

    /// Move the field.
    pub fn with_display_order(mut self, order: u32) -> Self {
        self.display_order = Some(order);
        self
    }

    /// Check if nothing would change.
    pub fn is_empty(&self) -> bool {
        *self == FieldChanges::default()
    }
}
