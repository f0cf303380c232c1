//! Pipelines and their derived schema projection.

use super::config::FieldConfig;
use super::field::FieldDefinition;
use super::rules::BusinessRules;
use super::types::{FieldType, StorageConstraints};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Cached view of one active field, keyed by slug in the projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaEntry {
    /// Field id.
    pub field_id: u64,
    /// Field type.
    pub field_type: FieldType,
    /// Type-specific configuration.
    pub config: FieldConfig,
    /// Storage constraints.
    pub constraints: StorageConstraints,
    /// Business rules.
    pub business_rules: BusinessRules,
    /// Position in the field order.
    pub display_order: u32,
}

/// Slug-keyed projection of a pipeline's active fields.
pub type SchemaProjection = BTreeMap<String, SchemaEntry>;

/// A named collection of fields describing one record schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    /// Pipeline id.
    pub id: u64,
    /// Display name.
    pub name: String,
    /// Slug of the field holding the record's stage, if any.
    #[serde(default)]
    pub stage_field: Option<String>,
    /// Member field ids, including soft-deleted ones.
    #[serde(default)]
    pub field_ids: Vec<u64>,
    /// Derived projection of the active fields. Never authoritative.
    #[serde(default)]
    pub schema: SchemaProjection,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
    /// Document version.
    #[serde(default)]
    pub version: u64,
}

impl Pipeline {
    /// Create an empty pipeline.
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            stage_field: None,
            field_ids: Vec::new(),
            schema: SchemaProjection::new(),
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }

    /// Name the field whose value is the record's stage.
    pub fn with_stage_field(mut self, slug: impl Into<String>) -> Self {
        self.stage_field = Some(slug.into());
        self
    }

    /// Rebuild the schema projection from the given fields. Deleted fields
    /// are left out.
    pub fn rebuild_schema(&mut self, fields: &[FieldDefinition]) {
        self.schema = fields
            .iter()
            .filter(|f| f.is_active() && f.pipeline_id == self.id)
            .map(|f| {
                (
                    f.slug.clone(),
                    SchemaEntry {
                        field_id: f.id,
                        field_type: f.field_type,
                        config: f.config.clone(),
                        constraints: f.constraints.clone(),
                        business_rules: f.business_rules.clone(),
                        display_order: f.display_order,
                    },
                )
            })
            .collect();
        self.updated_at = Utc::now();
    }

    /// Next display position after every current field.
    pub fn next_display_order(&self) -> u32 {
        self.schema
            .values()
            .map(|e| e.display_order.saturating_add(1))
            .max()
            .unwrap_or(0)
    }
}

/// A pipeline together with its active fields in display order.
#[derive(Debug, Clone)]
pub struct PipelineSchema {
    /// The pipeline document.
    pub pipeline: Pipeline,
    /// Active fields sorted by display order, then id.
    pub fields: Vec<FieldDefinition>,
}

impl PipelineSchema {
    /// Build from a pipeline and any of its fields; deleted fields are dropped.
    pub fn new(pipeline: Pipeline, fields: Vec<FieldDefinition>) -> Self {
        let mut fields: Vec<FieldDefinition> =
            fields.into_iter().filter(|f| f.is_active()).collect();
        fields.sort_by_key(|f| (f.display_order, f.id));
        Self { pipeline, fields }
    }

    /// Look up an active field by slug.
    pub fn field(&self, slug: &str) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| f.slug == slug)
    }

    /// Active slugs in display order.
    pub fn slugs(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.slug.as_str())
    }

    /// Slug of the stage field, if configured and active.
    pub fn stage_field(&self) -> Option<&str> {
        self.pipeline
            .stage_field
            .as_deref()
            .filter(|slug| self.field(slug).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::field::FieldSpec;

    fn field(id: u64, name: &str, order: u32) -> FieldDefinition {
        FieldDefinition::new(
            id,
            1,
            FieldSpec::new(name, FieldType::Text).with_display_order(order),
        )
        .unwrap()
    }

    #[test]
    fn test_rebuild_schema_skips_deleted() {
        let mut pipeline = Pipeline::new(1, "Deals");
        let mut gone = field(2, "Old Notes", 1);
        gone.is_deleted = true;
        pipeline.rebuild_schema(&[field(1, "Name", 0), gone]);

        assert_eq!(pipeline.schema.len(), 1);
        assert_eq!(pipeline.schema["name"].field_id, 1);
        assert_eq!(pipeline.next_display_order(), 1);
    }

    #[test]
    fn test_next_display_order_saturates() {
        let mut pipeline = Pipeline::new(1, "Deals");
        pipeline.rebuild_schema(&[field(1, "Name", u32::MAX)]);
        assert_eq!(pipeline.next_display_order(), u32::MAX);
    }

    #[test]
    fn test_pipeline_schema_ordering() {
        let schema = PipelineSchema::new(
            Pipeline::new(1, "Deals").with_stage_field("stage"),
            vec![field(3, "Stage", 2), field(1, "Name", 0), field(2, "Email", 0)],
        );
        let slugs: Vec<&str> = schema.slugs().collect();
        assert_eq!(slugs, vec!["name", "email", "stage"]);
        assert_eq!(schema.stage_field(), Some("stage"));
    }
}
