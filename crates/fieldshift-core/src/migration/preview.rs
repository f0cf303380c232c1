//! Migration previews.
//!
//! A preview runs the same conversions a live migration would over a sample
//! of records, without writing anything.

use super::coerce::CoercerRegistry;
use super::error::RiskLevel;
use super::matrix::{MigrationDecision, TypeCompatibilityMatrix};
use super::snapshot::ChangeAnalysis;
use crate::catalog::{is_empty_value, value_text, FieldDefinition};
use crate::error::Error;
use crate::storage::StorageEngine;
use serde_json::Value;

/// One sampled record.
#[derive(Debug, Clone, PartialEq)]
pub struct PreviewSample {
    /// Sampled record.
    pub record_id: u64,
    /// Stored value.
    pub before: Value,
    /// Value after migration; `None` means the key would be removed.
    pub after: Option<Value>,
    /// Whether the value survives the migration.
    pub success: bool,
    /// Why the value does not survive.
    pub note: Option<String>,
}

/// Overall assessment of a proposed change.
#[derive(Debug, Clone, PartialEq)]
pub struct RiskAssessment {
    /// Matrix verdict.
    pub decision: MigrationDecision,
    /// Highest risk between the verdict and the change analysis.
    pub risk_level: RiskLevel,
    /// Live records holding a value under the current slug.
    pub affected_record_estimate: u64,
    /// Sampled values that would not survive.
    pub sample_failures: usize,
    /// Details of each detected change.
    pub details: Vec<String>,
}

impl RiskAssessment {
    /// Share of sampled values that survive, between 0 and 1.
    pub fn sample_success_rate(&self, sample_count: usize) -> f64 {
        if sample_count == 0 {
            1.0
        } else {
            sample_count.saturating_sub(self.sample_failures) as f64 / sample_count as f64
        }
    }
}

/// Result of previewing a field change.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationPreview {
    /// Current field.
    pub field_id: u64,
    /// Sampled conversions. Empty for denied changes.
    pub samples: Vec<PreviewSample>,
    /// Risk summary.
    pub risk_assessment: RiskAssessment,
}

impl MigrationPreview {
    /// Build a preview of moving `before` to `after`.
    pub fn build(
        engine: &StorageEngine,
        matrix: &TypeCompatibilityMatrix,
        coercers: &CoercerRegistry,
        before: &FieldDefinition,
        after: &FieldDefinition,
        sample_size: usize,
    ) -> Result<Self, Error> {
        let decision = matrix.classify(
            before.field_type,
            after.field_type,
            &before.constraints,
            &after.constraints,
        );
        let analysis = ChangeAnalysis::between(before, after);
        let affected = engine.count_records_with_key(before.pipeline_id, &before.slug)?;

        let mut samples = Vec::new();
        if !decision.is_denied() {
            for record_id in engine
                .record_ids_with_key(before.pipeline_id, &before.slug)?
                .into_iter()
                .take(sample_size)
            {
                let Some(record) = engine.get_record(before.pipeline_id, record_id)? else {
                    continue;
                };
                let Some(value) = record.data.get(&before.slug) else {
                    continue;
                };
                samples.push(sample(coercers, before, after, record_id, value));
            }
        }

        let sample_failures = samples.iter().filter(|s| !s.success).count();
        Ok(Self {
            field_id: before.id,
            samples,
            risk_assessment: RiskAssessment {
                risk_level: decision.risk().max(analysis.risk_level),
                decision,
                affected_record_estimate: affected,
                sample_failures,
                details: analysis.details,
            },
        })
    }
}

fn sample(
    coercers: &CoercerRegistry,
    before: &FieldDefinition,
    after: &FieldDefinition,
    record_id: u64,
    value: &Value,
) -> PreviewSample {
    let mut sample = PreviewSample {
        record_id,
        before: value.clone(),
        after: None,
        success: true,
        note: None,
    };
    if is_empty_value(value) {
        return sample;
    }

    match coercers.coerce_for(before.field_type, after.field_type, value, &after.config) {
        None => {
            sample.success = false;
            sample.note = Some(format!("cannot convert to {}", after.field_type));
        }
        Some(converted) => {
            if let Some(max) = after.constraints.max_length {
                let length = value_text(&converted).map(|t| t.chars().count()).unwrap_or(0);
                if length > max {
                    sample.success = false;
                    sample.note = Some(format!("{} characters exceeds maximum of {}", length, max));
                }
            }
            sample.after = Some(converted);
        }
    }
    sample
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{FieldChanges, FieldSpec, FieldType, StorageConstraints};
    use crate::storage::{Record, StorageConfig};
    use serde_json::json;

    fn engine_with(rows: &[Value]) -> StorageEngine {
        let engine = StorageEngine::open(StorageConfig::temporary()).unwrap();
        let mut tx = engine.transaction();
        for (i, row) in rows.iter().enumerate() {
            tx.put_record(Record::new(
                i as u64 + 1,
                1,
                row.as_object().cloned().unwrap_or_default(),
            ));
        }
        tx.commit().unwrap();
        engine
    }

    fn preview(engine: &StorageEngine, before: &FieldDefinition, changes: FieldChanges) -> MigrationPreview {
        let mut after = before.clone();
        after.apply(&changes).unwrap();
        MigrationPreview::build(
            engine,
            &TypeCompatibilityMatrix::standard(),
            &CoercerRegistry::standard(),
            before,
            &after,
            10,
        )
        .unwrap()
    }

    #[test]
    fn test_preview_samples_conversions() {
        let engine = engine_with(&[json!({"age": "42"}), json!({"age": "old"}), json!({"x": 1})]);
        let before = FieldDefinition::new(5, 1, FieldSpec::new("Age", FieldType::Text)).unwrap();
        let result = preview(&engine, &before, FieldChanges::default().change_type(FieldType::Number));

        assert_eq!(result.samples.len(), 2);
        assert_eq!(result.samples[0].after, Some(json!(42)));
        assert!(result.samples[0].success);
        assert!(!result.samples[1].success);
        assert_eq!(result.samples[1].after, None);
        assert_eq!(result.risk_assessment.affected_record_estimate, 2);
        assert_eq!(result.risk_assessment.sample_failures, 1);
        assert_eq!(result.risk_assessment.sample_success_rate(2), 0.5);
        assert!(!engine.get_record(1, 1).unwrap().unwrap().data["age"].is_number());
    }

    #[test]
    fn test_preview_denied_has_no_samples() {
        let engine = engine_with(&[json!({"owner": 7})]);
        let before =
            FieldDefinition::new(5, 1, FieldSpec::new("Owner", FieldType::Relation)).unwrap();
        let result = preview(&engine, &before, FieldChanges::default().change_type(FieldType::Text));
        assert!(result.samples.is_empty());
        assert!(result.risk_assessment.decision.is_denied());
        assert_eq!(result.risk_assessment.risk_level, RiskLevel::High);
    }

    #[test]
    fn test_preview_flags_length_overflow() {
        let engine = engine_with(&[json!({"code": "abcdef"})]);
        let before = FieldDefinition::new(5, 1, FieldSpec::new("Code", FieldType::Text)).unwrap();
        let result = preview(
            &engine,
            &before,
            FieldChanges::default().with_constraints(StorageConstraints::default().with_max_length(3)),
        );
        assert!(!result.samples[0].success);
        assert!(result.samples[0].note.as_deref().unwrap_or("").contains("maximum"));
    }

    #[test]
    fn test_success_rate_with_more_failures_than_samples() {
        let assessment = RiskAssessment {
            decision: TypeCompatibilityMatrix::classify_constraints(
                &StorageConstraints::default(),
                &StorageConstraints::default(),
            ),
            risk_level: RiskLevel::Low,
            affected_record_estimate: 4,
            sample_failures: 5,
            details: Vec::new(),
        };
        assert_eq!(assessment.sample_success_rate(0), 1.0);
        assert_eq!(assessment.sample_success_rate(3), 0.0);
        assert_eq!(assessment.sample_success_rate(10), 0.5);
    }
}
