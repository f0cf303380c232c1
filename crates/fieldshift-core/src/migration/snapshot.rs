//! Operation-scoped field snapshots and change analysis.
//!
//! A snapshot is a deep copy of a field taken before a schema operation
//! mutates it. Entries are keyed by `(operation, field)` so concurrent
//! operations never see each other's copies, and expire after a TTL if an
//! operation never releases them.

use super::error::RiskLevel;
use crate::catalog::FieldDefinition;
use crate::error::Error;
use crate::storage::Transaction;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::fmt;
use std::time::{Duration, Instant};

/// Identifier of one schema operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(pub u64);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{:016x}", self.0)
    }
}

/// Kinds of data migration a field change can require, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MigrationType {
    /// The slug changed; values move to the new key.
    Rename,
    /// The type changed; values are coerced.
    TypeChange,
    /// Options were removed; values outside the new list are dropped.
    ConfigChange,
    /// Constraints tightened; existing values are checked.
    ConstraintChange,
}

impl MigrationType {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationType::Rename => "rename",
            MigrationType::TypeChange => "type_change",
            MigrationType::ConfigChange => "config_change",
            MigrationType::ConstraintChange => "constraint_change",
        }
    }
}

impl fmt::Display for MigrationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of diffing a field snapshot against its new state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeAnalysis {
    /// Whether stored values must be migrated.
    pub requires_migration: bool,
    /// Detected migrations, in execution order.
    pub migration_types: BTreeSet<MigrationType>,
    /// Highest risk over all detected changes.
    pub risk_level: RiskLevel,
    /// Live records holding a value under the pre-change slug.
    pub affected_record_estimate: u64,
    /// Human-readable description of each change.
    pub details: Vec<String>,
}

impl ChangeAnalysis {
    /// Compare two states of one field. The record estimate is left at zero.
    pub fn between(before: &FieldDefinition, after: &FieldDefinition) -> Self {
        let mut analysis = ChangeAnalysis::default();

        if before.slug != after.slug {
            analysis.add(
                MigrationType::Rename,
                RiskLevel::Low,
                format!("slug '{}' renamed to '{}'", before.slug, after.slug),
            );
        }

        if before.field_type != after.field_type {
            analysis.add(
                MigrationType::TypeChange,
                RiskLevel::High,
                format!("type changed from {} to {}", before.field_type, after.field_type),
            );
        }

        if let (Some(old_options), Some(new_options)) =
            (before.config.option_values(), after.config.option_values())
        {
            let removed: Vec<&str> = old_options
                .difference(&new_options)
                .map(|s| s.as_str())
                .collect();
            let unrestricted = after
                .config
                .choices()
                .is_some_and(|c| c.allow_custom || c.options.is_empty());
            if !removed.is_empty() && !unrestricted {
                analysis.add(
                    MigrationType::ConfigChange,
                    RiskLevel::Medium,
                    format!("options removed: {}", removed.join(", ")),
                );
            }
        }

        if before.constraints.max_length_shrinks_to(&after.constraints) {
            if let Some(max) = after.constraints.max_length {
                analysis.add(
                    MigrationType::ConstraintChange,
                    RiskLevel::High,
                    format!("maximum length lowered to {}", max),
                );
            }
        }
        if !before.constraints.enforce_uniqueness && after.constraints.enforce_uniqueness {
            analysis.add(
                MigrationType::ConstraintChange,
                RiskLevel::High,
                "uniqueness newly enforced".to_string(),
            );
        }

        analysis
    }

    fn add(&mut self, migration_type: MigrationType, risk: RiskLevel, detail: String) {
        self.requires_migration = true;
        self.migration_types.insert(migration_type);
        self.risk_level = self.risk_level.max(risk);
        self.details.push(detail);
    }
}

#[derive(Debug, Clone)]
struct FieldSnapshot {
    field: FieldDefinition,
    captured_at: Instant,
}

/// Snapshot store shared by all schema operations.
pub struct SnapshotStore {
    entries: DashMap<(OperationId, u64), FieldSnapshot>,
    ttl: Duration,
}

impl SnapshotStore {
    /// Create a store whose entries expire after `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Deep-copy `field` under `(operation, field.id)`.
    pub fn capture(&self, operation: OperationId, field: &FieldDefinition) {
        self.entries.insert(
            (operation, field.id),
            FieldSnapshot {
                field: field.clone(),
                captured_at: Instant::now(),
            },
        );
        tracing::debug!(operation_id = %operation, field_id = field.id, "captured field snapshot");
    }

    /// Get the snapshot of a field, if present and not expired.
    pub fn get(&self, operation: OperationId, field_id: u64) -> Option<FieldDefinition> {
        self.entries
            .get(&(operation, field_id))
            .filter(|entry| entry.captured_at.elapsed() < self.ttl)
            .map(|entry| entry.field.clone())
    }

    /// Diff the snapshot against `current`, estimating affected records from
    /// the pre-change slug.
    pub fn diff(
        &self,
        operation: OperationId,
        current: &FieldDefinition,
        tx: &Transaction<'_>,
    ) -> Result<ChangeAnalysis, Error> {
        let before = self.get(operation, current.id).ok_or_else(|| {
            Error::NotFound(format!(
                "snapshot of field {} for {}",
                current.id, operation
            ))
        })?;
        let mut analysis = ChangeAnalysis::between(&before, current);
        analysis.affected_record_estimate =
            tx.count_records_with_key(before.pipeline_id, &before.slug)?;
        Ok(analysis)
    }

    /// Drop the snapshot of a finished operation.
    pub fn release(&self, operation: OperationId, field_id: u64) {
        self.entries.remove(&(operation, field_id));
    }

    /// Drop expired entries; returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, snapshot| snapshot.captured_at.elapsed() < self.ttl);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            tracing::debug!(removed, "swept expired field snapshots");
        }
        removed
    }

    /// Number of held snapshots.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if no snapshot is held.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{
        ChoiceOptions, FieldChanges, FieldConfig, FieldSpec, FieldType, SelectOption,
        StorageConstraints,
    };

    fn text_field() -> FieldDefinition {
        FieldDefinition::new(1, 1, FieldSpec::new("Email", FieldType::Text)).unwrap()
    }

    #[test]
    fn test_snapshots_are_operation_scoped() {
        let store = SnapshotStore::new(Duration::from_secs(60));
        let field = text_field();
        let mut renamed = field.clone();
        renamed.apply(&FieldChanges::default().rename("Work Email")).unwrap();

        store.capture(OperationId(1), &field);
        store.capture(OperationId(2), &renamed);

        assert_eq!(store.get(OperationId(1), 1).unwrap().slug, "email");
        assert_eq!(store.get(OperationId(2), 1).unwrap().slug, "work_email");

        store.release(OperationId(1), 1);
        assert!(store.get(OperationId(1), 1).is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_expired_snapshots_are_swept() {
        let store = SnapshotStore::new(Duration::from_millis(0));
        store.capture(OperationId(1), &text_field());
        assert!(store.get(OperationId(1), 1).is_none());
        assert_eq!(store.sweep_expired(), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_analysis_detects_each_change() {
        let before = text_field();
        let mut after = before.clone();
        after
            .apply(
                &FieldChanges::default()
                    .rename("Email Address")
                    .change_type(FieldType::Email)
                    .with_constraints(StorageConstraints::default().unique()),
            )
            .unwrap();

        let analysis = ChangeAnalysis::between(&before, &after);
        assert!(analysis.requires_migration);
        let types: Vec<MigrationType> = analysis.migration_types.iter().copied().collect();
        assert_eq!(
            types,
            vec![
                MigrationType::Rename,
                MigrationType::TypeChange,
                MigrationType::ConstraintChange
            ]
        );
        assert_eq!(analysis.risk_level, RiskLevel::High);
    }

    #[test]
    fn test_analysis_removed_options() {
        let options = |values: &[&str]| {
            FieldConfig::Select(ChoiceOptions {
                options: values.iter().map(|v| SelectOption::new(*v)).collect(),
                ..ChoiceOptions::default()
            })
        };
        let before = FieldDefinition::new(
            1,
            1,
            FieldSpec::new("Stage", FieldType::Select).with_config(options(&["a", "b", "c"])),
        )
        .unwrap();
        let mut after = before.clone();
        after
            .apply(&FieldChanges::default().with_config(options(&["a", "b", "d"])))
            .unwrap();

        let analysis = ChangeAnalysis::between(&before, &after);
        assert_eq!(
            analysis.migration_types.iter().copied().collect::<Vec<_>>(),
            vec![MigrationType::ConfigChange]
        );
        assert_eq!(analysis.risk_level, RiskLevel::Medium);
        assert!(analysis.details[0].contains('c'));
    }

    #[test]
    fn test_analysis_no_change() {
        let field = text_field();
        let analysis = ChangeAnalysis::between(&field, &field);
        assert!(!analysis.requires_migration);
        assert_eq!(analysis.risk_level, RiskLevel::Low);
    }
}
