//! Type compatibility classification.
//!
//! Classifies a requested type change as Denied, Safe, or Risky. Entries are
//! looked up most-specific first: the exact `(old, new)` pair, then a
//! wildcard on the old type, then a wildcard on the new type. A pair that no
//! table covers is denied.

use super::error::RiskLevel;
use crate::catalog::{FieldType, StorageConstraints};
use std::collections::HashMap;

/// Number of characters kept when multi-line text becomes single-line text.
pub const TEXT_TRUNCATION_LIMIT: usize = 160;

/// Kind of data loss a risky change can cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataLossKind {
    /// Strings are cut to a maximum length.
    Truncation,
    /// Arrays are reduced to their first element.
    ArrayReduction,
    /// Values failing the target format are dropped.
    ValidationFilter,
    /// Time-of-day is discarded.
    PrecisionLoss,
    /// Values outside the target option list are dropped.
    OptionPruning,
    /// Existing values may violate tightened constraints.
    ConstraintTightening,
}

impl std::fmt::Display for DataLossKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataLossKind::Truncation => write!(f, "truncation"),
            DataLossKind::ArrayReduction => write!(f, "array_reduction"),
            DataLossKind::ValidationFilter => write!(f, "validation_filter"),
            DataLossKind::PrecisionLoss => write!(f, "precision_loss"),
            DataLossKind::OptionPruning => write!(f, "option_pruning"),
            DataLossKind::ConstraintTightening => write!(f, "constraint_tightening"),
        }
    }
}

/// Verdict for a proposed type or constraint change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationDecision {
    /// The change is refused; nothing may be migrated.
    Denied {
        /// Short reason.
        reason: String,
        /// Longer explanation for the user.
        explanation: String,
        /// Concrete alternative strategies.
        alternatives: Vec<String>,
    },
    /// Every existing value converts without loss.
    Safe {
        /// Whether stored values need rewriting.
        auto_convert: bool,
        /// What happens to stored values.
        description: String,
    },
    /// The change is allowed but may lose data.
    Risky {
        /// How data may be lost.
        data_loss: DataLossKind,
        /// Severity.
        risk: RiskLevel,
        /// Warning to surface to the user.
        warning: String,
        /// Whether the caller must confirm after previewing.
        requires_preview: bool,
    },
}

impl MigrationDecision {
    /// Check if the change is refused.
    pub fn is_denied(&self) -> bool {
        matches!(self, MigrationDecision::Denied { .. })
    }

    /// Check if the change is safe.
    pub fn is_safe(&self) -> bool {
        matches!(self, MigrationDecision::Safe { .. })
    }

    /// Risk level of the decision. Denied changes count as high.
    pub fn risk(&self) -> RiskLevel {
        match self {
            MigrationDecision::Safe { .. } => RiskLevel::Low,
            MigrationDecision::Risky { risk, .. } => *risk,
            MigrationDecision::Denied { .. } => RiskLevel::High,
        }
    }

    /// Warning text for risky decisions.
    pub fn warning(&self) -> Option<&str> {
        match self {
            MigrationDecision::Risky { warning, .. } => Some(warning),
            _ => None,
        }
    }

    /// Label used in logs and audit entries.
    pub fn label(&self) -> &'static str {
        match self {
            MigrationDecision::Denied { .. } => "denied",
            MigrationDecision::Safe { .. } => "safe",
            MigrationDecision::Risky { .. } => "risky",
        }
    }

    fn safe(description: impl Into<String>) -> Self {
        MigrationDecision::Safe {
            auto_convert: true,
            description: description.into(),
        }
    }

    fn risky(
        data_loss: DataLossKind,
        risk: RiskLevel,
        warning: impl Into<String>,
        requires_preview: bool,
    ) -> Self {
        MigrationDecision::Risky {
            data_loss,
            risk,
            warning: warning.into(),
            requires_preview,
        }
    }

    fn denied(reason: impl Into<String>, explanation: impl Into<String>) -> Self {
        MigrationDecision::Denied {
            reason: reason.into(),
            explanation: explanation.into(),
            alternatives: vec![
                "Create a new field with the target type and copy values manually".to_string(),
                "Export the records, transform the values, and re-import them".to_string(),
            ],
        }
    }
}

/// Lookup tables for type-change classification.
#[derive(Debug, Clone, Default)]
pub struct TypeCompatibilityMatrix {
    exact: HashMap<(FieldType, FieldType), MigrationDecision>,
    from_any: HashMap<FieldType, MigrationDecision>,
    to_any: HashMap<FieldType, MigrationDecision>,
}

impl TypeCompatibilityMatrix {
    /// Matrix with no entries; every type change is denied.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Matrix with the built-in classifications.
    pub fn standard() -> Self {
        use DataLossKind::*;
        use FieldType::*;

        let mut matrix = Self::empty();

        // Lossless widenings.
        for (from, to) in [
            (Text, Textarea),
            (Email, Text),
            (Email, Textarea),
            (Phone, Text),
            (Phone, Textarea),
            (Url, Text),
            (Url, Textarea),
        ] {
            matrix.set(from, to, MigrationDecision::safe("Values are kept as plain text"));
        }
        matrix.set(Number, Decimal, MigrationDecision::safe("Numbers keep their value"));
        matrix.set(Decimal, Number, MigrationDecision::safe("Numbers keep their value"));
        for from in [Number, Decimal, Boolean, Date, Datetime, Tags, Multiselect, Select] {
            matrix.set(
                from,
                Text,
                MigrationDecision::safe("Values are rendered as text"),
            );
        }
        matrix.set(
            Select,
            Multiselect,
            MigrationDecision::safe("Each value becomes a one-element selection"),
        );
        matrix.set(
            Select,
            Tags,
            MigrationDecision::safe("Each value becomes a single tag"),
        );
        matrix.set(
            Multiselect,
            Tags,
            MigrationDecision::safe("Selections become tags"),
        );
        matrix.set(
            Date,
            Datetime,
            MigrationDecision::safe("Dates become midnight UTC timestamps"),
        );

        // Lossy conversions.
        matrix.set(
            Textarea,
            Text,
            MigrationDecision::risky(
                Truncation,
                RiskLevel::High,
                format!(
                    "Text longer than {} characters will be truncated",
                    TEXT_TRUNCATION_LIMIT
                ),
                true,
            ),
        );
        matrix.set(
            Multiselect,
            Select,
            MigrationDecision::risky(
                ArrayReduction,
                RiskLevel::High,
                "Only the first selected value of each record is kept",
                true,
            ),
        );
        matrix.set(
            Datetime,
            Date,
            MigrationDecision::risky(
                PrecisionLoss,
                RiskLevel::Medium,
                "The time of day is discarded",
                false,
            ),
        );
        matrix.set(
            Tags,
            Multiselect,
            MigrationDecision::risky(
                OptionPruning,
                RiskLevel::Medium,
                "Tags that are not configured options are dropped",
                true,
            ),
        );
        for to in [Number, Decimal, Email, Url, Phone, Date, Datetime, Boolean, Select] {
            matrix.set(
                Text,
                to,
                MigrationDecision::risky(
                    ValidationFilter,
                    RiskLevel::High,
                    format!("Values that are not a valid {} will be cleared", to),
                    true,
                ),
            );
        }

        // Ambiguous unit: a date is not a number of anything in particular.
        let ambiguous = MigrationDecision::denied(
            "Ambiguous conversion between dates and numbers",
            "There is no single unit (days, seconds, a year) a date converts to or from",
        );
        matrix.set(Date, Number, ambiguous.clone());
        matrix.set(Number, Date, ambiguous);

        // Structured or computed types never convert.
        for field_type in [AiGenerated, Relation, File, Address, Button, RecordData] {
            let decision = MigrationDecision::denied(
                format!("'{}' fields cannot change type", field_type),
                format!(
                    "Values of a '{}' field have no faithful representation in another type",
                    field_type
                ),
            );
            matrix.set_from_any(field_type, decision.clone());
            matrix.set_to_any(field_type, decision);
        }

        matrix
    }

    /// Set the classification of an exact pair.
    pub fn set(&mut self, from: FieldType, to: FieldType, decision: MigrationDecision) -> &mut Self {
        self.exact.insert((from, to), decision);
        self
    }

    /// Set the classification of every change away from `from`.
    pub fn set_from_any(&mut self, from: FieldType, decision: MigrationDecision) -> &mut Self {
        self.from_any.insert(from, decision);
        self
    }

    /// Set the classification of every change into `to`.
    pub fn set_to_any(&mut self, to: FieldType, decision: MigrationDecision) -> &mut Self {
        self.to_any.insert(to, decision);
        self
    }

    /// Classify a change of type and constraints.
    pub fn classify(
        &self,
        old_type: FieldType,
        new_type: FieldType,
        old_constraints: &StorageConstraints,
        new_constraints: &StorageConstraints,
    ) -> MigrationDecision {
        if old_type == new_type {
            return Self::classify_constraints(old_constraints, new_constraints);
        }

        let decision = self
            .exact
            .get(&(old_type, new_type))
            .or_else(|| self.from_any.get(&old_type))
            .or_else(|| self.to_any.get(&new_type))
            .cloned()
            .unwrap_or_else(|| {
                MigrationDecision::denied(
                    format!("No tested conversion from '{}' to '{}'", old_type, new_type),
                    "Untested conversions are refused rather than guessed",
                )
            });

        match (decision, Self::classify_constraints(old_constraints, new_constraints)) {
            (denied @ MigrationDecision::Denied { .. }, _) => denied,
            (decision, MigrationDecision::Safe { .. }) => decision,
            (MigrationDecision::Safe { .. }, constraint) => constraint,
            (
                MigrationDecision::Risky {
                    data_loss,
                    warning,
                    requires_preview,
                    ..
                },
                constraint,
            ) => MigrationDecision::Risky {
                data_loss,
                risk: RiskLevel::High,
                warning: match constraint.warning() {
                    Some(extra) => format!("{}. {}", warning, extra),
                    None => warning,
                },
                requires_preview,
            },
        }
    }

    /// Classify a constraint-only change.
    pub fn classify_constraints(
        old: &StorageConstraints,
        new: &StorageConstraints,
    ) -> MigrationDecision {
        let mut warnings = Vec::new();
        if old.max_length_shrinks_to(new) {
            if let Some(max) = new.max_length {
                warnings.push(format!(
                    "Existing values longer than {} characters will block the change",
                    max
                ));
            }
        }
        if !old.enforce_uniqueness && new.enforce_uniqueness {
            warnings.push("Duplicate existing values will block the change".to_string());
        }

        if warnings.is_empty() {
            MigrationDecision::Safe {
                auto_convert: false,
                description: "No stored value changes".to_string(),
            }
        } else {
            MigrationDecision::risky(
                DataLossKind::ConstraintTightening,
                RiskLevel::High,
                warnings.join(". "),
                false,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use FieldType::*;

    fn classify(old: FieldType, new: FieldType) -> MigrationDecision {
        let none = StorageConstraints::default();
        TypeCompatibilityMatrix::standard().classify(old, new, &none, &none)
    }

    #[test]
    fn test_fixed_classifications() {
        assert!(classify(Text, Textarea).is_safe());
        assert!(classify(Number, Decimal).is_safe());
        assert!(classify(Select, Multiselect).is_safe());

        match classify(Textarea, Text) {
            MigrationDecision::Risky {
                data_loss,
                requires_preview,
                ..
            } => {
                assert_eq!(data_loss, DataLossKind::Truncation);
                assert!(requires_preview);
            }
            other => panic!("expected risky, got {:?}", other),
        }
        assert!(matches!(
            classify(Multiselect, Select),
            MigrationDecision::Risky {
                data_loss: DataLossKind::ArrayReduction,
                ..
            }
        ));
        for target in [Number, Email, Url, Phone, Date] {
            assert!(matches!(
                classify(Text, target),
                MigrationDecision::Risky {
                    data_loss: DataLossKind::ValidationFilter,
                    ..
                }
            ));
        }
    }

    #[test]
    fn test_structured_types_denied_both_ways() {
        for structured in [AiGenerated, Relation, File, Address, Button, RecordData] {
            assert!(classify(structured, Text).is_denied());
            assert!(classify(Text, structured).is_denied());
        }
        assert!(classify(Date, Number).is_denied());
        assert!(classify(Number, Date).is_denied());
    }

    #[test]
    fn test_denied_has_alternatives() {
        match classify(Relation, Text) {
            MigrationDecision::Denied { alternatives, .. } => assert!(!alternatives.is_empty()),
            other => panic!("expected denied, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_pairs_fail_closed() {
        let matrix = TypeCompatibilityMatrix::standard();
        let none = StorageConstraints::default();
        let known = |a: FieldType, b: FieldType| {
            matrix.exact.contains_key(&(a, b))
                || matrix.from_any.contains_key(&a)
                || matrix.to_any.contains_key(&b)
        };
        for old in FieldType::ALL {
            for new in FieldType::ALL {
                if old != new && !known(old, new) {
                    assert!(
                        matrix.classify(old, new, &none, &none).is_denied(),
                        "{} -> {} should be denied",
                        old,
                        new
                    );
                }
            }
        }
        assert!(classify(Boolean, Number).is_denied());
        assert!(classify(Phone, Email).is_denied());
    }

    #[test]
    fn test_exact_pair_beats_wildcard() {
        let mut matrix = TypeCompatibilityMatrix::empty();
        matrix.set_from_any(
            File,
            MigrationDecision::denied("no", "file values are opaque"),
        );
        matrix.set(File, Text, MigrationDecision::safe("file names become text"));
        matrix.set_to_any(Url, MigrationDecision::denied("no", "urls are special"));

        let none = StorageConstraints::default();
        assert!(matrix.classify(File, Text, &none, &none).is_safe());
        assert!(matrix.classify(File, Url, &none, &none).is_denied());
        // from-wildcard is consulted before to-wildcard
        matrix.set_from_any(Email, MigrationDecision::safe("anything goes"));
        assert!(matrix.classify(Email, Url, &none, &none).is_safe());
    }

    #[test]
    fn test_constraint_only_changes() {
        let matrix = TypeCompatibilityMatrix::standard();
        let loose = StorageConstraints::default().with_max_length(100);
        let tight = StorageConstraints::default().with_max_length(20);

        let decision = matrix.classify(Text, Text, &loose, &tight);
        assert!(matches!(
            decision,
            MigrationDecision::Risky {
                data_loss: DataLossKind::ConstraintTightening,
                risk: RiskLevel::High,
                ..
            }
        ));
        assert!(matrix.classify(Text, Text, &tight, &loose).is_safe());
        assert!(matrix
            .classify(Text, Text, &loose, &loose.clone().unique())
            .warning()
            .is_some());
    }

    #[test]
    fn test_constraint_tightening_escalates_type_change() {
        let matrix = TypeCompatibilityMatrix::standard();
        let none = StorageConstraints::default();
        let unique = StorageConstraints::default().unique();
        let decision = matrix.classify(Text, Textarea, &none, &unique);
        assert_eq!(decision.risk(), RiskLevel::High);
        assert!(!decision.is_safe());
    }
}
