//! Two-tier record validation against a pipeline schema.
//!
//! Critical validation runs before a write is accepted and can reject it.
//! Non-critical validation only produces warnings and visibility hints.

use super::rules::{classify_rules, has_value, RuleClassification, RuleEffect};
use super::storage::validate_storage;
use crate::catalog::PipelineSchema;
use crate::graph::DependencyGraph;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Updates touching at most this many fields are validated in the storage
/// context.
pub const STORAGE_CONTEXT_FIELD_THRESHOLD: usize = 3;

/// Configuration for record validation.
#[derive(Debug, Clone)]
pub struct ValidationConfig {
    /// Largest number of changed fields validated in the storage context.
    pub storage_context_max_changed_fields: usize,
    /// Maximum concurrent background validation tasks.
    pub background_validation_limit: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            storage_context_max_changed_fields: STORAGE_CONTEXT_FIELD_THRESHOLD,
            background_validation_limit: 8,
        }
    }
}

impl ValidationConfig {
    /// Set the storage-context threshold.
    pub fn with_storage_context_max_changed_fields(mut self, max: usize) -> Self {
        self.storage_context_max_changed_fields = max;
        self
    }

    /// Set the background task limit.
    pub fn with_background_validation_limit(mut self, limit: usize) -> Self {
        self.background_validation_limit = limit;
        self
    }
}

/// Which checks a write gets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationContext {
    /// New record: every field, critical rules included.
    Full,
    /// Small update: baseline storage checks of the changed fields only.
    Storage {
        /// Changed slugs.
        changed: BTreeSet<String>,
    },
    /// Large update or explicit request: critical rules over the cascade of
    /// the changed field, or over every field if no single field changed.
    BusinessRules {
        /// The single changed slug, if there is one.
        changed: Option<String>,
    },
}

impl ValidationContext {
    /// Name used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationContext::Full => "full",
            ValidationContext::Storage { .. } => "storage",
            ValidationContext::BusinessRules { .. } => "business_rules",
        }
    }
}

/// Result of blocking validation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationOutcome {
    /// True when no field has an error.
    pub is_valid: bool,
    /// Normalized values of the validated fields.
    pub cleaned_data: Map<String, Value>,
    /// Errors per slug.
    pub field_errors: BTreeMap<String, Vec<String>>,
}

impl ValidationOutcome {
    fn new() -> Self {
        Self {
            is_valid: true,
            ..Self::default()
        }
    }

    fn add_error(&mut self, slug: &str, message: String) {
        let messages = self.field_errors.entry(slug.to_string()).or_default();
        if !messages.contains(&message) {
            messages.push(message);
        }
        self.is_valid = false;
    }
}

/// Result of non-blocking validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    /// Warnings per slug.
    pub warnings: BTreeMap<String, Vec<String>>,
    /// Fields hidden for the validated data.
    pub hidden: BTreeSet<String>,
}

impl ValidationReport {
    /// Check if there is nothing to report.
    pub fn is_empty(&self) -> bool {
        self.warnings.is_empty() && self.hidden.is_empty()
    }
}

/// Validator bound to one pipeline schema.
#[derive(Debug, Clone)]
pub struct ValidationEngine {
    schema: PipelineSchema,
    graph: DependencyGraph,
    rules: RuleClassification,
    storage_context_max: usize,
}

impl ValidationEngine {
    /// Build a validator for `schema`.
    pub fn new(schema: PipelineSchema, config: &ValidationConfig) -> Self {
        let graph = DependencyGraph::build(&schema);
        let rules = classify_rules(&schema);
        Self {
            schema,
            graph,
            rules,
            storage_context_max: config.storage_context_max_changed_fields,
        }
    }

    /// The schema this engine validates against.
    pub fn schema(&self) -> &PipelineSchema {
        &self.schema
    }

    /// The pipeline's dependency graph.
    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Classified rules.
    pub fn rules(&self) -> &RuleClassification {
        &self.rules
    }

    /// Pick the validation context of a write.
    pub fn select_context(
        &self,
        is_new: bool,
        changed: &BTreeSet<String>,
        force_business_rules: bool,
    ) -> ValidationContext {
        if is_new {
            return ValidationContext::Full;
        }
        if !force_business_rules && changed.len() <= self.storage_context_max {
            return ValidationContext::Storage {
                changed: changed.clone(),
            };
        }
        let single = match changed.len() {
            1 => changed.iter().next().cloned(),
            _ => None,
        };
        ValidationContext::BusinessRules { changed: single }
    }

    /// Validate `data` (the full candidate record) in `context`.
    pub fn validate(&self, data: &Map<String, Value>, context: &ValidationContext) -> ValidationOutcome {
        match context {
            ValidationContext::Full => self.validate_critical(data, None),
            ValidationContext::Storage { changed } => self.validate_fields(data, changed),
            ValidationContext::BusinessRules { changed } => {
                self.validate_critical(data, changed.as_deref())
            }
        }
    }

    /// Baseline storage checks of `slugs` only.
    pub fn validate_fields(&self, data: &Map<String, Value>, slugs: &BTreeSet<String>) -> ValidationOutcome {
        let mut outcome = ValidationOutcome::new();
        for slug in slugs {
            let Some(field) = self.schema.field(slug) else {
                outcome.add_error(slug, "unknown field".to_string());
                continue;
            };
            let value = data.get(slug).unwrap_or(&Value::Null);
            match validate_storage(value, field.field_type, &field.config, &field.constraints) {
                Ok(cleaned) => {
                    outcome.cleaned_data.insert(slug.clone(), cleaned);
                }
                Err(message) => outcome.add_error(slug, message),
            }
        }
        outcome
    }

    /// Blocking validation: storage checks plus critical rules.
    ///
    /// With `changed`, only the cascade of that field is checked; otherwise
    /// every present field and every critical rule.
    pub fn validate_critical(&self, data: &Map<String, Value>, changed: Option<&str>) -> ValidationOutcome {
        let scope = changed.map(|slug| self.graph.cascade(slug).affected);
        let in_scope = |slug: &str| scope.as_ref().is_none_or(|s| s.contains(slug));

        let mut outcome = ValidationOutcome::new();
        let mut view = data.clone();
        for field in self.schema.fields.iter().filter(|f| in_scope(&f.slug)) {
            let Some(value) = data.get(&field.slug) else {
                continue;
            };
            match validate_storage(value, field.field_type, &field.config, &field.constraints) {
                Ok(cleaned) => {
                    view.insert(field.slug.clone(), cleaned.clone());
                    outcome.cleaned_data.insert(field.slug.clone(), cleaned);
                }
                Err(message) => outcome.add_error(&field.slug, message),
            }
        }

        let stage_field = self.schema.stage_field();
        for rule in self.rules.critical.iter().filter(|r| in_scope(&r.slug)) {
            if !self.rules.is_visible(&rule.slug, &view) {
                continue;
            }
            match rule.evaluate(&view, stage_field) {
                RuleEffect::Required(message) if !has_value(&view, &rule.slug) => {
                    outcome.add_error(&rule.slug, message)
                }
                RuleEffect::Warning(message) => outcome.add_error(&rule.slug, message),
                _ => {}
            }
        }
        outcome
    }

    /// Non-blocking validation: warnings and visibility hints. Never fails.
    pub fn validate_non_critical(&self, data: &Map<String, Value>, changed: Option<&str>) -> ValidationReport {
        let scope = changed.map(|slug| self.graph.cascade(slug).affected);
        let in_scope = |slug: &str| scope.as_ref().is_none_or(|s| s.contains(slug));
        let stage_field = self.schema.stage_field();

        let mut report = ValidationReport::default();
        for rule in self.rules.non_critical.iter().filter(|r| in_scope(&r.slug)) {
            match rule.evaluate(data, stage_field) {
                RuleEffect::Hidden => {
                    report.hidden.insert(rule.slug.clone());
                }
                RuleEffect::Warning(message) => {
                    report.warnings.entry(rule.slug.clone()).or_default().push(message);
                }
                RuleEffect::Required(message)
                    if !has_value(data, &rule.slug) && self.rules.is_visible(&rule.slug, data) =>
                {
                    report
                        .warnings
                        .entry(rule.slug.clone())
                        .or_default()
                        .push(format!("{} (not enforced)", message));
                }
                _ => {}
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{
        BusinessRules, Condition, ConditionGroup, ConditionalRule, FieldDefinition, FieldSpec,
        FieldType, Pipeline, RuleAction, StorageConstraints,
    };
    use serde_json::json;

    fn data(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    fn engine() -> ValidationEngine {
        let kind = FieldDefinition::new(1, 1, FieldSpec::new("Kind", FieldType::Text)).unwrap();
        let company = FieldDefinition::new(
            2,
            1,
            FieldSpec::new("Company", FieldType::Text).with_rules(
                BusinessRules::default()
                    .with_rule(ConditionalRule::new(
                        RuleAction::Require,
                        ConditionGroup::all(vec![Condition::equals("kind", "b2b")]),
                    ))
                    .with_rule(ConditionalRule::new(
                        RuleAction::Hide,
                        ConditionGroup::all(vec![Condition::equals("kind", "internal")]),
                    )),
            ),
        )
        .unwrap();
        let budget = FieldDefinition::new(
            3,
            1,
            FieldSpec::new("Budget", FieldType::Number)
                .with_rules(BusinessRules::default().with_stage_requirement(vec!["won".into()])),
        )
        .unwrap();
        let stage = FieldDefinition::new(4, 1, FieldSpec::new("Stage", FieldType::Text)).unwrap();
        let notes = FieldDefinition::new(
            5,
            1,
            FieldSpec::new("Notes", FieldType::Text)
                .with_constraints(StorageConstraints::default().with_max_length(5))
                .with_rules(BusinessRules::default().with_rule(
                    ConditionalRule::new(
                        RuleAction::Warn,
                        ConditionGroup::all(vec![Condition::is_not_empty("budget")]),
                    )
                    .with_message("mention the budget"),
                )),
        )
        .unwrap();
        let schema = PipelineSchema::new(
            Pipeline::new(1, "Deals").with_stage_field("stage"),
            vec![kind, company, budget, stage, notes],
        );
        ValidationEngine::new(schema, &ValidationConfig::default())
    }

    fn changed(slugs: &[&str]) -> BTreeSet<String> {
        slugs.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_context_selection() {
        let engine = engine();
        assert_eq!(engine.select_context(true, &changed(&[]), false), ValidationContext::Full);
        assert!(matches!(
            engine.select_context(false, &changed(&["a", "b", "c"]), false),
            ValidationContext::Storage { .. }
        ));
        assert_eq!(
            engine.select_context(false, &changed(&["a", "b", "c", "d"]), false),
            ValidationContext::BusinessRules { changed: None }
        );
        assert_eq!(
            engine.select_context(false, &changed(&["kind"]), true),
            ValidationContext::BusinessRules {
                changed: Some("kind".to_string())
            }
        );
    }

    #[test]
    fn test_threshold_is_configurable() {
        let engine = ValidationEngine::new(
            engine().schema().clone(),
            &ValidationConfig::default().with_storage_context_max_changed_fields(0),
        );
        assert!(matches!(
            engine.select_context(false, &changed(&["kind"]), false),
            ValidationContext::BusinessRules { .. }
        ));
    }

    #[test]
    fn test_conditional_requirement() {
        let engine = engine();
        let outcome = engine.validate_critical(&data(json!({"kind": "b2b"})), None);
        assert!(!outcome.is_valid);
        assert!(outcome.field_errors.contains_key("company"));

        let outcome = engine.validate_critical(&data(json!({"kind": "b2b", "company": "Acme"})), None);
        assert!(outcome.is_valid);
    }

    #[test]
    fn test_hidden_field_is_never_required() {
        let engine = engine();
        let mut rules_data = data(json!({"kind": "internal"}));
        let outcome = engine.validate_critical(&rules_data, None);
        assert!(outcome.is_valid);
        rules_data.insert("kind".to_string(), json!("b2b"));
        assert!(!engine.validate_critical(&rules_data, None).is_valid);
    }

    #[test]
    fn test_stage_requirement_in_cascade_scope() {
        let engine = engine();
        let record = data(json!({"stage": "won"}));
        let outcome = engine.validate_critical(&record, Some("stage"));
        assert_eq!(outcome.field_errors.keys().collect::<Vec<_>>(), vec!["budget"]);

        // kind's cascade does not reach budget
        assert!(engine.validate_critical(&record, Some("kind")).is_valid);
    }

    #[test]
    fn test_storage_context_checks_changed_fields_only() {
        let engine = engine();
        let record = data(json!({"kind": "b2b", "notes": "ok", "budget": "12"}));
        let outcome = engine.validate_fields(&record, &changed(&["budget"]));
        assert!(outcome.is_valid);
        assert_eq!(outcome.cleaned_data["budget"], json!(12));
        assert_eq!(outcome.cleaned_data.len(), 1);

        let outcome = engine.validate_fields(&data(json!({"notes": "too long"})), &changed(&["notes"]));
        assert!(outcome.field_errors["notes"][0].contains("maximum is 5"));

        let outcome = engine.validate_fields(&record, &changed(&["ghost"]));
        assert!(!outcome.is_valid);
    }

    #[test]
    fn test_non_critical_report() {
        let engine = engine();
        let report = engine.validate_non_critical(&data(json!({"kind": "internal", "budget": 5})), None);
        assert_eq!(report.warnings["notes"], vec!["mention the budget".to_string()]);
        assert!(report.hidden.contains("company"));
        assert!(engine.validate_non_critical(&data(json!({})), None).is_empty());
    }
}
