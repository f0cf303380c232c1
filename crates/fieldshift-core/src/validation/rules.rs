//! Business-rule classification and evaluation.

use crate::catalog::{
    is_empty_value, value_text, Condition, ConditionalRule, LegacyRequirement, PipelineSchema,
    RuleAction, StageRequirement,
};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// A business rule together with the field that owns it.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedRule {
    /// Owning field.
    pub slug: String,
    /// The rule.
    pub rule: RuleKind,
}

/// The shapes a business rule can take.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleKind {
    /// Required in certain stages.
    Stage(StageRequirement),
    /// Conditional show/hide/require/warn.
    Conditional(ConditionalRule),
    /// Legacy single-condition requirement.
    Legacy(LegacyRequirement),
}

/// Outcome of evaluating one rule against record data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleEffect {
    /// The rule does not apply.
    None,
    /// The owning field must hold a value.
    Required(String),
    /// The owning field is visible.
    Visible,
    /// The owning field is hidden.
    Hidden,
    /// A warning for the owning field.
    Warning(String),
}

impl ClassifiedRule {
    /// Check if the rule can block a write.
    ///
    /// An explicit `block_transitions` setting wins; otherwise stage and
    /// require rules block, and visibility and warning rules do not.
    pub fn is_critical(&self) -> bool {
        match &self.rule {
            RuleKind::Stage(stage) => stage.block_transitions.unwrap_or(true),
            RuleKind::Conditional(rule) => match rule.action {
                RuleAction::Show | RuleAction::Hide => false,
                RuleAction::Require => rule.block_transitions.unwrap_or(true),
                RuleAction::Warn => rule.block_transitions.unwrap_or(false),
            },
            RuleKind::Legacy(_) => true,
        }
    }

    /// Evaluate the rule against `data`.
    pub fn evaluate(&self, data: &Map<String, Value>, stage_field: Option<&str>) -> RuleEffect {
        match &self.rule {
            RuleKind::Stage(stage) => {
                let current = stage_field
                    .and_then(|slug| data.get(slug))
                    .and_then(value_text);
                match current {
                    Some(current)
                        if stage
                            .stages
                            .iter()
                            .any(|s| s.trim().eq_ignore_ascii_case(&current)) =>
                    {
                        RuleEffect::Required(format!("required in stage '{}'", current))
                    }
                    _ => RuleEffect::None,
                }
            }
            RuleKind::Conditional(rule) => {
                let matched = rule.when.evaluate(data);
                match (rule.action, matched) {
                    (RuleAction::Show, true) | (RuleAction::Hide, false) => RuleEffect::Visible,
                    (RuleAction::Show, false) | (RuleAction::Hide, true) => RuleEffect::Hidden,
                    (RuleAction::Require, true) => RuleEffect::Required(
                        rule.message.clone().unwrap_or_else(|| "required".to_string()),
                    ),
                    (RuleAction::Warn, true) => RuleEffect::Warning(
                        rule.message
                            .clone()
                            .unwrap_or_else(|| "check this value".to_string()),
                    ),
                    (RuleAction::Require, false) | (RuleAction::Warn, false) => RuleEffect::None,
                }
            }
            RuleKind::Legacy(requirement) => {
                let matched = Condition::equals(
                    requirement.condition_field.clone(),
                    requirement.condition_value.clone(),
                )
                .evaluate(data);
                if matched {
                    RuleEffect::Required(format!(
                        "required when '{}' is {}",
                        requirement.condition_field, requirement.condition_value
                    ))
                } else {
                    RuleEffect::None
                }
            }
        }
    }
}

/// Rules of a pipeline split by whether they can block a write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleClassification {
    /// Rules that can block a write.
    pub critical: Vec<ClassifiedRule>,
    /// Rules that only affect visibility or produce warnings.
    pub non_critical: Vec<ClassifiedRule>,
}

impl RuleClassification {
    /// Slugs owning at least one critical rule.
    pub fn critical_slugs(&self) -> BTreeSet<&str> {
        self.critical.iter().map(|r| r.slug.as_str()).collect()
    }

    /// Visibility rules of one field, whatever their classification.
    pub fn visibility_rules<'a>(&'a self, slug: &'a str) -> impl Iterator<Item = &'a ClassifiedRule> {
        self.critical
            .iter()
            .chain(self.non_critical.iter())
            .filter(move |r| r.slug == slug)
            .filter(|r| {
                matches!(
                    &r.rule,
                    RuleKind::Conditional(rule)
                        if matches!(rule.action, RuleAction::Show | RuleAction::Hide)
                )
            })
    }

    /// Check if `slug` is visible for `data`. A field without visibility
    /// rules is visible; otherwise every such rule must leave it visible.
    pub fn is_visible(&self, slug: &str, data: &Map<String, Value>) -> bool {
        self.visibility_rules(slug)
            .all(|rule| rule.evaluate(data, None) != RuleEffect::Hidden)
    }
}

/// Split every active field's rules into critical and non-critical.
pub fn classify_rules(schema: &PipelineSchema) -> RuleClassification {
    let mut classification = RuleClassification::default();
    for field in &schema.fields {
        let rules = &field.business_rules;
        let mut owned: Vec<RuleKind> = Vec::new();
        if let Some(stage) = &rules.stage_requirement {
            owned.push(RuleKind::Stage(stage.clone()));
        }
        owned.extend(rules.rules.iter().cloned().map(RuleKind::Conditional));
        owned.extend(
            rules
                .conditional_requirements
                .iter()
                .cloned()
                .map(RuleKind::Legacy),
        );

        for rule in owned {
            let classified = ClassifiedRule {
                slug: field.slug.clone(),
                rule,
            };
            if classified.is_critical() {
                classification.critical.push(classified);
            } else {
                classification.non_critical.push(classified);
            }
        }
    }
    classification
}

/// Check if `data` holds a value under `slug`.
pub(crate) fn has_value(data: &Map<String, Value>, slug: &str) -> bool {
    data.get(slug).is_some_and(|v| !is_empty_value(v))
}
