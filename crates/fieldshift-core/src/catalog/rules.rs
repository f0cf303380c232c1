//! Business rules attached to a field.
//!
//! Rules reference other fields by slug. A rule either gates writes (stage
//! requirements, require-when conditions, legacy conditional requirements) or
//! only affects display (show/hide) and warnings.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// Comparison applied by a [`Condition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    /// Value equals the operand.
    Equals,
    /// Value differs from the operand.
    NotEquals,
    /// String contains the operand, or array holds it.
    Contains,
    /// Value is missing, null, blank, or an empty collection.
    IsEmpty,
    /// Negation of `IsEmpty`.
    IsNotEmpty,
    /// Numeric (or lexical, for dates) greater-than.
    GreaterThan,
    /// Numeric (or lexical, for dates) less-than.
    LessThan,
    /// Value equals one of the operand's elements.
    OneOf,
}

/// A single predicate over another field's value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Slug of the field the condition reads.
    pub field: String,
    /// Comparison to apply.
    pub operator: ConditionOperator,
    /// Operand; unused by the emptiness operators.
    #[serde(default)]
    pub value: Value,
}

impl Condition {
    /// Create a condition.
    pub fn new(field: impl Into<String>, operator: ConditionOperator, value: Value) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
        }
    }

    /// `field == value`.
    pub fn equals(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, ConditionOperator::Equals, value.into())
    }

    /// `field` holds a value.
    pub fn is_not_empty(field: impl Into<String>) -> Self {
        Self::new(field, ConditionOperator::IsNotEmpty, Value::Null)
    }

    /// Evaluate against record data.
    pub fn evaluate(&self, data: &Map<String, Value>) -> bool {
        let actual = data.get(&self.field).unwrap_or(&Value::Null);
        match self.operator {
            ConditionOperator::Equals => loose_eq(actual, &self.value),
            ConditionOperator::NotEquals => !loose_eq(actual, &self.value),
            ConditionOperator::Contains => contains(actual, &self.value),
            ConditionOperator::IsEmpty => is_empty_value(actual),
            ConditionOperator::IsNotEmpty => !is_empty_value(actual),
            ConditionOperator::GreaterThan => {
                compare(actual, &self.value) == Some(std::cmp::Ordering::Greater)
            }
            ConditionOperator::LessThan => {
                compare(actual, &self.value) == Some(std::cmp::Ordering::Less)
            }
            ConditionOperator::OneOf => match &self.value {
                Value::Array(candidates) => candidates.iter().any(|c| loose_eq(actual, c)),
                other => loose_eq(actual, other),
            },
        }
    }
}

/// How the conditions of a group combine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupLogic {
    /// Every condition must hold.
    #[default]
    All,
    /// At least one condition must hold.
    Any,
}

/// A set of conditions combined with `all`/`any`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConditionGroup {
    /// Combination logic.
    #[serde(default)]
    pub logic: GroupLogic,
    /// Member conditions.
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl ConditionGroup {
    /// Group requiring every condition.
    pub fn all(conditions: Vec<Condition>) -> Self {
        Self {
            logic: GroupLogic::All,
            conditions,
        }
    }

    /// Group requiring any condition.
    pub fn any(conditions: Vec<Condition>) -> Self {
        Self {
            logic: GroupLogic::Any,
            conditions,
        }
    }

    /// Evaluate against record data. An empty group never matches.
    pub fn evaluate(&self, data: &Map<String, Value>) -> bool {
        if self.conditions.is_empty() {
            return false;
        }
        match self.logic {
            GroupLogic::All => self.conditions.iter().all(|c| c.evaluate(data)),
            GroupLogic::Any => self.conditions.iter().any(|c| c.evaluate(data)),
        }
    }
}

/// Effect of a conditional rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    /// Field is visible only while the condition holds.
    Show,
    /// Field is hidden while the condition holds.
    Hide,
    /// Field must hold a value while the condition holds.
    Require,
    /// Emit the rule message while the condition holds.
    Warn,
}

/// A conditional rule on the owning field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionalRule {
    /// What the rule does when it matches.
    pub action: RuleAction,
    /// When the rule matches.
    pub when: ConditionGroup,
    /// Message reported when the rule fires.
    #[serde(default)]
    pub message: Option<String>,
    /// Explicit override of whether the rule may block a write.
    #[serde(default)]
    pub block_transitions: Option<bool>,
}

impl ConditionalRule {
    /// Create a rule.
    pub fn new(action: RuleAction, when: ConditionGroup) -> Self {
        Self {
            action,
            when,
            message: None,
            block_transitions: None,
        }
    }

    /// Set the message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Override whether the rule blocks writes.
    pub fn with_block_transitions(mut self, block: bool) -> Self {
        self.block_transitions = Some(block);
        self
    }
}

/// Field must hold a value while the record sits in one of `stages`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageRequirement {
    /// Stage values (of the pipeline's stage field) that require this field.
    pub stages: Vec<String>,
    /// Explicit override of whether the requirement may block a write.
    #[serde(default)]
    pub block_transitions: Option<bool>,
}

/// Older single-condition requirement: required when `field` equals `equals`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyRequirement {
    /// Slug of the controlling field.
    pub condition_field: String,
    /// Value that makes the owning field required.
    pub condition_value: Value,
}

/// All business rules of one field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BusinessRules {
    /// Stage-driven requirement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_requirement: Option<StageRequirement>,
    /// Conditional show/hide/require/warn rules.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<ConditionalRule>,
    /// Legacy conditional requirements.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditional_requirements: Vec<LegacyRequirement>,
}

impl BusinessRules {
    /// Require the field in the given stages.
    pub fn with_stage_requirement(mut self, stages: Vec<String>) -> Self {
        self.stage_requirement = Some(StageRequirement {
            stages,
            block_transitions: None,
        });
        self
    }

    /// Add a conditional rule.
    pub fn with_rule(mut self, rule: ConditionalRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Add a legacy conditional requirement.
    pub fn with_conditional_requirement(
        mut self,
        condition_field: impl Into<String>,
        condition_value: impl Into<Value>,
    ) -> Self {
        self.conditional_requirements.push(LegacyRequirement {
            condition_field: condition_field.into(),
            condition_value: condition_value.into(),
        });
        self
    }

    /// Check if no rule is configured.
    pub fn is_empty(&self) -> bool {
        self.stage_requirement.is_none()
            && self.rules.is_empty()
            && self.conditional_requirements.is_empty()
    }

    /// Slugs referenced by any condition.
    pub fn referenced_slugs(&self) -> BTreeSet<String> {
        let mut slugs: BTreeSet<String> = self
            .rules
            .iter()
            .flat_map(|r| r.when.conditions.iter().map(|c| c.field.clone()))
            .collect();
        slugs.extend(
            self.conditional_requirements
                .iter()
                .map(|r| r.condition_field.clone()),
        );
        slugs
    }

    /// Rewrite references to `from` so they point at `to`.
    pub fn rename_reference(&mut self, from: &str, to: &str) -> bool {
        let mut changed = false;
        for rule in &mut self.rules {
            for condition in &mut rule.when.conditions {
                if condition.field == from {
                    condition.field = to.to_string();
                    changed = true;
                }
            }
        }
        for requirement in &mut self.conditional_requirements {
            if requirement.condition_field == from {
                requirement.condition_field = to.to_string();
                changed = true;
            }
        }
        changed
    }
}

/// Check if a value counts as "no value".
pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

/// Render a scalar as comparable text.
pub fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.trim().to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn loose_eq(actual: &Value, expected: &Value) -> bool {
    if let (Some(a), Some(b)) = (as_number(actual), as_number(expected)) {
        return a == b;
    }
    match (actual, expected) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::Array(_), _) | (_, Value::Array(_)) | (Value::Object(_), _) => actual == expected,
        _ => match (value_text(actual), value_text(expected)) {
            (Some(a), Some(b)) => a.eq_ignore_ascii_case(&b),
            _ => false,
        },
    }
}

fn contains(actual: &Value, needle: &Value) -> bool {
    match actual {
        Value::Array(items) => items.iter().any(|item| loose_eq(item, needle)),
        Value::String(haystack) => match value_text(needle) {
            Some(n) => haystack.to_lowercase().contains(&n.to_lowercase()),
            None => false,
        },
        _ => false,
    }
}

fn compare(actual: &Value, expected: &Value) -> Option<std::cmp::Ordering> {
    if let (Some(a), Some(b)) = (as_number(actual), as_number(expected)) {
        return a.partial_cmp(&b);
    }
    match (actual, expected) {
        (Value::String(a), Value::String(b)) => Some(a.as_str().cmp(b.as_str())),
        _ => None,
    }
}
