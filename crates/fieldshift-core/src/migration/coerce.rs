//! Value coercion between field types.
//!
//! Coercers are pure functions: no I/O, no clock, no shared state. A value
//! that cannot convert yields `None`; the caller decides what that means.

use super::matrix::TEXT_TRUNCATION_LIMIT;
use crate::catalog::{is_empty_value, value_text, FieldConfig, FieldType};
use crate::validation::format;
use serde_json::Value;
use std::collections::HashMap;

/// A single-value conversion.
pub type CoerceFn = fn(&Value) -> Option<Value>;

/// Registry of conversions keyed by `(old_type, new_type)`.
#[derive(Clone)]
pub struct CoercerRegistry {
    coercers: HashMap<(FieldType, FieldType), CoerceFn>,
}

impl std::fmt::Debug for CoercerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut pairs: Vec<String> = self
            .coercers
            .keys()
            .map(|(from, to)| format!("{}->{}", from, to))
            .collect();
        pairs.sort();
        f.debug_struct("CoercerRegistry").field("pairs", &pairs).finish()
    }
}

impl Default for CoercerRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl CoercerRegistry {
    /// Registry with the built-in conversions.
    pub fn standard() -> Self {
        use FieldType::*;

        let mut registry = Self {
            coercers: HashMap::new(),
        };

        for from in [
            Email,
            Phone,
            Url,
            Number,
            Decimal,
            Boolean,
            Date,
            Datetime,
            Select,
            Multiselect,
            Tags,
        ] {
            registry.register(from, Text, to_text);
        }
        for from in [Text, Email, Phone, Url] {
            registry.register(from, Textarea, to_text);
        }
        registry.register(Textarea, Text, truncate_text);

        registry.register(Number, Decimal, to_decimal);
        registry.register(Decimal, Number, to_number);

        registry.register(Text, Number, to_number);
        registry.register(Text, Decimal, to_decimal);
        registry.register(Text, Email, to_email);
        registry.register(Text, Url, to_url);
        registry.register(Text, Phone, to_phone);
        registry.register(Text, Date, to_date);
        registry.register(Text, Datetime, to_datetime);
        registry.register(Text, Boolean, to_boolean);
        registry.register(Text, Select, to_choice);

        registry.register(Date, Datetime, to_datetime);
        registry.register(Datetime, Date, to_date);

        registry.register(Select, Multiselect, to_list);
        registry.register(Select, Tags, to_list);
        registry.register(Multiselect, Tags, to_list);
        registry.register(Tags, Multiselect, to_list);
        registry.register(Multiselect, Select, first_element);

        registry
    }

    /// Register or replace a conversion.
    pub fn register(&mut self, from: FieldType, to: FieldType, coercer: CoerceFn) -> &mut Self {
        self.coercers.insert((from, to), coercer);
        self
    }

    /// Check if a dedicated conversion exists.
    pub fn has(&self, from: FieldType, to: FieldType) -> bool {
        self.coercers.contains_key(&(from, to))
    }

    /// Convert `value` from `from` to `to`.
    ///
    /// Same-type values pass through unchanged. Pairs without a dedicated
    /// conversion fall back to stringifying the value.
    pub fn coerce(&self, from: FieldType, to: FieldType, value: &Value) -> Option<Value> {
        if value.is_null() {
            return None;
        }
        if from == to {
            return Some(value.clone());
        }
        match self.coercers.get(&(from, to)) {
            Some(coercer) => coercer(value),
            None => to_text(value),
        }
    }

    /// Convert and then restrict the result to the target's option list.
    pub fn coerce_for(
        &self,
        from: FieldType,
        to: FieldType,
        value: &Value,
        target: &FieldConfig,
    ) -> Option<Value> {
        self.coerce(from, to, value)
            .and_then(|converted| restrict_to_options(&converted, target))
    }
}

/// Drop values a select or multiselect config does not list.
///
/// Configs that allow custom values, or list no options at all, accept
/// anything. Multiselect arrays keep their listed elements and become `None`
/// when nothing survives.
pub fn restrict_to_options(value: &Value, config: &FieldConfig) -> Option<Value> {
    let Some(choices) = config.choices() else {
        return Some(value.clone());
    };
    if choices.allow_custom || choices.options.is_empty() {
        return Some(value.clone());
    }
    let allowed = |v: &Value| {
        value_text(v).is_some_and(|text| choices.options.iter().any(|o| o.value == text))
    };
    match (config, value) {
        (FieldConfig::Multiselect(_), Value::Array(items)) => {
            let kept: Vec<Value> = items.iter().filter(|v| allowed(v)).cloned().collect();
            (!kept.is_empty()).then_some(Value::Array(kept))
        }
        (FieldConfig::Select(_), v) if !v.is_array() && allowed(v) => Some(v.clone()),
        _ => None,
    }
}

fn to_text(value: &Value) -> Option<Value> {
    let text = match value {
        Value::Null => return None,
        Value::Array(items) => items
            .iter()
            .filter_map(value_text)
            .collect::<Vec<_>>()
            .join(", "),
        other => value_text(other)?,
    };
    Some(Value::String(text))
}

fn truncate_text(value: &Value) -> Option<Value> {
    let Value::String(text) = to_text(value)? else {
        return None;
    };
    Some(Value::String(
        text.chars().take(TEXT_TRUNCATION_LIMIT).collect(),
    ))
}

fn to_number(value: &Value) -> Option<Value> {
    let n = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => format::parse_number(s)?,
        _ => return None,
    };
    format::number_value(n)
}

fn to_decimal(value: &Value) -> Option<Value> {
    match value {
        Value::Number(_) => Some(value.clone()),
        Value::String(s) => format::parse_number(s).and_then(format::number_value),
        _ => None,
    }
}

fn string_with(value: &Value, parse: fn(&str) -> Option<String>) -> Option<Value> {
    match value {
        Value::String(s) => parse(s).map(Value::String),
        _ => None,
    }
}

fn to_email(value: &Value) -> Option<Value> {
    string_with(value, format::parse_email)
}

fn to_url(value: &Value) -> Option<Value> {
    string_with(value, format::parse_url)
}

fn to_phone(value: &Value) -> Option<Value> {
    string_with(value, format::parse_phone)
}

fn to_date(value: &Value) -> Option<Value> {
    string_with(value, format::parse_date)
}

fn to_datetime(value: &Value) -> Option<Value> {
    string_with(value, format::parse_datetime)
}

fn to_boolean(value: &Value) -> Option<Value> {
    match value {
        Value::Bool(_) => Some(value.clone()),
        Value::String(s) => format::parse_bool(s).map(Value::Bool),
        _ => None,
    }
}

fn to_choice(value: &Value) -> Option<Value> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(Value::String(s.trim().to_string())),
        _ => None,
    }
}

fn to_list(value: &Value) -> Option<Value> {
    match value {
        Value::Array(items) => {
            let items: Vec<Value> = items
                .iter()
                .filter(|v| !is_empty_value(v))
                .filter_map(|v| value_text(v).map(Value::String))
                .collect();
            (!items.is_empty()).then_some(Value::Array(items))
        }
        v if is_empty_value(v) => None,
        v => value_text(v).map(|text| Value::Array(vec![Value::String(text)])),
    }
}

fn first_element(value: &Value) -> Option<Value> {
    match value {
        Value::Array(items) => items.iter().find(|v| !is_empty_value(v)).cloned(),
        v if is_empty_value(v) => None,
        v => Some(v.clone()),
    }
}
