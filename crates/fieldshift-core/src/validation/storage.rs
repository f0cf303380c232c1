//! Baseline storage validation, applied to every written value.
//!
//! Storage never requires presence: blank input becomes `null`. A value that
//! exceeds `max_length` is rejected, never truncated.

use super::format;
use crate::catalog::{is_empty_value, value_text, FieldConfig, FieldType, StorageConstraints};
use crate::migration::restrict_to_options;
use serde_json::Value;

/// Normalize `value` for storage under a field of `field_type`.
///
/// Returns the cleaned value, or a message describing why it is rejected.
pub fn validate_storage(
    value: &Value,
    field_type: FieldType,
    config: &FieldConfig,
    constraints: &StorageConstraints,
) -> Result<Value, String> {
    if is_empty_value(value) {
        return Ok(Value::Null);
    }

    let cleaned = match field_type {
        FieldType::Text | FieldType::Textarea => match value {
            Value::Array(_) | Value::Object(_) => return Err("expected text".to_string()),
            other => Value::String(value_text(other).unwrap_or_default()),
        },
        FieldType::Number | FieldType::Decimal => {
            let n = match value {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => format::parse_number(s),
                _ => None,
            }
            .ok_or_else(|| "expected a number".to_string())?;
            if let Some(opts) = config.number_options() {
                if let Some(min) = opts.min_value.filter(|min| n < *min) {
                    return Err(format!("must be at least {}", min));
                }
                if let Some(max) = opts.max_value.filter(|max| n > *max) {
                    return Err(format!("must be at most {}", max));
                }
            }
            format::number_value(n).ok_or_else(|| "expected a finite number".to_string())?
        }
        FieldType::Email => string_format(value, format::parse_email, "invalid email address")?,
        FieldType::Url => string_format(value, format::parse_url, "invalid URL")?,
        FieldType::Phone => string_format(value, format::parse_phone, "invalid phone number")?,
        FieldType::Date => string_format(value, format::parse_date, "invalid date")?,
        FieldType::Datetime => string_format(value, format::parse_datetime, "invalid date and time")?,
        FieldType::Boolean => match value {
            Value::Bool(_) => value.clone(),
            Value::String(s) => format::parse_bool(s)
                .map(Value::Bool)
                .ok_or_else(|| "expected true or false".to_string())?,
            Value::Number(n) if n.as_f64() == Some(0.0) => Value::Bool(false),
            Value::Number(n) if n.as_f64() == Some(1.0) => Value::Bool(true),
            _ => return Err("expected true or false".to_string()),
        },
        FieldType::Select => {
            let text = match value {
                Value::String(s) => s.trim().to_string(),
                Value::Number(_) | Value::Bool(_) => value_text(value).unwrap_or_default(),
                _ => return Err("expected a single option".to_string()),
            };
            restrict_to_options(&Value::String(text.clone()), config)
                .ok_or_else(|| format!("'{}' is not an allowed option", text))?
        }
        FieldType::Multiselect | FieldType::Tags => {
            let items: Vec<Value> = match value {
                Value::Array(items) => items
                    .iter()
                    .filter(|v| !is_empty_value(v))
                    .map(|v| value_text(v).map(Value::String).ok_or_else(|| "expected a list of text values".to_string()))
                    .collect::<Result<_, _>>()?,
                other => vec![Value::String(value_text(other).unwrap_or_default())],
            };
            if items.is_empty() {
                return Ok(Value::Null);
            }
            if let Some(choices) = config.choices() {
                if let Some(max) = choices.max_selections.filter(|max| items.len() > *max) {
                    return Err(format!("at most {} selections allowed", max));
                }
                let list = Value::Array(items.clone());
                if restrict_to_options(&list, config) != Some(list.clone()) {
                    return Err("contains options that are not allowed".to_string());
                }
            }
            Value::Array(items)
        }
        FieldType::Relation => {
            let allow_multiple = matches!(
                config,
                FieldConfig::Relation {
                    allow_multiple: true,
                    ..
                }
            );
            match value {
                Value::Array(ids) if allow_multiple && ids.iter().all(is_id) => value.clone(),
                v if is_id(v) => value.clone(),
                _ => return Err("expected a record id".to_string()),
            }
        }
        FieldType::File
        | FieldType::Address
        | FieldType::Button
        | FieldType::RecordData
        | FieldType::AiGenerated => value.clone(),
    };

    if let Some(max) = constraints.max_length {
        let length = value_text(&cleaned).map(|t| t.chars().count()).unwrap_or(0);
        if length > max {
            return Err(format!(
                "is {} characters long, maximum is {}",
                length, max
            ));
        }
    }
    Ok(cleaned)
}

fn string_format(
    value: &Value,
    parse: fn(&str) -> Option<String>,
    message: &str,
) -> Result<Value, String> {
    match value {
        Value::String(s) => parse(s).map(Value::String).ok_or_else(|| message.to_string()),
        _ => Err(message.to_string()),
    }
}

fn is_id(value: &Value) -> bool {
    match value {
        Value::Number(n) => n.as_u64().is_some(),
        Value::String(s) => s.trim().parse::<u64>().is_ok(),
        _ => false,
    }
}
