//! Per-type field configuration.
//!
//! Each field type owns exactly one config variant. A field definition whose
//! config variant does not match its type is rejected at construction.

use super::types::FieldType;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// One entry in a select/multiselect option list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectOption {
    /// Stored value.
    pub value: String,
    /// Display label.
    pub label: String,
}

impl SelectOption {
    /// Option whose label equals its value.
    pub fn new(value: impl Into<String>) -> Self {
        let value = value.into();
        Self {
            label: value.clone(),
            value,
        }
    }
}

/// Numeric config shared by number and decimal fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NumberOptions {
    /// Digits kept after the decimal point.
    #[serde(default)]
    pub decimal_places: Option<u8>,
    /// Inclusive lower bound.
    #[serde(default)]
    pub min_value: Option<f64>,
    /// Inclusive upper bound.
    #[serde(default)]
    pub max_value: Option<f64>,
    /// Value backfilled into existing records when the field is created.
    #[serde(default)]
    pub default_value: Option<f64>,
}

/// Option-list config shared by select and multiselect fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChoiceOptions {
    /// Allowed values.
    #[serde(default)]
    pub options: Vec<SelectOption>,
    /// Accept values outside `options`.
    #[serde(default)]
    pub allow_custom: bool,
    /// Multiselect only: maximum number of selected values.
    #[serde(default)]
    pub max_selections: Option<usize>,
    /// Default selection (a single value for select).
    #[serde(default)]
    pub default_value: Option<Value>,
}

/// Type-specific field configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldConfig {
    /// Single-line text.
    Text {
        /// Placeholder shown when empty.
        #[serde(default)]
        placeholder: Option<String>,
        /// Default value.
        #[serde(default)]
        default_value: Option<String>,
    },
    /// Multi-line text.
    Textarea {
        /// Editor height hint.
        #[serde(default)]
        rows: Option<u32>,
        /// Default value.
        #[serde(default)]
        default_value: Option<String>,
    },
    /// Numeric value.
    Number(NumberOptions),
    /// Fixed-precision numeric value.
    Decimal(NumberOptions),
    /// Email address.
    Email {},
    /// Phone number.
    Phone {
        /// Region assumed for numbers without a country prefix.
        #[serde(default)]
        default_country: Option<String>,
    },
    /// URL.
    Url {},
    /// Calendar date.
    Date {},
    /// Timestamp.
    Datetime {},
    /// True/false flag.
    Boolean {
        /// Default value.
        #[serde(default)]
        default_value: Option<bool>,
    },
    /// Single choice.
    Select(ChoiceOptions),
    /// Multiple choice.
    Multiselect(ChoiceOptions),
    /// Free-form labels.
    Tags {
        /// Suggested labels.
        #[serde(default)]
        suggestions: Vec<String>,
    },
    /// File reference.
    File {
        /// Accepted extensions; empty accepts anything.
        #[serde(default)]
        allowed_extensions: Vec<String>,
        /// Upload size cap.
        #[serde(default)]
        max_size_bytes: Option<u64>,
    },
    /// Link to another pipeline.
    Relation {
        /// Pipeline the linked records belong to.
        target_pipeline_id: u64,
        /// Hold several links instead of one.
        #[serde(default)]
        allow_multiple: bool,
    },
    /// Postal address.
    Address {
        /// Components captured, e.g. `street`, `city`.
        #[serde(default)]
        components: Vec<String>,
    },
    /// Action trigger.
    Button {
        /// Button caption.
        label: String,
        /// Action target; may embed `{slug}` tokens.
        #[serde(default)]
        action: Option<String>,
    },
    /// Record metadata projection.
    RecordData {
        /// Metadata key exposed, e.g. `created_at`.
        source: String,
    },
    /// AI-computed value.
    AiGenerated {
        /// Prompt template; `{slug}` tokens are replaced with field values.
        prompt: String,
        /// Model identifier.
        #[serde(default)]
        model: Option<String>,
        /// Slugs that trigger recomputation in addition to prompt tokens.
        #[serde(default)]
        trigger_fields: Vec<String>,
    },
}

impl FieldConfig {
    /// Default config for a field type.
    pub fn default_for(field_type: FieldType) -> Self {
        match field_type {
            FieldType::Text => FieldConfig::Text {
                placeholder: None,
                default_value: None,
            },
            FieldType::Textarea => FieldConfig::Textarea {
                rows: None,
                default_value: None,
            },
            FieldType::Number => FieldConfig::Number(NumberOptions::default()),
            FieldType::Decimal => FieldConfig::Decimal(NumberOptions {
                decimal_places: Some(2),
                ..NumberOptions::default()
            }),
            FieldType::Email => FieldConfig::Email {},
            FieldType::Phone => FieldConfig::Phone {
                default_country: None,
            },
            FieldType::Url => FieldConfig::Url {},
            FieldType::Date => FieldConfig::Date {},
            FieldType::Datetime => FieldConfig::Datetime {},
            FieldType::Boolean => FieldConfig::Boolean {
                default_value: None,
            },
            FieldType::Select => FieldConfig::Select(ChoiceOptions::default()),
            FieldType::Multiselect => FieldConfig::Multiselect(ChoiceOptions::default()),
            FieldType::Tags => FieldConfig::Tags {
                suggestions: Vec::new(),
            },
            FieldType::File => FieldConfig::File {
                allowed_extensions: Vec::new(),
                max_size_bytes: None,
            },
            FieldType::Relation => FieldConfig::Relation {
                target_pipeline_id: 0,
                allow_multiple: false,
            },
            FieldType::Address => FieldConfig::Address {
                components: Vec::new(),
            },
            FieldType::Button => FieldConfig::Button {
                label: String::new(),
                action: None,
            },
            FieldType::RecordData => FieldConfig::RecordData {
                source: "created_at".to_string(),
            },
            FieldType::AiGenerated => FieldConfig::AiGenerated {
                prompt: String::new(),
                model: None,
                trigger_fields: Vec::new(),
            },
        }
    }

    /// Field type this config belongs to.
    pub fn field_type(&self) -> FieldType {
        match self {
            FieldConfig::Text { .. } => FieldType::Text,
            FieldConfig::Textarea { .. } => FieldType::Textarea,
            FieldConfig::Number(_) => FieldType::Number,
            FieldConfig::Decimal(_) => FieldType::Decimal,
            FieldConfig::Email {} => FieldType::Email,
            FieldConfig::Phone { .. } => FieldType::Phone,
            FieldConfig::Url {} => FieldType::Url,
            FieldConfig::Date {} => FieldType::Date,
            FieldConfig::Datetime {} => FieldType::Datetime,
            FieldConfig::Boolean { .. } => FieldType::Boolean,
            FieldConfig::Select(_) => FieldType::Select,
            FieldConfig::Multiselect(_) => FieldType::Multiselect,
            FieldConfig::Tags { .. } => FieldType::Tags,
            FieldConfig::File { .. } => FieldType::File,
            FieldConfig::Relation { .. } => FieldType::Relation,
            FieldConfig::Address { .. } => FieldType::Address,
            FieldConfig::Button { .. } => FieldType::Button,
            FieldConfig::RecordData { .. } => FieldType::RecordData,
            FieldConfig::AiGenerated { .. } => FieldType::AiGenerated,
        }
    }

    /// Choice options, for select and multiselect configs.
    pub fn choices(&self) -> Option<&ChoiceOptions> {
        match self {
            FieldConfig::Select(choices) | FieldConfig::Multiselect(choices) => Some(choices),
            _ => None,
        }
    }

    /// Set of allowed option values, for select and multiselect configs.
    pub fn option_values(&self) -> Option<BTreeSet<String>> {
        self.choices()
            .map(|c| c.options.iter().map(|o| o.value.clone()).collect())
    }

    /// Numeric bounds, for number and decimal configs.
    pub fn number_options(&self) -> Option<&NumberOptions> {
        match self {
            FieldConfig::Number(opts) | FieldConfig::Decimal(opts) => Some(opts),
            _ => None,
        }
    }

    /// Value backfilled into existing records when a field is created.
    pub fn default_value(&self) -> Option<Value> {
        match self {
            FieldConfig::Text { default_value, .. } | FieldConfig::Textarea { default_value, .. } => {
                default_value.clone().map(Value::String)
            }
            FieldConfig::Number(opts) | FieldConfig::Decimal(opts) => opts
                .default_value
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number),
            FieldConfig::Boolean { default_value } => default_value.map(Value::Bool),
            FieldConfig::Select(choices) | FieldConfig::Multiselect(choices) => {
                choices.default_value.clone()
            }
            _ => None,
        }
    }

    /// Template strings that may embed `{slug}` tokens.
    pub fn template_texts(&self) -> Vec<&str> {
        match self {
            FieldConfig::AiGenerated { prompt, .. } => vec![prompt.as_str()],
            FieldConfig::Button {
                action: Some(action),
                ..
            } => vec![action.as_str()],
            _ => Vec::new(),
        }
    }

    /// Slugs listed explicitly as recompute triggers.
    pub fn trigger_fields(&self) -> &[String] {
        match self {
            FieldConfig::AiGenerated { trigger_fields, .. } => trigger_fields,
            _ => &[],
        }
    }

    /// Check internal consistency of the config.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            FieldConfig::Number(opts) | FieldConfig::Decimal(opts) => {
                if let (Some(min), Some(max)) = (opts.min_value, opts.max_value) {
                    if min > max {
                        return Err(format!("min_value {} exceeds max_value {}", min, max));
                    }
                }
                Ok(())
            }
            FieldConfig::Select(choices) | FieldConfig::Multiselect(choices) => {
                let mut seen = BTreeSet::new();
                for option in &choices.options {
                    if option.value.trim().is_empty() {
                        return Err("option values cannot be empty".to_string());
                    }
                    if !seen.insert(option.value.as_str()) {
                        return Err(format!("duplicate option value '{}'", option.value));
                    }
                }
                if choices.max_selections == Some(0) {
                    return Err("max_selections must be at least 1".to_string());
                }
                Ok(())
            }
            FieldConfig::AiGenerated { prompt, .. } if prompt.trim().is_empty() => {
                Err("AI fields require a prompt".to_string())
            }
            FieldConfig::RecordData { source } if source.trim().is_empty() => {
                Err("record data fields require a source".to_string())
            }
            _ => Ok(()),
        }
    }
}
