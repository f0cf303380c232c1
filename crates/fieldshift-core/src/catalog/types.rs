//! Field type and storage constraint definitions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Closed set of field types a pipeline column can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    /// Single-line text.
    Text,
    /// Multi-line text.
    Textarea,
    /// Arbitrary numeric value.
    Number,
    /// Fixed-precision numeric value.
    Decimal,
    /// Email address.
    Email,
    /// Phone number.
    Phone,
    /// Absolute http(s) URL.
    Url,
    /// Calendar date (`YYYY-MM-DD`).
    Date,
    /// Timestamp (RFC 3339).
    Datetime,
    /// True/false flag.
    Boolean,
    /// One value from a fixed option list.
    Select,
    /// Several values from a fixed option list.
    Multiselect,
    /// Free-form list of labels.
    Tags,
    /// Uploaded file reference.
    File,
    /// Link to records of another pipeline.
    Relation,
    /// Structured postal address.
    Address,
    /// Action trigger; holds no user data.
    Button,
    /// Read-only data derived from record metadata.
    RecordData,
    /// Value computed by an AI prompt after each write.
    AiGenerated,
}

impl FieldType {
    /// Every field type, in declaration order.
    pub const ALL: [FieldType; 19] = [
        FieldType::Text,
        FieldType::Textarea,
        FieldType::Number,
        FieldType::Decimal,
        FieldType::Email,
        FieldType::Phone,
        FieldType::Url,
        FieldType::Date,
        FieldType::Datetime,
        FieldType::Boolean,
        FieldType::Select,
        FieldType::Multiselect,
        FieldType::Tags,
        FieldType::File,
        FieldType::Relation,
        FieldType::Address,
        FieldType::Button,
        FieldType::RecordData,
        FieldType::AiGenerated,
    ];

    /// Wire name of the type.
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Text => "text",
            FieldType::Textarea => "textarea",
            FieldType::Number => "number",
            FieldType::Decimal => "decimal",
            FieldType::Email => "email",
            FieldType::Phone => "phone",
            FieldType::Url => "url",
            FieldType::Date => "date",
            FieldType::Datetime => "datetime",
            FieldType::Boolean => "boolean",
            FieldType::Select => "select",
            FieldType::Multiselect => "multiselect",
            FieldType::Tags => "tags",
            FieldType::File => "file",
            FieldType::Relation => "relation",
            FieldType::Address => "address",
            FieldType::Button => "button",
            FieldType::RecordData => "record_data",
            FieldType::AiGenerated => "ai_generated",
        }
    }

    /// Check if values of this type are plain strings.
    pub fn is_text_like(&self) -> bool {
        matches!(
            self,
            FieldType::Text
                | FieldType::Textarea
                | FieldType::Email
                | FieldType::Phone
                | FieldType::Url
        )
    }

    /// Check if values of this type are numbers.
    pub fn is_numeric(&self) -> bool {
        matches!(self, FieldType::Number | FieldType::Decimal)
    }

    /// Check if values of this type are arrays.
    pub fn is_multi_valued(&self) -> bool {
        matches!(self, FieldType::Multiselect | FieldType::Tags)
    }

    /// Check if the type carries a fixed option list.
    pub fn has_options(&self) -> bool {
        matches!(self, FieldType::Select | FieldType::Multiselect)
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FieldType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        FieldType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == normalized || t.as_str().replace('_', "") == normalized)
            .ok_or_else(|| format!("unknown field type '{}'", s))
    }
}

/// Storage-level constraints. Storage never requires presence: every field is
/// nullable at this layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConstraints {
    /// Maximum length in characters for string values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    /// Whether non-null values must be unique across live records.
    #[serde(default)]
    pub enforce_uniqueness: bool,
}

impl StorageConstraints {
    /// Constraints with a maximum length.
    pub fn with_max_length(mut self, max: usize) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Constraints enforcing uniqueness.
    pub fn unique(mut self) -> Self {
        self.enforce_uniqueness = true;
        self
    }

    /// Check if `new` is stricter than `self` in a way existing data may violate.
    pub fn is_tightened_by(&self, new: &StorageConstraints) -> bool {
        self.max_length_shrinks_to(new) || (!self.enforce_uniqueness && new.enforce_uniqueness)
    }

    /// Check if moving to `new` lowers (or introduces) the maximum length.
    pub fn max_length_shrinks_to(&self, new: &StorageConstraints) -> bool {
        match (self.max_length, new.max_length) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(old), Some(new)) => new < old,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_type_parse() {
        assert_eq!("text".parse::<FieldType>().unwrap(), FieldType::Text);
        assert_eq!("ai_generated".parse::<FieldType>().unwrap(), FieldType::AiGenerated);
        assert_eq!("aiGenerated".parse::<FieldType>().unwrap(), FieldType::AiGenerated);
        assert_eq!("record-data".parse::<FieldType>().unwrap(), FieldType::RecordData);
        assert!("spreadsheet".parse::<FieldType>().is_err());
    }

    #[test]
    fn test_field_type_serde_names() {
        let json = serde_json::to_string(&FieldType::Multiselect).unwrap();
        assert_eq!(json, "\"multiselect\"");
        let parsed: FieldType = serde_json::from_str("\"record_data\"").unwrap();
        assert_eq!(parsed, FieldType::RecordData);
    }

    #[test]
    fn test_constraint_tightening() {
        let loose = StorageConstraints::default();
        let capped = StorageConstraints::default().with_max_length(50);
        let tighter = StorageConstraints::default().with_max_length(10);

        assert!(loose.is_tightened_by(&capped));
        assert!(capped.is_tightened_by(&tighter));
        assert!(!tighter.is_tightened_by(&capped));
        assert!(!capped.is_tightened_by(&loose));
        assert!(loose.is_tightened_by(&StorageConstraints::default().unique()));
        assert!(!StorageConstraints::default().unique().is_tightened_by(&loose));
    }
}
