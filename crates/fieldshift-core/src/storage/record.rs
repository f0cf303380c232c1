//! Stored record documents.

use crate::catalog::is_empty_value;
use crate::error::Error;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// Who produced the last write to a record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOrigin {
    /// An edit made by a user.
    #[default]
    User,
    /// A schema migration rewrote the record.
    Migration,
    /// Housekeeping such as slug stripping on hard delete.
    System,
}

impl WriteOrigin {
    /// Check if dependents should be notified about this write.
    pub fn is_user_visible(&self) -> bool {
        matches!(self, WriteOrigin::User)
    }
}

/// One document in a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Record id.
    pub id: u64,
    /// Owning pipeline.
    pub pipeline_id: u64,
    /// Slug-keyed field values.
    #[serde(default)]
    pub data: Map<String, Value>,
    /// Bumped whenever `data` changes.
    pub version: u64,
    /// Soft-delete flag.
    #[serde(default)]
    pub is_deleted: bool,
    /// When the record was soft deleted.
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    /// Origin of the last write.
    #[serde(default)]
    pub last_write_origin: WriteOrigin,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl Record {
    /// Create a record at version 1.
    pub fn new(id: u64, pipeline_id: u64, data: Map<String, Value>) -> Self {
        let now = Utc::now();
        Self {
            id,
            pipeline_id,
            data,
            version: 1,
            is_deleted: false,
            deleted_at: None,
            last_write_origin: WriteOrigin::User,
            created_at: now,
            updated_at: now,
        }
    }

    /// Slugs present in `data`, blank or not. These are the keys the
    /// containment index tracks.
    pub fn keys(&self) -> BTreeSet<&str> {
        self.data.keys().map(|k| k.as_str()).collect()
    }

    /// Check if the record holds a non-blank value under `slug`.
    pub fn has_value(&self, slug: &str) -> bool {
        self.data.get(slug).is_some_and(|v| !is_empty_value(v))
    }

    /// Replace `data`, bumping the version only if it differs.
    pub fn set_data(&mut self, data: Map<String, Value>, origin: WriteOrigin) -> bool {
        if data == self.data {
            return false;
        }
        self.data = data;
        self.version += 1;
        self.last_write_origin = origin;
        self.updated_at = Utc::now();
        true
    }

    /// Serialize the record to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        encode_doc(self)
    }

    /// Deserialize a record from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        decode_doc(bytes)
    }
}

/// Encode a catalog or record document as JSON.
pub(crate) fn encode_doc<T: Serialize>(doc: &T) -> Result<Vec<u8>, Error> {
    serde_json::to_vec(doc).map_err(|e| Error::Serialization(e.to_string()))
}

/// Decode a JSON document.
pub(crate) fn decode_doc<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, Error> {
    serde_json::from_slice(bytes).map_err(|e| Error::Deserialization(e.to_string()))
}
