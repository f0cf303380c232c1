//! Buffered transactions over the document trees.
//!
//! Writes are cached in memory (reads see them) and applied on commit in one
//! multi-tree sled transaction. Documents read through the transaction are
//! version-checked at commit, and the key-containment and unique indexes are
//! maintained inside the same sled transaction. Dropping a transaction
//! discards everything.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use super::key::{self, canonical_display, canonical_value, decode_id, slug_prefix};
use super::record::{decode_doc, encode_doc};
use super::{Record, StorageEngine};
use crate::catalog::{FieldDefinition, Pipeline, PipelineSchema};
use crate::error::Error;
use serde::Deserialize;
use serde_json::Value;
use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionalTree};
use sled::Transactional;

/// A document tracked for optimistic version checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum DocKey {
    Pipeline(u64),
    Field(u64),
    Record(u64, u64),
}

impl fmt::Display for DocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocKey::Pipeline(id) => write!(f, "pipeline {}", id),
            DocKey::Field(id) => write!(f, "field {}", id),
            DocKey::Record(pipeline, id) => write!(f, "record {}/{}", pipeline, id),
        }
    }
}

/// Pending state of one unique index entry.
#[derive(Debug, Clone)]
struct UniqueSlot {
    slug: String,
    canonical: String,
    /// Owner after commit; None removes the entry.
    owner: Option<u64>,
    /// Committed owner when the slot was first touched.
    seen: Option<u64>,
}

#[derive(Deserialize)]
struct VersionProbe {
    #[serde(default)]
    version: u64,
}

/// A buffered transaction.
pub struct Transaction<'a> {
    engine: &'a StorageEngine,
    pipelines: HashMap<u64, Pipeline>,
    fields: HashMap<u64, Option<FieldDefinition>>,
    records: BTreeMap<(u64, u64), Record>,
    /// Versions observed by tracked reads (0 = absent).
    read_versions: HashMap<DocKey, u64>,
    unique: HashMap<Vec<u8>, UniqueSlot>,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(engine: &'a StorageEngine) -> Self {
        Self {
            engine,
            pipelines: HashMap::new(),
            fields: HashMap::new(),
            records: BTreeMap::new(),
            read_versions: HashMap::new(),
            unique: HashMap::new(),
        }
    }

    /// The engine this transaction writes to.
    pub fn engine(&self) -> &'a StorageEngine {
        self.engine
    }

    // ========== Reads ==========

    /// Read a pipeline and track its version.
    pub fn pipeline(&mut self, pipeline_id: u64) -> Result<Option<Pipeline>, Error> {
        if let Some(cached) = self.pipelines.get(&pipeline_id) {
            return Ok(Some(cached.clone()));
        }
        let pipeline = self.engine.get_pipeline(pipeline_id)?;
        self.track(DocKey::Pipeline(pipeline_id), pipeline.as_ref().map(|p| p.version));
        Ok(pipeline)
    }

    /// Read a field and track its version.
    pub fn field(&mut self, field_id: u64) -> Result<Option<FieldDefinition>, Error> {
        if let Some(cached) = self.fields.get(&field_id) {
            return Ok(cached.clone());
        }
        let field = self.engine.get_field(field_id)?;
        self.track(DocKey::Field(field_id), field.as_ref().map(|f| f.version));
        Ok(field)
    }

    /// Read a field without tracking it.
    pub fn peek_field(&self, field_id: u64) -> Result<Option<FieldDefinition>, Error> {
        match self.fields.get(&field_id) {
            Some(cached) => Ok(cached.clone()),
            None => self.engine.get_field(field_id),
        }
    }

    /// Read a pipeline and its active fields without tracking them.
    pub fn schema(&self, pipeline_id: u64) -> Result<Option<PipelineSchema>, Error> {
        let pipeline = match self.pipelines.get(&pipeline_id) {
            Some(cached) => cached.clone(),
            None => match self.engine.get_pipeline(pipeline_id)? {
                Some(pipeline) => pipeline,
                None => return Ok(None),
            },
        };
        let mut fields = Vec::with_capacity(pipeline.field_ids.len());
        for field_id in &pipeline.field_ids {
            if let Some(field) = self.peek_field(*field_id)? {
                fields.push(field);
            }
        }
        Ok(Some(PipelineSchema::new(pipeline, fields)))
    }

    /// Read a record and track its version.
    pub fn record(&mut self, pipeline_id: u64, record_id: u64) -> Result<Option<Record>, Error> {
        if let Some(cached) = self.records.get(&(pipeline_id, record_id)) {
            return Ok(Some(cached.clone()));
        }
        let record = self.engine.get_record(pipeline_id, record_id)?;
        self.track(
            DocKey::Record(pipeline_id, record_id),
            record.as_ref().map(|r| r.version),
        );
        Ok(record)
    }

    /// Ids of live records whose data contains `slug`, including uncommitted
    /// writes, in id order.
    pub fn record_ids_with_key(&self, pipeline_id: u64, slug: &str) -> Result<Vec<u64>, Error> {
        let mut ids: BTreeMap<u64, bool> = self
            .engine
            .record_ids_with_key(pipeline_id, slug)?
            .into_iter()
            .map(|id| (id, true))
            .collect();
        for ((pipeline, id), record) in &self.records {
            if *pipeline == pipeline_id {
                ids.insert(*id, !record.is_deleted && record.data.contains_key(slug));
            }
        }
        Ok(ids.into_iter().filter(|(_, hit)| *hit).map(|(id, _)| id).collect())
    }

    /// Number of live records whose data contains `slug`.
    pub fn count_records_with_key(&self, pipeline_id: u64, slug: &str) -> Result<u64, Error> {
        Ok(self.record_ids_with_key(pipeline_id, slug)?.len() as u64)
    }

    /// Every live record of a pipeline, including uncommitted writes, in id
    /// order.
    pub fn live_records(&self, pipeline_id: u64) -> Result<Vec<Record>, Error> {
        let mut records: BTreeMap<u64, Record> = BTreeMap::new();
        for record in self.engine.scan_records(pipeline_id) {
            let record = record?;
            records.insert(record.id, record);
        }
        for ((pipeline, id), record) in &self.records {
            if *pipeline == pipeline_id {
                records.insert(*id, record.clone());
            }
        }
        Ok(records.into_values().filter(|r| !r.is_deleted).collect())
    }

    /// Record that will own `value` under `slug` after commit.
    pub fn unique_owner(
        &self,
        pipeline_id: u64,
        slug: &str,
        value: &Value,
    ) -> Result<Option<u64>, Error> {
        let Some(canonical) = canonical_value(value) else {
            return Ok(None);
        };
        let index_key = key::unique_key(pipeline_id, slug, &canonical);
        match self.unique.get(&index_key) {
            Some(slot) => Ok(slot.owner),
            None => self.engine.unique_owner_by_key(&index_key),
        }
    }

    // ========== Writes ==========

    /// Buffer a pipeline write.
    pub fn put_pipeline(&mut self, pipeline: Pipeline) -> &mut Self {
        self.pipelines.insert(pipeline.id, pipeline);
        self
    }

    /// Buffer a field write.
    pub fn put_field(&mut self, field: FieldDefinition) -> &mut Self {
        self.fields.insert(field.id, Some(field));
        self
    }

    /// Buffer a field removal.
    pub fn remove_field(&mut self, field_id: u64) -> &mut Self {
        self.fields.insert(field_id, None);
        self
    }

    /// Buffer a record write.
    pub fn put_record(&mut self, record: Record) -> &mut Self {
        self.records.insert((record.pipeline_id, record.id), record);
        self
    }

    /// Claim `value` of `slug` for `owner`.
    ///
    /// Blank values are never claimed. Fails if another record holds the
    /// value.
    pub fn claim_unique(
        &mut self,
        pipeline_id: u64,
        slug: &str,
        value: &Value,
        owner: u64,
    ) -> Result<(), Error> {
        let Some(canonical) = canonical_value(value) else {
            return Ok(());
        };
        if let Some(current) = self.unique_owner(pipeline_id, slug, value)? {
            if current != owner {
                return Err(Error::UniqueViolation {
                    slug: slug.to_string(),
                    value: canonical_display(&canonical).to_string(),
                    owner: current,
                });
            }
        }
        self.set_unique_slot(pipeline_id, slug, canonical, Some(owner))
    }

    /// Release `value` of `slug` if `owner` holds it.
    pub fn release_unique(
        &mut self,
        pipeline_id: u64,
        slug: &str,
        value: &Value,
        owner: u64,
    ) -> Result<(), Error> {
        let Some(canonical) = canonical_value(value) else {
            return Ok(());
        };
        if self.unique_owner(pipeline_id, slug, value)? == Some(owner) {
            self.set_unique_slot(pipeline_id, slug, canonical, None)?;
        }
        Ok(())
    }

    /// Drop every unique entry of `slug`, committed or pending.
    pub fn clear_unique(&mut self, pipeline_id: u64, slug: &str) -> Result<(), Error> {
        let prefix = slug_prefix(pipeline_id, slug);
        for index_key in self.engine.unique_keys_for_slug(pipeline_id, slug)? {
            let index_key = index_key.to_vec();
            let seen = self.engine.unique_owner_by_key(&index_key)?;
            let slot = self.unique.entry(index_key).or_insert_with(|| UniqueSlot {
                slug: slug.to_string(),
                canonical: String::new(),
                owner: None,
                seen,
            });
            slot.owner = None;
        }
        for (index_key, slot) in self.unique.iter_mut() {
            if index_key.starts_with(&prefix) {
                slot.owner = None;
            }
        }
        Ok(())
    }

    fn set_unique_slot(
        &mut self,
        pipeline_id: u64,
        slug: &str,
        canonical: String,
        owner: Option<u64>,
    ) -> Result<(), Error> {
        let index_key = key::unique_key(pipeline_id, slug, &canonical);
        if let Some(slot) = self.unique.get_mut(&index_key) {
            slot.owner = owner;
            return Ok(());
        }
        let seen = self.engine.unique_owner_by_key(&index_key)?;
        self.unique.insert(
            index_key,
            UniqueSlot {
                slug: slug.to_string(),
                canonical,
                owner,
                seen,
            },
        );
        Ok(())
    }

    fn track(&mut self, doc: DocKey, version: Option<u64>) {
        self.read_versions.entry(doc).or_insert(version.unwrap_or(0));
    }

    /// Number of buffered document writes.
    pub fn write_count(&self) -> usize {
        self.pipelines.len() + self.fields.len() + self.records.len()
    }

    /// Check if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.write_count() == 0 && self.unique.is_empty()
    }

    /// Discard every buffered write.
    pub fn rollback(self) {
        drop(self);
    }

    /// Commit the transaction atomically.
    ///
    /// All writes succeed or none do. Fails with [`Error::Conflict`] if a
    /// document read through this transaction changed in the meantime.
    pub fn commit(self) -> Result<(), Error> {
        if self.is_empty() {
            return Ok(());
        }

        let pipeline_writes = self
            .pipelines
            .values()
            .map(|p| Ok((key::id_key(p.id).to_vec(), encode_doc(p)?)))
            .collect::<Result<Vec<_>, Error>>()?;
        let field_writes = self
            .fields
            .iter()
            .map(|(id, field)| {
                let bytes = match field {
                    Some(field) => Some(encode_doc(field)?),
                    None => None,
                };
                Ok((key::id_key(*id).to_vec(), bytes))
            })
            .collect::<Result<Vec<_>, Error>>()?;
        let record_writes = self
            .records
            .values()
            .map(|r| Ok((r, key::record_key(r.pipeline_id, r.id).to_vec(), r.to_bytes()?)))
            .collect::<Result<Vec<_>, Error>>()?;

        let pipelines_tree = self.engine.pipelines_tree();
        let fields_tree = self.engine.fields_tree();
        let records_tree = self.engine.records_tree();
        let key_index_tree = self.engine.key_index_tree();
        let unique_index_tree = self.engine.unique_index_tree();

        let result: Result<(), TransactionError<Error>> = (
            pipelines_tree,
            fields_tree,
            records_tree,
            key_index_tree,
            unique_index_tree,
        )
            .transaction(|(pipelines_tx, fields_tx, records_tx, keys_tx, unique_tx)| {
                for (doc, expected) in &self.read_versions {
                    let actual = match doc {
                        DocKey::Pipeline(id) => Self::version_of(pipelines_tx, &key::id_key(*id))?,
                        DocKey::Field(id) => Self::version_of(fields_tx, &key::id_key(*id))?,
                        DocKey::Record(pipeline, id) => {
                            Self::version_of(records_tx, &key::record_key(*pipeline, *id))?
                        }
                    };
                    if actual != *expected {
                        return Err(ConflictableTransactionError::Abort(Error::Conflict(
                            format!("{} changed since it was read", doc),
                        )));
                    }
                }

                for (key_bytes, value) in &pipeline_writes {
                    pipelines_tx.insert(key_bytes.as_slice(), value.as_slice())?;
                }
                for (key_bytes, value) in &field_writes {
                    match value {
                        Some(value) => {
                            fields_tx.insert(key_bytes.as_slice(), value.as_slice())?;
                        }
                        None => {
                            fields_tx.remove(key_bytes.as_slice())?;
                        }
                    }
                }

                for (record, key_bytes, value) in &record_writes {
                    let before = records_tx.get(key_bytes.as_slice())?;
                    if let Some(bytes) = before {
                        let before: Record =
                            decode_doc(&bytes).map_err(ConflictableTransactionError::Abort)?;
                        if !before.is_deleted {
                            for slug in before.keys() {
                                keys_tx.remove(key::key_index_key(record.pipeline_id, slug, record.id))?;
                            }
                        }
                    }
                    if !record.is_deleted {
                        for slug in record.keys() {
                            keys_tx.insert(
                                key::key_index_key(record.pipeline_id, slug, record.id),
                                &[] as &[u8],
                            )?;
                        }
                    }
                    records_tx.insert(key_bytes.as_slice(), value.as_slice())?;
                }

                Self::apply_unique(unique_tx, &self.unique)?;
                Ok(())
            });

        match result {
            Ok(()) => Ok(()),
            Err(TransactionError::Abort(e)) => Err(e),
            Err(TransactionError::Storage(e)) => Err(Error::Storage(e)),
        }
    }

    fn version_of(
        tree: &TransactionalTree,
        key_bytes: &[u8],
    ) -> Result<u64, ConflictableTransactionError<Error>> {
        match tree.get(key_bytes)? {
            Some(bytes) => {
                let probe: VersionProbe =
                    decode_doc(&bytes).map_err(ConflictableTransactionError::Abort)?;
                Ok(probe.version)
            }
            None => Ok(0),
        }
    }

    /// Releases first, then claims, so a value can move between records in
    /// one commit.
    fn apply_unique(
        unique_tx: &TransactionalTree,
        slots: &HashMap<Vec<u8>, UniqueSlot>,
    ) -> Result<(), ConflictableTransactionError<Error>> {
        let current_owner = |index_key: &[u8]| -> Result<Option<u64>, ConflictableTransactionError<Error>> {
            Ok(unique_tx.get(index_key)?.and_then(|bytes| decode_id(&bytes)))
        };

        for (index_key, slot) in slots.iter().filter(|(_, s)| s.owner.is_none()) {
            if current_owner(index_key)? != slot.seen {
                return Err(ConflictableTransactionError::Abort(Error::Conflict(format!(
                    "unique index for '{}' changed since it was read",
                    slot.slug
                ))));
            }
            unique_tx.remove(index_key.as_slice())?;
        }

        for (index_key, slot) in slots {
            let Some(owner) = slot.owner else { continue };
            match current_owner(index_key)? {
                Some(current) if current != owner && Some(current) != slot.seen => {
                    return Err(ConflictableTransactionError::Abort(Error::UniqueViolation {
                        slug: slot.slug.clone(),
                        value: canonical_display(&slot.canonical).to_string(),
                        owner: current,
                    }));
                }
                _ => {
                    unique_tx.insert(index_key.as_slice(), key::id_key(owner).to_vec())?;
                }
            }
        }
        Ok(())
    }
}
