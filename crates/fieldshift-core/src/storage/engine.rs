//! Storage engine implementation.

use super::key::{self, decode_key_index_record, record_prefix, slug_prefix};
use super::record::decode_doc;
use super::{Record, StorageConfig, Transaction};
use crate::catalog::{FieldDefinition, Pipeline, PipelineSchema};
use crate::error::Error;
use sled::{Db, IVec, Tree};

/// Tree name for pipeline documents.
const PIPELINES_TREE: &str = "pipelines";

/// Tree name for field documents.
const FIELDS_TREE: &str = "fields";

/// Tree name for record documents.
const RECORDS_TREE: &str = "records";

/// Tree name for the key-containment index.
const KEY_INDEX_TREE: &str = "index:keys";

/// Tree name for the value-uniqueness index.
const UNIQUE_INDEX_TREE: &str = "index:unique";

/// The document store wrapping sled.
pub struct StorageEngine {
    /// The underlying sled database.
    db: Db,

    /// Pipeline documents keyed by pipeline id.
    pipelines_tree: Tree,

    /// Field documents keyed by field id.
    fields_tree: Tree,

    /// Record documents keyed by pipeline id + record id.
    records_tree: Tree,

    /// Key-containment index (pipeline + slug + record -> empty), live
    /// records only.
    key_index_tree: Tree,

    /// Unique index (pipeline + slug + value hash -> owner record id).
    unique_index_tree: Tree,
}

impl StorageEngine {
    /// Open or create a storage engine with the given configuration.
    pub fn open(config: StorageConfig) -> Result<Self, Error> {
        let db = config.to_sled_config().open()?;
        let pipelines_tree = db.open_tree(PIPELINES_TREE)?;
        let fields_tree = db.open_tree(FIELDS_TREE)?;
        let records_tree = db.open_tree(RECORDS_TREE)?;
        let key_index_tree = db.open_tree(KEY_INDEX_TREE)?;
        let unique_index_tree = db.open_tree(UNIQUE_INDEX_TREE)?;

        Ok(Self {
            db,
            pipelines_tree,
            fields_tree,
            records_tree,
            key_index_tree,
            unique_index_tree,
        })
    }

    /// Check if the database was recovered from a previous crash.
    pub fn was_recovered(&self) -> bool {
        self.db.was_recovered()
    }

    /// Allocate a fresh, never-zero id.
    pub fn generate_id(&self) -> Result<u64, Error> {
        Ok(self.db.generate_id()? + 1)
    }

    /// Begin a buffered transaction.
    pub fn transaction(&self) -> Transaction<'_> {
        Transaction::new(self)
    }

    /// Get a pipeline document.
    pub fn get_pipeline(&self, pipeline_id: u64) -> Result<Option<Pipeline>, Error> {
        match self.pipelines_tree.get(key::id_key(pipeline_id))? {
            Some(bytes) => Ok(Some(decode_doc(&bytes)?)),
            None => Ok(None),
        }
    }

    /// List every pipeline.
    pub fn list_pipelines(&self) -> Result<Vec<Pipeline>, Error> {
        self.pipelines_tree
            .iter()
            .values()
            .map(|bytes| decode_doc(&bytes?))
            .collect()
    }

    /// Get a field document, deleted or not.
    pub fn get_field(&self, field_id: u64) -> Result<Option<FieldDefinition>, Error> {
        match self.fields_tree.get(key::id_key(field_id))? {
            Some(bytes) => Ok(Some(decode_doc(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Every field of a pipeline, deleted ones included.
    pub fn pipeline_fields(&self, pipeline: &Pipeline) -> Result<Vec<FieldDefinition>, Error> {
        let mut fields = Vec::with_capacity(pipeline.field_ids.len());
        for field_id in &pipeline.field_ids {
            if let Some(field) = self.get_field(*field_id)? {
                fields.push(field);
            }
        }
        Ok(fields)
    }

    /// Load a pipeline with its active fields.
    pub fn load_schema(&self, pipeline_id: u64) -> Result<Option<PipelineSchema>, Error> {
        let Some(pipeline) = self.get_pipeline(pipeline_id)? else {
            return Ok(None);
        };
        let fields = self.pipeline_fields(&pipeline)?;
        Ok(Some(PipelineSchema::new(pipeline, fields)))
    }

    /// Get a record, deleted or not.
    pub fn get_record(&self, pipeline_id: u64, record_id: u64) -> Result<Option<Record>, Error> {
        let Some(bytes) = self.records_tree.get(key::record_key(pipeline_id, record_id))? else {
            return Ok(None);
        };
        let record = Record::from_bytes(&bytes)?;
        if record.pipeline_id != pipeline_id || record.id != record_id {
            return Err(Error::InvalidData(format!(
                "record stored at {}/{} is {}/{}",
                pipeline_id, record_id, record.pipeline_id, record.id
            )));
        }
        Ok(Some(record))
    }

    /// Scan every record of a pipeline in id order, deleted ones included.
    pub fn scan_records(
        &self,
        pipeline_id: u64,
    ) -> impl Iterator<Item = Result<Record, Error>> + '_ {
        self.records_tree
            .scan_prefix(record_prefix(pipeline_id))
            .values()
            .map(|result| Record::from_bytes(&result?))
    }

    /// Ids of live records whose data contains `slug`, in id order.
    pub fn record_ids_with_key(&self, pipeline_id: u64, slug: &str) -> Result<Vec<u64>, Error> {
        self.key_index_tree
            .scan_prefix(slug_prefix(pipeline_id, slug))
            .keys()
            .map(|result| {
                let key = result?;
                decode_key_index_record(&key).ok_or(Error::InvalidKey)
            })
            .collect()
    }

    /// Number of live records whose data contains `slug`.
    pub fn count_records_with_key(&self, pipeline_id: u64, slug: &str) -> Result<u64, Error> {
        let mut count = 0u64;
        for result in self
            .key_index_tree
            .scan_prefix(slug_prefix(pipeline_id, slug))
            .keys()
        {
            result?;
            count += 1;
        }
        Ok(count)
    }

    /// Record currently owning a unique index entry.
    pub fn unique_owner_by_key(&self, index_key: &[u8]) -> Result<Option<u64>, Error> {
        match self.unique_index_tree.get(index_key)? {
            Some(bytes) => key::decode_id(&bytes).map(Some).ok_or(Error::InvalidKey),
            None => Ok(None),
        }
    }

    /// Every unique index key held for `slug`.
    pub fn unique_keys_for_slug(&self, pipeline_id: u64, slug: &str) -> Result<Vec<IVec>, Error> {
        self.unique_index_tree
            .scan_prefix(slug_prefix(pipeline_id, slug))
            .keys()
            .map(|result| result.map_err(Error::from))
            .collect()
    }

    /// Flush all pending writes to disk.
    pub fn flush(&self) -> Result<(), Error> {
        self.db.flush()?;
        Ok(())
    }

    /// Get the underlying sled database.
    pub fn db(&self) -> &Db {
        &self.db
    }

    pub(crate) fn pipelines_tree(&self) -> &Tree {
        &self.pipelines_tree
    }

    pub(crate) fn fields_tree(&self) -> &Tree {
        &self.fields_tree
    }

    pub(crate) fn records_tree(&self) -> &Tree {
        &self.records_tree
    }

    pub(crate) fn key_index_tree(&self) -> &Tree {
        &self.key_index_tree
    }

    pub(crate) fn unique_index_tree(&self) -> &Tree {
        &self.unique_index_tree
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map, Value};

    fn data(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn test_open_and_generate_ids() {
        let engine = StorageEngine::open(StorageConfig::temporary()).unwrap();
        let a = engine.generate_id().unwrap();
        let b = engine.generate_id().unwrap();
        assert!(a > 0);
        assert!(b > a);
    }

    #[test]
    fn test_scan_and_key_index() {
        let engine = StorageEngine::open(StorageConfig::temporary()).unwrap();
        let mut tx = engine.transaction();
        tx.put_record(Record::new(1, 10, data(json!({"email": "a@x.io"}))));
        tx.put_record(Record::new(2, 10, data(json!({"name": "b"}))));
        tx.put_record(Record::new(3, 11, data(json!({"email": "c@x.io"}))));
        tx.commit().unwrap();

        let records: Vec<Record> = engine.scan_records(10).collect::<Result<_, _>>().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(engine.record_ids_with_key(10, "email").unwrap(), vec![1]);
        assert_eq!(engine.count_records_with_key(11, "email").unwrap(), 1);
        assert_eq!(engine.count_records_with_key(10, "phone").unwrap(), 0);
    }

    #[test]
    fn test_misplaced_record_is_invalid() {
        let engine = StorageEngine::open(StorageConfig::temporary()).unwrap();
        let record = Record::new(2, 1, Map::new());
        engine
            .records_tree
            .insert(key::record_key(1, 3), record.to_bytes().unwrap())
            .unwrap();

        assert!(matches!(engine.get_record(1, 3), Err(Error::InvalidData(_))));
        assert!(engine.get_record(1, 2).unwrap().is_none());
    }

    #[test]
    fn test_on_disk_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let engine = StorageEngine::open(StorageConfig::new(dir.path())).unwrap();
            let mut tx = engine.transaction();
            tx.put_pipeline(Pipeline::new(5, "Leads"));
            tx.commit().unwrap();
            engine.flush().unwrap();
        }
        let engine = StorageEngine::open(StorageConfig::new(dir.path())).unwrap();
        assert_eq!(engine.get_pipeline(5).unwrap().unwrap().name, "Leads");
        assert_eq!(engine.list_pipelines().unwrap().len(), 1);
    }
}
