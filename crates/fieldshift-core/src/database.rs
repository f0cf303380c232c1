//! Database handle combining storage, job checkpoints, and both coordinators.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::catalog::{FieldChanges, FieldDefinition, FieldSpec, FieldType, Pipeline, PipelineSchema, StorageConstraints};
use crate::config::EngineConfig;
use crate::coordinator::{
    Actor, AuditSink, Authorizer, FieldDeletion, FieldUpdate, LockManager, Notifier,
    RecordWriteCoordinator, SaveOptions, SavedRecord, SchemaChangeCoordinator, SchemaChangeError,
    UpdateOptions, ValidationError,
};
use crate::error::Error;
use crate::graph::DependencyGraph;
use crate::migration::{JobStore, MigrationDecision, MigrationJob, MigrationPreview, ProgressCallback};
use crate::storage::{Record, StorageEngine};
use crate::validation::{BackgroundValidator, WarningSink};

/// A fieldshift database.
pub struct Database {
    storage: Arc<StorageEngine>,
    jobs: JobStore,
    schema: SchemaChangeCoordinator,
    records: RecordWriteCoordinator,
    config: EngineConfig,
    recovered: Vec<MigrationJob>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("config", &self.config)
            .field("recovered_jobs", &self.recovered.len())
            .finish()
    }
}

impl Database {
    /// Open a database and close migration jobs a previous process left
    /// running.
    pub fn open(config: EngineConfig) -> Result<Self, Error> {
        let storage = Arc::new(StorageEngine::open(config.storage.clone())?);
        let jobs = JobStore::open(storage.db())?;
        let recovered = jobs.recover_interrupted()?;
        if !recovered.is_empty() {
            warn!(count = recovered.len(), "closed interrupted migration jobs");
        }

        let locks = Arc::new(LockManager::new());
        let schema = SchemaChangeCoordinator::new(storage.clone(), locks.clone(), jobs.clone(), &config);
        let records = RecordWriteCoordinator::new(
            storage.clone(),
            locks,
            config.validation.clone(),
            config.lock_timeout,
        );

        info!(
            path = %config.storage.path.display(),
            temporary = config.storage.temporary,
            "database opened"
        );
        Ok(Self {
            storage,
            jobs,
            schema,
            records,
            config,
            recovered,
        })
    }

    /// Check permissions with `authorizer` for schema changes and writes.
    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.schema = self.schema.with_authorizer(authorizer.clone());
        self.records = self.records.with_authorizer(authorizer);
        self
    }

    /// Send audit entries of both coordinators to `audit`.
    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.schema = self.schema.with_audit(audit.clone());
        self.records = self.records.with_audit(audit);
        self
    }

    /// Fan out committed record writes to `notifier`.
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.records = self.records.with_notifier(notifier);
        self
    }

    /// Deliver background validation reports to `sink`.
    pub fn with_warning_sink(mut self, sink: Arc<dyn WarningSink>) -> Self {
        let background = BackgroundValidator::new(self.config.validation.background_validation_limit, sink);
        self.records = self.records.with_background(background);
        self
    }

    /// Report migration progress to `callback`.
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.schema = self.schema.with_progress(callback);
        self
    }

    /// The storage engine.
    pub fn storage(&self) -> &StorageEngine {
        &self.storage
    }

    /// The schema change coordinator.
    pub fn schema(&self) -> &SchemaChangeCoordinator {
        &self.schema
    }

    /// The record write coordinator.
    pub fn records(&self) -> &RecordWriteCoordinator {
        &self.records
    }

    /// The configuration the database was opened with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Jobs closed as interrupted when the database was opened.
    pub fn recovered_jobs(&self) -> &[MigrationJob] {
        &self.recovered
    }

    /// Every migration job checkpoint.
    pub fn migration_jobs(&self) -> Result<Vec<MigrationJob>, Error> {
        Ok(self.jobs.list()?)
    }

    /// Close jobs still marked running.
    pub fn recover_interrupted(&self) -> Result<Vec<MigrationJob>, Error> {
        Ok(self.jobs.recover_interrupted()?)
    }

    // ========== Schema ==========

    /// Classify a type and constraint change.
    pub fn classify(
        &self,
        old_type: FieldType,
        new_type: FieldType,
        old_constraints: &StorageConstraints,
        new_constraints: &StorageConstraints,
    ) -> MigrationDecision {
        self.schema
            .classify(old_type, new_type, old_constraints, new_constraints)
    }

    /// Create a pipeline.
    pub fn create_pipeline(
        &self,
        name: &str,
        stage_field: Option<&str>,
        actor: &Actor,
    ) -> Result<Pipeline, SchemaChangeError> {
        self.schema.create_pipeline(name, stage_field, actor)
    }

    /// Add a field to a pipeline.
    pub fn create_field(
        &self,
        pipeline_id: u64,
        spec: FieldSpec,
        actor: &Actor,
    ) -> Result<FieldDefinition, SchemaChangeError> {
        self.schema.create_field(pipeline_id, spec, actor)
    }

    /// Change a field and migrate its values.
    pub fn update_field(
        &self,
        field_id: u64,
        changes: &FieldChanges,
        actor: &Actor,
        options: UpdateOptions,
    ) -> Result<FieldUpdate, SchemaChangeError> {
        self.schema.update_field(field_id, changes, actor, options)
    }

    /// Delete a field.
    pub fn delete_field(
        &self,
        field_id: u64,
        actor: &Actor,
        hard_delete: bool,
    ) -> Result<FieldDeletion, SchemaChangeError> {
        self.schema.delete_field(field_id, actor, hard_delete)
    }

    /// Restore a soft-deleted field.
    pub fn restore_field(&self, field_id: u64, actor: &Actor) -> Result<FieldDefinition, SchemaChangeError> {
        self.schema.restore_field(field_id, actor)
    }

    /// Hard delete fields whose grace period has ended.
    pub fn purge_expired_fields(&self, actor: &Actor) -> Result<Vec<u64>, SchemaChangeError> {
        self.schema.purge_expired_fields(Utc::now(), actor)
    }

    /// Preview a field change.
    pub fn preview_migration(
        &self,
        field_id: u64,
        changes: &FieldChanges,
        sample_size: usize,
    ) -> Result<MigrationPreview, SchemaChangeError> {
        self.schema.preview_migration(field_id, changes, sample_size)
    }

    /// Convert an ad-hoc value for a field.
    pub fn coerce_value(&self, field_id: u64, value: &Value) -> Result<Option<Value>, SchemaChangeError> {
        self.schema.coerce_value(field_id, value)
    }

    /// Get a pipeline.
    pub fn get_pipeline(&self, pipeline_id: u64) -> Result<Option<Pipeline>, Error> {
        self.storage.get_pipeline(pipeline_id)
    }

    /// List every pipeline.
    pub fn list_pipelines(&self) -> Result<Vec<Pipeline>, Error> {
        self.storage.list_pipelines()
    }

    /// Get a field, deleted or not.
    pub fn get_field(&self, field_id: u64) -> Result<Option<FieldDefinition>, Error> {
        self.storage.get_field(field_id)
    }

    /// Load a pipeline with its active fields.
    pub fn load_schema(&self, pipeline_id: u64) -> Result<Option<PipelineSchema>, Error> {
        self.storage.load_schema(pipeline_id)
    }

    /// Dependency graph of a pipeline's active fields.
    pub fn dependency_graph(&self, pipeline_id: u64) -> Result<Option<DependencyGraph>, Error> {
        Ok(self
            .storage
            .load_schema(pipeline_id)?
            .map(|schema| DependencyGraph::build(&schema)))
    }

    // ========== Records ==========

    /// Create (`record_id = None`) or update a record.
    pub fn save(
        &self,
        pipeline_id: u64,
        record_id: Option<u64>,
        data: Map<String, Value>,
        actor: &Actor,
    ) -> Result<SavedRecord, ValidationError> {
        self.records
            .save(pipeline_id, record_id, data, actor, SaveOptions::default())
    }

    /// Create or update a record with explicit options.
    pub fn save_with(
        &self,
        pipeline_id: u64,
        record_id: Option<u64>,
        data: Map<String, Value>,
        actor: &Actor,
        options: SaveOptions,
    ) -> Result<SavedRecord, ValidationError> {
        self.records.save(pipeline_id, record_id, data, actor, options)
    }

    /// Soft delete a record.
    pub fn delete_record(&self, pipeline_id: u64, record_id: u64, actor: &Actor) -> Result<Record, ValidationError> {
        self.records.delete(pipeline_id, record_id, actor)
    }

    /// Get a record, deleted or not.
    pub fn get_record(&self, pipeline_id: u64, record_id: u64) -> Result<Option<Record>, Error> {
        self.storage.get_record(pipeline_id, record_id)
    }

    /// Flush pending writes to disk.
    pub fn flush(&self) -> Result<(), Error> {
        self.storage.flush()
    }
}

/// Handle for a background task that purges expired fields.
pub struct MaintenanceTask {
    handle: JoinHandle<()>,
    stop_flag: Arc<AtomicBool>,
}

impl MaintenanceTask {
    /// Start purging on the current tokio runtime every `interval`.
    pub fn start(database: Arc<Database>, interval: Duration) -> Self {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let stop = stop_flag.clone();

        let handle = tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "maintenance task started");
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if stop.load(Ordering::SeqCst) {
                    info!("maintenance task stopping");
                    break;
                }

                let db = database.clone();
                let outcome =
                    tokio::task::spawn_blocking(move || db.purge_expired_fields(&Actor::system())).await;
                match outcome {
                    Ok(Ok(purged)) if !purged.is_empty() => {
                        info!(purged = purged.len(), "maintenance purged expired fields")
                    }
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => warn!(error = %e, "maintenance purge failed"),
                    Err(e) => warn!(error = %e, "maintenance purge panicked"),
                }
            }
        });

        Self { handle, stop_flag }
    }

    /// Signal the task to stop after its current tick.
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
    }

    /// Stop the task and wait for it.
    pub async fn join(self) {
        self.stop();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "maintenance task panicked");
        }
    }
}

/// Thread-safe database handle.
pub type SharedDatabase = Arc<Database>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageConfig;
    use serde_json::json;

    #[test]
    fn test_database_open() {
        let db = Database::open(EngineConfig::temporary()).unwrap();
        assert!(db.recovered_jobs().is_empty());
        assert!(db.list_pipelines().unwrap().is_empty());
    }

    #[test]
    fn test_database_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::new(StorageConfig::new(dir.path().join("data")));

        let (pipeline_id, record_id) = {
            let db = Database::open(config.clone()).unwrap();
            let pipeline = db.create_pipeline("Leads", None, &Actor::system()).unwrap();
            db.create_field(pipeline.id, FieldSpec::new("Email", FieldType::Email), &Actor::system())
                .unwrap();
            let data = json!({"email": "ana@example.com"}).as_object().cloned().unwrap();
            let saved = db.save(pipeline.id, None, data, &Actor::system()).unwrap();
            db.flush().unwrap();
            (pipeline.id, saved.record.id)
        };

        let db = Database::open(config).unwrap();
        let schema = db.load_schema(pipeline_id).unwrap().unwrap();
        assert_eq!(schema.fields.len(), 1);
        let record = db.get_record(pipeline_id, record_id).unwrap().unwrap();
        assert_eq!(record.data["email"], json!("ana@example.com"));
    }

    #[tokio::test]
    async fn test_maintenance_task_stops() {
        let db = Arc::new(Database::open(EngineConfig::temporary()).unwrap());
        let task = MaintenanceTask::start(db, Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(30)).await;
        task.join().await;
    }
}
