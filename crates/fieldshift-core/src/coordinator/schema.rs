//! Schema change orchestration.
//!
//! A field change moves through
//! `Validating -> Snapshotting -> Applying -> Migrating -> Committed` inside
//! one storage transaction, then refreshes the pipeline's schema projection.
//! A denial, failed migration, or storage error at any step drops the
//! transaction, so neither the definition nor any record changes.

use super::collaborators::{
    Action, Actor, AllowAll, AuditEntry, AuditOp, AuditSink, Authorizer, Resource,
    TracingAuditSink,
};
use super::error::SchemaChangeError;
use super::locks::{LockKey, LockManager, RowGuard};
use crate::catalog::{is_empty_value, FieldChanges, FieldDefinition, FieldSpec, FieldType, Pipeline, PipelineSchema};
use crate::config::EngineConfig;
use crate::error::Error;
use crate::graph::DependencyGraph;
use crate::migration::{
    ChangeAnalysis, CoercerRegistry, JobStore, MigrationDecision, MigrationExecutor,
    MigrationPreview, MigrationResult, MigrationType, OperationId, ProgressCallback,
    SnapshotStore, TypeCompatibilityMatrix,
};
use crate::storage::{StorageEngine, Transaction};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Steps of a field change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangePhase {
    /// Checking names, types, and the compatibility verdict.
    Validating,
    /// Capturing the pre-change field.
    Snapshotting,
    /// Writing the new definition.
    Applying,
    /// Migrating stored values.
    Migrating,
    /// Rebuilding the pipeline's schema projection.
    SchemaCacheRefresh,
    /// Committed.
    Committed,
}

/// Options of [`SchemaChangeCoordinator::update_field`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOptions {
    /// The caller has seen the data-loss warning and accepts it.
    pub confirmed: bool,
    /// Run the migration and roll everything back.
    pub dry_run: bool,
}

impl UpdateOptions {
    /// Options for a confirmed live change.
    pub fn confirmed() -> Self {
        Self {
            confirmed: true,
            dry_run: false,
        }
    }

    /// Options for a dry run.
    pub fn dry_run() -> Self {
        Self {
            confirmed: false,
            dry_run: true,
        }
    }
}

/// Outcome of a field change.
#[derive(Debug, Clone)]
pub struct FieldUpdate {
    /// The field after the change. For a dry run, the proposed definition.
    pub field: FieldDefinition,
    /// Compatibility verdict.
    pub decision: MigrationDecision,
    /// Detected changes.
    pub analysis: ChangeAnalysis,
    /// Migration outcome, when stored values had to change.
    pub migration: Option<MigrationResult>,
    /// False for dry runs.
    pub committed: bool,
}

/// Outcome of a field deletion.
#[derive(Debug, Clone)]
pub struct FieldDeletion {
    /// The field as it was left (soft) or as it was before removal (hard).
    pub field: FieldDefinition,
    /// Whether the field and its values were removed for good.
    pub hard: bool,
    /// Active fields whose rules or templates read the deleted field.
    pub dependents: Vec<String>,
    /// Value removal outcome for hard deletes.
    pub migration: Option<MigrationResult>,
}

/// Orchestrates pipeline and field definition changes.
pub struct SchemaChangeCoordinator {
    storage: Arc<StorageEngine>,
    matrix: Arc<TypeCompatibilityMatrix>,
    coercers: Arc<CoercerRegistry>,
    executor: MigrationExecutor,
    snapshots: SnapshotStore,
    locks: Arc<LockManager>,
    jobs: JobStore,
    authorizer: Arc<dyn Authorizer>,
    audit: Arc<dyn AuditSink>,
    lock_timeout: Duration,
    hard_delete_grace: chrono::Duration,
}

impl std::fmt::Debug for SchemaChangeCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaChangeCoordinator")
            .field("executor", &self.executor)
            .field("snapshots", &self.snapshots.len())
            .field("lock_timeout", &self.lock_timeout)
            .finish()
    }
}

impl SchemaChangeCoordinator {
    /// Create a coordinator with the standard matrix and coercers.
    pub fn new(
        storage: Arc<StorageEngine>,
        locks: Arc<LockManager>,
        jobs: JobStore,
        config: &EngineConfig,
    ) -> Self {
        let matrix = Arc::new(TypeCompatibilityMatrix::standard());
        let coercers = Arc::new(CoercerRegistry::standard());
        let executor = MigrationExecutor::new(matrix.clone(), coercers.clone(), config.migration.clone())
            .with_job_store(jobs.clone());
        Self {
            storage,
            matrix,
            coercers,
            executor,
            snapshots: SnapshotStore::new(config.snapshot_ttl),
            locks,
            jobs,
            authorizer: Arc::new(AllowAll),
            audit: Arc::new(TracingAuditSink),
            lock_timeout: config.lock_timeout,
            hard_delete_grace: config.hard_delete_grace,
        }
    }

    /// Check permissions with `authorizer`.
    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    /// Send audit entries to `audit`.
    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    /// Report migration progress to `callback`.
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.executor = self.executor.with_progress(callback);
        self
    }

    /// The compatibility matrix.
    pub fn matrix(&self) -> &TypeCompatibilityMatrix {
        &self.matrix
    }

    /// Held snapshots; zero when no operation is in flight.
    pub fn pending_snapshots(&self) -> usize {
        self.snapshots.len()
    }

    /// Classify a type and constraint change.
    pub fn classify(
        &self,
        old_type: FieldType,
        new_type: FieldType,
        old_constraints: &crate::catalog::StorageConstraints,
        new_constraints: &crate::catalog::StorageConstraints,
    ) -> MigrationDecision {
        self.matrix
            .classify(old_type, new_type, old_constraints, new_constraints)
    }

    // ========== Pipelines ==========

    /// Create an empty pipeline.
    pub fn create_pipeline(
        &self,
        name: &str,
        stage_field: Option<&str>,
        actor: &Actor,
    ) -> Result<Pipeline, SchemaChangeError> {
        let pipeline_id = self.storage.generate_id()?;
        self.authorize(actor, Action::CreateSchema, Resource::Pipeline(pipeline_id))?;

        let mut pipeline = Pipeline::new(pipeline_id, name);
        if let Some(stage) = stage_field {
            pipeline = pipeline.with_stage_field(stage);
        }
        let mut tx = self.storage.transaction();
        tx.put_pipeline(pipeline.clone());
        commit(tx)?;

        self.write_audit(
            AuditEntry::new(actor, AuditOp::PipelineCreated, Resource::Pipeline(pipeline_id))
                .with_states(None, Some(&pipeline)),
        );
        info!(pipeline_id, name = %pipeline.name, "pipeline created");
        Ok(pipeline)
    }

    // ========== Fields ==========

    /// Add a field to a pipeline.
    ///
    /// When the field has a default value, existing records that lack the
    /// slug are backfilled with it in the same transaction.
    pub fn create_field(
        &self,
        pipeline_id: u64,
        spec: FieldSpec,
        actor: &Actor,
    ) -> Result<FieldDefinition, SchemaChangeError> {
        self.authorize(actor, Action::CreateSchema, Resource::Pipeline(pipeline_id))?;
        let _records_guard = self.lock(LockKey::Records(pipeline_id))?;
        let _pipeline_guard = self.lock(LockKey::Pipeline(pipeline_id))?;
        let operation = OperationId(self.storage.generate_id()?);

        let outcome = self.create_field_in(operation, pipeline_id, spec);
        let (field, backfill) = self.settle(operation, outcome)?;

        let mut entry = AuditEntry::new(actor, AuditOp::FieldCreated, Resource::Field(field.id))
            .with_states(None, Some(&field));
        if let Some(result) = &backfill {
            entry = entry.with_migration(result.summary());
        }
        self.write_audit(entry);
        info!(
            pipeline_id,
            field_id = field.id,
            slug = %field.slug,
            field_type = %field.field_type,
            backfilled = backfill.as_ref().map_or(0, |r| r.records_migrated),
            "field created"
        );
        Ok(field)
    }

    fn create_field_in(
        &self,
        operation: OperationId,
        pipeline_id: u64,
        mut spec: FieldSpec,
    ) -> Result<(FieldDefinition, Option<MigrationResult>), SchemaChangeError> {
        let mut tx = self.storage.transaction();
        let mut pipeline = tx
            .pipeline(pipeline_id)?
            .ok_or(SchemaChangeError::PipelineNotFound(pipeline_id))?;

        if spec.display_order.is_none() {
            spec.display_order = Some(pipeline.next_display_order());
        }
        let field = FieldDefinition::new(self.storage.generate_id()?, pipeline_id, spec)?;
        let schema = load_schema(&tx, pipeline_id)?;
        if schema.field(&field.slug).is_some() {
            return Err(SchemaChangeError::NameCollision {
                slug: field.slug,
                pipeline_id,
            });
        }

        tx.put_field(field.clone());
        pipeline.field_ids.push(field.id);
        rebuild_projection(&mut tx, pipeline)?;

        let backfill = match field.config.default_value().filter(|v| !is_empty_value(v)) {
            Some(default) => {
                let result = self
                    .executor
                    .backfill_default(&mut tx, operation, &field, &default, false)?;
                if !result.success {
                    return Err(SchemaChangeError::MigrationFailed(Box::new(result)));
                }
                Some(result)
            }
            None => None,
        };

        commit(tx)?;
        Ok((field, backfill))
    }

    /// Change a field's definition and migrate its stored values.
    ///
    /// Denied type changes fail before anything is written. Risky changes
    /// that require a preview fail with
    /// [`SchemaChangeError::ConfirmationRequired`] unless `options.confirmed`
    /// is set. A migration with failed records rolls back the whole change.
    pub fn update_field(
        &self,
        field_id: u64,
        changes: &FieldChanges,
        actor: &Actor,
        options: UpdateOptions,
    ) -> Result<FieldUpdate, SchemaChangeError> {
        self.authorize(actor, Action::UpdateSchema, Resource::Field(field_id))?;
        let _field_guard = self.lock(LockKey::Field(field_id))?;
        let _records_guard = self.lock_records_of(field_id)?;
        let operation = OperationId(self.storage.generate_id()?);

        let outcome = self.update_field_in(operation, field_id, changes, options);
        self.snapshots.release(operation, field_id);
        let (before, update) = if options.dry_run {
            outcome?
        } else {
            self.settle(operation, outcome)?
        };
        if !update.committed {
            debug!(operation_id = %operation, field_id, "dry run rolled back");
            return Ok(update);
        }

        let mut entry = AuditEntry::new(actor, AuditOp::FieldUpdated, Resource::Field(field_id))
            .with_states(Some(&before), Some(&update.field));
        if let Some(result) = &update.migration {
            entry = entry.with_migration(result.summary());
        }
        self.write_audit(entry);
        trace_phase(operation, field_id, ChangePhase::Committed);
        info!(
            operation_id = %operation,
            field_id,
            slug = %update.field.slug,
            decision = update.decision.label(),
            changes = ?update.analysis.migration_types,
            migrated = update.migration.as_ref().map_or(0, |r| r.records_migrated),
            "field updated"
        );
        Ok(update)
    }

    fn update_field_in(
        &self,
        operation: OperationId,
        field_id: u64,
        changes: &FieldChanges,
        options: UpdateOptions,
    ) -> Result<(FieldDefinition, FieldUpdate), SchemaChangeError> {
        let mut tx = self.storage.transaction();
        let before = tx
            .field(field_id)?
            .filter(|f| f.is_active())
            .ok_or(SchemaChangeError::FieldNotFound(field_id))?;

        trace_phase(operation, field_id, ChangePhase::Snapshotting);
        self.snapshots.capture(operation, &before);

        trace_phase(operation, field_id, ChangePhase::Validating);
        let mut after = before.clone();
        after.apply(changes)?;

        let renamed = after.slug != before.slug;
        let _pipeline_guard = self.lock(LockKey::Pipeline(before.pipeline_id))?;
        let schema = load_schema(&tx, before.pipeline_id)?;
        if renamed && schema.fields.iter().any(|f| f.id != field_id && f.slug == after.slug) {
            return Err(SchemaChangeError::NameCollision {
                slug: after.slug,
                pipeline_id: before.pipeline_id,
            });
        }

        let decision = self.matrix.classify(
            before.field_type,
            after.field_type,
            &before.constraints,
            &after.constraints,
        );
        match &decision {
            MigrationDecision::Denied {
                reason,
                explanation,
                alternatives,
            } => {
                info!(
                    operation_id = %operation,
                    field_id,
                    from = %before.field_type,
                    to = %after.field_type,
                    "field change denied"
                );
                return Err(SchemaChangeError::Denied {
                    reason: format!("{}. {}", reason, explanation),
                    alternatives: alternatives.clone(),
                });
            }
            MigrationDecision::Risky {
                warning,
                requires_preview: true,
                ..
            } if !options.confirmed && !options.dry_run => {
                return Err(SchemaChangeError::ConfirmationRequired {
                    warning: warning.clone(),
                });
            }
            _ => {}
        }

        trace_phase(operation, field_id, ChangePhase::Applying);
        let analysis = self.snapshots.diff(operation, &after, &tx)?;
        after.version += 1;
        tx.put_field(after.clone());
        if renamed {
            rewrite_references(&mut tx, &schema, field_id, &before.slug, &after.slug)?;
        }

        trace_phase(operation, field_id, ChangePhase::Migrating);
        let result = self.executor.execute_all(
            &mut tx,
            operation,
            &before,
            &after,
            &analysis,
            options.dry_run,
        )?;
        if !result.success && !options.dry_run {
            warn!(
                operation_id = %operation,
                field_id,
                summary = %result.summary(),
                "migration failed, rolling back field change"
            );
            return Err(SchemaChangeError::MigrationFailed(Box::new(result)));
        }

        trace_phase(operation, field_id, ChangePhase::SchemaCacheRefresh);
        let pipeline = tx
            .pipeline(after.pipeline_id)?
            .ok_or(SchemaChangeError::PipelineNotFound(after.pipeline_id))?;
        rebuild_projection(&mut tx, pipeline)?;

        let migration = analysis.requires_migration.then_some(result);
        let committed = !options.dry_run;
        if committed {
            commit(tx)?;
        } else {
            tx.rollback();
        }
        Ok((
            before,
            FieldUpdate {
                field: after,
                decision,
                analysis,
                migration,
                committed,
            },
        ))
    }

    /// Delete a field.
    ///
    /// A soft delete hides the field and schedules it for hard delete after
    /// the grace period; stored values stay so the field can be restored. A
    /// hard delete removes the definition and strips the slug from every
    /// record in the same transaction.
    pub fn delete_field(
        &self,
        field_id: u64,
        actor: &Actor,
        hard_delete: bool,
    ) -> Result<FieldDeletion, SchemaChangeError> {
        self.authorize(actor, Action::DeleteSchema, Resource::Field(field_id))?;
        let _field_guard = self.lock(LockKey::Field(field_id))?;
        let _records_guard = self.lock_records_of(field_id)?;
        let operation = OperationId(self.storage.generate_id()?);

        let outcome = self.delete_field_in(operation, field_id, hard_delete);
        let deletion = self.settle(operation, outcome)?;

        let op = if hard_delete {
            AuditOp::FieldHardDeleted
        } else {
            AuditOp::FieldSoftDeleted
        };
        let mut entry = AuditEntry::new(actor, op, Resource::Field(field_id))
            .with_states(Some(&deletion.field), None);
        if let Some(result) = &deletion.migration {
            entry = entry.with_migration(result.summary());
        }
        self.write_audit(entry);
        info!(
            field_id,
            slug = %deletion.field.slug,
            hard = hard_delete,
            dependents = deletion.dependents.len(),
            "field deleted"
        );
        Ok(deletion)
    }

    fn delete_field_in(
        &self,
        operation: OperationId,
        field_id: u64,
        hard_delete: bool,
    ) -> Result<FieldDeletion, SchemaChangeError> {
        let mut tx = self.storage.transaction();
        let mut field = tx
            .field(field_id)?
            .ok_or(SchemaChangeError::FieldNotFound(field_id))?;
        if !hard_delete && field.is_deleted {
            return Err(SchemaChangeError::FieldNotFound(field_id));
        }

        let _pipeline_guard = self.lock(LockKey::Pipeline(field.pipeline_id))?;
        let mut pipeline = tx
            .pipeline(field.pipeline_id)?
            .ok_or(SchemaChangeError::PipelineNotFound(field.pipeline_id))?;
        let schema = load_schema(&tx, field.pipeline_id)?;

        let dependents = if field.is_active() {
            DependencyGraph::build(&schema).dependents_of(&field.slug)
        } else {
            Vec::new()
        };
        if !dependents.is_empty() {
            warn!(
                field_id,
                slug = %field.slug,
                dependents = ?dependents,
                "deleting a field other fields depend on"
            );
        }

        let migration = if hard_delete {
            // A soft-deleted field's slug may since have been taken by a new field.
            let slug_reused = field.is_deleted && schema.field(&field.slug).is_some();
            let stripped = if slug_reused {
                None
            } else {
                Some(self.executor.strip_slug(&mut tx, operation, &field)?)
            };
            tx.remove_field(field_id);
            pipeline.field_ids.retain(|id| *id != field_id);
            stripped
        } else {
            let now = Utc::now();
            field.is_deleted = true;
            field.deleted_at = Some(now);
            field.scheduled_hard_delete_at = Some(now + self.hard_delete_grace);
            field.updated_at = now;
            field.version += 1;
            if field.constraints.enforce_uniqueness {
                tx.clear_unique(field.pipeline_id, &field.slug)?;
            }
            tx.put_field(field.clone());
            None
        };

        rebuild_projection(&mut tx, pipeline)?;
        commit(tx)?;
        Ok(FieldDeletion {
            field,
            hard: hard_delete,
            dependents,
            migration,
        })
    }

    /// Revive a soft-deleted field whose slug is still free.
    pub fn restore_field(&self, field_id: u64, actor: &Actor) -> Result<FieldDefinition, SchemaChangeError> {
        self.authorize(actor, Action::DeleteSchema, Resource::Field(field_id))?;
        let _field_guard = self.lock(LockKey::Field(field_id))?;
        let _records_guard = self.lock_records_of(field_id)?;
        let operation = OperationId(self.storage.generate_id()?);

        let outcome = self.restore_field_in(operation, field_id);
        let (field, restored) = self.settle(operation, outcome)?;
        if restored {
            self.write_audit(
                AuditEntry::new(actor, AuditOp::FieldRestored, Resource::Field(field_id))
                    .with_states(None, Some(&field)),
            );
            info!(field_id, slug = %field.slug, "field restored");
        }
        Ok(field)
    }

    fn restore_field_in(
        &self,
        operation: OperationId,
        field_id: u64,
    ) -> Result<(FieldDefinition, bool), SchemaChangeError> {
        let mut tx = self.storage.transaction();
        let field = tx
            .field(field_id)?
            .ok_or(SchemaChangeError::FieldNotFound(field_id))?;
        if field.is_active() {
            return Ok((field, false));
        }

        let _pipeline_guard = self.lock(LockKey::Pipeline(field.pipeline_id))?;
        let pipeline = tx
            .pipeline(field.pipeline_id)?
            .ok_or(SchemaChangeError::PipelineNotFound(field.pipeline_id))?;
        if load_schema(&tx, field.pipeline_id)?.field(&field.slug).is_some() {
            return Err(SchemaChangeError::NameCollision {
                slug: field.slug,
                pipeline_id: field.pipeline_id,
            });
        }

        let mut restored = field;
        restored.is_deleted = false;
        restored.deleted_at = None;
        restored.scheduled_hard_delete_at = None;
        restored.updated_at = Utc::now();
        restored.version += 1;
        tx.put_field(restored.clone());

        if restored.constraints.enforce_uniqueness {
            let mut relaxed = restored.clone();
            relaxed.constraints.enforce_uniqueness = false;
            let result = self.executor.execute(
                &mut tx,
                operation,
                MigrationType::ConstraintChange,
                &relaxed,
                &restored,
                false,
            )?;
            if !result.success {
                return Err(SchemaChangeError::MigrationFailed(Box::new(result)));
            }
        }

        rebuild_projection(&mut tx, pipeline)?;
        commit(tx)?;
        Ok((restored, true))
    }

    /// Hard delete every soft-deleted field whose grace period ended before
    /// `now`. Returns the purged field ids.
    pub fn purge_expired_fields(
        &self,
        now: DateTime<Utc>,
        actor: &Actor,
    ) -> Result<Vec<u64>, SchemaChangeError> {
        let mut purged = Vec::new();
        for pipeline in self.storage.list_pipelines()? {
            for field in self.storage.pipeline_fields(&pipeline)? {
                let due = field.is_deleted
                    && field.scheduled_hard_delete_at.is_some_and(|at| at <= now);
                if !due {
                    continue;
                }
                match self.delete_field(field.id, actor, true) {
                    Ok(_) => purged.push(field.id),
                    Err(e) => warn!(
                        pipeline_id = pipeline.id,
                        field_id = field.id,
                        error = %e,
                        "failed to purge field, retrying on the next run"
                    ),
                }
            }
        }

        let swept = self.snapshots.sweep_expired();
        let pruned = self.locks.prune();
        info!(purged = purged.len(), swept, pruned, "purged expired fields");
        Ok(purged)
    }

    // ========== Previews and ad-hoc coercion ==========

    /// Preview `changes` over up to `sample_size` stored values.
    pub fn preview_migration(
        &self,
        field_id: u64,
        changes: &FieldChanges,
        sample_size: usize,
    ) -> Result<MigrationPreview, SchemaChangeError> {
        let before = self
            .storage
            .get_field(field_id)?
            .filter(|f| f.is_active())
            .ok_or(SchemaChangeError::FieldNotFound(field_id))?;
        let mut after = before.clone();
        after.apply(changes)?;
        Ok(MigrationPreview::build(
            &self.storage,
            &self.matrix,
            &self.coercers,
            &before,
            &after,
            sample_size,
        )?)
    }

    /// Convert an ad-hoc value for a field with the coercer migrations use.
    ///
    /// The source type is inferred from the value's shape. Returns `None`
    /// when the value cannot convert.
    pub fn coerce_value(&self, field_id: u64, value: &Value) -> Result<Option<Value>, SchemaChangeError> {
        let field = self
            .storage
            .get_field(field_id)?
            .filter(|f| f.is_active())
            .ok_or(SchemaChangeError::FieldNotFound(field_id))?;
        Ok(self
            .coercers
            .coerce_for(infer_type(value), field.field_type, value, &field.config))
    }

    /// Rebuild and persist a pipeline's schema projection.
    pub fn refresh_projection(&self, pipeline_id: u64) -> Result<(), SchemaChangeError> {
        let _guard = self.lock(LockKey::Pipeline(pipeline_id))?;
        let mut tx = self.storage.transaction();
        let pipeline = tx
            .pipeline(pipeline_id)?
            .ok_or(SchemaChangeError::PipelineNotFound(pipeline_id))?;
        rebuild_projection(&mut tx, pipeline)?;
        commit(tx)
    }

    // ========== Helpers ==========

    fn authorize(&self, actor: &Actor, action: Action, resource: Resource) -> Result<(), SchemaChangeError> {
        if self.authorizer.can(actor, action, &resource) {
            Ok(())
        } else {
            Err(SchemaChangeError::PermissionDenied(format!(
                "{} may not {} {}",
                actor.id, action, resource
            )))
        }
    }

    fn lock(&self, key: LockKey) -> Result<RowGuard, SchemaChangeError> {
        self.locks.try_lock_for(key, self.lock_timeout).ok_or_else(|| {
            SchemaChangeError::ConcurrentModification(format!("timed out waiting for {:?}", key))
        })
    }

    /// Take the record set of a field's pipeline exclusively. A field that
    /// does not exist locks nothing; the operation then reports it missing.
    fn lock_records_of(&self, field_id: u64) -> Result<Option<RowGuard>, SchemaChangeError> {
        match self.storage.get_field(field_id)? {
            Some(field) => Ok(Some(self.lock(LockKey::Records(field.pipeline_id))?)),
            None => Ok(None),
        }
    }

    /// Close the job checkpoints of a failed operation.
    fn settle<T>(
        &self,
        operation: OperationId,
        outcome: Result<T, SchemaChangeError>,
    ) -> Result<T, SchemaChangeError> {
        if let Err(e) = &outcome {
            match self.jobs.roll_back_operation(operation.0, &e.to_string()) {
                Ok(0) => {}
                Ok(count) => debug!(operation_id = %operation, count, "rolled back migration jobs"),
                Err(job_error) => warn!(
                    operation_id = %operation,
                    error = %job_error,
                    "failed to mark migration jobs rolled back"
                ),
            }
        }
        outcome
    }

    fn write_audit(&self, entry: AuditEntry) {
        if let Err(e) = self.audit.write(entry) {
            warn!(error = %e, "audit write failed");
        }
    }
}

fn trace_phase(operation: OperationId, field_id: u64, phase: ChangePhase) {
    debug!(operation_id = %operation, field_id, phase = ?phase, "schema change phase");
}

fn commit(tx: Transaction<'_>) -> Result<(), SchemaChangeError> {
    tx.commit().map_err(|e| match e {
        Error::Conflict(message) => SchemaChangeError::ConcurrentModification(message),
        other => other.into(),
    })
}

fn load_schema(tx: &Transaction<'_>, pipeline_id: u64) -> Result<PipelineSchema, SchemaChangeError> {
    tx.schema(pipeline_id)?
        .ok_or(SchemaChangeError::PipelineNotFound(pipeline_id))
}

/// Write `pipeline` with a projection rebuilt from the transaction's view of
/// its fields.
fn rebuild_projection(tx: &mut Transaction<'_>, mut pipeline: Pipeline) -> Result<(), SchemaChangeError> {
    pipeline.version += 1;
    tx.put_pipeline(pipeline.clone());
    let schema = load_schema(tx, pipeline.id)?;
    pipeline.rebuild_schema(&schema.fields);
    tx.put_pipeline(pipeline);
    Ok(())
}

/// Point other fields' rules, and the pipeline's stage field, at a renamed
/// slug.
fn rewrite_references(
    tx: &mut Transaction<'_>,
    schema: &PipelineSchema,
    renamed_id: u64,
    from: &str,
    to: &str,
) -> Result<(), SchemaChangeError> {
    for other in schema.fields.iter().filter(|f| f.id != renamed_id) {
        if !other.business_rules.referenced_slugs().contains(from) {
            continue;
        }
        let Some(mut current) = tx.field(other.id)? else {
            continue;
        };
        if current.business_rules.rename_reference(from, to) {
            current.version += 1;
            current.updated_at = Utc::now();
            debug!(field_id = current.id, from, to, "rewrote rule references");
            tx.put_field(current);
        }
    }

    if schema.pipeline.stage_field.as_deref() == Some(from) {
        if let Some(mut pipeline) = tx.pipeline(schema.pipeline.id)? {
            pipeline.stage_field = Some(to.to_string());
            pipeline.version += 1;
            tx.put_pipeline(pipeline);
        }
    }
    Ok(())
}

fn infer_type(value: &Value) -> FieldType {
    match value {
        Value::Number(_) => FieldType::Number,
        Value::Bool(_) => FieldType::Boolean,
        Value::Array(_) => FieldType::Tags,
        _ => FieldType::Text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{
        BusinessRules, ChoiceOptions, Condition, ConditionGroup, ConditionalRule, FieldConfig,
        RuleAction, SelectOption, StorageConstraints,
    };
    use crate::coordinator::MemoryAuditLog;
    use crate::storage::{Record, StorageConfig};
    use serde_json::{json, Map};

    struct Fixture {
        storage: Arc<StorageEngine>,
        locks: Arc<LockManager>,
        coordinator: SchemaChangeCoordinator,
        audit: Arc<MemoryAuditLog>,
        pipeline_id: u64,
    }

    fn fixture() -> Fixture {
        let storage = Arc::new(StorageEngine::open(StorageConfig::temporary()).unwrap());
        let jobs = JobStore::open(storage.db()).unwrap();
        let audit = Arc::new(MemoryAuditLog::new());
        let config = EngineConfig::temporary().with_lock_timeout(Duration::from_millis(50));
        let locks = Arc::new(LockManager::new());
        let coordinator = SchemaChangeCoordinator::new(storage.clone(), locks.clone(), jobs, &config)
            .with_audit(audit.clone());
        let pipeline_id = coordinator
            .create_pipeline("Deals", Some("stage"), &Actor::system())
            .unwrap()
            .id;
        Fixture {
            storage,
            locks,
            coordinator,
            audit,
            pipeline_id,
        }
    }

    fn put_record(storage: &StorageEngine, pipeline_id: u64, id: u64, value: Value) {
        let data: Map<String, Value> = value.as_object().cloned().unwrap_or_default();
        let mut tx = storage.transaction();
        tx.put_record(Record::new(id, pipeline_id, data));
        tx.commit().unwrap();
    }

    #[test]
    fn test_create_field_rejects_collision() {
        let f = fixture();
        let actor = Actor::new("ana");
        f.coordinator
            .create_field(f.pipeline_id, FieldSpec::new("Email", FieldType::Email), &actor)
            .unwrap();
        let err = f
            .coordinator
            .create_field(f.pipeline_id, FieldSpec::new("email", FieldType::Text), &actor)
            .unwrap_err();
        assert!(matches!(err, SchemaChangeError::NameCollision { .. }));

        let pipeline = f.storage.get_pipeline(f.pipeline_id).unwrap().unwrap();
        assert_eq!(pipeline.field_ids.len(), 1);
        assert!(pipeline.schema.contains_key("email"));
    }

    #[test]
    fn test_create_field_backfills_default() {
        let f = fixture();
        put_record(&f.storage, f.pipeline_id, 1, json!({}));
        put_record(&f.storage, f.pipeline_id, 2, json!({"priority": "high"}));

        let choices = ChoiceOptions {
            options: vec![SelectOption::new("low"), SelectOption::new("high")],
            default_value: Some(json!("low")),
            ..ChoiceOptions::default()
        };
        f.coordinator
            .create_field(
                f.pipeline_id,
                FieldSpec::new("Priority", FieldType::Select).with_config(FieldConfig::Select(choices)),
                &Actor::system(),
            )
            .unwrap();

        let first = f.storage.get_record(f.pipeline_id, 1).unwrap().unwrap();
        let second = f.storage.get_record(f.pipeline_id, 2).unwrap().unwrap();
        assert_eq!(first.data["priority"], json!("low"));
        assert_eq!(second.data["priority"], json!("high"));
        assert!(f.audit.entries()[1].migration.is_some());
    }

    #[test]
    fn test_risky_change_requires_confirmation() {
        let f = fixture();
        let field = f
            .coordinator
            .create_field(f.pipeline_id, FieldSpec::new("Notes", FieldType::Textarea), &Actor::system())
            .unwrap();
        put_record(&f.storage, f.pipeline_id, 1, json!({"notes": "x".repeat(200)}));

        let changes = FieldChanges::default().change_type(FieldType::Text);
        let err = f
            .coordinator
            .update_field(field.id, &changes, &Actor::system(), UpdateOptions::default())
            .unwrap_err();
        assert!(matches!(err, SchemaChangeError::ConfirmationRequired { .. }));

        let update = f
            .coordinator
            .update_field(field.id, &changes, &Actor::system(), UpdateOptions::confirmed())
            .unwrap();
        assert!(update.committed);
        let record = f.storage.get_record(f.pipeline_id, 1).unwrap().unwrap();
        assert_eq!(record.data["notes"].as_str().unwrap().chars().count(), 160);
        assert_eq!(f.coordinator.pending_snapshots(), 0);
    }

    #[test]
    fn test_dry_run_changes_nothing() {
        let f = fixture();
        let field = f
            .coordinator
            .create_field(f.pipeline_id, FieldSpec::new("Score", FieldType::Text), &Actor::system())
            .unwrap();
        put_record(&f.storage, f.pipeline_id, 1, json!({"score": "7"}));

        let update = f
            .coordinator
            .update_field(
                field.id,
                &FieldChanges::default().change_type(FieldType::Number),
                &Actor::system(),
                UpdateOptions::dry_run(),
            )
            .unwrap();
        assert!(!update.committed);
        assert_eq!(update.migration.unwrap().records_migrated, 1);

        let stored = f.storage.get_field(field.id).unwrap().unwrap();
        assert_eq!(stored.field_type, FieldType::Text);
        let record = f.storage.get_record(f.pipeline_id, 1).unwrap().unwrap();
        assert_eq!(record.data["score"], json!("7"));
    }

    #[test]
    fn test_rename_rewrites_rule_references() {
        let f = fixture();
        let actor = Actor::system();
        let kind = f
            .coordinator
            .create_field(f.pipeline_id, FieldSpec::new("Kind", FieldType::Text), &actor)
            .unwrap();
        let company = f
            .coordinator
            .create_field(
                f.pipeline_id,
                FieldSpec::new("Company", FieldType::Text).with_rules(BusinessRules::default().with_rule(
                    ConditionalRule::new(
                        RuleAction::Require,
                        ConditionGroup::all(vec![Condition::equals("kind", "b2b")]),
                    ),
                )),
                &actor,
            )
            .unwrap();

        f.coordinator
            .update_field(kind.id, &FieldChanges::default().rename("Customer Kind"), &actor, UpdateOptions::default())
            .unwrap();

        let company = f.storage.get_field(company.id).unwrap().unwrap();
        assert!(company.business_rules.referenced_slugs().contains("customer_kind"));
        let pipeline = f.storage.get_pipeline(f.pipeline_id).unwrap().unwrap();
        assert!(pipeline.schema.contains_key("customer_kind"));
        assert!(!pipeline.schema.contains_key("kind"));
    }

    #[test]
    fn test_soft_delete_restore_and_purge() {
        let f = fixture();
        let actor = Actor::system();
        let field = f
            .coordinator
            .create_field(f.pipeline_id, FieldSpec::new("Budget", FieldType::Number), &actor)
            .unwrap();
        put_record(&f.storage, f.pipeline_id, 1, json!({"budget": 10}));

        let deletion = f.coordinator.delete_field(field.id, &actor, false).unwrap();
        assert!(deletion.field.is_deleted);
        assert!(deletion.field.scheduled_hard_delete_at.is_some());
        assert!(!f.storage.get_pipeline(f.pipeline_id).unwrap().unwrap().schema.contains_key("budget"));

        let restored = f.coordinator.restore_field(field.id, &actor).unwrap();
        assert!(restored.is_active());

        f.coordinator.delete_field(field.id, &actor, false).unwrap();
        assert!(f.coordinator.purge_expired_fields(Utc::now(), &actor).unwrap().is_empty());
        let later = Utc::now() + chrono::Duration::days(31);
        assert_eq!(f.coordinator.purge_expired_fields(later, &actor).unwrap(), vec![field.id]);

        assert!(f.storage.get_field(field.id).unwrap().is_none());
        let record = f.storage.get_record(f.pipeline_id, 1).unwrap().unwrap();
        assert!(!record.data.contains_key("budget"));
    }

    #[test]
    fn test_purge_skips_failing_fields() {
        let f = fixture();
        let actor = Actor::system();
        let first = f
            .coordinator
            .create_field(f.pipeline_id, FieldSpec::new("First", FieldType::Text), &actor)
            .unwrap();
        let second = f
            .coordinator
            .create_field(f.pipeline_id, FieldSpec::new("Second", FieldType::Text), &actor)
            .unwrap();
        f.coordinator.delete_field(first.id, &actor, false).unwrap();
        f.coordinator.delete_field(second.id, &actor, false).unwrap();

        let later = Utc::now() + chrono::Duration::days(31);
        let held = f
            .locks
            .try_lock_for(LockKey::Field(first.id), Duration::from_millis(10))
            .unwrap();
        assert_eq!(f.coordinator.purge_expired_fields(later, &actor).unwrap(), vec![second.id]);
        assert!(f.storage.get_field(first.id).unwrap().is_some());

        drop(held);
        assert_eq!(f.coordinator.purge_expired_fields(later, &actor).unwrap(), vec![first.id]);
        assert!(f.storage.get_field(first.id).unwrap().is_none());
    }

    #[test]
    fn test_migration_holds_record_set() {
        let f = fixture();
        let field = f
            .coordinator
            .create_field(f.pipeline_id, FieldSpec::new("Score", FieldType::Text), &Actor::system())
            .unwrap();
        let writer = f
            .locks
            .try_lock_shared_for(LockKey::Records(f.pipeline_id), Duration::from_millis(10))
            .unwrap();
        let err = f
            .coordinator
            .update_field(
                field.id,
                &FieldChanges::default().change_type(FieldType::Number),
                &Actor::system(),
                UpdateOptions::confirmed(),
            )
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(f.storage.get_field(field.id).unwrap().unwrap().field_type, FieldType::Text);

        drop(writer);
        f.coordinator
            .update_field(
                field.id,
                &FieldChanges::default().change_type(FieldType::Number),
                &Actor::system(),
                UpdateOptions::confirmed(),
            )
            .unwrap();
    }

    #[test]
    fn test_update_rebuilds_projection_in_same_commit() {
        let f = fixture();
        let field = f
            .coordinator
            .create_field(f.pipeline_id, FieldSpec::new("Score", FieldType::Text), &Actor::system())
            .unwrap();
        let version = f.storage.get_pipeline(f.pipeline_id).unwrap().unwrap().version;

        f.coordinator
            .update_field(
                field.id,
                &FieldChanges::default().change_type(FieldType::Number),
                &Actor::system(),
                UpdateOptions::confirmed(),
            )
            .unwrap();
        let pipeline = f.storage.get_pipeline(f.pipeline_id).unwrap().unwrap();
        assert_eq!(pipeline.version, version + 1);
        assert_eq!(pipeline.schema["score"].field_type, FieldType::Number);

        let dry = f
            .coordinator
            .update_field(
                field.id,
                &FieldChanges::default().rename("Points"),
                &Actor::system(),
                UpdateOptions::dry_run(),
            )
            .unwrap();
        assert!(!dry.committed);
        let pipeline = f.storage.get_pipeline(f.pipeline_id).unwrap().unwrap();
        assert_eq!(pipeline.version, version + 1);
        assert!(pipeline.schema.contains_key("score"));
    }

    #[test]
    fn test_refresh_projection_repairs_stale_entries() {
        let f = fixture();
        f.coordinator
            .create_field(f.pipeline_id, FieldSpec::new("Score", FieldType::Text), &Actor::system())
            .unwrap();
        let mut stale = f.storage.get_pipeline(f.pipeline_id).unwrap().unwrap();
        stale.schema.clear();
        let mut tx = f.storage.transaction();
        tx.put_pipeline(stale);
        tx.commit().unwrap();

        f.coordinator.refresh_projection(f.pipeline_id).unwrap();
        let pipeline = f.storage.get_pipeline(f.pipeline_id).unwrap().unwrap();
        assert!(pipeline.schema.contains_key("score"));
    }

    #[test]
    fn test_delete_reports_dependents() {
        let f = fixture();
        let actor = Actor::system();
        let stage = f
            .coordinator
            .create_field(f.pipeline_id, FieldSpec::new("Stage", FieldType::Text), &actor)
            .unwrap();
        f.coordinator
            .create_field(
                f.pipeline_id,
                FieldSpec::new("Budget", FieldType::Number)
                    .with_rules(BusinessRules::default().with_stage_requirement(vec!["won".into()])),
                &actor,
            )
            .unwrap();

        let deletion = f.coordinator.delete_field(stage.id, &actor, false).unwrap();
        assert_eq!(deletion.dependents, vec!["budget".to_string()]);
    }

    #[test]
    fn test_uniqueness_on_duplicates_rolls_back() {
        let f = fixture();
        let field = f
            .coordinator
            .create_field(f.pipeline_id, FieldSpec::new("Code", FieldType::Text), &Actor::system())
            .unwrap();
        put_record(&f.storage, f.pipeline_id, 1, json!({"code": "A"}));
        put_record(&f.storage, f.pipeline_id, 2, json!({"code": "A"}));

        let err = f
            .coordinator
            .update_field(
                field.id,
                &FieldChanges::default().with_constraints(StorageConstraints::default().unique()),
                &Actor::system(),
                UpdateOptions::confirmed(),
            )
            .unwrap_err();
        let SchemaChangeError::MigrationFailed(result) = err else {
            panic!("expected a failed migration");
        };
        assert_eq!(result.records_failed, 1);
        let stored = f.storage.get_field(field.id).unwrap().unwrap();
        assert!(!stored.constraints.enforce_uniqueness);
    }

    #[test]
    fn test_coerce_value() {
        let f = fixture();
        let field = f
            .coordinator
            .create_field(f.pipeline_id, FieldSpec::new("Amount", FieldType::Number), &Actor::system())
            .unwrap();
        assert_eq!(f.coordinator.coerce_value(field.id, &json!("12")).unwrap(), Some(json!(12)));
        assert_eq!(f.coordinator.coerce_value(field.id, &json!("twelve")).unwrap(), None);
    }

    #[test]
    fn test_permission_denied() {
        struct DenyAll;
        impl Authorizer for DenyAll {
            fn can(&self, _: &Actor, _: Action, _: &Resource) -> bool {
                false
            }
        }
        let f = fixture();
        let coordinator = SchemaChangeCoordinator::new(
            f.storage.clone(),
            Arc::new(LockManager::new()),
            JobStore::open(f.storage.db()).unwrap(),
            &EngineConfig::temporary(),
        )
        .with_authorizer(Arc::new(DenyAll));
        let err = coordinator
            .create_field(f.pipeline_id, FieldSpec::new("X", FieldType::Text), &Actor::new("eve"))
            .unwrap_err();
        assert!(matches!(err, SchemaChangeError::PermissionDenied(_)));
    }
}
