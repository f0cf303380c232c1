//! Batched migration of stored field values.
//!
//! One pass handles one [`MigrationType`]. Passes run inside the caller's
//! transaction, so a failed or dry-run migration is discarded together with
//! the field definition change that triggered it.

use super::coerce::{restrict_to_options, CoercerRegistry};
use super::error::MigrationError;
use super::matrix::TypeCompatibilityMatrix;
use super::snapshot::{ChangeAnalysis, MigrationType, OperationId};
use super::state::{JobStore, MigrationJob};
use crate::catalog::{is_empty_value, value_text, FieldDefinition};
use crate::error::Error;
use crate::storage::{Record, Transaction, WriteOrigin};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Configuration for migration execution.
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Number of records per batch.
    pub batch_size: usize,
    /// Maximum number of error and warning messages kept in a result.
    pub max_errors: usize,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_errors: 10,
        }
    }
}

impl MigrationConfig {
    /// Set the batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Set the message cap.
    pub fn with_max_errors(mut self, max_errors: usize) -> Self {
        self.max_errors = max_errors;
        self
    }
}

/// Progress report, sent after every batch and on completion.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationProgress {
    /// Records processed so far.
    pub processed: u64,
    /// Records selected for the pass.
    pub total: u64,
    /// Human-readable status.
    pub message: String,
}

/// Progress callback.
pub type ProgressCallback = Arc<dyn Fn(&MigrationProgress) + Send + Sync>;

/// Outcome of a migration.
///
/// Counters are summed over the passes that ran.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MigrationResult {
    /// True when no record failed.
    pub success: bool,
    /// Passes that ran, in order.
    pub migration_types: Vec<MigrationType>,
    /// Records visited.
    pub records_processed: u64,
    /// Records whose value was rewritten.
    pub records_migrated: u64,
    /// Records that could not be migrated.
    pub records_failed: u64,
    /// Values that could not convert and were removed.
    pub values_dropped: u64,
    /// Failure messages, capped.
    pub errors: Vec<String>,
    /// Warning messages, capped.
    pub warnings: Vec<String>,
    /// Wall time spent.
    pub elapsed: Duration,
    /// Whether this was a dry run.
    pub dry_run: bool,
}

impl MigrationResult {
    fn new(dry_run: bool) -> Self {
        Self {
            success: true,
            dry_run,
            ..Self::default()
        }
    }

    fn absorb(&mut self, other: MigrationResult, max_messages: usize) {
        self.success &= other.success;
        self.migration_types.extend(other.migration_types);
        self.records_processed += other.records_processed;
        self.records_migrated += other.records_migrated;
        self.records_failed += other.records_failed;
        self.values_dropped += other.values_dropped;
        for error in other.errors {
            push_capped(&mut self.errors, error, max_messages);
        }
        for warning in other.warnings {
            push_capped(&mut self.warnings, warning, max_messages);
        }
    }

    /// One-line summary for logs and audit entries.
    pub fn summary(&self) -> String {
        format!(
            "{} processed, {} migrated, {} failed, {} dropped",
            self.records_processed, self.records_migrated, self.records_failed, self.values_dropped
        )
    }
}

fn push_capped(messages: &mut Vec<String>, message: String, cap: usize) {
    if messages.len() < cap {
        messages.push(message);
    }
}

/// Outcome of migrating one record.
enum RecordOutcome {
    /// Nothing to change.
    Unchanged,
    /// Value rewritten.
    Migrated,
    /// Value removed because it could not convert.
    Dropped(String),
    /// Blank value removed.
    Cleared,
    /// The record cannot satisfy the new definition.
    Failed(String),
}

/// Executes field migrations against a transaction.
#[derive(Clone)]
pub struct MigrationExecutor {
    matrix: Arc<TypeCompatibilityMatrix>,
    coercers: Arc<CoercerRegistry>,
    config: MigrationConfig,
    jobs: Option<JobStore>,
    progress: Option<ProgressCallback>,
}

impl std::fmt::Debug for MigrationExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationExecutor")
            .field("config", &self.config)
            .field("checkpoints", &self.jobs.is_some())
            .finish()
    }
}

impl MigrationExecutor {
    /// Create an executor.
    pub fn new(
        matrix: Arc<TypeCompatibilityMatrix>,
        coercers: Arc<CoercerRegistry>,
        config: MigrationConfig,
    ) -> Self {
        Self {
            matrix,
            coercers,
            config,
            jobs: None,
            progress: None,
        }
    }

    /// Write job checkpoints to `jobs` during live runs.
    pub fn with_job_store(mut self, jobs: JobStore) -> Self {
        self.jobs = Some(jobs);
        self
    }

    /// Report progress to `callback`.
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Executor configuration.
    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    /// Run every pass of `analysis` in order, stopping at the first pass that
    /// fails, then bring the unique index in line with `after`.
    pub fn execute_all(
        &self,
        tx: &mut Transaction<'_>,
        operation: OperationId,
        before: &FieldDefinition,
        after: &FieldDefinition,
        analysis: &ChangeAnalysis,
        dry_run: bool,
    ) -> Result<MigrationResult, MigrationError> {
        let started = Instant::now();
        let mut result = MigrationResult::new(dry_run);

        for migration_type in &analysis.migration_types {
            let pass = self.execute(tx, operation, *migration_type, before, after, dry_run)?;
            result.absorb(pass, self.config.max_errors);
            if !result.success {
                tracing::debug!(
                    operation_id = %operation,
                    field_id = after.id,
                    migration_type = %migration_type,
                    "stopping after failed migration pass"
                );
                break;
            }
        }

        let claimed = after.constraints.enforce_uniqueness
            && analysis.migration_types.contains(&MigrationType::ConstraintChange);
        if result.success && !claimed {
            let rebuild = self.sync_unique_index(tx, before, after)?;
            result.absorb(rebuild, self.config.max_errors);
        }

        result.elapsed = started.elapsed();
        Ok(result)
    }

    /// Run one migration pass.
    ///
    /// The rename pass reads records holding the old slug; later passes read
    /// the new slug, which the rename pass has already populated.
    pub fn execute(
        &self,
        tx: &mut Transaction<'_>,
        operation: OperationId,
        migration_type: MigrationType,
        before: &FieldDefinition,
        after: &FieldDefinition,
        dry_run: bool,
    ) -> Result<MigrationResult, MigrationError> {
        if migration_type == MigrationType::TypeChange
            && self
                .matrix
                .classify(
                    before.field_type,
                    after.field_type,
                    &before.constraints,
                    &after.constraints,
                )
                .is_denied()
        {
            return Err(MigrationError::DeniedConversion {
                from: before.field_type,
                to: after.field_type,
            });
        }

        let source_slug = match migration_type {
            MigrationType::Rename => before.slug.as_str(),
            _ => after.slug.as_str(),
        };

        if migration_type == MigrationType::ConstraintChange && after.constraints.enforce_uniqueness
        {
            tx.clear_unique(after.pipeline_id, &before.slug)?;
            if before.slug != after.slug {
                tx.clear_unique(after.pipeline_id, &after.slug)?;
            }
        }

        let pipeline_id = after.pipeline_id;
        self.run_batches(
            tx,
            operation,
            after,
            migration_type.as_str(),
            source_slug,
            dry_run,
            |tx, record| self.migrate_record(tx, migration_type, before, after, record),
        )
        .map(|mut result| {
            result.migration_types.push(migration_type);
            tracing::debug!(
                operation_id = %operation,
                pipeline_id,
                field_id = after.id,
                migration_type = %migration_type,
                dry_run,
                summary = %result.summary(),
                "migration pass finished"
            );
            result
        })
    }

    /// Write `default` into every live record that lacks the field's slug.
    pub fn backfill_default(
        &self,
        tx: &mut Transaction<'_>,
        operation: OperationId,
        field: &FieldDefinition,
        default: &Value,
        dry_run: bool,
    ) -> Result<MigrationResult, MigrationError> {
        let started = Instant::now();
        let ids: Vec<u64> = tx
            .live_records(field.pipeline_id)?
            .into_iter()
            .filter(|record| !record.data.contains_key(&field.slug))
            .map(|record| record.id)
            .collect();

        let mut result = self.run_ids(
            tx,
            operation,
            field,
            "backfill",
            &field.slug,
            ids,
            dry_run,
            |tx, record| {
                if field.constraints.enforce_uniqueness {
                    if let Some(failure) = claim_or_fail(tx, field, default, record.id)? {
                        return Ok(RecordOutcome::Failed(failure));
                    }
                }
                let mut data = record.data.clone();
                data.insert(field.slug.clone(), default.clone());
                write(tx, record, data, WriteOrigin::Migration);
                Ok(RecordOutcome::Migrated)
            },
        )?;
        result.elapsed = started.elapsed();
        Ok(result)
    }

    /// Remove `slug` from every record of the pipeline and drop its unique
    /// index entries. Used by hard delete.
    pub fn strip_slug(
        &self,
        tx: &mut Transaction<'_>,
        operation: OperationId,
        field: &FieldDefinition,
    ) -> Result<MigrationResult, MigrationError> {
        let started = Instant::now();
        tx.clear_unique(field.pipeline_id, &field.slug)?;
        let mut result = self.run_batches(
            tx,
            operation,
            field,
            "strip",
            &field.slug,
            false,
            |tx, record| {
                let mut data = record.data.clone();
                data.remove(&field.slug);
                write(tx, record, data, WriteOrigin::System);
                Ok(RecordOutcome::Migrated)
            },
        )?;
        result.elapsed = started.elapsed();
        Ok(result)
    }

    /// Rebuild unique entries after a rename or type change of a field that
    /// already enforced uniqueness, and drop them when uniqueness is lifted.
    fn sync_unique_index(
        &self,
        tx: &mut Transaction<'_>,
        before: &FieldDefinition,
        after: &FieldDefinition,
    ) -> Result<MigrationResult, MigrationError> {
        let mut result = MigrationResult::new(false);
        let was_unique = before.constraints.enforce_uniqueness;
        let is_unique = after.constraints.enforce_uniqueness;

        if was_unique && !is_unique {
            tx.clear_unique(before.pipeline_id, &before.slug)?;
            return Ok(result);
        }
        let reshaped = before.slug != after.slug || before.field_type != after.field_type;
        if !is_unique || !reshaped {
            return Ok(result);
        }

        tx.clear_unique(before.pipeline_id, &before.slug)?;
        for record_id in tx.record_ids_with_key(after.pipeline_id, &after.slug)? {
            let record = tx
                .record(after.pipeline_id, record_id)?
                .ok_or(MigrationError::RecordVanished { record_id })?;
            let Some(value) = record.data.get(&after.slug) else {
                continue;
            };
            if let Some(failure) = claim_or_fail(tx, after, value, record_id)? {
                result.success = false;
                result.records_failed += 1;
                push_capped(&mut result.errors, failure, self.config.max_errors);
            }
        }
        Ok(result)
    }

    fn migrate_record(
        &self,
        tx: &mut Transaction<'_>,
        migration_type: MigrationType,
        before: &FieldDefinition,
        after: &FieldDefinition,
        record: &Record,
    ) -> Result<RecordOutcome, MigrationError> {
        match migration_type {
            MigrationType::Rename => {
                let mut data = record.data.clone();
                let Some(value) = data.remove(&before.slug) else {
                    return Ok(RecordOutcome::Unchanged);
                };
                if let Some(existing) = data.get(&after.slug) {
                    if !is_empty_value(existing) && *existing != value {
                        return Ok(RecordOutcome::Failed(format!(
                            "record {}: '{}' already holds a different value",
                            record.id, after.slug
                        )));
                    }
                }
                data.insert(after.slug.clone(), value);
                write(tx, record, data, WriteOrigin::Migration);
                Ok(RecordOutcome::Migrated)
            }
            MigrationType::TypeChange => {
                let Some(value) = record.data.get(&after.slug) else {
                    return Ok(RecordOutcome::Unchanged);
                };
                let mut data = record.data.clone();
                if is_empty_value(value) {
                    data.remove(&after.slug);
                    write(tx, record, data, WriteOrigin::Migration);
                    return Ok(RecordOutcome::Cleared);
                }
                match self.coercers.coerce_for(
                    before.field_type,
                    after.field_type,
                    value,
                    &after.config,
                ) {
                    Some(converted) => {
                        data.insert(after.slug.clone(), converted);
                        write(tx, record, data, WriteOrigin::Migration);
                        Ok(RecordOutcome::Migrated)
                    }
                    None => {
                        let warning = format!(
                            "record {}: {} could not convert to {}",
                            record.id, value, after.field_type
                        );
                        data.remove(&after.slug);
                        write(tx, record, data, WriteOrigin::Migration);
                        Ok(RecordOutcome::Dropped(warning))
                    }
                }
            }
            MigrationType::ConfigChange => {
                let Some(value) = record.data.get(&after.slug) else {
                    return Ok(RecordOutcome::Unchanged);
                };
                if is_empty_value(value) {
                    return Ok(RecordOutcome::Unchanged);
                }
                let mut data = record.data.clone();
                match restrict_to_options(value, &after.config) {
                    Some(kept) if kept == *value => Ok(RecordOutcome::Unchanged),
                    Some(kept) => {
                        data.insert(after.slug.clone(), kept);
                        write(tx, record, data, WriteOrigin::Migration);
                        Ok(RecordOutcome::Migrated)
                    }
                    None => {
                        let warning = format!(
                            "record {}: {} is no longer an option",
                            record.id, value
                        );
                        data.remove(&after.slug);
                        write(tx, record, data, WriteOrigin::Migration);
                        Ok(RecordOutcome::Dropped(warning))
                    }
                }
            }
            MigrationType::ConstraintChange => {
                let Some(value) = record.data.get(&after.slug) else {
                    return Ok(RecordOutcome::Unchanged);
                };
                if let Some(max) = after.constraints.max_length {
                    let length = value_text(value).map(|t| t.chars().count()).unwrap_or(0);
                    if length > max {
                        return Ok(RecordOutcome::Failed(format!(
                            "record {}: value of '{}' has {} characters, maximum is {}",
                            record.id, after.slug, length, max
                        )));
                    }
                }
                if after.constraints.enforce_uniqueness {
                    if let Some(failure) = claim_or_fail(tx, after, value, record.id)? {
                        return Ok(RecordOutcome::Failed(failure));
                    }
                }
                Ok(RecordOutcome::Unchanged)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn run_batches<F>(
        &self,
        tx: &mut Transaction<'_>,
        operation: OperationId,
        field: &FieldDefinition,
        label: &str,
        source_slug: &str,
        dry_run: bool,
        per_record: F,
    ) -> Result<MigrationResult, MigrationError>
    where
        F: FnMut(&mut Transaction<'_>, &Record) -> Result<RecordOutcome, MigrationError>,
    {
        let ids = tx.record_ids_with_key(field.pipeline_id, source_slug)?;
        self.run_ids(tx, operation, field, label, source_slug, ids, dry_run, per_record)
    }

    #[allow(clippy::too_many_arguments)]
    fn run_ids<F>(
        &self,
        tx: &mut Transaction<'_>,
        operation: OperationId,
        field: &FieldDefinition,
        label: &str,
        source_slug: &str,
        ids: Vec<u64>,
        dry_run: bool,
        mut per_record: F,
    ) -> Result<MigrationResult, MigrationError>
    where
        F: FnMut(&mut Transaction<'_>, &Record) -> Result<RecordOutcome, MigrationError>,
    {
        let mut result = MigrationResult::new(dry_run);
        let total = ids.len() as u64;
        let cap = self.config.max_errors;

        let mut job = match (&self.jobs, dry_run) {
            (Some(_), false) => Some(MigrationJob::new(
                tx.engine().generate_id()?,
                operation.0,
                field.pipeline_id,
                field.id,
                label,
                source_slug,
                field.slug.as_str(),
                total,
            )),
            _ => None,
        };
        self.checkpoint(job.as_ref())?;

        for batch in ids.chunks(self.config.batch_size.max(1)) {
            for record_id in batch {
                let record = tx
                    .record(field.pipeline_id, *record_id)?
                    .ok_or(MigrationError::RecordVanished {
                        record_id: *record_id,
                    })?;
                result.records_processed += 1;
                match per_record(tx, &record)? {
                    RecordOutcome::Unchanged | RecordOutcome::Cleared => {}
                    RecordOutcome::Migrated => result.records_migrated += 1,
                    RecordOutcome::Dropped(warning) => {
                        result.values_dropped += 1;
                        push_capped(&mut result.warnings, warning, cap);
                    }
                    RecordOutcome::Failed(error) => {
                        result.records_failed += 1;
                        push_capped(&mut result.errors, error, cap);
                    }
                }
            }

            if let Some(job) = job.as_mut() {
                job.checkpoint(
                    result.records_processed,
                    result.records_migrated,
                    result.records_failed,
                    batch.last().copied(),
                );
            }
            self.checkpoint(job.as_ref())?;
            self.report(
                result.records_processed,
                total,
                format!("{}: {}/{} records", label, result.records_processed, total),
            );
        }

        result.success = result.records_failed == 0;
        if let Some(job) = job.as_mut() {
            if result.success {
                job.complete();
            } else {
                job.fail(format!("{} records failed", result.records_failed));
            }
        }
        self.checkpoint(job.as_ref())?;
        self.report(
            result.records_processed,
            total,
            format!("{} finished: {}", label, result.summary()),
        );
        Ok(result)
    }

    fn checkpoint(&self, job: Option<&MigrationJob>) -> Result<(), MigrationError> {
        match (&self.jobs, job) {
            (Some(store), Some(job)) => store.save(job),
            _ => Ok(()),
        }
    }

    fn report(&self, processed: u64, total: u64, message: String) {
        if let Some(callback) = &self.progress {
            callback(&MigrationProgress {
                processed,
                total,
                message,
            });
        }
    }
}

fn write(
    tx: &mut Transaction<'_>,
    record: &Record,
    data: serde_json::Map<String, Value>,
    origin: WriteOrigin,
) {
    let mut updated = record.clone();
    if updated.set_data(data, origin) {
        tx.put_record(updated);
    }
}

/// Claim a unique value; a duplicate becomes a failure message.
fn claim_or_fail(
    tx: &mut Transaction<'_>,
    field: &FieldDefinition,
    value: &Value,
    record_id: u64,
) -> Result<Option<String>, MigrationError> {
    match tx.claim_unique(field.pipeline_id, &field.slug, value, record_id) {
        Ok(()) => Ok(None),
        Err(Error::UniqueViolation { value, owner, .. }) => Ok(Some(format!(
            "record {}: '{}' duplicates the value '{}' of record {}",
            record_id, field.slug, value, owner
        ))),
        Err(e) => Err(e.into()),
    }
}
