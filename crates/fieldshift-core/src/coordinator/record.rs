//! Record write orchestration.
//!
//! A save merges the incoming values into the stored record, validates the
//! candidate in the context the change calls for, keeps the unique index in
//! step, and commits. Fan-out to dependents, auditing, and non-critical
//! validation run after commit and never fail the write.

use super::collaborators::{
    Action, Actor, AllowAll, AuditEntry, AuditOp, AuditSink, Authorizer, Notifier, NoopNotifier,
    Resource, TracingAuditSink,
};
use super::error::ValidationError;
use super::locks::{LockKey, LockManager, RowGuard};
use crate::catalog::{is_empty_value, PipelineSchema};
use crate::error::Error;
use crate::storage::{Record, StorageEngine, Transaction, WriteOrigin};
use crate::validation::{
    BackgroundValidator, LogWarningSink, ValidationConfig, ValidationContext, ValidationEngine,
};
use chrono::Utc;
use dashmap::DashMap;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Options of [`RecordWriteCoordinator::save`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveOptions {
    /// Run critical business rules even for a small update.
    pub force_business_rules: bool,
}

/// Outcome of a save.
#[derive(Debug, Clone)]
pub struct SavedRecord {
    /// The record as committed.
    pub record: Record,
    /// Whether the record was created by this save.
    pub created: bool,
    /// Slugs whose value changed.
    pub changed: BTreeSet<String>,
    /// Validation context the save ran in.
    pub context: ValidationContext,
    /// Whether non-critical validation was scheduled.
    pub background_scheduled: bool,
}

/// Schema identity used to reuse validators: pipeline version plus the
/// `(id, version)` of each active field.
type SchemaStamp = (u64, Vec<(u64, u64)>);

fn stamp(schema: &PipelineSchema) -> SchemaStamp {
    (
        schema.pipeline.version,
        schema.fields.iter().map(|f| (f.id, f.version)).collect(),
    )
}

/// Orchestrates record creates, updates, and deletes.
pub struct RecordWriteCoordinator {
    storage: Arc<StorageEngine>,
    locks: Arc<LockManager>,
    config: ValidationConfig,
    validators: DashMap<u64, (SchemaStamp, Arc<ValidationEngine>)>,
    background: BackgroundValidator,
    authorizer: Arc<dyn Authorizer>,
    notifier: Arc<dyn Notifier>,
    audit: Arc<dyn AuditSink>,
    lock_timeout: Duration,
}

impl std::fmt::Debug for RecordWriteCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordWriteCoordinator")
            .field("config", &self.config)
            .field("cached_validators", &self.validators.len())
            .field("background", &self.background)
            .finish()
    }
}

impl RecordWriteCoordinator {
    /// Create a coordinator that logs background warnings.
    pub fn new(
        storage: Arc<StorageEngine>,
        locks: Arc<LockManager>,
        config: ValidationConfig,
        lock_timeout: Duration,
    ) -> Self {
        let background =
            BackgroundValidator::new(config.background_validation_limit, Arc::new(LogWarningSink));
        Self {
            storage,
            locks,
            config,
            validators: DashMap::new(),
            background,
            authorizer: Arc::new(AllowAll),
            notifier: Arc::new(NoopNotifier),
            audit: Arc::new(TracingAuditSink),
            lock_timeout,
        }
    }

    /// Check permissions with `authorizer`.
    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    /// Fan out committed writes to `notifier`.
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Send audit entries to `audit`.
    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    /// Run non-critical validation with `background`.
    pub fn with_background(mut self, background: BackgroundValidator) -> Self {
        self.background = background;
        self
    }

    /// Validator for the current schema of a pipeline.
    pub fn validator(&self, pipeline_id: u64) -> Result<Arc<ValidationEngine>, ValidationError> {
        let schema = self
            .storage
            .load_schema(pipeline_id)?
            .ok_or(ValidationError::PipelineNotFound(pipeline_id))?;
        Ok(self.validator_for(schema))
    }

    fn validator_for(&self, schema: PipelineSchema) -> Arc<ValidationEngine> {
        let pipeline_id = schema.pipeline.id;
        let current = stamp(&schema);
        if let Some(entry) = self.validators.get(&pipeline_id) {
            if entry.0 == current {
                return entry.1.clone();
            }
        }
        let engine = Arc::new(ValidationEngine::new(schema, &self.config));
        self.validators
            .insert(pipeline_id, (current, engine.clone()));
        debug!(pipeline_id, "built validator");
        engine
    }

    /// Create (`record_id = None`) or update a record.
    ///
    /// Only slugs present in `incoming` are written; every other stored
    /// value is kept. Blank values are stored as `null`.
    pub fn save(
        &self,
        pipeline_id: u64,
        record_id: Option<u64>,
        incoming: Map<String, Value>,
        actor: &Actor,
        options: SaveOptions,
    ) -> Result<SavedRecord, ValidationError> {
        self.authorize(
            actor,
            Action::WriteRecord,
            Resource::Record {
                pipeline_id,
                record_id,
            },
        )?;
        let created = record_id.is_none();
        let record_id = match record_id {
            Some(id) => id,
            None => self.storage.generate_id()?,
        };
        let _records_guard = self.lock_records(pipeline_id)?;
        let _guard = self.lock(LockKey::Record(pipeline_id, record_id))?;

        let mut tx = self.storage.transaction();
        let schema = tx
            .schema(pipeline_id)?
            .ok_or(ValidationError::PipelineNotFound(pipeline_id))?;
        let engine = self.validator_for(schema);

        let existing = if created {
            None
        } else {
            Some(
                tx.record(pipeline_id, record_id)?
                    .filter(|r| !r.is_deleted)
                    .ok_or(ValidationError::RecordNotFound {
                        pipeline_id,
                        record_id,
                    })?,
            )
        };
        let stored = existing.as_ref().map(|r| r.data.clone()).unwrap_or_default();

        let mut unknown = BTreeMap::new();
        for slug in incoming.keys() {
            if engine.schema().field(slug).is_none() {
                unknown.insert(slug.clone(), vec!["unknown field".to_string()]);
            }
        }
        if !unknown.is_empty() {
            return Err(ValidationError::FieldErrors(unknown));
        }

        let changed: BTreeSet<String> = incoming
            .iter()
            .filter(|(slug, value)| created || stored.get(slug.as_str()) != Some(*value))
            .map(|(slug, _)| slug.clone())
            .collect();

        let mut candidate = stored.clone();
        for (slug, value) in &incoming {
            candidate.insert(slug.clone(), value.clone());
        }

        let context = engine.select_context(created, &changed, options.force_business_rules);
        let mut outcome = engine.validate(&candidate, &context);
        let unchecked: BTreeSet<String> = changed
            .iter()
            .filter(|slug| !outcome.cleaned_data.contains_key(slug.as_str()))
            .filter(|slug| !outcome.field_errors.contains_key(slug.as_str()))
            .cloned()
            .collect();
        if !unchecked.is_empty() {
            let extra = engine.validate_fields(&candidate, &unchecked);
            outcome.cleaned_data.extend(extra.cleaned_data);
            for (slug, messages) in extra.field_errors {
                outcome.field_errors.entry(slug).or_default().extend(messages);
            }
            outcome.is_valid &= extra.is_valid;
        }
        if !outcome.is_valid {
            debug!(
                pipeline_id,
                record_id,
                context = context.as_str(),
                fields = ?outcome.field_errors.keys().collect::<Vec<_>>(),
                "record rejected"
            );
            return Err(ValidationError::FieldErrors(outcome.field_errors));
        }

        let mut data = stored.clone();
        for slug in &changed {
            let value = outcome
                .cleaned_data
                .get(slug)
                .cloned()
                .unwrap_or(Value::Null);
            data.insert(slug.clone(), value);
        }

        self.sync_unique(&mut tx, &engine, pipeline_id, record_id, &stored, &data, &changed)?;

        let (record, written) = match existing {
            Some(mut record) => {
                let written = record.set_data(data, WriteOrigin::User);
                if written {
                    tx.put_record(record.clone());
                }
                (record, written)
            }
            None => {
                let record = Record::new(record_id, pipeline_id, data);
                tx.put_record(record.clone());
                (record, true)
            }
        };
        commit(tx)?;

        let background_scheduled = if written {
            self.after_write(&engine, actor, &record, created, &changed, stored)
        } else {
            false
        };
        Ok(SavedRecord {
            record,
            created,
            changed,
            context,
            background_scheduled,
        })
    }

    /// Soft delete a record and release its unique values.
    pub fn delete(&self, pipeline_id: u64, record_id: u64, actor: &Actor) -> Result<Record, ValidationError> {
        self.authorize(
            actor,
            Action::DeleteRecord,
            Resource::Record {
                pipeline_id,
                record_id: Some(record_id),
            },
        )?;
        let _records_guard = self.lock_records(pipeline_id)?;
        let _guard = self.lock(LockKey::Record(pipeline_id, record_id))?;

        let mut tx = self.storage.transaction();
        let schema = tx
            .schema(pipeline_id)?
            .ok_or(ValidationError::PipelineNotFound(pipeline_id))?;
        let mut record = tx
            .record(pipeline_id, record_id)?
            .filter(|r| !r.is_deleted)
            .ok_or(ValidationError::RecordNotFound {
                pipeline_id,
                record_id,
            })?;

        for field in schema.fields.iter().filter(|f| f.constraints.enforce_uniqueness) {
            if let Some(value) = record.data.get(&field.slug) {
                tx.release_unique(pipeline_id, &field.slug, value, record_id)?;
            }
        }
        let now = Utc::now();
        record.is_deleted = true;
        record.deleted_at = Some(now);
        record.updated_at = now;
        record.version += 1;
        tx.put_record(record.clone());
        commit(tx)?;

        self.write_audit(
            AuditEntry::new(actor, AuditOp::RecordDeleted, Resource::Record {
                pipeline_id,
                record_id: Some(record_id),
            })
            .with_states(Some(&record.data), None),
        );
        info!(pipeline_id, record_id, "record deleted");
        Ok(record)
    }

    /// Release old and claim new values of changed unique fields.
    #[allow(clippy::too_many_arguments)]
    fn sync_unique(
        &self,
        tx: &mut Transaction<'_>,
        engine: &ValidationEngine,
        pipeline_id: u64,
        record_id: u64,
        stored: &Map<String, Value>,
        data: &Map<String, Value>,
        changed: &BTreeSet<String>,
    ) -> Result<(), ValidationError> {
        let mut errors: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for slug in changed {
            let Some(field) = engine.schema().field(slug) else {
                continue;
            };
            if !field.constraints.enforce_uniqueness {
                continue;
            }
            if let Some(old) = stored.get(slug) {
                tx.release_unique(pipeline_id, slug, old, record_id)?;
            }
            let Some(new) = data.get(slug).filter(|v| !is_empty_value(v)) else {
                continue;
            };
            match tx.claim_unique(pipeline_id, slug, new, record_id) {
                Ok(()) => {}
                Err(Error::UniqueViolation { value, owner, .. }) => {
                    errors
                        .entry(slug.clone())
                        .or_default()
                        .push(duplicate_message(&value, owner));
                }
                Err(e) => return Err(e.into()),
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::FieldErrors(errors))
        }
    }

    /// Notify, audit, and schedule non-critical validation. Returns whether
    /// background validation was scheduled.
    fn after_write(
        &self,
        engine: &Arc<ValidationEngine>,
        actor: &Actor,
        record: &Record,
        created: bool,
        changed: &BTreeSet<String>,
        stored: Map<String, Value>,
    ) -> bool {
        if !changed.is_empty() && record.last_write_origin.is_user_visible() {
            if let Err(e) = self.notifier.notify_dependents(record, changed) {
                warn!(
                    pipeline_id = record.pipeline_id,
                    record_id = record.id,
                    error = %e,
                    "dependent notification failed"
                );
            }
        }

        let resource = Resource::Record {
            pipeline_id: record.pipeline_id,
            record_id: Some(record.id),
        };
        let entry = if created {
            AuditEntry::new(actor, AuditOp::RecordCreated, resource).with_states(None, Some(&record.data))
        } else {
            AuditEntry::new(actor, AuditOp::RecordUpdated, resource)
                .with_states(Some(&stored), Some(&record.data))
        };
        self.write_audit(entry);

        let single = match changed.len() {
            1 => changed.iter().next().cloned(),
            _ => None,
        };
        let scheduled = self
            .background
            .spawn(engine.clone(), record.id, record.data.clone(), single);
        info!(
            pipeline_id = record.pipeline_id,
            record_id = record.id,
            created,
            changed = changed.len(),
            version = record.version,
            "record saved"
        );
        scheduled
    }

    fn authorize(&self, actor: &Actor, action: Action, resource: Resource) -> Result<(), ValidationError> {
        if self.authorizer.can(actor, action, &resource) {
            Ok(())
        } else {
            Err(ValidationError::PermissionDenied(format!(
                "{} may not {} {}",
                actor.id, action, resource
            )))
        }
    }

    fn lock(&self, key: LockKey) -> Result<RowGuard, ValidationError> {
        self.locks.try_lock_for(key, self.lock_timeout).ok_or_else(|| {
            ValidationError::ConcurrentModification(format!("timed out waiting for {:?}", key))
        })
    }

    /// Hold the pipeline's record set shared so no migration runs until the
    /// write commits.
    fn lock_records(&self, pipeline_id: u64) -> Result<RowGuard, ValidationError> {
        let key = LockKey::Records(pipeline_id);
        self.locks
            .try_lock_shared_for(key, self.lock_timeout)
            .ok_or_else(|| {
                ValidationError::ConcurrentModification(format!(
                    "pipeline {} is being migrated",
                    pipeline_id
                ))
            })
    }

    fn write_audit(&self, entry: AuditEntry) {
        if let Err(e) = self.audit.write(entry) {
            warn!(error = %e, "audit write failed");
        }
    }
}

fn duplicate_message(value: &str, owner: u64) -> String {
    format!("value {} is already used by record {}", value, owner)
}

fn commit(tx: Transaction<'_>) -> Result<(), ValidationError> {
    tx.commit().map_err(|e| match e {
        Error::Conflict(message) => ValidationError::ConcurrentModification(message),
        Error::UniqueViolation { slug, value, owner } => {
            let mut errors = BTreeMap::new();
            errors.insert(slug, vec![duplicate_message(&value, owner)]);
            ValidationError::FieldErrors(errors)
        }
        other => other.into(),
    })
}
