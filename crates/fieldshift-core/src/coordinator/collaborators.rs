//! Capabilities the coordinators consume but do not implement.

use crate::storage::Record;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// Who performs an operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Actor {
    /// Stable actor id.
    pub id: String,
}

impl Actor {
    /// Create an actor.
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    /// Actor used for housekeeping jobs.
    pub fn system() -> Self {
        Self::new("system")
    }
}

/// Operations checked against the authorizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Create pipelines and fields.
    CreateSchema,
    /// Change field definitions.
    UpdateSchema,
    /// Delete or restore fields.
    DeleteSchema,
    /// Create or update records.
    WriteRecord,
    /// Delete records.
    DeleteRecord,
}

impl Action {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::CreateSchema => "create_schema",
            Action::UpdateSchema => "update_schema",
            Action::DeleteSchema => "delete_schema",
            Action::WriteRecord => "write_record",
            Action::DeleteRecord => "delete_record",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The object an action targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "id")]
pub enum Resource {
    /// A pipeline.
    Pipeline(u64),
    /// A field.
    Field(u64),
    /// A record of a pipeline.
    Record {
        /// Pipeline.
        pipeline_id: u64,
        /// Record; `None` for a record being created.
        record_id: Option<u64>,
    },
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resource::Pipeline(id) => write!(f, "pipeline {}", id),
            Resource::Field(id) => write!(f, "field {}", id),
            Resource::Record {
                pipeline_id,
                record_id: Some(id),
            } => write!(f, "record {}/{}", pipeline_id, id),
            Resource::Record {
                pipeline_id,
                record_id: None,
            } => write!(f, "new record in pipeline {}", pipeline_id),
        }
    }
}

/// Permission check.
pub trait Authorizer: Send + Sync {
    /// Check if `actor` may perform `action` on `resource`.
    fn can(&self, actor: &Actor, action: Action, resource: &Resource) -> bool;
}

/// Authorizer that allows everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn can(&self, _actor: &Actor, _action: Action, _resource: &Resource) -> bool {
        true
    }
}

/// Post-write fan-out (computed fields, search refresh, broadcast).
pub trait Notifier: Send + Sync {
    /// Tell dependents that `changed` slugs of `record` were written.
    fn notify_dependents(&self, record: &Record, changed: &BTreeSet<String>) -> Result<(), String>;
}

/// Notifier that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify_dependents(&self, _record: &Record, _changed: &BTreeSet<String>) -> Result<(), String> {
        Ok(())
    }
}

/// Kinds of audited operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOp {
    /// Pipeline created.
    PipelineCreated,
    /// Field created.
    FieldCreated,
    /// Field definition changed.
    FieldUpdated,
    /// Field soft deleted.
    FieldSoftDeleted,
    /// Field hard deleted.
    FieldHardDeleted,
    /// Soft-deleted field restored.
    FieldRestored,
    /// Record created.
    RecordCreated,
    /// Record updated.
    RecordUpdated,
    /// Record deleted.
    RecordDeleted,
}

/// One append-only audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// When the operation committed.
    pub timestamp: DateTime<Utc>,
    /// Who performed it.
    pub actor: String,
    /// What happened.
    pub op: AuditOp,
    /// Affected resource.
    pub resource: Resource,
    /// State before, if any.
    pub before: Option<Value>,
    /// State after, if any.
    pub after: Option<Value>,
    /// Migration outcome summary, if a migration ran.
    pub migration: Option<String>,
}

impl AuditEntry {
    /// Create an entry stamped now.
    pub fn new(actor: &Actor, op: AuditOp, resource: Resource) -> Self {
        Self {
            timestamp: Utc::now(),
            actor: actor.id.clone(),
            op,
            resource,
            before: None,
            after: None,
            migration: None,
        }
    }

    /// Attach serialized before/after states.
    pub fn with_states<T: Serialize>(mut self, before: Option<&T>, after: Option<&T>) -> Self {
        self.before = before.and_then(|v| serde_json::to_value(v).ok());
        self.after = after.and_then(|v| serde_json::to_value(v).ok());
        self
    }

    /// Attach a migration summary.
    pub fn with_migration(mut self, summary: impl Into<String>) -> Self {
        self.migration = Some(summary.into());
        self
    }
}

/// Append-only audit destination.
pub trait AuditSink: Send + Sync {
    /// Append one entry.
    fn write(&self, entry: AuditEntry) -> Result<(), String>;
}

/// Audit sink that writes entries to the `fieldshift::audit` log target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn write(&self, entry: AuditEntry) -> Result<(), String> {
        tracing::info!(
            target: "fieldshift::audit",
            actor = %entry.actor,
            op = ?entry.op,
            resource = %entry.resource,
            migration = entry.migration.as_deref().unwrap_or("-"),
            "audit"
        );
        Ok(())
    }
}

/// In-memory audit log.
#[derive(Debug, Default)]
pub struct MemoryAuditLog {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// All entries.
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().clone()
    }

    /// Entry count.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl AuditSink for MemoryAuditLog {
    fn write(&self, entry: AuditEntry) -> Result<(), String> {
        self.entries.lock().push(entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_audit_log() {
        let log = MemoryAuditLog::new();
        assert!(log.is_empty());
        let entry = AuditEntry::new(&Actor::new("ana"), AuditOp::FieldCreated, Resource::Field(3))
            .with_states(None, Some(&serde_json::json!({"slug": "email"})))
            .with_migration("0 processed");
        log.write(entry).unwrap();

        let entries = log.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].actor, "ana");
        assert_eq!(entries[0].after, Some(serde_json::json!({"slug": "email"})));
        assert!(entries[0].before.is_none());
    }

    #[test]
    fn test_resource_display() {
        assert_eq!(Resource::Field(4).to_string(), "field 4");
        assert_eq!(
            Resource::Record {
                pipeline_id: 1,
                record_id: None
            }
            .to_string(),
            "new record in pipeline 1"
        );
    }
}
