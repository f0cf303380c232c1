//! Coordinators for schema changes and record writes.
//!
//! Both coordinators take row locks through a shared [`LockManager`], run
//! their work in one storage transaction, and report to pluggable
//! collaborators (authorization, audit, dependent notification).

pub mod collaborators;
pub mod error;
pub mod locks;
pub mod record;
pub mod schema;

pub use collaborators::{
    Action, Actor, AllowAll, AuditEntry, AuditOp, AuditSink, Authorizer, MemoryAuditLog,
    NoopNotifier, Notifier, Resource, TracingAuditSink,
};
pub use error::{SchemaChangeError, ValidationError};
pub use locks::{LockKey, LockManager, RowGuard};
pub use record::{RecordWriteCoordinator, SaveOptions, SavedRecord};
pub use schema::{ChangePhase, FieldDeletion, FieldUpdate, SchemaChangeCoordinator, UpdateOptions};
