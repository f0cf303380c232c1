//! Migration job checkpoints.
//!
//! Live migrations write a checkpoint per batch so an operator can see how
//! far a job got, and so jobs interrupted by a crash can be found and closed
//! on the next start.

use super::error::MigrationError;
use crate::storage::key::{current_timestamp, id_key};
use rkyv::{Archive, Deserialize, Serialize};

/// Status of a migration job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub enum JobStatus {
    /// Job is processing batches.
    Running,
    /// Every batch was processed without failures.
    Completed,
    /// At least one record failed; the enclosing operation was abandoned.
    Failed,
    /// The enclosing transaction was discarded.
    RolledBack,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::RolledBack => write!(f, "rolled_back"),
        }
    }
}

/// Persistent checkpoint of one migration pass.
#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
pub struct MigrationJob {
    /// Job id.
    pub job_id: u64,
    /// Schema operation the job belongs to.
    pub operation_id: u64,
    /// Pipeline being migrated.
    pub pipeline_id: u64,
    /// Field being migrated.
    pub field_id: u64,
    /// Migration kind (`rename`, `type_change`, ...).
    pub migration_type: String,
    /// Slug values are read from.
    pub source_slug: String,
    /// Slug values are written to.
    pub target_slug: String,
    /// Current status.
    pub status: JobStatus,
    /// Records processed so far.
    pub processed: u64,
    /// Records selected for the job.
    pub total: u64,
    /// Records rewritten so far.
    pub migrated: u64,
    /// Records that failed so far.
    pub failed: u64,
    /// Last processed record id.
    pub last_processed_id: Option<u64>,
    /// Start time (microseconds since epoch).
    pub started_at: u64,
    /// Last checkpoint time (microseconds since epoch).
    pub updated_at: u64,
    /// Reason the job stopped, if it did not complete.
    pub error: Option<String>,
}

impl MigrationJob {
    /// Create a running job.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        job_id: u64,
        operation_id: u64,
        pipeline_id: u64,
        field_id: u64,
        migration_type: impl Into<String>,
        source_slug: impl Into<String>,
        target_slug: impl Into<String>,
        total: u64,
    ) -> Self {
        let now = current_timestamp();
        Self {
            job_id,
            operation_id,
            pipeline_id,
            field_id,
            migration_type: migration_type.into(),
            source_slug: source_slug.into(),
            target_slug: target_slug.into(),
            status: JobStatus::Running,
            processed: 0,
            total,
            migrated: 0,
            failed: 0,
            last_processed_id: None,
            started_at: now,
            updated_at: now,
            error: None,
        }
    }

    /// Record batch progress.
    pub fn checkpoint(&mut self, processed: u64, migrated: u64, failed: u64, last_id: Option<u64>) {
        self.processed = processed;
        self.migrated = migrated;
        self.failed = failed;
        self.last_processed_id = last_id.or(self.last_processed_id);
        self.updated_at = current_timestamp();
    }

    /// Mark the job completed.
    pub fn complete(&mut self) {
        self.status = JobStatus::Completed;
        self.updated_at = current_timestamp();
    }

    /// Mark the job failed.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.error = Some(error.into());
        self.updated_at = current_timestamp();
    }

    /// Mark the job rolled back.
    pub fn roll_back(&mut self, reason: impl Into<String>) {
        self.status = JobStatus::RolledBack;
        if self.error.is_none() {
            self.error = Some(reason.into());
        }
        self.updated_at = current_timestamp();
    }

    /// Check if the job reached a final status.
    pub fn is_terminal(&self) -> bool {
        !matches!(self.status, JobStatus::Running)
    }

    /// Calculate percentage complete.
    pub fn percent_complete(&self) -> f64 {
        if self.total == 0 {
            100.0
        } else {
            (self.processed as f64 / self.total as f64) * 100.0
        }
    }

    /// Serialize the job to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, MigrationError> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(|e| MigrationError::Serialization(e.to_string()))
    }

    /// Deserialize a job from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MigrationError> {
        let mut aligned = rkyv::util::AlignedVec::<16>::with_capacity(bytes.len());
        aligned.extend_from_slice(bytes);
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(&aligned)
            .map_err(|e| MigrationError::Deserialization(e.to_string()))
    }
}

/// Job checkpoint store on its own sled tree.
///
/// Checkpoints are written outside the schema transaction so progress stays
/// visible while the transaction is still open.
#[derive(Clone)]
pub struct JobStore {
    tree: sled::Tree,
}

impl JobStore {
    /// Tree name for job checkpoints.
    pub const TREE_NAME: &'static str = "migration:jobs";

    /// Open or create the job store.
    pub fn open(db: &sled::Db) -> Result<Self, MigrationError> {
        Ok(Self {
            tree: db.open_tree(Self::TREE_NAME)?,
        })
    }

    /// Save a job.
    pub fn save(&self, job: &MigrationJob) -> Result<(), MigrationError> {
        self.tree.insert(id_key(job.job_id), job.to_bytes()?)?;
        Ok(())
    }

    /// Load a job.
    pub fn load(&self, job_id: u64) -> Result<Option<MigrationJob>, MigrationError> {
        match self.tree.get(id_key(job_id))? {
            Some(bytes) => Ok(Some(MigrationJob::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// List every job in id order.
    pub fn list(&self) -> Result<Vec<MigrationJob>, MigrationError> {
        self.tree
            .iter()
            .values()
            .map(|bytes| MigrationJob::from_bytes(&bytes?))
            .collect()
    }

    /// Jobs of one operation.
    pub fn for_operation(&self, operation_id: u64) -> Result<Vec<MigrationJob>, MigrationError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|job| job.operation_id == operation_id)
            .collect())
    }

    /// Mark every non-terminal job of `operation_id` rolled back.
    pub fn roll_back_operation(
        &self,
        operation_id: u64,
        reason: &str,
    ) -> Result<usize, MigrationError> {
        let mut count = 0;
        for mut job in self.for_operation(operation_id)? {
            if job.status == JobStatus::Running || job.status == JobStatus::Completed {
                job.roll_back(reason);
                self.save(&job)?;
                count += 1;
            }
        }
        Ok(count)
    }

    /// Close jobs left running by a previous process.
    ///
    /// The schema transaction of such a job never committed, so its record
    /// writes were discarded; the job is marked rolled back.
    pub fn recover_interrupted(&self) -> Result<Vec<MigrationJob>, MigrationError> {
        let mut recovered = Vec::new();
        for mut job in self.list()? {
            if job.status == JobStatus::Running {
                job.roll_back("interrupted before commit");
                self.save(&job)?;
                tracing::warn!(
                    job_id = job.job_id,
                    field_id = job.field_id,
                    migration_type = %job.migration_type,
                    processed = job.processed,
                    "marked interrupted migration job rolled back"
                );
                recovered.push(job);
            }
        }
        Ok(recovered)
    }
}
