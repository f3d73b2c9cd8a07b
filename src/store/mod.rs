//! Durable store: the single source of truth for jobs, executions and logs.
//!
//! Two backends: [`PgStore`] for production and [`MemoryStore`] for tests and
//! local development. The planner and workers only see the [`JobStore`]
//! trait.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::error::Result;
use crate::execution::{Execution, ExecutionError, ExecutionId, ExecutionStatus, JobLog};
use crate::job::{Job, JobId, JobStatus};

/// What should happen to `next_execution_at` when an attempt finalizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextExecution {
    /// Leave the stored value untouched.
    Keep,
    /// Clear it (terminal job states).
    Clear,
    /// Set a new instant (recurring advance).
    Set(DateTime<Utc>),
}

/// Job-row effects of one attempt outcome, applied together with the
/// execution update.
#[derive(Debug, Clone)]
pub struct JobFinalize {
    /// Bumps `successful_executions` when true, `failed_executions` otherwise.
    /// `total_executions` is always bumped.
    pub succeeded: bool,
    pub last_executed_at: DateTime<Utc>,
    /// Status transition, if any (`completed` / `failed`).
    pub new_status: Option<JobStatus>,
    pub next_execution: NextExecution,
}

/// The terminal write for one attempt.
///
/// Applied atomically: the execution row becomes terminal and the owning
/// job's counters/status move in the same transaction. Re-applying an
/// outcome whose execution is already terminal is a no-op, which makes
/// redelivered envelopes safe.
#[derive(Debug, Clone)]
pub struct AttemptOutcome {
    pub execution_id: ExecutionId,
    pub job_id: JobId,
    pub status: ExecutionStatus,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub result: Option<Value>,
    pub output: Option<Value>,
    pub error: Option<ExecutionError>,
    pub job: JobFinalize,
}

/// Persistent storage operations for the scheduling core.
#[async_trait]
pub trait JobStore: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Jobs
    // ─────────────────────────────────────────────────────────────────────────

    async fn insert_job(&self, job: &Job) -> Result<()>;

    async fn get_job(&self, id: JobId) -> Result<Option<Job>>;

    async fn list_jobs_by_owner(&self, owner_id: Uuid) -> Result<Vec<Job>>;

    async fn list_jobs_by_status(&self, status: JobStatus) -> Result<Vec<Job>>;

    /// Persist planner-side changes to a job row (status transitions,
    /// schedule fields, `next_execution_at`). Never touches the counters;
    /// those belong to [`JobStore::finalize_attempt`].
    async fn update_job(&self, job: &Job) -> Result<()>;

    /// Delete the job and cascade its executions and logs. Returns whether a
    /// row existed.
    async fn delete_job(&self, id: JobId) -> Result<bool>;

    /// Cascade used when an owner account is removed.
    async fn delete_jobs_by_owner(&self, owner_id: Uuid) -> Result<u64>;

    // ─────────────────────────────────────────────────────────────────────────
    // Executions
    // ─────────────────────────────────────────────────────────────────────────

    async fn insert_execution(&self, execution: &Execution) -> Result<()>;

    async fn get_execution(&self, id: ExecutionId) -> Result<Option<Execution>>;

    /// All attempts of a job, oldest first.
    async fn list_executions(&self, job_id: JobId) -> Result<Vec<Execution>>;

    /// Most recently created attempt of a job.
    async fn latest_execution(&self, job_id: JobId) -> Result<Option<Execution>>;

    /// Is any attempt of this job currently `pending` or `running`?
    async fn has_active_execution(&self, job_id: JobId) -> Result<bool>;

    /// Apply the terminal outcome of one attempt. Returns `false` (and
    /// changes nothing) when the execution is already terminal.
    async fn finalize_attempt(&self, outcome: &AttemptOutcome) -> Result<bool>;

    // ─────────────────────────────────────────────────────────────────────────
    // Logs
    // ─────────────────────────────────────────────────────────────────────────

    async fn append_log(&self, log: &JobLog) -> Result<()>;

    /// Newest-first log lines for a job.
    async fn list_logs(&self, job_id: JobId, limit: i64) -> Result<Vec<JobLog>>;

    /// Drop log lines older than `before`. Returns the number removed.
    async fn prune_logs(&self, before: DateTime<Utc>) -> Result<u64>;
}
