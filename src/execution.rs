//! Execution records: one row per attempt, plus the append-only audit log.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ChronodError;
use crate::job::JobId;

/// Audit log rows are retained for at least this many days.
pub const LOG_RETENTION_DAYS: i64 = 14;

/// Unique identifier for an execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionId(pub Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for ExecutionId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Status of a single attempt. Transitions are monotonic:
/// `pending → running → (completed | failed | cancelled | timeout)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl ExecutionStatus {
    /// Once terminal, the record is immutable except for log appends.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled | Self::Timeout)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = ChronodError;

    fn from_str(s: &str) -> Result<Self, ChronodError> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "timeout" => Ok(Self::Timeout),
            other => Err(ChronodError::internal(format!(
                "unknown execution status '{}'",
                other
            ))),
        }
    }
}

/// Failure details recorded on a non-successful attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

/// One attempt of a job.
///
/// Attempts are 1-based; attempt 1 is the original, later attempts are
/// retries linked through `previous_execution_id`. The chain is a directed
/// path: each node's predecessor is an ancestor, never a descendant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub job_id: JobId,
    pub status: ExecutionStatus,
    pub attempt: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub result: Option<Value>,
    pub error: Option<ExecutionError>,
    pub is_retry: bool,
    pub previous_execution_id: Option<ExecutionId>,
    pub worker_id: String,
    pub input: Value,
    pub output: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl Execution {
    /// Open a new running attempt.
    pub fn begin(
        job_id: JobId,
        attempt: u32,
        worker_id: impl Into<String>,
        input: Value,
        previous: Option<ExecutionId>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ExecutionId::new(),
            job_id,
            status: ExecutionStatus::Running,
            attempt,
            started_at: Some(now),
            completed_at: None,
            duration_ms: None,
            result: None,
            error: None,
            is_retry: attempt > 1,
            previous_execution_id: previous,
            worker_id: worker_id.into(),
            input,
            output: None,
            created_at: now,
        }
    }
}

/// Audit-level append-only log line. Never mutated after write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLog {
    pub id: Uuid,
    pub job_id: JobId,
    pub execution_id: Option<ExecutionId>,
    pub level: LogLevel,
    pub message: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl JobLog {
    pub fn new(
        job_id: JobId,
        execution_id: Option<ExecutionId>,
        level: LogLevel,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            execution_id,
            level,
            message: message.into(),
            data: Value::Null,
            timestamp: now,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = ChronodError;

    fn from_str(s: &str) -> Result<Self, ChronodError> {
        match s {
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(ChronodError::internal(format!("unknown log level '{}'", other))),
        }
    }
}
