//! PostgreSQL store backed by sqlx.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::error::{ChronodError, Result};
use crate::execution::{Execution, ExecutionError, ExecutionId, ExecutionStatus, JobLog, LogLevel};
use crate::job::{Job, JobId, JobStatus, Payload};

use super::{AttemptOutcome, JobStore, NextExecution};

/// sqlx-backed [`JobStore`].
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Create a connection pool per the configured limits.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.pool.max)
            .min_connections(config.pool.min)
            .acquire_timeout(Duration::from_millis(config.pool.acquire))
            .idle_timeout(Duration::from_millis(config.pool.idle))
            .connect(&config.url())
            .await?;

        Ok(Self { pool })
    }

    /// Run migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| ChronodError::from(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl JobStore for PgStore {
    // ─────────────────────────────────────────────────────────────────────────
    // Jobs
    // ─────────────────────────────────────────────────────────────────────────

    async fn insert_job(&self, job: &Job) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs (id, owner_id, name, description, tags, metadata,
                              job_type, payload, schedule_type, scheduled_at,
                              cron_expression, timezone, status, priority,
                              max_retries, retry_delay_ms, retry_backoff, timeout_ms,
                              last_executed_at, next_execution_at,
                              end_at, max_executions, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                    $15, $16, $17, $18, $19, $20, $21, $22, $23, $24)
            "#,
        )
        .bind(job.id.0)
        .bind(job.owner_id)
        .bind(&job.name)
        .bind(&job.description)
        .bind(&job.tags)
        .bind(&job.metadata)
        .bind(job.job_type.as_str())
        .bind(serde_json::to_value(&job.payload)?)
        .bind(job.schedule_type.as_str())
        .bind(job.scheduled_at)
        .bind(&job.cron_expression)
        .bind(&job.timezone)
        .bind(job.status.as_str())
        .bind(job.priority as i16)
        .bind(job.max_retries as i32)
        .bind(job.retry_delay_ms as i64)
        .bind(job.retry_backoff.as_str())
        .bind(job.timeout_ms as i64)
        .bind(job.last_executed_at)
        .bind(job.next_execution_at)
        .bind(job.end_at)
        .bind(job.max_executions)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT id, owner_id, name, description, tags, metadata, job_type, payload,
                   schedule_type, scheduled_at, cron_expression, timezone, status,
                   priority, max_retries, retry_delay_ms, retry_backoff, timeout_ms,
                   last_executed_at, next_execution_at, total_executions,
                   successful_executions, failed_executions, end_at, max_executions,
                   created_at, updated_at
            FROM jobs
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Job::try_from).transpose()
    }

    async fn list_jobs_by_owner(&self, owner_id: Uuid) -> Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT id, owner_id, name, description, tags, metadata, job_type, payload,
                   schedule_type, scheduled_at, cron_expression, timezone, status,
                   priority, max_retries, retry_delay_ms, retry_backoff, timeout_ms,
                   last_executed_at, next_execution_at, total_executions,
                   successful_executions, failed_executions, end_at, max_executions,
                   created_at, updated_at
            FROM jobs
            WHERE owner_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Job::try_from).collect()
    }

    async fn list_jobs_by_status(&self, status: JobStatus) -> Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT id, owner_id, name, description, tags, metadata, job_type, payload,
                   schedule_type, scheduled_at, cron_expression, timezone, status,
                   priority, max_retries, retry_delay_ms, retry_backoff, timeout_ms,
                   last_executed_at, next_execution_at, total_executions,
                   successful_executions, failed_executions, end_at, max_executions,
                   created_at, updated_at
            FROM jobs
            WHERE status = $1
            ORDER BY created_at
            "#,
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Job::try_from).collect()
    }

    async fn update_job(&self, job: &Job) -> Result<()> {
        // Counters are deliberately absent; finalize_attempt owns them.
        sqlx::query(
            r#"
            UPDATE jobs
            SET name = $2, description = $3, tags = $4, metadata = $5, payload = $6,
                schedule_type = $7, scheduled_at = $8, cron_expression = $9,
                timezone = $10, status = $11, priority = $12, max_retries = $13,
                retry_delay_ms = $14, retry_backoff = $15, timeout_ms = $16,
                last_executed_at = $17, next_execution_at = $18, end_at = $19,
                max_executions = $20, updated_at = $21
            WHERE id = $1
            "#,
        )
        .bind(job.id.0)
        .bind(&job.name)
        .bind(&job.description)
        .bind(&job.tags)
        .bind(&job.metadata)
        .bind(serde_json::to_value(&job.payload)?)
        .bind(job.schedule_type.as_str())
        .bind(job.scheduled_at)
        .bind(&job.cron_expression)
        .bind(&job.timezone)
        .bind(job.status.as_str())
        .bind(job.priority as i16)
        .bind(job.max_retries as i32)
        .bind(job.retry_delay_ms as i64)
        .bind(job.retry_backoff.as_str())
        .bind(job.timeout_ms as i64)
        .bind(job.last_executed_at)
        .bind(job.next_execution_at)
        .bind(job.end_at)
        .bind(job.max_executions)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_job(&self, id: JobId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_jobs_by_owner(&self, owner_id: Uuid) -> Result<u64> {
        let result = sqlx::query("DELETE FROM jobs WHERE owner_id = $1")
            .bind(owner_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Executions
    // ─────────────────────────────────────────────────────────────────────────

    async fn insert_execution(&self, execution: &Execution) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO job_executions (id, job_id, status, attempt, started_at,
                                        completed_at, duration_ms, result, error,
                                        is_retry, previous_execution_id, worker_id,
                                        input, output, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(execution.id.0)
        .bind(execution.job_id.0)
        .bind(execution.status.as_str())
        .bind(execution.attempt as i32)
        .bind(execution.started_at)
        .bind(execution.completed_at)
        .bind(execution.duration_ms)
        .bind(&execution.result)
        .bind(execution.error.as_ref().map(serde_json::to_value).transpose()?)
        .bind(execution.is_retry)
        .bind(execution.previous_execution_id.map(|id| id.0))
        .bind(&execution.worker_id)
        .bind(&execution.input)
        .bind(&execution.output)
        .bind(execution.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_execution(&self, id: ExecutionId) -> Result<Option<Execution>> {
        let row = sqlx::query_as::<_, ExecutionRow>(
            r#"
            SELECT id, job_id, status, attempt, started_at, completed_at, duration_ms,
                   result, error, is_retry, previous_execution_id, worker_id,
                   input, output, created_at
            FROM job_executions
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Execution::try_from).transpose()
    }

    async fn list_executions(&self, job_id: JobId) -> Result<Vec<Execution>> {
        let rows = sqlx::query_as::<_, ExecutionRow>(
            r#"
            SELECT id, job_id, status, attempt, started_at, completed_at, duration_ms,
                   result, error, is_retry, previous_execution_id, worker_id,
                   input, output, created_at
            FROM job_executions
            WHERE job_id = $1
            ORDER BY created_at, attempt
            "#,
        )
        .bind(job_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Execution::try_from).collect()
    }

    async fn latest_execution(&self, job_id: JobId) -> Result<Option<Execution>> {
        let row = sqlx::query_as::<_, ExecutionRow>(
            r#"
            SELECT id, job_id, status, attempt, started_at, completed_at, duration_ms,
                   result, error, is_retry, previous_execution_id, worker_id,
                   input, output, created_at
            FROM job_executions
            WHERE job_id = $1
            ORDER BY created_at DESC, attempt DESC
            LIMIT 1
            "#,
        )
        .bind(job_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Execution::try_from).transpose()
    }

    async fn has_active_execution(&self, job_id: JobId) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM job_executions
                WHERE job_id = $1 AND status IN ('pending', 'running')
            )
            "#,
        )
        .bind(job_id.0)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn finalize_attempt(&self, outcome: &AttemptOutcome) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        // Lock the execution row; a redelivered envelope whose attempt is
        // already terminal must not double-count.
        let current: Option<String> =
            sqlx::query_scalar("SELECT status FROM job_executions WHERE id = $1 FOR UPDATE")
                .bind(outcome.execution_id.0)
                .fetch_optional(&mut *tx)
                .await?;

        let Some(current) = current else {
            return Ok(false);
        };
        if ExecutionStatus::from_str(&current)?.is_terminal() {
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE job_executions
            SET status = $2, completed_at = $3, duration_ms = $4,
                result = $5, output = $6, error = $7
            WHERE id = $1
            "#,
        )
        .bind(outcome.execution_id.0)
        .bind(outcome.status.as_str())
        .bind(outcome.completed_at)
        .bind(outcome.duration_ms)
        .bind(&outcome.result)
        .bind(&outcome.output)
        .bind(outcome.error.as_ref().map(serde_json::to_value).transpose()?)
        .execute(&mut *tx)
        .await?;

        let job_sql = match outcome.job.next_execution {
            NextExecution::Keep => {
                r#"
                UPDATE jobs
                SET total_executions = total_executions + 1,
                    successful_executions = successful_executions + CASE WHEN $2 THEN 1 ELSE 0 END,
                    failed_executions = failed_executions + CASE WHEN $2 THEN 0 ELSE 1 END,
                    last_executed_at = $3,
                    status = COALESCE($4, status),
                    updated_at = $3
                WHERE id = $1
                "#
            }
            NextExecution::Clear => {
                r#"
                UPDATE jobs
                SET total_executions = total_executions + 1,
                    successful_executions = successful_executions + CASE WHEN $2 THEN 1 ELSE 0 END,
                    failed_executions = failed_executions + CASE WHEN $2 THEN 0 ELSE 1 END,
                    last_executed_at = $3,
                    status = COALESCE($4, status),
                    next_execution_at = NULL,
                    updated_at = $3
                WHERE id = $1
                "#
            }
            NextExecution::Set(_) => {
                r#"
                UPDATE jobs
                SET total_executions = total_executions + 1,
                    successful_executions = successful_executions + CASE WHEN $2 THEN 1 ELSE 0 END,
                    failed_executions = failed_executions + CASE WHEN $2 THEN 0 ELSE 1 END,
                    last_executed_at = $3,
                    status = COALESCE($4, status),
                    next_execution_at = $5,
                    updated_at = $3
                WHERE id = $1
                "#
            }
        };

        let mut query = sqlx::query(job_sql)
            .bind(outcome.job_id.0)
            .bind(outcome.job.succeeded)
            .bind(outcome.job.last_executed_at)
            .bind(outcome.job.new_status.map(|s| s.as_str()));
        if let NextExecution::Set(at) = outcome.job.next_execution {
            query = query.bind(at);
        }
        query.execute(&mut *tx).await?;

        tx.commit().await?;
        Ok(true)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logs
    // ─────────────────────────────────────────────────────────────────────────

    async fn append_log(&self, log: &JobLog) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO job_logs (id, job_id, execution_id, level, message, data, timestamp)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(log.id)
        .bind(log.job_id.0)
        .bind(log.execution_id.map(|id| id.0))
        .bind(log.level.as_str())
        .bind(&log.message)
        .bind(&log.data)
        .bind(log.timestamp)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_logs(&self, job_id: JobId, limit: i64) -> Result<Vec<JobLog>> {
        let rows = sqlx::query_as::<_, LogRow>(
            r#"
            SELECT id, job_id, execution_id, level, message, data, timestamp
            FROM job_logs
            WHERE job_id = $1
            ORDER BY timestamp DESC
            LIMIT $2
            "#,
        )
        .bind(job_id.0)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(JobLog::try_from).collect()
    }

    async fn prune_logs(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM job_logs WHERE timestamp < $1")
            .bind(before)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Row Types
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    owner_id: Uuid,
    name: String,
    description: Option<String>,
    tags: Vec<String>,
    metadata: serde_json::Value,
    job_type: String,
    payload: serde_json::Value,
    schedule_type: String,
    scheduled_at: Option<DateTime<Utc>>,
    cron_expression: Option<String>,
    timezone: String,
    status: String,
    priority: i16,
    max_retries: i32,
    retry_delay_ms: i64,
    retry_backoff: String,
    timeout_ms: i64,
    last_executed_at: Option<DateTime<Utc>>,
    next_execution_at: Option<DateTime<Utc>>,
    total_executions: i64,
    successful_executions: i64,
    failed_executions: i64,
    end_at: Option<DateTime<Utc>>,
    max_executions: Option<i64>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = ChronodError;

    fn try_from(row: JobRow) -> Result<Self> {
        let payload: Payload = serde_json::from_value(row.payload)?;
        Ok(Job {
            id: JobId(row.id),
            owner_id: row.owner_id,
            name: row.name,
            description: row.description,
            tags: row.tags,
            metadata: row.metadata,
            job_type: row.job_type.parse()?,
            payload,
            schedule_type: row.schedule_type.parse()?,
            scheduled_at: row.scheduled_at,
            cron_expression: row.cron_expression,
            timezone: row.timezone,
            status: row.status.parse()?,
            priority: row.priority.clamp(0, u8::MAX as i16) as u8,
            max_retries: row.max_retries.max(0) as u32,
            retry_delay_ms: row.retry_delay_ms.max(0) as u64,
            retry_backoff: row.retry_backoff.parse()?,
            timeout_ms: row.timeout_ms.max(0) as u64,
            last_executed_at: row.last_executed_at,
            next_execution_at: row.next_execution_at,
            total_executions: row.total_executions,
            successful_executions: row.successful_executions,
            failed_executions: row.failed_executions,
            end_at: row.end_at,
            max_executions: row.max_executions,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ExecutionRow {
    id: Uuid,
    job_id: Uuid,
    status: String,
    attempt: i32,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    duration_ms: Option<i64>,
    result: Option<serde_json::Value>,
    error: Option<serde_json::Value>,
    is_retry: bool,
    previous_execution_id: Option<Uuid>,
    worker_id: String,
    input: serde_json::Value,
    output: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
}

impl TryFrom<ExecutionRow> for Execution {
    type Error = ChronodError;

    fn try_from(row: ExecutionRow) -> Result<Self> {
        let error: Option<ExecutionError> =
            row.error.map(serde_json::from_value).transpose()?;
        Ok(Execution {
            id: ExecutionId(row.id),
            job_id: JobId(row.job_id),
            status: row.status.parse()?,
            attempt: row.attempt.max(0) as u32,
            started_at: row.started_at,
            completed_at: row.completed_at,
            duration_ms: row.duration_ms,
            result: row.result,
            error,
            is_retry: row.is_retry,
            previous_execution_id: row.previous_execution_id.map(ExecutionId),
            worker_id: row.worker_id,
            input: row.input,
            output: row.output,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct LogRow {
    id: Uuid,
    job_id: Uuid,
    execution_id: Option<Uuid>,
    level: String,
    message: String,
    data: serde_json::Value,
    timestamp: DateTime<Utc>,
}

impl TryFrom<LogRow> for JobLog {
    type Error = ChronodError;

    fn try_from(row: LogRow) -> Result<Self> {
        Ok(JobLog {
            id: row.id,
            job_id: JobId(row.job_id),
            execution_id: row.execution_id.map(ExecutionId),
            level: row.level.parse::<LogLevel>()?,
            message: row.message,
            data: row.data,
            timestamp: row.timestamp,
        })
    }
}
