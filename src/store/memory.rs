//! In-memory store for tests and local development.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::Result;
use crate::execution::{Execution, ExecutionId, JobLog};
use crate::job::{Job, JobId, JobStatus};

use super::{AttemptOutcome, JobStore, NextExecution};

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    executions: HashMap<ExecutionId, Execution>,
    logs: Vec<JobLog>,
}

/// `HashMap`-backed [`JobStore`]. All mutations go through one write lock,
/// which gives the same atomicity the Postgres backend gets from
/// transactions.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert_job(&self, job: &Job) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        let inner = self.inner.read().await;
        Ok(inner.jobs.get(&id).cloned())
    }

    async fn list_jobs_by_owner(&self, owner_id: Uuid) -> Result<Vec<Job>> {
        let inner = self.inner.read().await;
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|job| job.owner_id == owner_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }

    async fn list_jobs_by_status(&self, status: JobStatus) -> Result<Vec<Job>> {
        let inner = self.inner.read().await;
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|job| job.status == status)
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }

    async fn update_job(&self, job: &Job) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(existing) = inner.jobs.get_mut(&job.id) {
            // Counters stay owned by finalize_attempt.
            let (total, succeeded, failed) = (
                existing.total_executions,
                existing.successful_executions,
                existing.failed_executions,
            );
            *existing = job.clone();
            existing.total_executions = total;
            existing.successful_executions = succeeded;
            existing.failed_executions = failed;
        }
        Ok(())
    }

    async fn delete_job(&self, id: JobId) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let existed = inner.jobs.remove(&id).is_some();
        if existed {
            inner.executions.retain(|_, e| e.job_id != id);
            inner.logs.retain(|log| log.job_id != id);
        }
        Ok(existed)
    }

    async fn delete_jobs_by_owner(&self, owner_id: Uuid) -> Result<u64> {
        let ids: Vec<JobId> = {
            let inner = self.inner.read().await;
            inner
                .jobs
                .values()
                .filter(|job| job.owner_id == owner_id)
                .map(|job| job.id)
                .collect()
        };
        let mut removed = 0;
        for id in ids {
            if self.delete_job(id).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn insert_execution(&self, execution: &Execution) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn get_execution(&self, id: ExecutionId) -> Result<Option<Execution>> {
        let inner = self.inner.read().await;
        Ok(inner.executions.get(&id).cloned())
    }

    async fn list_executions(&self, job_id: JobId) -> Result<Vec<Execution>> {
        let inner = self.inner.read().await;
        let mut executions: Vec<Execution> = inner
            .executions
            .values()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect();
        executions.sort_by_key(|e| (e.created_at, e.attempt));
        Ok(executions)
    }

    async fn latest_execution(&self, job_id: JobId) -> Result<Option<Execution>> {
        Ok(self.list_executions(job_id).await?.pop())
    }

    async fn has_active_execution(&self, job_id: JobId) -> Result<bool> {
        let inner = self.inner.read().await;
        Ok(inner
            .executions
            .values()
            .any(|e| e.job_id == job_id && !e.status.is_terminal()))
    }

    async fn finalize_attempt(&self, outcome: &AttemptOutcome) -> Result<bool> {
        let mut inner = self.inner.write().await;

        match inner.executions.get_mut(&outcome.execution_id) {
            Some(execution) if !execution.status.is_terminal() => {
                execution.status = outcome.status;
                execution.completed_at = Some(outcome.completed_at);
                execution.duration_ms = Some(outcome.duration_ms);
                execution.result = outcome.result.clone();
                execution.output = outcome.output.clone();
                execution.error = outcome.error.clone();
            }
            // Already terminal (redelivered envelope) or unknown: no-op.
            _ => return Ok(false),
        }

        if let Some(job) = inner.jobs.get_mut(&outcome.job_id) {
            job.total_executions += 1;
            if outcome.job.succeeded {
                job.successful_executions += 1;
            } else {
                job.failed_executions += 1;
            }
            job.last_executed_at = Some(outcome.job.last_executed_at);
            if let Some(status) = outcome.job.new_status {
                job.status = status;
            }
            match outcome.job.next_execution {
                NextExecution::Keep => {}
                NextExecution::Clear => job.next_execution_at = None,
                NextExecution::Set(at) => job.next_execution_at = Some(at),
            }
            job.updated_at = outcome.completed_at;
        }

        Ok(true)
    }

    async fn append_log(&self, log: &JobLog) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.logs.push(log.clone());
        Ok(())
    }

    async fn list_logs(&self, job_id: JobId, limit: i64) -> Result<Vec<JobLog>> {
        let inner = self.inner.read().await;
        let mut logs: Vec<JobLog> = inner
            .logs
            .iter()
            .filter(|log| log.job_id == job_id)
            .cloned()
            .collect();
        logs.sort_by_key(|log| std::cmp::Reverse(log.timestamp));
        logs.truncate(limit.max(0) as usize);
        Ok(logs)
    }

    async fn prune_logs(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let initial = inner.logs.len();
        inner.logs.retain(|log| log.timestamp >= before);
        Ok((initial - inner.logs.len()) as u64)
    }
}
