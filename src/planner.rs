//! Scheduling planner: turns user intents into store mutations and queue
//! registrations, and keeps `next_execution_at` honest.
//!
//! State machine over job status:
//!
//! | from \ action | trigger | pause | resume | reschedule | cancel |
//! |---------------|---------|-------|--------|------------|--------|
//! | active        | ok      | ok    | reject | ok         | ok     |
//! | paused        | reject  | reject| ok     | ok         | ok     |
//! | terminal      | reject  | reject| reject | reject     | no-op  |
//!
//! `complete`/`fail` transitions are internal to the worker pipeline and
//! arrive through [`Planner::advance_recurring`] and the finalize write.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{ChronodError, Result};
use crate::execution::{Execution, JobLog, LogLevel};
use crate::job::{Job, JobId, JobStatus, NewJob, ScheduleType};
use crate::queue::{Envelope, QueueBackend, Repeatable};
use crate::store::{JobStore, NextExecution};

/// A schedule change applied through [`Planner::reschedule`].
#[derive(Debug, Clone)]
pub enum NewSchedule {
    /// Switch to a one-shot schedule at the given instant.
    At(DateTime<Utc>),
    /// Switch to a recurring schedule.
    Cron {
        expression: String,
        /// `None` keeps the job's current zone.
        timezone: Option<String>,
    },
}

/// What the worker's finalize write should do to a recurring job row.
#[derive(Debug, Clone)]
pub struct AdvancePlan {
    pub new_status: Option<JobStatus>,
    pub next_execution: NextExecution,
}

/// The scheduling planner. One per process; shared behind an `Arc`.
pub struct Planner {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn QueueBackend>,
    clock: Arc<dyn Clock>,
}

impl Planner {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn QueueBackend>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { store, queue, clock }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Intents
    // ─────────────────────────────────────────────────────────────────────────

    /// Validate, persist and register a new job. Nothing is persisted when
    /// validation fails.
    pub async fn create(&self, new: NewJob) -> Result<Job> {
        let now = self.clock.now();
        new.validate(now)?;

        let mut job = new.into_job(now);
        job.next_execution_at = Some(self.initial_execution_at(&job, now)?);

        self.store.insert_job(&job).await?;
        self.register(&job, now).await?;
        self.log(&job, None, LogLevel::Info, "job created", json!({"schedule_type": job.schedule_type.as_str()}))
            .await;

        tracing::info!(
            job_id = %job.id,
            job_type = %job.job_type,
            schedule_type = %job.schedule_type,
            next_execution_at = ?job.next_execution_at,
            "job created"
        );
        Ok(job)
    }

    /// Enqueue a one-shot attempt at the highest priority tier. Does not
    /// advance `next_execution_at`; may run concurrently with a scheduled
    /// fire (documented behavior).
    pub async fn trigger(&self, id: JobId) -> Result<()> {
        let job = self.require_job(id).await?;
        if job.status != JobStatus::Active {
            return Err(ChronodError::illegal_transition("trigger", job.status));
        }

        let now = self.clock.now();
        self.queue.enqueue(Envelope::manual(&job, now)).await?;
        self.log(&job, None, LogLevel::Info, "manually triggered", json!(null))
            .await;
        Ok(())
    }

    /// Remove pending work and stop scheduling. In-flight attempts drain
    /// naturally; their outcomes still update counters.
    pub async fn pause(&self, id: JobId) -> Result<Job> {
        let mut job = self.require_job(id).await?;
        if job.status != JobStatus::Active {
            return Err(ChronodError::illegal_transition("pause", job.status));
        }

        self.unregister(id).await?;
        job.status = JobStatus::Paused;
        job.updated_at = self.clock.now();
        self.store.update_job(&job).await?;
        self.log(&job, None, LogLevel::Info, "paused", json!(null)).await;
        Ok(job)
    }

    /// Reactivate a paused job, recomputing its next instant from now.
    pub async fn resume(&self, id: JobId) -> Result<Job> {
        let mut job = self.require_job(id).await?;
        if job.status != JobStatus::Paused {
            return Err(ChronodError::illegal_transition("resume", job.status));
        }

        let now = self.clock.now();
        job.status = JobStatus::Active;
        job.next_execution_at = Some(self.initial_execution_at(&job, now)?);
        job.updated_at = now;

        self.store.update_job(&job).await?;
        self.register(&job, now).await?;
        self.log(&job, None, LogLevel::Info, "resumed", json!({"next_execution_at": job.next_execution_at}))
            .await;
        Ok(job)
    }

    /// Replace the schedule. Active jobs re-register immediately; paused
    /// jobs keep the new schedule dormant until resumed.
    pub async fn reschedule(&self, id: JobId, schedule: NewSchedule) -> Result<Job> {
        let mut job = self.require_job(id).await?;
        if job.status.is_terminal() {
            return Err(ChronodError::illegal_transition("reschedule", job.status));
        }

        let now = self.clock.now();
        match schedule {
            NewSchedule::At(at) => {
                if at <= now {
                    return Err(ChronodError::invalid_schedule(
                        "scheduled_at must be in the future",
                    ));
                }
                job.schedule_type = ScheduleType::Scheduled;
                job.scheduled_at = Some(at);
                job.cron_expression = None;
            }
            NewSchedule::Cron { expression, timezone } => {
                crate::calendar::CronExpr::validate(&expression)?;
                if let Some(tz) = timezone {
                    crate::calendar::parse_timezone(&tz)?;
                    job.timezone = tz;
                }
                job.schedule_type = ScheduleType::Recurring;
                job.cron_expression = Some(expression);
                job.scheduled_at = None;
            }
        }

        self.unregister(id).await?;

        if job.status == JobStatus::Active {
            job.next_execution_at = Some(self.initial_execution_at(&job, now)?);
        } else {
            job.next_execution_at = None;
        }
        job.updated_at = now;
        self.store.update_job(&job).await?;

        if job.status == JobStatus::Active {
            self.register(&job, now).await?;
        }
        self.log(&job, None, LogLevel::Info, "rescheduled", json!({"schedule_type": job.schedule_type.as_str()}))
            .await;
        Ok(job)
    }

    /// Stop all future scheduling. Idempotent on already-terminal jobs.
    pub async fn cancel(&self, id: JobId) -> Result<Job> {
        let mut job = self.require_job(id).await?;
        if job.status.is_terminal() {
            return Ok(job);
        }

        self.unregister(id).await?;
        job.status = JobStatus::Cancelled;
        job.next_execution_at = None;
        job.updated_at = self.clock.now();
        self.store.update_job(&job).await?;
        self.log(&job, None, LogLevel::Info, "cancelled", json!(null)).await;
        Ok(job)
    }

    /// Cancel, then remove all persistent state (executions and logs
    /// cascade).
    pub async fn delete(&self, id: JobId) -> Result<()> {
        self.cancel(id).await?;
        self.store.delete_job(id).await?;
        tracing::info!(job_id = %id, "job deleted");
        Ok(())
    }

    /// Cascade used when an owner account is removed.
    pub async fn delete_owner_jobs(&self, owner_id: Uuid) -> Result<u64> {
        let jobs = self.store.list_jobs_by_owner(owner_id).await?;
        for job in &jobs {
            self.unregister(job.id).await?;
        }
        self.store.delete_jobs_by_owner(owner_id).await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Worker-side hooks
    // ─────────────────────────────────────────────────────────────────────────

    /// Post-attempt advance for a recurring job: recompute the next instant
    /// and evaluate end conditions. `job` carries pre-finalize counters; the
    /// attempt being finalized counts toward `max_executions`.
    pub async fn advance_recurring(&self, job: &Job, now: DateTime<Utc>) -> Result<AdvancePlan> {
        let total_after = job.total_executions + 1;
        let ended = job
            .end_at
            .map(|end_at| end_at <= now)
            .unwrap_or(false)
            || job
                .max_executions
                .map(|max| total_after >= max)
                .unwrap_or(false);

        if ended {
            self.queue.remove_repeatable(job.id).await?;
            self.log(job, None, LogLevel::Info, "recurring schedule completed", json!({"total_executions": total_after}))
                .await;
            return Ok(AdvancePlan {
                new_status: Some(JobStatus::Completed),
                next_execution: NextExecution::Clear,
            });
        }

        let expr = job.cron_expr()?;
        let tz = job.tz()?;
        match expr.next_after(now, tz) {
            Some(next) => Ok(AdvancePlan {
                new_status: None,
                next_execution: NextExecution::Set(next),
            }),
            // Expression has no further firings inside the horizon.
            None => {
                self.queue.remove_repeatable(job.id).await?;
                Ok(AdvancePlan {
                    new_status: Some(JobStatus::Completed),
                    next_execution: NextExecution::Clear,
                })
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Read-throughs for the API surface
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn get_job(&self, id: JobId) -> Result<Job> {
        self.require_job(id).await
    }

    pub async fn list_jobs(&self, owner_id: Uuid) -> Result<Vec<Job>> {
        self.store.list_jobs_by_owner(owner_id).await
    }

    pub async fn list_executions(&self, id: JobId) -> Result<Vec<Execution>> {
        self.require_job(id).await?;
        self.store.list_executions(id).await
    }

    pub async fn list_logs(&self, id: JobId, limit: i64) -> Result<Vec<JobLog>> {
        self.require_job(id).await?;
        self.store.list_logs(id, limit).await
    }

    /// Walk a retry chain backwards from `from`, newest first. The depth
    /// bound keeps a corrupted self-reference from looping.
    pub async fn retry_chain(&self, from: crate::execution::ExecutionId) -> Result<Vec<Execution>> {
        const MAX_CHAIN_DEPTH: usize = 32;

        let mut chain = Vec::new();
        let mut cursor = Some(from);
        while let Some(id) = cursor {
            if chain.len() >= MAX_CHAIN_DEPTH {
                tracing::warn!(execution_id = %id, "retry chain exceeds depth bound, truncating");
                break;
            }
            let execution = self
                .store
                .get_execution(id)
                .await?
                .ok_or_else(|| ChronodError::execution_not_found(id))?;
            cursor = execution.previous_execution_id;
            chain.push(execution);
        }
        Ok(chain)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Internals
    // ─────────────────────────────────────────────────────────────────────────

    async fn require_job(&self, id: JobId) -> Result<Job> {
        self.store
            .get_job(id)
            .await?
            .ok_or_else(|| ChronodError::job_not_found(id))
    }

    /// First instant this job should run after `now`.
    fn initial_execution_at(&self, job: &Job, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        match job.schedule_type {
            ScheduleType::Immediate => Ok(now),
            ScheduleType::Scheduled => {
                // A paused job resumed after its instant fires right away.
                Ok(job.scheduled_at.unwrap_or(now).max(now))
            }
            ScheduleType::Recurring => {
                let expr = job.cron_expr()?;
                let tz = job.tz()?;
                expr.next_after(now, tz).ok_or_else(|| {
                    ChronodError::invalid_schedule("calendar expression never fires")
                })
            }
        }
    }

    /// Queue-side registration per the create rules.
    async fn register(&self, job: &Job, now: DateTime<Utc>) -> Result<()> {
        match job.schedule_type {
            ScheduleType::Immediate => self.queue.enqueue(Envelope::fire(job, now)).await,
            ScheduleType::Scheduled => {
                let visible_at = job.next_execution_at.unwrap_or(now);
                if visible_at <= now {
                    self.queue.enqueue(Envelope::fire(job, now)).await
                } else {
                    self.queue
                        .enqueue_delayed(Envelope::fire(job, now), visible_at)
                        .await
                }
            }
            ScheduleType::Recurring => {
                let next_fire_at = job.next_execution_at.ok_or_else(|| {
                    ChronodError::invalid_schedule("recurring job without a next instant")
                })?;
                self.queue
                    .register_repeatable(Repeatable {
                        job_id: job.id,
                        cron_expression: job.cron_expression.clone().unwrap_or_default(),
                        timezone: job.timezone.clone(),
                        priority: job.priority,
                        next_fire_at,
                    })
                    .await
            }
        }
    }

    async fn unregister(&self, id: JobId) -> Result<()> {
        self.queue.remove_job(id).await?;
        self.queue.remove_repeatable(id).await?;
        Ok(())
    }

    /// Best-effort audit log append.
    async fn log(
        &self,
        job: &Job,
        execution: Option<&Execution>,
        level: LogLevel,
        message: &str,
        data: serde_json::Value,
    ) {
        let entry = JobLog::new(job.id, execution.map(|e| e.id), level, message, self.clock.now())
            .with_data(data);
        if let Err(e) = self.store.append_log(&entry).await {
            tracing::warn!(job_id = %job.id, error = %e, "failed to append job log");
        }
    }
}
