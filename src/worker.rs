//! Worker pool: pops attempt envelopes, supervises each attempt with a hard
//! deadline, applies the retry policy and records the auditable outcome.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use metrics::counter;
use rand::Rng;
use serde_json::json;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::WorkerSettings;
use crate::error::Result;
use crate::execution::{
    Execution, ExecutionError, ExecutionStatus, JobLog, LogLevel, LOG_RETENTION_DAYS,
};
use crate::executor::ExecutorRegistry;
use crate::job::{Job, JobStatus};
use crate::notifier::{NotificationEvent, Notifier};
use crate::planner::Planner;
use crate::queue::{Delivery, Envelope, QueueBackend};
use crate::store::{AttemptOutcome, JobFinalize, JobStore, NextExecution};

// ═══════════════════════════════════════════════════════════════════════════════
// Configuration & Stats
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration for one worker process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum attempts running concurrently.
    pub concurrency: usize,
    /// Dispatch rate cap: at most `limiter_max` per `limiter_window`.
    pub limiter_max: u32,
    pub limiter_window: Duration,
    /// Sleep between polls when the queue is empty.
    pub poll_interval: Duration,
    /// Grace window for in-flight attempts during shutdown.
    pub shutdown_grace: Duration,
    /// Identifier recorded on every execution row.
    pub worker_id: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            limiter_max: 100,
            limiter_window: Duration::from_millis(60_000),
            poll_interval: Duration::from_millis(1000),
            shutdown_grace: Duration::from_secs(30),
            worker_id: format!("worker-{}", uuid::Uuid::new_v4()),
        }
    }
}

impl WorkerConfig {
    pub fn from_settings(settings: &WorkerSettings) -> Self {
        Self {
            concurrency: settings.concurrency,
            limiter_max: settings.limiter.max,
            limiter_window: Duration::from_millis(settings.limiter.window_ms),
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
            shutdown_grace: Duration::from_secs(settings.shutdown_grace_secs),
            ..Default::default()
        }
    }
}

/// Live counters for a worker process.
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    pub dispatched: Arc<AtomicU64>,
    pub succeeded: Arc<AtomicU64>,
    pub failed: Arc<AtomicU64>,
    pub retried: Arc<AtomicU64>,
    pub skipped_overlap: Arc<AtomicU64>,
}

impl WorkerStats {
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn retried(&self) -> u64 {
        self.retried.load(Ordering::Relaxed)
    }

    pub fn skipped_overlap(&self) -> u64 {
        self.skipped_overlap.load(Ordering::Relaxed)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Rate Limiter
// ═══════════════════════════════════════════════════════════════════════════════

/// Fixed-window dispatch limiter.
struct RateLimiter {
    max: u32,
    window: Duration,
    state: Mutex<WindowState>,
}

struct WindowState {
    started: Instant,
    count: u32,
}

impl RateLimiter {
    fn new(max: u32, window: Duration) -> Self {
        Self {
            max,
            window,
            state: Mutex::new(WindowState {
                started: Instant::now(),
                count: 0,
            }),
        }
    }

    /// Record one dispatch, or return how long until the window frees up.
    async fn acquire(&self) -> Option<Duration> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        if now.duration_since(state.started) >= self.window {
            state.started = now;
            state.count = 0;
        }
        if state.count < self.max {
            state.count += 1;
            None
        } else {
            Some(self.window.saturating_sub(now.duration_since(state.started)))
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Worker Pool
// ═══════════════════════════════════════════════════════════════════════════════

/// A worker process: dispatch loop plus the per-attempt pipeline.
pub struct WorkerPool {
    config: WorkerConfig,
    store: Arc<dyn JobStore>,
    queue: Arc<dyn QueueBackend>,
    planner: Arc<Planner>,
    executors: Arc<ExecutorRegistry>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    stats: WorkerStats,
}

impl WorkerPool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: WorkerConfig,
        store: Arc<dyn JobStore>,
        queue: Arc<dyn QueueBackend>,
        planner: Arc<Planner>,
        executors: Arc<ExecutorRegistry>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            store,
            queue,
            planner,
            executors,
            notifier,
            clock,
            stats: WorkerStats::default(),
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.clone()
    }

    /// Run the dispatch loop until `shutdown` flips true, then drain
    /// in-flight attempts up to the grace window.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            worker_id = %self.config.worker_id,
            concurrency = self.config.concurrency,
            "worker started"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let limiter = RateLimiter::new(self.config.limiter_max, self.config.limiter_window);
        let mut tasks: JoinSet<()> = JoinSet::new();

        loop {
            if *shutdown.borrow() {
                break;
            }
            // Reap whatever already finished so the set stays small.
            while tasks.try_join_next().is_some() {}

            if let Some(wait) = limiter.acquire().await {
                debug!(wait_ms = wait.as_millis() as u64, "dispatch rate cap reached");
                if Self::sleep_or_shutdown(wait, &mut shutdown).await {
                    break;
                }
                continue;
            }

            let permit = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    // A dropped sender counts as a shutdown order.
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self.queue.pop(self.clock.now()).await {
                Ok(Some(delivery)) => {
                    let pool = Arc::clone(&self);
                    tasks.spawn(async move {
                        pool.process_delivery(delivery).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    let sleep = self.idle_sleep();
                    if Self::sleep_or_shutdown(sleep, &mut shutdown).await {
                        break;
                    }
                }
                Err(e) => {
                    drop(permit);
                    e.log();
                    if Self::sleep_or_shutdown(self.idle_sleep(), &mut shutdown).await {
                        break;
                    }
                }
            }
        }

        // Refuse new pops, give in-flight attempts the grace window.
        info!(
            worker_id = %self.config.worker_id,
            in_flight = tasks.len(),
            grace_secs = self.config.shutdown_grace.as_secs(),
            "worker draining"
        );
        let drain = async {
            while tasks.join_next().await.is_some() {}
        };
        if tokio::time::timeout(self.config.shutdown_grace, drain).await.is_err() {
            warn!(worker_id = %self.config.worker_id, "grace window elapsed, aborting in-flight attempts");
            tasks.abort_all();
        }
        info!(worker_id = %self.config.worker_id, "worker stopped");
    }

    /// Pop once and process the envelope, if any. Returns whether an
    /// envelope was handled. Used by tests and catch-up tooling.
    pub async fn run_pending_once(&self) -> Result<bool> {
        match self.queue.pop(self.clock.now()).await? {
            Some(delivery) => {
                self.process_delivery(delivery).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn idle_sleep(&self) -> Duration {
        // Jitter spreads polling across worker processes.
        let jitter = rand::thread_rng().gen_range(0..250);
        self.config.poll_interval + Duration::from_millis(jitter)
    }

    /// Returns true when shutdown was signalled during the sleep.
    async fn sleep_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Attempt pipeline
    // ─────────────────────────────────────────────────────────────────────────

    /// Deterministic pipeline for one delivered envelope.
    pub async fn process_delivery(&self, delivery: Delivery) {
        let envelope = delivery.envelope.clone();

        let job = match self.store.get_job(envelope.job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                // Deleted underneath its envelope.
                self.ack(&delivery).await;
                return;
            }
            Err(e) => {
                e.log();
                self.nack(&delivery).await;
                return;
            }
        };

        // Pause/cancel won the race; the envelope is stale.
        if job.status != JobStatus::Active {
            debug!(job_id = %job.id, status = %job.status, "dropping envelope for inactive job");
            self.ack(&delivery).await;
            return;
        }

        let attempt = envelope.attempts_made + 1;

        // Redelivered retry envelope whose attempt already finished: no-op ack.
        if envelope.attempts_made > 0 {
            match self.store.latest_execution(job.id).await {
                Ok(Some(latest))
                    if latest.attempt >= attempt && latest.status.is_terminal() =>
                {
                    debug!(job_id = %job.id, attempt, "attempt already finalized, acking redelivery");
                    self.ack(&delivery).await;
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    e.log();
                    self.nack(&delivery).await;
                    return;
                }
            }
        }

        // Overlapping recurring fire: skip, manual triggers excepted.
        if !envelope.manual && job.is_recurring() && envelope.attempts_made == 0 {
            match self.store.has_active_execution(job.id).await {
                Ok(true) => {
                    self.stats.skipped_overlap.fetch_add(1, Ordering::Relaxed);
                    counter!("chronod_attempts_skipped_overlap_total").increment(1);
                    self.append_log(&job, None, LogLevel::Warn, "skipped_overlap", json!(null))
                        .await;
                    self.ack(&delivery).await;
                    return;
                }
                Ok(false) => {}
                Err(e) => {
                    e.log();
                    self.nack(&delivery).await;
                    return;
                }
            }
        }

        let previous = if envelope.attempts_made > 0 {
            match self.store.latest_execution(job.id).await {
                Ok(previous) => previous.map(|e| e.id),
                Err(_) => None,
            }
        } else {
            None
        };

        let now = self.clock.now();
        let input = serde_json::to_value(&job.payload).unwrap_or(serde_json::Value::Null);
        let execution = Execution::begin(
            job.id,
            attempt,
            self.config.worker_id.clone(),
            input,
            previous,
            now,
        );
        if let Err(e) = self.store.insert_execution(&execution).await {
            e.log();
            self.nack(&delivery).await;
            return;
        }
        self.append_log(
            &job,
            Some(&execution),
            LogLevel::Info,
            "started",
            json!({"attempt": attempt, "worker_id": self.config.worker_id}),
        )
        .await;

        self.stats.dispatched.fetch_add(1, Ordering::Relaxed);

        let deadline = Duration::from_millis(job.timeout_ms);
        let started = Instant::now();
        let result = tokio::time::timeout(deadline, self.executors.execute(&job.payload, deadline)).await;
        let duration_ms = started.elapsed().as_millis() as i64;
        let finished_at = self.clock.now();

        match result {
            Ok(Ok(value)) => {
                self.finalize_success(&job, &execution, value, duration_ms, finished_at, &delivery)
                    .await;
            }
            Ok(Err(adapter_error)) => {
                self.finalize_failure(
                    &job,
                    &execution,
                    ExecutionStatus::Failed,
                    adapter_error.into(),
                    duration_ms,
                    finished_at,
                    &delivery,
                )
                .await;
            }
            Err(_elapsed) => {
                // The executor future was dropped; adapters abort what they
                // can (kill-on-drop subprocesses, cancelled requests) and
                // orphans drain on their own.
                self.finalize_failure(
                    &job,
                    &execution,
                    ExecutionStatus::Timeout,
                    ExecutionError::new(format!(
                        "attempt exceeded timeout of {}ms",
                        job.timeout_ms
                    )),
                    duration_ms,
                    finished_at,
                    &delivery,
                )
                .await;
            }
        }
    }

    async fn finalize_success(
        &self,
        job: &Job,
        execution: &Execution,
        value: serde_json::Value,
        duration_ms: i64,
        now: DateTime<Utc>,
        delivery: &Delivery,
    ) {
        let (new_status, next_execution) = if job.is_recurring() {
            match self.planner.advance_recurring(job, now).await {
                Ok(plan) => (plan.new_status, plan.next_execution),
                Err(e) => {
                    e.log();
                    (None, NextExecution::Keep)
                }
            }
        } else {
            (Some(JobStatus::Completed), NextExecution::Clear)
        };

        let outcome = AttemptOutcome {
            execution_id: execution.id,
            job_id: job.id,
            status: ExecutionStatus::Completed,
            completed_at: now,
            duration_ms,
            result: Some(value.clone()),
            output: Some(value),
            error: None,
            job: JobFinalize {
                succeeded: true,
                last_executed_at: now,
                new_status,
                next_execution,
            },
        };

        match self.store.finalize_attempt(&outcome).await {
            Ok(true) => {
                self.ack(delivery).await;
                self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
                counter!("chronod_attempts_total", "outcome" => "completed").increment(1);
                self.append_log(
                    job,
                    Some(execution),
                    LogLevel::Info,
                    &format!("completed in {}ms", duration_ms),
                    json!({"attempt": execution.attempt}),
                )
                .await;

                let mut completed = execution.clone();
                completed.status = ExecutionStatus::Completed;
                completed.completed_at = Some(now);
                completed.duration_ms = Some(duration_ms);
                self.notifier
                    .notify(NotificationEvent::JobCompleted {
                        job: job.clone(),
                        execution: completed,
                        duration_ms,
                    })
                    .await;
            }
            Ok(false) => {
                // Already terminal: redelivered work, nothing to record.
                self.ack(delivery).await;
            }
            Err(e) => {
                e.log();
                self.nack(delivery).await;
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn finalize_failure(
        &self,
        job: &Job,
        execution: &Execution,
        status: ExecutionStatus,
        error: ExecutionError,
        duration_ms: i64,
        now: DateTime<Utc>,
        delivery: &Delivery,
    ) {
        let attempt = execution.attempt;
        // The initial try counts as attempt 1, plus up to max_retries more.
        let is_last = attempt >= job.max_retries + 1;

        let (new_status, next_execution) = if !is_last {
            (None, NextExecution::Keep)
        } else if job.is_recurring() {
            // Recurring jobs stay active on their regular cadence.
            match self.planner.advance_recurring(job, now).await {
                Ok(plan) => (plan.new_status, plan.next_execution),
                Err(e) => {
                    e.log();
                    (None, NextExecution::Keep)
                }
            }
        } else {
            (Some(JobStatus::Failed), NextExecution::Clear)
        };

        let outcome = AttemptOutcome {
            execution_id: execution.id,
            job_id: job.id,
            status,
            completed_at: now,
            duration_ms,
            result: None,
            output: None,
            error: Some(error.clone()),
            job: JobFinalize {
                succeeded: false,
                last_executed_at: now,
                new_status,
                next_execution,
            },
        };

        let applied = match self.store.finalize_attempt(&outcome).await {
            Ok(applied) => applied,
            Err(e) => {
                e.log();
                self.nack(delivery).await;
                return;
            }
        };
        if !applied {
            self.ack(delivery).await;
            return;
        }

        self.stats.failed.fetch_add(1, Ordering::Relaxed);
        counter!("chronod_attempts_total", "outcome" => status.as_str()).increment(1);
        self.append_log(
            job,
            Some(execution),
            LogLevel::Error,
            &format!("failed: {}, last_attempt={}", error.message, is_last),
            json!({"attempt": attempt, "status": status.as_str()}),
        )
        .await;

        if !is_last {
            let delay = job.retry_delay(attempt);
            let visible_at = now
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(5));
            let retry_envelope = Envelope::retry(job, attempt, now);
            if let Err(e) = self.queue.enqueue_delayed(retry_envelope, visible_at).await {
                error!(job_id = %job.id, error = %e, "failed to enqueue retry");
                // The outcome is recorded; the stalled envelope will be
                // redelivered and hit the no-op-ack path, so the chain ends
                // here rather than double-running.
                self.ack(delivery).await;
                return;
            }
            self.ack(delivery).await;
            self.stats.retried.fetch_add(1, Ordering::Relaxed);

            self.notifier
                .notify(NotificationEvent::JobRetry {
                    job: job.clone(),
                    attempt,
                    max_retries: job.max_retries,
                    error_message: error.message.clone(),
                })
                .await;
        } else {
            self.ack(delivery).await;

            self.notifier
                .notify(NotificationEvent::MaxRetriesExceeded {
                    job: job.clone(),
                    max_retries: job.max_retries,
                    last_error: error.clone(),
                })
                .await;

            let mut failed = execution.clone();
            failed.status = status;
            failed.completed_at = Some(now);
            failed.duration_ms = Some(duration_ms);
            failed.error = Some(error.clone());
            self.notifier
                .notify(NotificationEvent::JobFailed {
                    job: job.clone(),
                    execution: failed,
                    error,
                    attempts: attempt,
                })
                .await;
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Helpers
    // ─────────────────────────────────────────────────────────────────────────

    async fn ack(&self, delivery: &Delivery) {
        if let Err(e) = self.queue.ack(delivery).await {
            warn!(job_id = %delivery.envelope.job_id, error = %e, "failed to ack delivery");
        }
    }

    async fn nack(&self, delivery: &Delivery) {
        if let Err(e) = self.queue.nack(delivery).await {
            warn!(job_id = %delivery.envelope.job_id, error = %e, "failed to nack delivery");
        }
    }

    async fn append_log(
        &self,
        job: &Job,
        execution: Option<&Execution>,
        level: LogLevel,
        message: &str,
        data: serde_json::Value,
    ) {
        let entry = JobLog::new(
            job.id,
            execution.map(|e| e.id),
            level,
            message,
            self.clock.now(),
        )
        .with_data(data);
        if let Err(e) = self.store.append_log(&entry).await {
            warn!(job_id = %job.id, error = %e, "failed to append job log");
        }
    }
}

/// Periodic retention sweep for the audit log. Runs in the worker process.
pub async fn log_retention_loop(
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(3600));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let cutoff = clock.now() - chrono::Duration::days(LOG_RETENTION_DAYS);
                match store.prune_logs(cutoff).await {
                    Ok(0) => {}
                    Ok(removed) => info!(removed, "pruned expired job logs"),
                    Err(e) => e.log(),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rate_limiter_caps_a_window() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        assert!(limiter.acquire().await.is_none());
        assert!(limiter.acquire().await.is_none());
        assert!(limiter.acquire().await.is_none());
        let wait = limiter.acquire().await;
        assert!(wait.is_some());
        assert!(wait.unwrap() <= Duration::from_secs(60));
    }

    #[tokio::test]
    async fn rate_limiter_resets_after_window() {
        let limiter = RateLimiter::new(1, Duration::from_millis(20));
        assert!(limiter.acquire().await.is_none());
        assert!(limiter.acquire().await.is_some());
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(limiter.acquire().await.is_none());
    }

    #[test]
    fn config_from_settings() {
        let settings = WorkerSettings::default();
        let config = WorkerConfig::from_settings(&settings);
        assert_eq!(config.concurrency, 5);
        assert_eq!(config.limiter_max, 100);
        assert_eq!(config.limiter_window, Duration::from_millis(60_000));
        assert_eq!(config.shutdown_grace, Duration::from_secs(30));
    }
}
