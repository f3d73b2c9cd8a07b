//! Worker pipeline integration tests: the literal dispatch scenarios run
//! against in-memory backends, a manual clock and a scripted executor.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use chronod::clock::{Clock, ManualClock};
use chronod::execution::ExecutionStatus;
use chronod::executor::{AdapterError, AdapterResult, ExecutorRegistry, JobTypeExecutor};
use chronod::job::{HttpPayload, JobStatus, JobType, NewJob, Payload, RetryBackoff};
use chronod::notifier::{NotificationEvent, Notifier};
use chronod::planner::Planner;
use chronod::queue::{MemoryQueue, QueueBackend};
use chronod::store::{JobStore, MemoryStore};
use chronod::worker::{WorkerConfig, WorkerPool};

// ─────────────────────────────────────────────────────────────────────────────
// Harness
// ─────────────────────────────────────────────────────────────────────────────

/// Executor that plays back a script of outcomes, one per attempt.
struct ScriptedExecutor {
    outcomes: Mutex<VecDeque<AdapterResult>>,
    delay: Option<Duration>,
}

impl ScriptedExecutor {
    fn new(outcomes: Vec<AdapterResult>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
            delay: None,
        }
    }

    fn slow(delay: Duration) -> Self {
        Self {
            outcomes: Mutex::new(VecDeque::new()),
            delay: Some(delay),
        }
    }
}

#[async_trait]
impl JobTypeExecutor for ScriptedExecutor {
    async fn execute(&self, _payload: &Payload, _deadline: Duration) -> AdapterResult {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
            return Ok(json!({"slept_ms": delay.as_millis() as u64}));
        }
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(AdapterError::new("script exhausted")))
    }
}

struct RecordingNotifier {
    events: Mutex<Vec<String>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, event: NotificationEvent) {
        self.events.lock().unwrap().push(event.kind().to_string());
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    queue: Arc<MemoryQueue>,
    clock: Arc<ManualClock>,
    planner: Arc<Planner>,
    notifier: Arc<RecordingNotifier>,
    pool: WorkerPool,
}

impl Harness {
    fn new(start: &str, executor: ScriptedExecutor) -> Self {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new(Duration::from_secs(120)));
        let clock = Arc::new(ManualClock::new(start.parse().unwrap()));
        let planner = Arc::new(Planner::new(store.clone(), queue.clone(), clock.clone()));
        let notifier = Arc::new(RecordingNotifier {
            events: Mutex::new(Vec::new()),
        });

        let mut registry = ExecutorRegistry::new();
        registry.register(JobType::Http, Arc::new(executor));

        let pool = WorkerPool::new(
            WorkerConfig {
                worker_id: "worker-test".to_string(),
                ..WorkerConfig::default()
            },
            store.clone(),
            queue.clone(),
            planner.clone(),
            Arc::new(registry),
            notifier.clone(),
            clock.clone(),
        );

        Self {
            store,
            queue,
            clock,
            planner,
            notifier,
            pool,
        }
    }

    fn events(&self) -> Vec<String> {
        self.notifier.events.lock().unwrap().clone()
    }
}

fn http_payload() -> Payload {
    Payload::Http(HttpPayload {
        url: "http://svc/ok".to_string(),
        method: "GET".to_string(),
        headers: Default::default(),
        body: None,
        timeout_ms: 30_000,
    })
}

fn at(s: &str) -> DateTime<Utc> {
    s.parse().unwrap()
}

fn ok_response() -> AdapterResult {
    Ok(json!({"statusCode": 200, "body": {"ok": true}}))
}

fn server_error() -> AdapterResult {
    Err(AdapterError::new("http request failed with status 500"))
}

// ─────────────────────────────────────────────────────────────────────────────
// Scenarios
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn immediate_http_job_success() {
    let h = Harness::new("2024-01-01T00:00:00Z", ScriptedExecutor::new(vec![ok_response()]));

    let job = h
        .planner
        .create(NewJob::immediate(Uuid::new_v4(), "report", http_payload()).with_max_retries(3))
        .await
        .unwrap();

    assert!(h.pool.run_pending_once().await.unwrap());

    let executions = h.store.list_executions(job.id).await.unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].status, ExecutionStatus::Completed);
    assert_eq!(executions[0].attempt, 1);
    assert!(!executions[0].is_retry);
    assert_eq!(executions[0].result.as_ref().unwrap()["statusCode"], 200);
    assert_eq!(executions[0].worker_id, "worker-test");

    let job = h.store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.total_executions, 1);
    assert_eq!(job.successful_executions, 1);
    assert_eq!(job.failed_executions, 0);
    assert_eq!(job.next_execution_at, None);

    assert_eq!(h.events(), vec!["job_completed"]);

    // Everything acked: the queue is drained.
    assert!(!h.pool.run_pending_once().await.unwrap());
    assert_eq!(h.queue.in_flight_len().await, 0);
}

#[tokio::test]
async fn failure_then_success_on_retry() {
    let h = Harness::new(
        "2024-01-01T00:00:00Z",
        ScriptedExecutor::new(vec![server_error(), ok_response()]),
    );

    let job = h
        .planner
        .create(
            NewJob::immediate(Uuid::new_v4(), "flaky", http_payload())
                .with_max_retries(3)
                .with_retry_delay_ms(5000),
        )
        .await
        .unwrap();

    // Attempt 1 fails; the retry is delayed by 5000 × 2^0 ms.
    assert!(h.pool.run_pending_once().await.unwrap());
    assert!(!h.pool.run_pending_once().await.unwrap());

    h.clock.set(at("2024-01-01T00:00:04Z"));
    assert!(!h.pool.run_pending_once().await.unwrap());

    h.clock.set(at("2024-01-01T00:00:05Z"));
    assert!(h.pool.run_pending_once().await.unwrap());

    let executions = h.store.list_executions(job.id).await.unwrap();
    assert_eq!(executions.len(), 2);
    assert_eq!(executions[0].status, ExecutionStatus::Failed);
    assert_eq!(executions[0].error.as_ref().unwrap().message, "http request failed with status 500");
    assert_eq!(executions[1].status, ExecutionStatus::Completed);
    assert_eq!(executions[1].attempt, 2);
    assert!(executions[1].is_retry);
    assert_eq!(executions[1].previous_execution_id, Some(executions[0].id));

    let job = h.store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.total_executions, 2);
    assert_eq!(job.successful_executions, 1);
    assert_eq!(job.failed_executions, 1);

    assert_eq!(h.events(), vec!["job_retry", "job_completed"]);
}

#[tokio::test]
async fn exhausted_retries_fail_the_job() {
    let h = Harness::new(
        "2024-01-01T00:00:00Z",
        ScriptedExecutor::new(vec![server_error(), server_error(), server_error()]),
    );

    let job = h
        .planner
        .create(
            NewJob::immediate(Uuid::new_v4(), "doomed", http_payload())
                .with_max_retries(2)
                .with_retry_delay_ms(5000)
                .with_backoff(RetryBackoff::Exponential),
        )
        .await
        .unwrap();

    // Attempt 1 at t=0; retry delays are 5000 then 10000 ms.
    assert!(h.pool.run_pending_once().await.unwrap());

    h.clock.set(at("2024-01-01T00:00:05Z"));
    assert!(h.pool.run_pending_once().await.unwrap());

    // Second retry is not visible before its exponential delay elapses.
    h.clock.set(at("2024-01-01T00:00:14Z"));
    assert!(!h.pool.run_pending_once().await.unwrap());

    h.clock.set(at("2024-01-01T00:00:15Z"));
    assert!(h.pool.run_pending_once().await.unwrap());

    let executions = h.store.list_executions(job.id).await.unwrap();
    assert_eq!(executions.len(), 3);
    assert!(executions.iter().all(|e| e.status == ExecutionStatus::Failed));
    assert_eq!(
        executions.iter().map(|e| e.attempt).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );

    let job = h.store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.total_executions, 3);
    assert_eq!(job.failed_executions, 3);
    assert_eq!(job.successful_executions, 0);
    assert_eq!(job.next_execution_at, None);

    let events = h.events();
    assert_eq!(
        events,
        vec!["job_retry", "job_retry", "max_retries_exceeded", "job_failed"]
    );
    assert_eq!(
        events.iter().filter(|e| *e == "max_retries_exceeded").count(),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn timeout_counts_as_failure() {
    let h = Harness::new(
        "2024-01-01T00:00:00Z",
        ScriptedExecutor::slow(Duration::from_millis(5000)),
    );

    let job = h
        .planner
        .create(
            NewJob::immediate(Uuid::new_v4(), "slowpoke", http_payload())
                .with_timeout_ms(1000)
                .with_max_retries(0),
        )
        .await
        .unwrap();

    assert!(h.pool.run_pending_once().await.unwrap());

    let executions = h.store.list_executions(job.id).await.unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].status, ExecutionStatus::Timeout);
    assert_eq!(executions[0].duration_ms, Some(1000));
    assert!(executions[0]
        .error
        .as_ref()
        .unwrap()
        .message
        .contains("exceeded timeout"));

    // Retry decision treats the timeout as a failure; max_retries=0 means
    // the job fails outright.
    let job = h.store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.failed_executions, 1);

    let events = h.events();
    assert!(events.contains(&"max_retries_exceeded".to_string()));
    assert!(events.contains(&"job_failed".to_string()));
}

#[tokio::test]
async fn recurring_success_advances_and_stays_active() {
    let h = Harness::new(
        "2024-01-01T00:04:59Z",
        ScriptedExecutor::new(vec![ok_response(), ok_response()]),
    );

    let job = h
        .planner
        .create(NewJob::recurring(
            Uuid::new_v4(),
            "tick",
            http_payload(),
            "*/5 * * * *",
        ))
        .await
        .unwrap();
    assert_eq!(job.next_execution_at, Some(at("2024-01-01T00:05:00Z")));

    h.clock.set(at("2024-01-01T00:05:00Z"));
    assert!(h.pool.run_pending_once().await.unwrap());

    let job = h.store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Active);
    assert_eq!(job.total_executions, 1);
    assert_eq!(job.successful_executions, 1);
    assert_eq!(job.next_execution_at, Some(at("2024-01-01T00:10:00Z")));

    // The repeatable fires again at the next boundary.
    h.clock.set(at("2024-01-01T00:10:00Z"));
    assert!(h.pool.run_pending_once().await.unwrap());
    let job = h.store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.total_executions, 2);
    assert_eq!(job.next_execution_at, Some(at("2024-01-01T00:15:00Z")));
}

#[tokio::test]
async fn recurring_reaching_max_executions_completes() {
    let h = Harness::new(
        "2024-01-01T00:04:59Z",
        ScriptedExecutor::new(vec![ok_response()]),
    );

    let job = h
        .planner
        .create(
            NewJob::recurring(Uuid::new_v4(), "bounded", http_payload(), "*/5 * * * *")
                .with_max_executions(1),
        )
        .await
        .unwrap();

    h.clock.set(at("2024-01-01T00:05:00Z"));
    assert!(h.pool.run_pending_once().await.unwrap());

    let job = h.store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.total_executions, 1);
    assert_eq!(job.next_execution_at, None);

    // No further firings.
    h.clock.set(at("2024-01-01T00:10:00Z"));
    assert!(!h.pool.run_pending_once().await.unwrap());
}

#[tokio::test]
async fn overlapping_recurring_fire_is_skipped() {
    let h = Harness::new(
        "2024-01-01T00:04:59Z",
        ScriptedExecutor::new(vec![ok_response()]),
    );

    let job = h
        .planner
        .create(NewJob::recurring(
            Uuid::new_v4(),
            "slow-tick",
            http_payload(),
            "*/5 * * * *",
        ))
        .await
        .unwrap();

    // A previous instance is still running when the next fire arrives.
    let running = chronod::execution::Execution::begin(
        job.id,
        1,
        "worker-other",
        Value::Null,
        None,
        h.clock.now(),
    );
    h.store.insert_execution(&running).await.unwrap();

    h.clock.set(at("2024-01-01T00:05:00Z"));
    assert!(h.pool.run_pending_once().await.unwrap());

    // No second execution was opened; the fire was dropped and audited.
    let executions = h.store.list_executions(job.id).await.unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(h.pool.stats().skipped_overlap(), 1);
    let logs = h.store.list_logs(job.id, 10).await.unwrap();
    assert!(logs.iter().any(|l| l.message == "skipped_overlap"));

    // Counters untouched by a skipped fire.
    let job = h.store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.total_executions, 0);
}

#[tokio::test]
async fn manual_trigger_runs_despite_running_instance() {
    let h = Harness::new(
        "2024-01-01T00:00:00Z",
        ScriptedExecutor::new(vec![ok_response()]),
    );

    let job = h
        .planner
        .create(NewJob::recurring(
            Uuid::new_v4(),
            "busy",
            http_payload(),
            "*/5 * * * *",
        ))
        .await
        .unwrap();

    let running = chronod::execution::Execution::begin(
        job.id,
        1,
        "worker-other",
        Value::Null,
        None,
        h.clock.now(),
    );
    h.store.insert_execution(&running).await.unwrap();

    h.planner.trigger(job.id).await.unwrap();
    assert!(h.pool.run_pending_once().await.unwrap());

    // The manual attempt ran concurrently with the in-flight one.
    let executions = h.store.list_executions(job.id).await.unwrap();
    assert_eq!(executions.len(), 2);
    assert!(executions
        .iter()
        .any(|e| e.status == ExecutionStatus::Completed));
    assert_eq!(h.pool.stats().skipped_overlap(), 0);

    // The manual run counts toward the counters.
    let job = h.store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.total_executions, 1);
    assert_eq!(job.successful_executions, 1);
}

#[tokio::test]
async fn stale_envelope_for_paused_job_is_dropped() {
    let h = Harness::new(
        "2024-01-01T00:00:00Z",
        ScriptedExecutor::new(vec![ok_response()]),
    );

    let job = h
        .planner
        .create(NewJob::immediate(Uuid::new_v4(), "late-pause", http_payload()))
        .await
        .unwrap();

    // The planner purge can race a pop in production; simulate an envelope
    // that survived the purge.
    h.planner.pause(job.id).await.unwrap();
    h.queue
        .enqueue(chronod::queue::Envelope::fire(&job, h.clock.now()))
        .await
        .unwrap();

    while h.pool.run_pending_once().await.unwrap() {}

    assert!(h.store.list_executions(job.id).await.unwrap().is_empty());
    let job = h.store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.total_executions, 0);
    assert_eq!(job.status, JobStatus::Paused);
}

#[tokio::test]
async fn counters_satisfy_invariant_across_mixed_outcomes() {
    let h = Harness::new(
        "2024-01-01T00:00:00Z",
        ScriptedExecutor::new(vec![server_error(), ok_response()]),
    );

    let job = h
        .planner
        .create(
            NewJob::immediate(Uuid::new_v4(), "mixed", http_payload())
                .with_max_retries(1)
                .with_retry_delay_ms(1000)
                .with_backoff(RetryBackoff::Fixed),
        )
        .await
        .unwrap();

    assert!(h.pool.run_pending_once().await.unwrap());
    h.clock.set(at("2024-01-01T00:00:01Z"));
    assert!(h.pool.run_pending_once().await.unwrap());

    let job = h.store.get_job(job.id).await.unwrap().unwrap();
    assert!(job.successful_executions + job.failed_executions <= job.total_executions);
    assert_eq!(job.total_executions, 2);

    // Retry chain is a directed path rooted at the first attempt.
    let executions = h.store.list_executions(job.id).await.unwrap();
    assert_eq!(executions[0].previous_execution_id, None);
    assert!(!executions[0].is_retry);
    assert_eq!(executions[1].previous_execution_id, Some(executions[0].id));
}

#[tokio::test]
async fn retry_chain_walks_back_to_the_first_attempt() {
    let h = Harness::new(
        "2024-01-01T00:00:00Z",
        ScriptedExecutor::new(vec![server_error(), server_error(), ok_response()]),
    );

    let job = h
        .planner
        .create(
            NewJob::immediate(Uuid::new_v4(), "chained", http_payload())
                .with_max_retries(3)
                .with_retry_delay_ms(1000)
                .with_backoff(RetryBackoff::Fixed),
        )
        .await
        .unwrap();

    assert!(h.pool.run_pending_once().await.unwrap());
    h.clock.set(at("2024-01-01T00:00:01Z"));
    assert!(h.pool.run_pending_once().await.unwrap());
    h.clock.set(at("2024-01-01T00:00:02Z"));
    assert!(h.pool.run_pending_once().await.unwrap());

    let executions = h.store.list_executions(job.id).await.unwrap();
    let chain = h.planner.retry_chain(executions[2].id).await.unwrap();
    assert_eq!(
        chain.iter().map(|e| e.attempt).collect::<Vec<_>>(),
        vec![3, 2, 1]
    );
    assert_eq!(chain[2].previous_execution_id, None);
}

#[tokio::test]
async fn graceful_shutdown_stops_the_loop() {
    let h = Harness::new(
        "2024-01-01T00:00:00Z",
        ScriptedExecutor::new(vec![ok_response()]),
    );

    let pool = Arc::new(h.pool);
    let (tx, rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(pool.run(rx));

    tokio::time::sleep(Duration::from_millis(50)).await;
    tx.send(true).unwrap();

    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("worker did not stop within the grace window")
        .unwrap();
}
