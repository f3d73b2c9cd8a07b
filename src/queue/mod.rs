//! Ready queue: durable staging for attempt envelopes.
//!
//! Three integrations, per the planner's registration rules:
//! - immediate enqueue into a priority band (FIFO within a band),
//! - delayed enqueue with an absolute visibility instant,
//! - repeatable registrations that materialize one envelope per calendar
//!   firing until removed.
//!
//! Delivered envelopes are tracked in-flight; removal is explicit (worker
//! ack) and a crashed worker's envelope becomes visible again once its stall
//! deadline passes.

mod memory;
mod redis_backend;

pub use memory::MemoryQueue;
pub use redis_backend::RedisQueue;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::job::{Job, JobId, TRIGGER_PRIORITY};

/// A queue message referencing one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub job_id: JobId,
    /// Attempts already finished for this chain; the worker runs attempt
    /// `attempts_made + 1`.
    pub attempts_made: u32,
    pub enqueued_at: DateTime<Utc>,
    pub priority: u8,
    /// Manual triggers bypass the overlap check and jump the queue.
    #[serde(default)]
    pub manual: bool,
}

impl Envelope {
    /// First attempt of a scheduled/immediate/recurring fire.
    pub fn fire(job: &Job, now: DateTime<Utc>) -> Self {
        Self {
            job_id: job.id,
            attempts_made: 0,
            enqueued_at: now,
            priority: job.priority,
            manual: false,
        }
    }

    /// Manually triggered attempt at the highest priority tier.
    pub fn manual(job: &Job, now: DateTime<Utc>) -> Self {
        Self {
            job_id: job.id,
            attempts_made: 0,
            enqueued_at: now,
            priority: TRIGGER_PRIORITY,
            manual: true,
        }
    }

    /// Retry envelope carrying the finished-attempt count.
    pub fn retry(job: &Job, attempts_made: u32, now: DateTime<Utc>) -> Self {
        Self {
            job_id: job.id,
            attempts_made,
            enqueued_at: now,
            priority: job.priority,
            manual: false,
        }
    }
}

/// A popped envelope plus the receipt needed to ack or nack it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delivery {
    pub envelope: Envelope,
    pub receipt: Uuid,
}

/// A planner-owned registration that fires per its calendar expression.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repeatable {
    pub job_id: JobId,
    pub cron_expression: String,
    pub timezone: String,
    pub priority: u8,
    pub next_fire_at: DateTime<Utc>,
}

/// Queue backend operations.
///
/// Workers only call `pop`/`ack`/`nack`; registrations belong to the
/// planner.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Enqueue for immediate visibility.
    async fn enqueue(&self, envelope: Envelope) -> Result<()>;

    /// Enqueue with an absolute visibility instant.
    async fn enqueue_delayed(&self, envelope: Envelope, visible_at: DateTime<Utc>) -> Result<()>;

    /// Register (or replace) the repeatable entry for a job.
    async fn register_repeatable(&self, repeatable: Repeatable) -> Result<()>;

    async fn remove_repeatable(&self, job_id: JobId) -> Result<()>;

    /// Deliver the next visible envelope, if any.
    ///
    /// Also promotes due delayed entries, materializes due repeatable
    /// firings, and reclaims in-flight envelopes whose stall deadline has
    /// passed.
    async fn pop(&self, now: DateTime<Utc>) -> Result<Option<Delivery>>;

    /// Remove a delivered envelope after its terminal outcome was recorded.
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Return a delivered envelope to the queue after the stall interval
    /// (infrastructure failure path).
    async fn nack(&self, delivery: &Delivery) -> Result<()>;

    /// Purge pending and delayed entries for a job (pause/cancel). In-flight
    /// attempts drain naturally. Returns the number removed.
    async fn remove_job(&self, job_id: JobId) -> Result<u64>;

    /// Number of visible + delayed envelopes.
    async fn len(&self) -> Result<usize>;
}
