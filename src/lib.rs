//! # chronod
//!
//! Core of a distributed job scheduling system.
//!
//! ## Architecture
//!
//! - **Calendar Engine**: 5-field schedule expressions evaluated in a named
//!   time zone, DST-aware
//! - **Scheduling Planner**: create/trigger/pause/resume/reschedule/cancel
//!   transitions, `next_execution_at` maintenance, end conditions
//! - **Ready Queue**: durable priority queue with delayed visibility,
//!   repeatable registrations and stall-based redelivery
//! - **Worker Pool**: concurrency-bounded, rate-capped attempt supervision
//!   with timeout and retry/backoff semantics
//! - **Durable Store**: jobs, executions and audit logs behind one trait
//!   (PostgreSQL or in-memory)
//! - **Executor Adapters**: http, webhook, script, email and custom handlers
//!   behind a single capability
//! - **Notifier**: best-effort completion/retry/failure event fan-out
//!
//! The HTTP surface, authentication and transport concerns live outside this
//! crate; the two shipped binaries wire the planner (server) and the worker
//! pool (worker) to the configured backends.

pub mod calendar;
pub mod clock;
pub mod config;
pub mod error;
pub mod execution;
pub mod executor;
pub mod job;
pub mod notifier;
pub mod planner;
pub mod queue;
pub mod shutdown;
pub mod store;
pub mod telemetry;
pub mod worker;

pub use error::{ChronodError, ErrorCode, Result};

/// Re-export commonly used types.
pub mod prelude {
    pub use crate::calendar::CronExpr;
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::config::Config;
    pub use crate::error::{ChronodError, ErrorCode, Result};
    pub use crate::execution::{Execution, ExecutionError, ExecutionId, ExecutionStatus, JobLog};
    pub use crate::executor::{
        AdapterError, CustomExecutor, CustomHandler, ExecutorRegistry, JobTypeExecutor, LogMailer,
        Mailer,
    };
    pub use crate::job::{
        Job, JobId, JobStatus, JobType, NewJob, Payload, RetryBackoff, ScheduleType,
    };
    pub use crate::notifier::{LogNotifier, NotificationEvent, Notifier};
    pub use crate::planner::{NewSchedule, Planner};
    pub use crate::queue::{Delivery, Envelope, MemoryQueue, QueueBackend, RedisQueue};
    pub use crate::store::{JobStore, MemoryStore, PgStore};
    pub use crate::worker::{WorkerConfig, WorkerPool, WorkerStats};
}
