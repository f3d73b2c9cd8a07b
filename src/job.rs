//! Job definitions: the persistent specification of work with a schedule.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::calendar::{self, CronExpr};
use crate::error::{ChronodError, Result};

/// Lower bound on a per-attempt timeout.
pub const MIN_TIMEOUT_MS: u64 = 1_000;
/// Upper bound on a per-attempt timeout.
pub const MAX_TIMEOUT_MS: u64 = 3_600_000;
/// Highest user-settable priority band.
pub const MAX_PRIORITY: u8 = 10;
/// Priority band used for manual triggers; above every job priority.
pub const TRIGGER_PRIORITY: u8 = u8::MAX;
/// Cap on configured retries.
pub const MAX_RETRIES_LIMIT: u32 = 10;

// ═══════════════════════════════════════════════════════════════════════════════
// Identifiers
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Enumerations
// ═══════════════════════════════════════════════════════════════════════════════

/// Which executor adapter handles a job. Immutable after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Http,
    Webhook,
    Script,
    Email,
    Custom,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Webhook => "webhook",
            Self::Script => "script",
            Self::Email => "email",
            Self::Custom => "custom",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = ChronodError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "http" => Ok(Self::Http),
            "webhook" => Ok(Self::Webhook),
            "script" => Ok(Self::Script),
            "email" => Ok(Self::Email),
            "custom" => Ok(Self::Custom),
            other => Err(ChronodError::internal(format!("unknown job type '{}'", other))),
        }
    }
}

/// How a job is planned in wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    /// Run as soon as a worker is free.
    Immediate,
    /// Run once at `scheduled_at`.
    Scheduled,
    /// Run on every firing of `cron_expression`.
    Recurring,
}

impl ScheduleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Immediate => "immediate",
            Self::Scheduled => "scheduled",
            Self::Recurring => "recurring",
        }
    }
}

impl fmt::Display for ScheduleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScheduleType {
    type Err = ChronodError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "immediate" => Ok(Self::Immediate),
            "scheduled" => Ok(Self::Scheduled),
            "recurring" => Ok(Self::Recurring),
            other => Err(ChronodError::internal(format!("unknown schedule type '{}'", other))),
        }
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Active,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Terminal states never schedule again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ChronodError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(ChronodError::internal(format!("unknown job status '{}'", other))),
        }
    }
}

/// Strategy for spacing retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryBackoff {
    /// Same delay between every retry.
    Fixed,
    /// Delay doubles with each attempt.
    Exponential,
}

impl RetryBackoff {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fixed => "fixed",
            Self::Exponential => "exponential",
        }
    }
}

impl FromStr for RetryBackoff {
    type Err = ChronodError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fixed" => Ok(Self::Fixed),
            "exponential" => Ok(Self::Exponential),
            other => Err(ChronodError::internal(format!("unknown backoff '{}'", other))),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Payloads
// ═══════════════════════════════════════════════════════════════════════════════

/// Typed work description, selected by the job type and persisted as tagged
/// JSON. The core treats the contents as opaque; each executor adapter
/// validates its own variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    Http(HttpPayload),
    Webhook(WebhookPayload),
    Script(ScriptPayload),
    Email(EmailPayload),
    Custom(CustomPayload),
}

impl Payload {
    /// The adapter this payload dispatches to.
    pub fn job_type(&self) -> JobType {
        match self {
            Self::Http(_) => JobType::Http,
            Self::Webhook(_) => JobType::Webhook,
            Self::Script(_) => JobType::Script,
            Self::Email(_) => JobType::Email,
            Self::Custom(_) => JobType::Custom,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpPayload {
    pub url: String,
    #[serde(default = "default_get")]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default = "default_http_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub url: String,
    #[serde(default = "default_post")]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Body to deliver; also the signing input when `secret` is set.
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(default = "default_http_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptPayload {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default = "default_script_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailPayload {
    pub to: String,
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomPayload {
    /// Name of a handler in the process-local registry.
    pub handler: String,
    #[serde(default)]
    pub data: Value,
}

fn default_get() -> String {
    "GET".to_string()
}

fn default_post() -> String {
    "POST".to_string()
}

fn default_http_timeout_ms() -> u64 {
    30_000
}

fn default_script_timeout_ms() -> u64 {
    60_000
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job
// ═══════════════════════════════════════════════════════════════════════════════

/// A persistent job row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub owner_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub metadata: Value,
    pub job_type: JobType,
    pub payload: Payload,
    pub schedule_type: ScheduleType,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub cron_expression: Option<String>,
    pub timezone: String,
    pub status: JobStatus,
    pub priority: u8,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub retry_backoff: RetryBackoff,
    pub timeout_ms: u64,
    pub last_executed_at: Option<DateTime<Utc>>,
    pub next_execution_at: Option<DateTime<Utc>>,
    pub total_executions: i64,
    pub successful_executions: i64,
    pub failed_executions: i64,
    pub end_at: Option<DateTime<Utc>>,
    pub max_executions: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn is_recurring(&self) -> bool {
        self.schedule_type == ScheduleType::Recurring
    }

    /// Delay before the retry that becomes attempt `attempt + 1`, where
    /// `attempt` is the 1-based index of the attempt that just failed.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let ms = match self.retry_backoff {
            RetryBackoff::Fixed => self.retry_delay_ms,
            RetryBackoff::Exponential => {
                // 2^(attempt-1), capped well before overflow territory.
                let exp = attempt.saturating_sub(1).min(20);
                self.retry_delay_ms.saturating_mul(1u64 << exp)
            }
        };
        Duration::from_millis(ms)
    }

    /// Parsed calendar expression of a recurring job.
    pub fn cron_expr(&self) -> Result<CronExpr> {
        let expr = self
            .cron_expression
            .as_deref()
            .ok_or_else(|| ChronodError::invalid_schedule("recurring job has no calendar expression"))?;
        CronExpr::parse(expr)
    }

    /// Parsed IANA zone of the job.
    pub fn tz(&self) -> Result<chrono_tz::Tz> {
        calendar::parse_timezone(&self.timezone)
    }

    /// Has the recurring job reached one of its end conditions?
    pub fn end_condition_reached(&self, now: DateTime<Utc>) -> bool {
        if let Some(end_at) = self.end_at {
            if end_at <= now {
                return true;
            }
        }
        if let Some(max) = self.max_executions {
            if self.total_executions >= max {
                return true;
            }
        }
        false
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// NewJob (creation input)
// ═══════════════════════════════════════════════════════════════════════════════

/// Input for creating a job. Build with one of the schedule constructors,
/// then chain setters for everything else.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub owner_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub metadata: Value,
    pub payload: Payload,
    pub schedule_type: ScheduleType,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub cron_expression: Option<String>,
    pub timezone: String,
    pub priority: u8,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub retry_backoff: RetryBackoff,
    pub timeout_ms: u64,
    pub end_at: Option<DateTime<Utc>>,
    pub max_executions: Option<i64>,
}

impl NewJob {
    fn base(owner_id: Uuid, name: impl Into<String>, payload: Payload) -> Self {
        Self {
            owner_id,
            name: name.into(),
            description: None,
            tags: Vec::new(),
            metadata: Value::Object(Default::default()),
            payload,
            schedule_type: ScheduleType::Immediate,
            scheduled_at: None,
            cron_expression: None,
            timezone: "UTC".to_string(),
            priority: 0,
            max_retries: 3,
            retry_delay_ms: 5000,
            retry_backoff: RetryBackoff::Exponential,
            timeout_ms: 300_000,
            end_at: None,
            max_executions: None,
        }
    }

    /// A job that runs as soon as possible.
    pub fn immediate(owner_id: Uuid, name: impl Into<String>, payload: Payload) -> Self {
        Self::base(owner_id, name, payload)
    }

    /// A one-shot job at a future instant.
    pub fn scheduled(
        owner_id: Uuid,
        name: impl Into<String>,
        payload: Payload,
        at: DateTime<Utc>,
    ) -> Self {
        let mut new = Self::base(owner_id, name, payload);
        new.schedule_type = ScheduleType::Scheduled;
        new.scheduled_at = Some(at);
        new
    }

    /// A recurring job driven by a calendar expression.
    pub fn recurring(
        owner_id: Uuid,
        name: impl Into<String>,
        payload: Payload,
        cron_expression: impl Into<String>,
    ) -> Self {
        let mut new = Self::base(owner_id, name, payload);
        new.schedule_type = ScheduleType::Recurring;
        new.cron_expression = Some(cron_expression.into());
        new
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = timezone.into();
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay_ms(mut self, delay_ms: u64) -> Self {
        self.retry_delay_ms = delay_ms;
        self
    }

    pub fn with_backoff(mut self, backoff: RetryBackoff) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_end_at(mut self, end_at: DateTime<Utc>) -> Self {
        self.end_at = Some(end_at);
        self
    }

    pub fn with_max_executions(mut self, max: i64) -> Self {
        self.max_executions = Some(max);
        self
    }

    /// Validate the request against its schedule type and field bounds.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<()> {
        if self.name.is_empty() || self.name.len() > 255 {
            return Err(ChronodError::invalid_schedule(
                "job name must be between 1 and 255 characters",
            ));
        }
        if self.priority > MAX_PRIORITY {
            return Err(ChronodError::invalid_schedule(format!(
                "priority must be between 0 and {}",
                MAX_PRIORITY
            )));
        }
        if self.max_retries > MAX_RETRIES_LIMIT {
            return Err(ChronodError::invalid_schedule(format!(
                "max_retries must be between 0 and {}",
                MAX_RETRIES_LIMIT
            )));
        }
        if self.retry_delay_ms == 0 {
            return Err(ChronodError::invalid_schedule("retry_delay_ms must be positive"));
        }
        if !(MIN_TIMEOUT_MS..=MAX_TIMEOUT_MS).contains(&self.timeout_ms) {
            return Err(ChronodError::invalid_schedule(format!(
                "timeout_ms must be between {} and {}",
                MIN_TIMEOUT_MS, MAX_TIMEOUT_MS
            )));
        }
        if let Some(max) = self.max_executions {
            if max <= 0 {
                return Err(ChronodError::invalid_schedule("max_executions must be positive"));
            }
        }

        calendar::parse_timezone(&self.timezone)?;

        match self.schedule_type {
            ScheduleType::Immediate => Ok(()),
            ScheduleType::Scheduled => {
                let at = self.scheduled_at.ok_or_else(|| {
                    ChronodError::invalid_schedule("scheduled jobs require scheduled_at")
                })?;
                if at <= now {
                    return Err(ChronodError::invalid_schedule(
                        "scheduled_at must be in the future",
                    ));
                }
                Ok(())
            }
            ScheduleType::Recurring => {
                let expr = self.cron_expression.as_deref().ok_or_else(|| {
                    ChronodError::invalid_schedule("recurring jobs require cron_expression")
                })?;
                CronExpr::validate(expr)
            }
        }
    }

    /// Materialize the job row. Callers validate first.
    pub fn into_job(self, now: DateTime<Utc>) -> Job {
        Job {
            id: JobId::new(),
            owner_id: self.owner_id,
            name: self.name,
            description: self.description,
            tags: self.tags,
            metadata: self.metadata,
            job_type: self.payload.job_type(),
            payload: self.payload,
            schedule_type: self.schedule_type,
            scheduled_at: self.scheduled_at,
            cron_expression: self.cron_expression,
            timezone: self.timezone,
            status: JobStatus::Active,
            priority: self.priority,
            max_retries: self.max_retries,
            retry_delay_ms: self.retry_delay_ms,
            retry_backoff: self.retry_backoff,
            timeout_ms: self.timeout_ms,
            last_executed_at: None,
            next_execution_at: None,
            total_executions: 0,
            successful_executions: 0,
            failed_executions: 0,
            end_at: self.end_at,
            max_executions: self.max_executions,
            created_at: now,
            updated_at: now,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn http_payload() -> Payload {
        Payload::Http(HttpPayload {
            url: "http://svc/ok".to_string(),
            method: "GET".to_string(),
            headers: HashMap::new(),
            body: None,
            timeout_ms: 30_000,
        })
    }

    #[test]
    fn payload_selects_job_type() {
        assert_eq!(http_payload().job_type(), JobType::Http);
        let script = Payload::Script(ScriptPayload {
            command: "true".into(),
            args: vec![],
            cwd: None,
            env: HashMap::new(),
            timeout_ms: 60_000,
        });
        assert_eq!(script.job_type(), JobType::Script);
    }

    #[test]
    fn payload_defaults_fill_in_on_deserialize() {
        let payload: Payload =
            serde_json::from_value(serde_json::json!({"type": "http", "url": "http://x"})).unwrap();
        match payload {
            Payload::Http(http) => {
                assert_eq!(http.method, "GET");
                assert_eq!(http.timeout_ms, 30_000);
            }
            other => panic!("unexpected payload {:?}", other),
        }

        let payload: Payload =
            serde_json::from_value(serde_json::json!({"type": "webhook", "url": "http://x"}))
                .unwrap();
        match payload {
            Payload::Webhook(hook) => assert_eq!(hook.method, "POST"),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn scheduled_in_the_past_is_rejected() {
        let now = Utc::now();
        let new = NewJob::scheduled(
            Uuid::new_v4(),
            "backfill",
            http_payload(),
            now - ChronoDuration::seconds(10),
        );
        let err = new.validate(now).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::InvalidSchedule);
    }

    #[test]
    fn recurring_requires_valid_expression() {
        let now = Utc::now();
        let mut new = NewJob::recurring(Uuid::new_v4(), "tick", http_payload(), "*/5 * * * *");
        assert!(new.validate(now).is_ok());

        new.cron_expression = Some("not a cron".to_string());
        assert!(new.validate(now).is_err());

        new.cron_expression = None;
        assert!(new.validate(now).is_err());
    }

    #[test]
    fn field_bounds_are_enforced() {
        let now = Utc::now();
        let base = NewJob::immediate(Uuid::new_v4(), "bounds", http_payload());

        assert!(base.clone().with_priority(11).validate(now).is_err());
        assert!(base.clone().with_max_retries(11).validate(now).is_err());
        assert!(base.clone().with_timeout_ms(500).validate(now).is_err());
        assert!(base.clone().with_timeout_ms(4_000_000).validate(now).is_err());
        assert!(base.clone().with_retry_delay_ms(0).validate(now).is_err());
        assert!(base.clone().with_timezone("Nowhere/Void").validate(now).is_err());
        assert!(base.validate(now).is_ok());
    }

    #[test]
    fn exponential_backoff_doubles_per_attempt() {
        let job = NewJob::immediate(Uuid::new_v4(), "retry", http_payload())
            .into_job(Utc::now());
        assert_eq!(job.retry_delay(1), Duration::from_millis(5000));
        assert_eq!(job.retry_delay(2), Duration::from_millis(10_000));
        assert_eq!(job.retry_delay(3), Duration::from_millis(20_000));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let job = NewJob::immediate(Uuid::new_v4(), "retry", http_payload())
            .with_backoff(RetryBackoff::Fixed)
            .into_job(Utc::now());
        assert_eq!(job.retry_delay(1), Duration::from_millis(5000));
        assert_eq!(job.retry_delay(4), Duration::from_millis(5000));
    }

    #[test]
    fn end_conditions() {
        let now = Utc::now();
        let mut job = NewJob::recurring(Uuid::new_v4(), "tick", http_payload(), "* * * * *")
            .into_job(now);
        assert!(!job.end_condition_reached(now));

        job.end_at = Some(now - ChronoDuration::seconds(1));
        assert!(job.end_condition_reached(now));

        job.end_at = None;
        job.max_executions = Some(3);
        job.total_executions = 3;
        assert!(job.end_condition_reached(now));
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Active.is_terminal());
        assert!(!JobStatus::Paused.is_terminal());
    }
}
