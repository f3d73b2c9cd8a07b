//! Notification trigger points.
//!
//! The worker pipeline emits these events; delivery (email rendering, SMTP,
//! push, …) is an external collaborator. Emission is best-effort: a failed
//! notification never alters job or execution state.

use async_trait::async_trait;

use crate::execution::{Execution, ExecutionError};
use crate::job::Job;

/// Events fanned out to the owner's preferred channel.
#[derive(Debug, Clone)]
pub enum NotificationEvent {
    JobCompleted {
        job: Job,
        execution: Execution,
        duration_ms: i64,
    },
    JobRetry {
        job: Job,
        attempt: u32,
        max_retries: u32,
        error_message: String,
    },
    MaxRetriesExceeded {
        job: Job,
        max_retries: u32,
        last_error: ExecutionError,
    },
    JobFailed {
        job: Job,
        execution: Execution,
        error: ExecutionError,
        attempts: u32,
    },
}

impl NotificationEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::JobCompleted { .. } => "job_completed",
            Self::JobRetry { .. } => "job_retry",
            Self::MaxRetriesExceeded { .. } => "max_retries_exceeded",
            Self::JobFailed { .. } => "job_failed",
        }
    }
}

/// Notification sink.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: NotificationEvent);
}

/// Default sink: structured log lines only.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: NotificationEvent) {
        match &event {
            NotificationEvent::JobCompleted { job, duration_ms, .. } => {
                tracing::info!(
                    job_id = %job.id,
                    job_name = %job.name,
                    duration_ms,
                    event = event.kind(),
                    "job completed"
                );
            }
            NotificationEvent::JobRetry { job, attempt, max_retries, error_message } => {
                tracing::warn!(
                    job_id = %job.id,
                    attempt,
                    max_retries,
                    error = %error_message,
                    event = event.kind(),
                    "job attempt failed, retry scheduled"
                );
            }
            NotificationEvent::MaxRetriesExceeded { job, max_retries, last_error } => {
                tracing::error!(
                    job_id = %job.id,
                    max_retries,
                    error = %last_error.message,
                    event = event.kind(),
                    "job exhausted its retries"
                );
            }
            NotificationEvent::JobFailed { job, error, attempts, .. } => {
                tracing::error!(
                    job_id = %job.id,
                    attempts,
                    error = %error.message,
                    event = event.kind(),
                    "job failed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{HttpPayload, NewJob, Payload};
    use chrono::Utc;
    use serde_json::Value;
    use std::sync::Mutex;
    use uuid::Uuid;

    /// Sink that records event kinds.
    struct RecordingNotifier {
        events: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, event: NotificationEvent) {
            self.events.lock().unwrap().push(event.kind().to_string());
        }
    }

    #[tokio::test]
    async fn event_kinds_are_stable() {
        let payload = Payload::Http(HttpPayload {
            url: "http://svc/ok".into(),
            method: "GET".into(),
            headers: Default::default(),
            body: None,
            timeout_ms: 30_000,
        });
        let job = NewJob::immediate(Uuid::new_v4(), "n", payload).into_job(Utc::now());
        let execution =
            crate::execution::Execution::begin(job.id, 1, "w-0", Value::Null, None, Utc::now());

        let notifier = RecordingNotifier {
            events: Mutex::new(Vec::new()),
        };
        notifier
            .notify(NotificationEvent::JobCompleted {
                job: job.clone(),
                execution: execution.clone(),
                duration_ms: 10,
            })
            .await;
        notifier
            .notify(NotificationEvent::JobRetry {
                job: job.clone(),
                attempt: 1,
                max_retries: 3,
                error_message: "boom".into(),
            })
            .await;
        notifier
            .notify(NotificationEvent::MaxRetriesExceeded {
                job: job.clone(),
                max_retries: 3,
                last_error: ExecutionError::new("boom"),
            })
            .await;
        notifier
            .notify(NotificationEvent::JobFailed {
                job,
                execution,
                error: ExecutionError::new("boom"),
                attempts: 4,
            })
            .await;

        assert_eq!(
            *notifier.events.lock().unwrap(),
            vec!["job_completed", "job_retry", "max_retries_exceeded", "job_failed"]
        );
    }
}
