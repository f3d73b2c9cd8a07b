//! Email executor adapter.
//!
//! Message rendering and SMTP transport live outside the core; this adapter
//! assembles the message and hands it to a [`Mailer`] capability constructed
//! once per process.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::job::{JobType, Payload};

use super::{AdapterError, AdapterResult, JobTypeExecutor};

/// Assembled message handed to the transport.
#[derive(Debug, Clone)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub text: Option<String>,
    pub html: Option<String>,
    pub from: Option<String>,
}

/// Outbound mail transport. Returns the provider's message id.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> Result<String, AdapterError>;
}

/// Default transport: logs the message and fabricates an id. Useful in
/// development and tests; production wires a real transport here.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, message: &EmailMessage) -> Result<String, AdapterError> {
        let message_id = Uuid::new_v4().to_string();
        tracing::info!(
            to = %message.to,
            subject = %message.subject,
            message_id = %message_id,
            "email handed to log transport"
        );
        Ok(message_id)
    }
}

/// Runs `email` jobs.
pub struct EmailExecutor {
    mailer: Arc<dyn Mailer>,
}

impl EmailExecutor {
    pub fn new(mailer: Arc<dyn Mailer>) -> Self {
        Self { mailer }
    }
}

#[async_trait]
impl JobTypeExecutor for EmailExecutor {
    async fn execute(&self, payload: &Payload, deadline: Duration) -> AdapterResult {
        let Payload::Email(email) = payload else {
            return Err(AdapterError::wrong_payload(JobType::Email));
        };
        if email.text.is_none() && email.html.is_none() {
            return Err(AdapterError::new("email payload needs text or html content"));
        }

        let message = EmailMessage {
            to: email.to.clone(),
            subject: email.subject.clone(),
            text: email.text.clone(),
            html: email.html.clone(),
            from: email.from.clone(),
        };

        let message_id = tokio::time::timeout(deadline, self.mailer.send(&message))
            .await
            .map_err(|_| AdapterError::new("mail transport timed out"))??;

        Ok(json!({
            "messageId": message_id,
            "to": message.to,
            "subject": message.subject,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::EmailPayload;

    fn payload(text: Option<&str>) -> Payload {
        Payload::Email(EmailPayload {
            to: "ops@example.com".into(),
            subject: "nightly report".into(),
            text: text.map(|s| s.to_string()),
            html: None,
            from: None,
        })
    }

    #[tokio::test]
    async fn returns_message_id_to_and_subject() {
        let executor = EmailExecutor::new(Arc::new(LogMailer));
        let result = executor
            .execute(&payload(Some("all good")), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(result["messageId"].as_str().is_some());
        assert_eq!(result["to"], "ops@example.com");
        assert_eq!(result["subject"], "nightly report");
    }

    #[tokio::test]
    async fn empty_body_is_rejected() {
        let executor = EmailExecutor::new(Arc::new(LogMailer));
        let err = executor
            .execute(&payload(None), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.message.contains("text or html"));
    }
}
