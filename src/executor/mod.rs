//! Executor adapters: the capability the worker pipeline dispatches to.
//!
//! The core stays agnostic of what an attempt actually does; it hands the
//! typed payload and a hard deadline to a [`JobTypeExecutor`] and records
//! whatever comes back.

mod custom;
mod email;
mod http;
mod script;
mod webhook;

pub use custom::{CustomExecutor, CustomHandler};
pub use email::{EmailExecutor, EmailMessage, LogMailer, Mailer};
pub use http::HttpExecutor;
pub use script::ScriptExecutor;
pub use webhook::WebhookExecutor;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::execution::ExecutionError;
use crate::job::{JobType, Payload};

/// Failure reported by an adapter; recorded on the execution row and fed
/// into the retry decision.
#[derive(Debug, Clone)]
pub struct AdapterError {
    pub message: String,
    pub stack: Option<String>,
}

impl AdapterError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// A payload variant reached the wrong adapter; wiring bug.
    pub fn wrong_payload(expected: JobType) -> Self {
        Self::new(format!("payload does not match the {} adapter", expected))
    }
}

impl fmt::Display for AdapterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for AdapterError {}

impl From<AdapterError> for ExecutionError {
    fn from(error: AdapterError) -> Self {
        Self {
            message: error.message,
            stack: error.stack,
        }
    }
}

/// Result type for adapter execution.
pub type AdapterResult = std::result::Result<Value, AdapterError>;

/// One job-type adapter.
#[async_trait]
pub trait JobTypeExecutor: Send + Sync {
    /// Run the work described by `payload`. `deadline` is the hard
    /// per-attempt budget; adapters with their own payload timeouts use
    /// whichever is tighter.
    async fn execute(&self, payload: &Payload, deadline: Duration) -> AdapterResult;
}

/// Process-local mapping of job type → adapter, wired once at startup.
pub struct ExecutorRegistry {
    executors: HashMap<JobType, Arc<dyn JobTypeExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// Registry with all five shipped adapters.
    pub fn builtin(mailer: Arc<dyn Mailer>, custom: CustomExecutor) -> Self {
        let mut registry = Self::new();
        registry.register(JobType::Http, Arc::new(HttpExecutor::new()));
        registry.register(JobType::Webhook, Arc::new(WebhookExecutor::new()));
        registry.register(JobType::Script, Arc::new(ScriptExecutor::new()));
        registry.register(JobType::Email, Arc::new(EmailExecutor::new(mailer)));
        registry.register(JobType::Custom, Arc::new(custom));
        registry
    }

    pub fn register(&mut self, job_type: JobType, executor: Arc<dyn JobTypeExecutor>) {
        self.executors.insert(job_type, executor);
    }

    /// Dispatch a payload to its adapter.
    pub async fn execute(&self, payload: &Payload, deadline: Duration) -> AdapterResult {
        let job_type = payload.job_type();
        let executor = self.executors.get(&job_type).ok_or_else(|| {
            AdapterError::new(format!("no executor registered for job type '{}'", job_type))
        })?;
        executor.execute(payload, deadline).await
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{CustomPayload, Payload};

    #[tokio::test]
    async fn unregistered_type_is_an_adapter_error() {
        let registry = ExecutorRegistry::new();
        let payload = Payload::Custom(CustomPayload {
            handler: "noop".into(),
            data: Value::Null,
        });
        let err = registry
            .execute(&payload, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.message.contains("no executor registered"));
    }
}
