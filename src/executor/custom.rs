//! Custom executor adapter: dispatch to named handlers registered at
//! process start.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::job::{JobType, Payload};

use super::{AdapterError, AdapterResult, JobTypeExecutor};

/// A named in-process handler for `custom` jobs.
#[async_trait]
pub trait CustomHandler: Send + Sync {
    async fn run(&self, data: Value) -> Result<Value, AdapterError>;
}

/// Runs `custom` jobs against a process-local handler registry. Handlers
/// are registered during wiring, before the executor is shared.
pub struct CustomExecutor {
    handlers: HashMap<String, Arc<dyn CustomHandler>>,
}

impl CustomExecutor {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn CustomHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn handler_names(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }
}

impl Default for CustomExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobTypeExecutor for CustomExecutor {
    async fn execute(&self, payload: &Payload, deadline: Duration) -> AdapterResult {
        let Payload::Custom(custom) = payload else {
            return Err(AdapterError::wrong_payload(JobType::Custom));
        };

        let handler = self.handlers.get(&custom.handler).ok_or_else(|| {
            AdapterError::new(format!("unknown custom handler '{}'", custom.handler))
        })?;

        tokio::time::timeout(deadline, handler.run(custom.data.clone()))
            .await
            .map_err(|_| AdapterError::new("custom handler timed out"))?
    }
}
