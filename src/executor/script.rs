//! Script executor adapter: runs a subprocess and captures its output.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::process::Command;

use crate::job::{JobType, Payload};

use super::{AdapterError, AdapterResult, JobTypeExecutor};

/// Runs `script` jobs. Success iff the process exits 0.
pub struct ScriptExecutor;

impl ScriptExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ScriptExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobTypeExecutor for ScriptExecutor {
    async fn execute(&self, payload: &Payload, deadline: Duration) -> AdapterResult {
        let Payload::Script(script) = payload else {
            return Err(AdapterError::wrong_payload(JobType::Script));
        };

        let mut command = Command::new(&script.command);
        command
            .args(&script.args)
            .envs(&script.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &script.cwd {
            command.current_dir(cwd);
        }

        let timeout = deadline.min(Duration::from_millis(script.timeout_ms));
        let output = match tokio::time::timeout(timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(AdapterError::new(format!(
                    "failed to spawn '{}': {}",
                    script.command, e
                )));
            }
            Err(_) => {
                return Err(AdapterError::new(format!(
                    "script timed out after {}ms",
                    timeout.as_millis()
                )));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let exit_code = output.status.code().unwrap_or(-1);

        if output.status.success() {
            Ok(json!({
                "exitCode": exit_code,
                "stdout": stdout,
                "stderr": stderr,
            }))
        } else {
            Err(
                AdapterError::new(format!("script exited with code {}", exit_code))
                    .with_stack(stderr),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::ScriptPayload;
    use std::collections::HashMap;

    fn payload(command: &str, args: &[&str]) -> Payload {
        Payload::Script(ScriptPayload {
            command: command.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            cwd: None,
            env: HashMap::new(),
            timeout_ms: 60_000,
        })
    }

    #[tokio::test]
    async fn captures_trimmed_stdout() {
        let executor = ScriptExecutor::new();
        let result = executor
            .execute(&payload("echo", &["hello"]), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(result["exitCode"], 0);
        assert_eq!(result["stdout"], "hello");
    }

    #[tokio::test]
    async fn non_zero_exit_is_a_failure() {
        let executor = ScriptExecutor::new();
        let err = executor
            .execute(&payload("false", &[]), Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(err.message.contains("exited with code"));
    }

    #[tokio::test]
    async fn missing_binary_is_a_failure() {
        let executor = ScriptExecutor::new();
        let err = executor
            .execute(
                &payload("definitely-not-a-real-binary-6f2a", &[]),
                Duration::from_secs(10),
            )
            .await
            .unwrap_err();
        assert!(err.message.contains("failed to spawn"));
    }

    #[tokio::test]
    async fn deadline_cuts_long_scripts() {
        let executor = ScriptExecutor::new();
        let err = executor
            .execute(&payload("sleep", &["5"]), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(err.message.contains("timed out"));
    }
}
