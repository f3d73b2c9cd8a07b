//! HTTP executor adapter.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::job::{JobType, Payload};

use super::{AdapterError, AdapterResult, JobTypeExecutor};

/// Runs `http` jobs through a shared reqwest client.
pub struct HttpExecutor {
    client: reqwest::Client,
}

impl HttpExecutor {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobTypeExecutor for HttpExecutor {
    async fn execute(&self, payload: &Payload, deadline: Duration) -> AdapterResult {
        let Payload::Http(http) = payload else {
            return Err(AdapterError::wrong_payload(JobType::Http));
        };
        let timeout = deadline.min(Duration::from_millis(http.timeout_ms));
        send_request(
            &self.client,
            &http.method,
            &http.url,
            &http.headers,
            http.body.as_ref(),
            timeout,
        )
        .await
    }
}

/// Shared request path for the http and webhook adapters.
///
/// Success iff the response status is in [200, 300); the result carries the
/// status, response headers and the body (JSON-parsed when possible).
pub(super) async fn send_request(
    client: &reqwest::Client,
    method: &str,
    url: &str,
    headers: &HashMap<String, String>,
    body: Option<&Value>,
    timeout: Duration,
) -> AdapterResult {
    let method = reqwest::Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .map_err(|_| AdapterError::new(format!("invalid http method '{}'", method)))?;

    let mut request = client.request(method, url).timeout(timeout);
    for (name, value) in headers {
        request = request.header(name, value);
    }
    if let Some(body) = body {
        request = request.json(body);
    }

    let response = request
        .send()
        .await
        .map_err(|e| AdapterError::new(format!("http request failed: {}", e)))?;

    let status = response.status().as_u16();
    let mut response_headers = serde_json::Map::new();
    for (name, value) in response.headers() {
        if let Ok(value) = value.to_str() {
            response_headers.insert(name.to_string(), Value::String(value.to_string()));
        }
    }

    let text = response
        .text()
        .await
        .map_err(|e| AdapterError::new(format!("failed to read response body: {}", e)))?;
    let body: Value = serde_json::from_str(&text).unwrap_or(Value::String(text));

    if (200..300).contains(&status) {
        Ok(json!({
            "statusCode": status,
            "headers": Value::Object(response_headers),
            "body": body,
        }))
    } else {
        Err(
            AdapterError::new(format!("http request failed with status {}", status))
                .with_stack(body.to_string()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn invalid_method_is_rejected() {
        let client = reqwest::Client::new();
        let err = send_request(
            &client,
            "NOT A METHOD",
            "http://localhost/x",
            &HashMap::new(),
            None,
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(err.message.contains("invalid http method"));
    }

    #[tokio::test]
    async fn wrong_payload_variant_is_rejected() {
        let executor = HttpExecutor::new();
        let payload = Payload::Custom(crate::job::CustomPayload {
            handler: "x".into(),
            data: Value::Null,
        });
        let err = executor
            .execute(&payload, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.message.contains("does not match"));
    }
}
