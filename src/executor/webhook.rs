//! Webhook executor adapter: HTTP delivery with optional HMAC signing.

use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;

use crate::job::{JobType, Payload};

use super::http::send_request;
use super::{AdapterError, AdapterResult, JobTypeExecutor};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the hex HMAC-SHA256 of the canonical payload.
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

/// Runs `webhook` jobs: POST by default, signed when a secret is present.
pub struct WebhookExecutor {
    client: reqwest::Client,
}

impl WebhookExecutor {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for WebhookExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobTypeExecutor for WebhookExecutor {
    async fn execute(&self, payload: &Payload, deadline: Duration) -> AdapterResult {
        let Payload::Webhook(hook) = payload else {
            return Err(AdapterError::wrong_payload(JobType::Webhook));
        };

        let mut headers = hook.headers.clone();
        if let Some(secret) = &hook.secret {
            let signature = sign(secret, &hook.data)?;
            headers.insert(SIGNATURE_HEADER.to_string(), signature);
        }

        let timeout = deadline.min(Duration::from_millis(hook.timeout_ms));
        send_request(
            &self.client,
            &hook.method,
            &hook.url,
            &headers,
            Some(&hook.data),
            timeout,
        )
        .await
    }
}

/// Hex HMAC-SHA256 over the canonical JSON form of `data`.
fn sign(secret: &str, data: &Value) -> Result<String, AdapterError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| AdapterError::new("webhook secret is not a usable hmac key"))?;
    mac.update(canonical_json(data).as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// JSON serialization with object keys sorted at every depth, so both sides
/// of a webhook can agree on the signed bytes.
fn canonical_json(value: &Value) -> String {
    fn canonicalize(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let sorted: std::collections::BTreeMap<&String, Value> =
                    map.iter().map(|(k, v)| (k, canonicalize(v))).collect();
                serde_json::to_value(sorted).unwrap_or(Value::Null)
            }
            Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
            other => other.clone(),
        }
    }
    canonicalize(value).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_keys_recursively() {
        let a = json!({"b": 1, "a": {"z": true, "y": [ {"k2": 1, "k1": 2} ]}});
        let b = json!({"a": {"y": [ {"k1": 2, "k2": 1} ], "z": true}, "b": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(
            canonical_json(&json!({"b": 1, "a": 2})),
            r#"{"a":2,"b":1}"#
        );
    }

    #[test]
    fn signature_is_stable_across_key_order() {
        let a = sign("s3cret", &json!({"x": 1, "y": 2})).unwrap();
        let b = sign("s3cret", &json!({"y": 2, "x": 1})).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64); // hex sha256
    }

    #[test]
    fn different_secret_different_signature() {
        let data = json!({"x": 1});
        assert_ne!(sign("one", &data).unwrap(), sign("two", &data).unwrap());
    }
}
