//! Networked key/value storage over a Redis-compatible REST API.
//!
//! Speaks the Upstash-style protocol: each command is a JSON array POSTed
//! to the base URL with a bearer token, and the reply is
//! `{"result": ...}` on success or `{"error": "..."}` on failure.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;
use tandem_core::error::StorageError;
use tandem_core::storage::StorageProvider;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct KvRestStorage {
    client: reqwest::Client,
    url: String,
    token: String,
}

#[derive(Deserialize)]
struct CommandReply {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<String>,
}

impl KvRestStorage {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Result<Self, StorageError> {
        let url = url.into().trim().trim_end_matches('/').to_string();
        let token = token.into();

        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(StorageError::Unavailable(format!(
                "KV REST URL must start with http:// or https://, got '{url}'"
            )));
        }
        if token.trim().is_empty() {
            return Err(StorageError::Unavailable("KV REST token is empty".into()));
        }

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| StorageError::Unavailable(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { client, url, token })
    }

    /// Run one command and return its `result` value.
    async fn command(&self, args: Value) -> Result<Value, StorageError> {
        let op = args
            .get(0)
            .and_then(Value::as_str)
            .unwrap_or("?")
            .to_string();
        debug!(op = %op, "KV command");

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.token)
            .json(&args)
            .send()
            .await
            .map_err(|e| StorageError::Unavailable(format!("{op}: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| StorageError::Unavailable(format!("{op}: {e}")))?;

        let reply: Option<CommandReply> = serde_json::from_str(&body).ok();
        if let Some(error) = reply.as_ref().and_then(|r| r.error.clone()) {
            return Err(StorageError::Backend(format!("{op}: {error}")));
        }
        if !status.is_success() {
            return Err(StorageError::Backend(format!(
                "{op}: HTTP {}: {body}",
                status.as_u16()
            )));
        }

        reply
            .map(|r| r.result)
            .ok_or_else(|| StorageError::Serialization(format!("{op}: unexpected reply '{body}'")))
    }
}

#[async_trait]
impl StorageProvider for KvRestStorage {
    fn name(&self) -> &str {
        "kv"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        match self.command(json!(["GET", key])).await? {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(s)),
            other => Err(StorageError::Serialization(format!(
                "GET returned a non-string value: {other}"
            ))),
        }
    }

    async fn set(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<(), StorageError> {
        let args = match ttl {
            Some(ttl) => {
                let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
                json!(["SET", key, value, "PX", millis])
            }
            None => json!(["SET", key, value]),
        };
        self.command(args).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.command(json!(["DEL", key])).await?;
        Ok(())
    }
}
