// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{SendError, Sink};
use crate::config::options::{value_or_default, OptionSpec};
use crate::error::ConfigError;
use crate::record::Batch;

pub const SINK_TYPE: &str = "http";
pub const KEY_HTTP_SENDER_URL: &str = "http_sender_url";
pub const KEY_HTTP_SENDER_TIMEOUT_SECS: &str = "http_sender_timeout_secs";

pub static HTTP_OPTIONS: &[OptionSpec] = &[
    OptionSpec::new(
        KEY_HTTP_SENDER_URL,
        "",
        "Endpoint the batches are POSTed to as a JSON array (http_sender_url)",
    )
    .with_check(r"https?://\S+")
    .required(),
    OptionSpec::numeric(
        KEY_HTTP_SENDER_TIMEOUT_SECS,
        "30",
        "Request timeout in seconds (http_sender_timeout_secs)",
    ),
];

/// POSTs every batch as a JSON array of records.
#[derive(Debug, Clone)]
pub struct HttpSink {
    url: String,
    client: reqwest::Client,
}

impl HttpSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, ConfigError> {
        let url = url.into();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConfigError::InvalidOption {
                key: KEY_HTTP_SENDER_URL.to_string(),
                value: url.clone(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(HttpSink { url, client })
    }
}

#[async_trait]
impl Sink for HttpSink {
    fn name(&self) -> &str {
        SINK_TYPE
    }

    async fn send(&self, batch: &Batch) -> Result<(), SendError> {
        let body = serde_json::to_vec(batch.records())
            .map_err(|e| SendError::Fatal(format!("failed to encode batch: {e}")))?;

        let response = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| SendError::Retryable(format!("request to {} failed: {e}", self.url)))?;

        let status = response.status();
        if status.is_success() {
            debug!("HTTP | Sent {} records to {}", batch.len(), self.url);
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify(status, &body))
    }
}

/// 429 and 5xx are worth retrying, any other 4xx never succeeds.
fn classify(status: StatusCode, body: &str) -> SendError {
    let message = format!("{status}: {body}");
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        SendError::Retryable(message)
    } else if status.is_client_error() {
        SendError::Fatal(message)
    } else {
        SendError::Unclassified(message)
    }
}

pub(crate) fn build(options: &HashMap<String, String>) -> Result<Arc<dyn Sink>, ConfigError> {
    let url = value_or_default(options, &HTTP_OPTIONS[0]);
    let timeout_spec = &HTTP_OPTIONS[1];
    let raw_timeout = value_or_default(options, timeout_spec);
    let timeout: u64 = raw_timeout.parse().map_err(|_| ConfigError::InvalidOption {
        key: KEY_HTTP_SENDER_TIMEOUT_SECS.to_string(),
        value: raw_timeout.to_string(),
        reason: "not a valid number".to_string(),
    })?;
    Ok(Arc::new(HttpSink::new(url, Duration::from_secs(timeout))?))
}
