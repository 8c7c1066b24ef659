//! HTTP client for the register-PDF endpoint

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use tracing::debug;

use super::{UpstreamCaller, UpstreamError};
use crate::config::UpstreamConfig;
use crate::types::{GatewayError, Result};

/// Header carrying the register API key
pub const API_KEY_HEADER: &str = "x-api-key";

/// Longest upstream error body kept in error messages
const MAX_ERROR_BODY: usize = 512;

/// Calls the upstream register endpoint over HTTPS
pub struct HttpUpstream {
    client: reqwest::Client,
    config: UpstreamConfig,
}

impl HttpUpstream {
    pub fn new(config: UpstreamConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("padsign-gateway/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| GatewayError::Config(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    /// Register URL for a document; `{docid}` in the configured URL is
    /// replaced with the document id
    pub fn register_url(&self, document_id: &str) -> String {
        self.config.register_pdf_url.replace("{docid}", document_id)
    }
}

/// Request body: the caller payload with `documentId` filled in when the
/// payload is an object that does not carry one
pub fn register_body(document_id: &str, payload: &JsonValue) -> JsonValue {
    let mut body = payload.clone();
    if let Some(obj) = body.as_object_mut() {
        obj.entry("documentId")
            .or_insert_with(|| JsonValue::String(document_id.to_string()));
    }
    body
}

/// Map an HTTP status to the upstream error taxonomy
pub fn classify_status(status: StatusCode, body: &str) -> UpstreamError {
    let mut detail = format!("HTTP {}", status.as_u16());
    if !body.is_empty() {
        let end = body
            .char_indices()
            .nth(MAX_ERROR_BODY)
            .map_or(body.len(), |(i, _)| i);
        detail.push_str(": ");
        detail.push_str(&body[..end]);
    }

    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        UpstreamError::Transient(detail)
    } else if status.is_client_error() {
        UpstreamError::Rejected(detail)
    } else {
        UpstreamError::Permanent(detail)
    }
}

fn classify_transport(err: reqwest::Error) -> UpstreamError {
    if err.is_timeout() {
        UpstreamError::Timeout
    } else if err.is_connect() || err.is_request() || err.is_body() {
        UpstreamError::Transient(err.to_string())
    } else {
        UpstreamError::Permanent(err.to_string())
    }
}

#[async_trait]
impl UpstreamCaller for HttpUpstream {
    async fn register_pdf(
        &self,
        document_id: &str,
        payload: &JsonValue,
        timeout: Duration,
    ) -> std::result::Result<JsonValue, UpstreamError> {
        let url = self.register_url(document_id);
        debug!(document_id = document_id, url = %url, "Calling register endpoint");

        let response = self
            .client
            .post(&url)
            .header(API_KEY_HEADER, &self.config.api_key)
            .timeout(timeout)
            .json(&register_body(document_id, payload))
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        let body = response.bytes().await.map_err(classify_transport)?;

        if !status.is_success() {
            return Err(classify_status(status, &String::from_utf8_lossy(&body)));
        }
        if body.is_empty() {
            return Ok(JsonValue::Null);
        }
        serde_json::from_slice(&body)
            .map_err(|e| UpstreamError::Permanent(format!("Invalid register response: {}", e)))
    }
}
