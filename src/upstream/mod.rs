//! Upstream signing service integration
//!
//! The gateway core only knows the [`UpstreamCaller`] capability; the
//! concrete transport lives in [`http`].

pub mod http;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

pub use http::HttpUpstream;

/// Failure reported by an upstream call
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream call timed out")]
    Timeout,

    /// The upstream answered and refused the request (4xx-equivalent)
    #[error("upstream rejected the request: {0}")]
    Rejected(String),

    /// Network failure or 5xx-equivalent answer
    #[error("transient upstream failure: {0}")]
    Transient(String),

    #[error("permanent upstream failure: {0}")]
    Permanent(String),
}

impl UpstreamError {
    /// Worth retrying, and evidence that the dependency is unhealthy
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::Transient(_))
    }
}

/// Capability to register a PDF with the upstream signing service
#[async_trait]
pub trait UpstreamCaller: Send + Sync {
    /// Register `document_id` with `payload`. Implementations should honour
    /// `timeout`; the gateway enforces it regardless.
    async fn register_pdf(
        &self,
        document_id: &str,
        payload: &JsonValue,
        timeout: Duration,
    ) -> Result<JsonValue, UpstreamError>;
}
