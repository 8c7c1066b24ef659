//! Error types for the gateway
//!
//! Every terminal failure a caller can observe is a [`GatewayError`]. The
//! enum is `Clone` because failed operations are stored in the idempotency
//! cache and replayed verbatim to retries.

use serde::{Deserialize, Serialize};

/// Main error type for gateway operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("Document {document_id} is locked by another operation")]
    AlreadyLocked { document_id: String },

    #[error("Lock on document {document_id} is held by a different token")]
    TokenMismatch { document_id: String },

    #[error("Dependency unavailable: {0}")]
    DependencyUnavailable(String),

    #[error("Register queue is full")]
    QueueFull,

    #[error("Timed out waiting for a register slot")]
    QueueWaitTimeout,

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Operation for idempotency key {key} is still in progress")]
    StillInProgress { key: String },

    #[error("Idempotency key {key} was already used for a different request")]
    IdempotencyKeyReused { key: String },

    #[error("Gateway is shutting down")]
    ShuttingDown,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error taxonomy exposed to the HTTP layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Another operation holds the document; retry later
    Conflict,
    /// Admission limits reached; back off
    Overload,
    /// The upstream dependency failed or is unavailable
    Dependency,
    /// The request itself is unusable as sent
    Client,
    Internal,
}

impl GatewayError {
    /// Classify the error
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::AlreadyLocked { .. } | Self::TokenMismatch { .. } => ErrorClass::Conflict,
            Self::StillInProgress { .. } => ErrorClass::Conflict,
            Self::QueueFull | Self::QueueWaitTimeout | Self::ShuttingDown => ErrorClass::Overload,
            Self::DependencyUnavailable(_) | Self::Upstream(_) => ErrorClass::Dependency,
            Self::IdempotencyKeyReused { .. } => ErrorClass::Client,
            Self::Config(_) | Self::Internal(_) => ErrorClass::Internal,
        }
    }

    /// Whether the same request may succeed if retried later
    pub fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Conflict | ErrorClass::Overload)
    }

    /// HTTP status code the transport layer should answer with
    pub fn status_code(&self) -> u16 {
        match self {
            Self::AlreadyLocked { .. } | Self::TokenMismatch { .. } => 409,
            Self::StillInProgress { .. } => 409,
            Self::QueueFull | Self::QueueWaitTimeout | Self::ShuttingDown => 503,
            Self::DependencyUnavailable(_) => 503,
            Self::Upstream(_) => 502,
            Self::IdempotencyKeyReused { .. } => 422,
            Self::Config(_) | Self::Internal(_) => 500,
        }
    }
}

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;
