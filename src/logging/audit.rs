//! Audit trail of gateway outcomes
//!
//! One JSONL line per terminal register outcome. Without a file the events
//! are only emitted through `tracing`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::types::{ErrorClass, GatewayError};

/// Terminal outcome of a gateway request
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    /// Upstream call succeeded
    Registered,
    /// Stored result returned without calling upstream
    Replayed,
    /// Request ran and failed
    Failed,
    /// Request refused before reaching upstream (conflict, overload)
    Rejected,
}

/// One audit record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub operation: String,
    pub document_id: String,
    pub idempotency_key: Option<String>,
    pub outcome: AuditOutcome,
    /// Upstream attempts made by this request
    pub attempts: u32,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_class: Option<ErrorClass>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuditEvent {
    pub fn new(operation: &str, document_id: &str, outcome: AuditOutcome) -> Self {
        Self {
            timestamp: Utc::now(),
            operation: operation.to_string(),
            document_id: document_id.to_string(),
            idempotency_key: None,
            outcome,
            attempts: 0,
            duration_ms: 0,
            error_class: None,
            error: None,
        }
    }

    pub fn with_key(mut self, key: &str) -> Self {
        self.idempotency_key = Some(key.to_string());
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn with_error(mut self, err: &GatewayError) -> Self {
        self.error_class = Some(err.class());
        self.error = Some(err.to_string());
        self
    }

    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Audit logger writing JSONL events
#[derive(Clone, Default)]
pub struct AuditLogger {
    inner: Arc<Mutex<Option<BufWriter<File>>>>,
}

impl AuditLogger {
    /// Logger that only emits tracing events
    pub fn new() -> Self {
        Self::default()
    }

    /// Logger appending to `path`
    pub fn to_file(path: PathBuf) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        info!("Audit logging initialized to {}", path.display());
        Ok(Self {
            inner: Arc::new(Mutex::new(Some(BufWriter::new(file)))),
        })
    }

    pub async fn log(&self, event: AuditEvent) {
        info!(
            target: "padsign_gateway::audit",
            operation = %event.operation,
            document_id = %event.document_id,
            outcome = ?event.outcome,
            attempts = event.attempts,
            duration_ms = event.duration_ms,
            error = event.error.as_deref().unwrap_or(""),
            "Gateway outcome"
        );

        let mut inner = self.inner.lock().await;
        let Some(writer) = inner.as_mut() else {
            return;
        };

        let line = match event.to_jsonl() {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to serialize audit event: {}", e);
                return;
            }
        };
        if let Err(e) = writeln!(writer, "{}", line) {
            error!("Failed to write audit event: {}", e);
        }
        if let Err(e) = writer.flush() {
            error!("Failed to flush audit log: {}", e);
        }
    }
}
