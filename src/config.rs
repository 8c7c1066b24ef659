//! Configuration for the gateway
//!
//! CLI arguments and environment variable handling using clap. Every
//! reliability knob is a positive integer; zero is rejected at startup.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

use crate::types::{GatewayError, Result};

/// Default upstream endpoint for registering a PDF
pub const DEFAULT_REGISTER_PDF_URL: &str =
    "https://padsign.trustlynx.com/archive/api/document/create";

/// Padsign gateway - admission-controlled PDF registration
#[derive(Parser, Debug, Clone)]
#[command(name = "padsign-gateway")]
#[command(about = "Register a PDF with the upstream signing service through the gateway")]
pub struct Args {
    /// Per-attempt upstream timeout in milliseconds
    #[arg(long, env = "REGISTER_PDF_UPSTREAM_TIMEOUT_MS", default_value = "15000")]
    pub upstream_timeout_ms: u64,

    /// Retries after the first attempt on transient upstream failures
    #[arg(long, env = "REGISTER_PDF_UPSTREAM_RETRIES", default_value = "2")]
    pub upstream_retries: u32,

    /// Linear backoff step between retry attempts in milliseconds
    #[arg(long, env = "REGISTER_PDF_RETRY_BACKOFF_MS", default_value = "250")]
    pub retry_backoff_ms: u64,

    /// Maximum concurrently executing upstream calls
    #[arg(long, env = "REGISTER_PDF_MAX_CONCURRENCY", default_value = "4")]
    pub max_concurrency: usize,

    /// Maximum callers waiting for an execution slot
    #[arg(long, env = "REGISTER_PDF_QUEUE_MAX_SIZE", default_value = "32")]
    pub queue_max_size: usize,

    /// Maximum time a caller waits for an execution slot in milliseconds
    #[arg(long, env = "REGISTER_PDF_QUEUE_WAIT_MS", default_value = "10000")]
    pub queue_wait_ms: u64,

    /// Consecutive upstream failures that open the circuit breaker
    #[arg(long, env = "DEPENDENCY_CB_FAILURE_THRESHOLD", default_value = "5")]
    pub cb_failure_threshold: u32,

    /// Time the breaker stays open before allowing a probe, in milliseconds
    #[arg(long, env = "DEPENDENCY_CB_COOLDOWN_MS", default_value = "30000")]
    pub cb_cooldown_ms: u64,

    /// Retention of completed/failed idempotency records in milliseconds
    #[arg(long, env = "IDEMPOTENCY_TTL_MS", default_value = "600000")]
    pub idempotency_ttl_ms: u64,

    /// Default document operation lock TTL in milliseconds
    #[arg(long, env = "DOC_OPERATION_LOCK_TTL_MS", default_value = "60000")]
    pub doc_lock_ttl_ms: u64,

    /// User entry TTL in milliseconds
    #[arg(long, env = "USER_ENTRY_TTL_MS", default_value = "3600000")]
    pub user_entry_ttl_ms: u64,

    /// User state cleanup interval in milliseconds
    #[arg(long, env = "USER_STATE_CLEANUP_MS", default_value = "60000")]
    pub user_cleanup_ms: u64,

    /// Sweep interval for the lock and idempotency tables in milliseconds
    #[arg(long, env = "TTL_SWEEP_INTERVAL_MS", default_value = "30000")]
    pub sweep_interval_ms: u64,

    /// Time allowed for in-flight calls to drain on shutdown, in milliseconds
    #[arg(long, env = "SHUTDOWN_GRACE_MS", default_value = "10000")]
    pub shutdown_grace_ms: u64,

    /// Upstream endpoint that registers a PDF for signing
    #[arg(long, env = "REGISTER_PDF_URL", default_value = DEFAULT_REGISTER_PDF_URL)]
    pub register_pdf_url: String,

    /// API key sent to the register endpoint
    #[arg(long, env = "REGISTER_PDF_API_KEY")]
    pub register_pdf_api_key: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format (text or json)
    #[arg(long, env = "LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    /// Optional JSONL audit log of gateway outcomes
    #[arg(long, env = "AUDIT_LOG_PATH")]
    pub audit_log_path: Option<PathBuf>,

    /// Document to register
    #[arg(long)]
    pub document_id: String,

    /// Client idempotency key (defaults to a fresh UUID)
    #[arg(long)]
    pub idempotency_key: Option<String>,

    /// JSON file holding the register payload
    #[arg(long)]
    pub payload_file: PathBuf,
}

impl Args {
    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        let positive: [(&str, u64); 14] = [
            ("REGISTER_PDF_UPSTREAM_TIMEOUT_MS", self.upstream_timeout_ms),
            ("REGISTER_PDF_UPSTREAM_RETRIES", self.upstream_retries as u64),
            ("REGISTER_PDF_RETRY_BACKOFF_MS", self.retry_backoff_ms),
            ("REGISTER_PDF_MAX_CONCURRENCY", self.max_concurrency as u64),
            ("REGISTER_PDF_QUEUE_MAX_SIZE", self.queue_max_size as u64),
            ("REGISTER_PDF_QUEUE_WAIT_MS", self.queue_wait_ms),
            ("DEPENDENCY_CB_FAILURE_THRESHOLD", self.cb_failure_threshold as u64),
            ("DEPENDENCY_CB_COOLDOWN_MS", self.cb_cooldown_ms),
            ("IDEMPOTENCY_TTL_MS", self.idempotency_ttl_ms),
            ("DOC_OPERATION_LOCK_TTL_MS", self.doc_lock_ttl_ms),
            ("USER_ENTRY_TTL_MS", self.user_entry_ttl_ms),
            ("USER_STATE_CLEANUP_MS", self.user_cleanup_ms),
            ("TTL_SWEEP_INTERVAL_MS", self.sweep_interval_ms),
            ("SHUTDOWN_GRACE_MS", self.shutdown_grace_ms),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(format!("{} must be a positive integer", name));
        }

        if self.register_pdf_api_key.as_deref().map_or(true, str::is_empty) {
            return Err("REGISTER_PDF_API_KEY is required".to_string());
        }

        if !self.register_pdf_url.starts_with("http://")
            && !self.register_pdf_url.starts_with("https://")
        {
            return Err("REGISTER_PDF_URL must be an http(s) URL".to_string());
        }

        if self.log_format != "text" && self.log_format != "json" {
            return Err("LOG_FORMAT must be 'text' or 'json'".to_string());
        }

        self.gateway_config().validate().map_err(|e| e.to_string())
    }

    /// Build the gateway core configuration
    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            upstream_timeout: Duration::from_millis(self.upstream_timeout_ms),
            upstream_retries: self.upstream_retries,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            max_concurrency: self.max_concurrency,
            queue_max_size: self.queue_max_size,
            queue_wait: Duration::from_millis(self.queue_wait_ms),
            cb_failure_threshold: self.cb_failure_threshold,
            cb_cooldown: Duration::from_millis(self.cb_cooldown_ms),
            idempotency_ttl: Duration::from_millis(self.idempotency_ttl_ms),
            doc_lock_ttl: Duration::from_millis(self.doc_lock_ttl_ms),
            user_entry_ttl: Duration::from_millis(self.user_entry_ttl_ms),
            user_cleanup_interval: Duration::from_millis(self.user_cleanup_ms),
            sweep_interval: Duration::from_millis(self.sweep_interval_ms),
        }
    }

    /// Build the HTTP upstream configuration
    pub fn upstream_config(&self) -> UpstreamConfig {
        UpstreamConfig {
            register_pdf_url: self.register_pdf_url.clone(),
            api_key: self.register_pdf_api_key.clone().unwrap_or_default(),
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Reliability settings consumed by the gateway core
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub upstream_timeout: Duration,
    /// Retries after the first attempt
    pub upstream_retries: u32,
    pub retry_backoff: Duration,
    pub max_concurrency: usize,
    pub queue_max_size: usize,
    pub queue_wait: Duration,
    pub cb_failure_threshold: u32,
    pub cb_cooldown: Duration,
    pub idempotency_ttl: Duration,
    pub doc_lock_ttl: Duration,
    pub user_entry_ttl: Duration,
    pub user_cleanup_interval: Duration,
    pub sweep_interval: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            upstream_timeout: Duration::from_millis(15_000),
            upstream_retries: 2,
            retry_backoff: Duration::from_millis(250),
            max_concurrency: 4,
            queue_max_size: 32,
            queue_wait: Duration::from_millis(10_000),
            cb_failure_threshold: 5,
            cb_cooldown: Duration::from_millis(30_000),
            idempotency_ttl: Duration::from_millis(600_000),
            doc_lock_ttl: Duration::from_millis(60_000),
            user_entry_ttl: Duration::from_millis(3_600_000),
            user_cleanup_interval: Duration::from_millis(60_000),
            sweep_interval: Duration::from_millis(30_000),
        }
    }
}

impl GatewayConfig {
    /// Reject non-positive values
    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("upstream_timeout", self.upstream_timeout),
            ("queue_wait", self.queue_wait),
            ("cb_cooldown", self.cb_cooldown),
            ("idempotency_ttl", self.idempotency_ttl),
            ("doc_lock_ttl", self.doc_lock_ttl),
            ("user_entry_ttl", self.user_entry_ttl),
            ("user_cleanup_interval", self.user_cleanup_interval),
            ("sweep_interval", self.sweep_interval),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, d)| d.is_zero()) {
            return Err(GatewayError::Config(format!("{} must be positive", name)));
        }
        if self.max_concurrency == 0 {
            return Err(GatewayError::Config("max_concurrency must be positive".into()));
        }
        if self.queue_max_size == 0 {
            return Err(GatewayError::Config("queue_max_size must be positive".into()));
        }
        if self.cb_failure_threshold == 0 {
            return Err(GatewayError::Config(
                "cb_failure_threshold must be positive".into(),
            ));
        }
        if self.upstream_retries == 0 {
            return Err(GatewayError::Config("upstream_retries must be positive".into()));
        }
        if self.checked_operation_budget().is_none() {
            return Err(GatewayError::Config(
                "upstream timeout, retries and backoff overflow the operation budget".into(),
            ));
        }
        Ok(())
    }

    /// Total attempts per request (first call plus retries)
    pub fn max_attempts(&self) -> u32 {
        self.upstream_retries.saturating_add(1)
    }

    /// Worst-case wall time of one register operation once admitted to the
    /// queue: the slot wait plus every attempt and its backoff.
    ///
    /// Saturates at `Duration::MAX`; [`GatewayConfig::validate`] rejects
    /// configurations where that happens.
    pub fn operation_budget(&self) -> Duration {
        self.checked_operation_budget().unwrap_or(Duration::MAX)
    }

    fn checked_operation_budget(&self) -> Option<Duration> {
        let attempts = self.max_attempts();
        let per_attempt = self
            .upstream_timeout
            .checked_add(self.retry_backoff.checked_mul(attempts)?)?;
        self.queue_wait.checked_add(per_attempt.checked_mul(attempts)?)
    }

    /// Lock TTL used for register operations
    pub fn register_lock_ttl(&self) -> Duration {
        let budget = self.operation_budget();
        if self.doc_lock_ttl < budget {
            warn!(
                configured_ms = self.doc_lock_ttl.as_millis() as u64,
                budget_ms = budget.as_millis() as u64,
                "DOC_OPERATION_LOCK_TTL_MS is shorter than the register budget, using the budget"
            );
            budget
        } else {
            self.doc_lock_ttl
        }
    }
}

/// HTTP upstream settings
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub register_pdf_url: String,
    pub api_key: String,
}
