//! Padsign gateway - register a PDF through the protected upstream path

use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};

use padsign_gateway::{
    config::Args,
    logging::{self, AuditLogger},
    HttpUpstream, RegisterPdfGateway,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    logging::init(&args.log_level, args.log_format == "json");

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    let config = args.gateway_config();

    info!("======================================");
    info!("  Padsign Gateway");
    info!("======================================");
    info!("Register URL: {}", args.register_pdf_url);
    info!(
        "Upstream: timeout {}ms, {} attempt(s), backoff {}ms",
        args.upstream_timeout_ms,
        config.max_attempts(),
        args.retry_backoff_ms
    );
    info!(
        "Queue: {} running, {} waiting, wait {}ms",
        args.max_concurrency, args.queue_max_size, args.queue_wait_ms
    );
    info!(
        "Breaker: threshold {}, cooldown {}ms",
        args.cb_failure_threshold, args.cb_cooldown_ms
    );
    info!(
        "Operation budget: {}ms",
        config.operation_budget().as_millis()
    );
    info!("======================================");

    let audit = match &args.audit_log_path {
        Some(path) => AuditLogger::to_file(path.clone())
            .with_context(|| format!("Failed to open audit log {}", path.display()))?,
        None => AuditLogger::new(),
    };

    let upstream = Arc::new(HttpUpstream::new(args.upstream_config())?);
    let gateway = RegisterPdfGateway::new(config, upstream)?.with_audit(audit);
    gateway.spawn_maintenance();

    let raw = std::fs::read(&args.payload_file)
        .with_context(|| format!("Failed to read payload {}", args.payload_file.display()))?;
    let payload: serde_json::Value =
        serde_json::from_slice(&raw).context("Payload is not valid JSON")?;
    let key = args
        .idempotency_key
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    info!(document_id = %args.document_id, idempotency_key = %key, "Registering document");
    let result = gateway
        .register_document(&args.document_id, &key, payload)
        .await;

    gateway.shutdown(args.shutdown_grace()).await;

    match result {
        Ok(receipt) => {
            println!("{}", serde_json::to_string_pretty(&receipt)?);
            Ok(())
        }
        Err(e) => {
            error!(
                class = ?e.class(),
                status = e.status_code(),
                retryable = e.is_retryable(),
                "Register failed: {}",
                e
            );
            std::process::exit(1);
        }
    }
}
