//! Register-PDF gateway
//!
//! Owns every piece of process-wide protection state (document locks,
//! idempotency records, the circuit breaker, the admission queue and the
//! user store) and sequences them in front of the upstream caller.
//!
//! ```text
//! register_document
//!   │
//!   ├─ LockDocument      AlreadyLocked ──────────────▶ caller (retry later)
//!   ├─ CheckIdempotency  Completed/Failed ───────────▶ stored result
//!   ├─ CheckBreaker      Open ───────────────────────▶ DependencyUnavailable
//!   ├─ Admit             QueueFull/QueueWaitTimeout ─▶ caller (back off)
//!   ├─ CallUpstream      timeout + retries, breaker updated per attempt
//!   └─ Finalize          record outcome, release lock
//! ```
//!
//! The gateway is constructed explicitly and shared by reference (usually
//! behind an `Arc`); nothing here is global. State is in memory only, so
//! idempotency guarantees do not survive a restart.

mod register;

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::GatewayConfig;
use crate::guard::{
    AdmissionConfig, AdmissionQueue, AdmissionStats, BreakerConfig, BreakerState, CircuitBreaker,
    DocumentLocks, IdempotencyCache, IdempotencyStats, LockToken,
};
use crate::logging::AuditLogger;
use crate::store::{UserStateStore, UserStoreStats};
use crate::types::{GatewayError, Result};
use crate::upstream::UpstreamCaller;

/// Result of a successful registration, replayed verbatim for retries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterReceipt {
    pub document_id: String,
    /// Upstream response body
    pub response: JsonValue,
    /// Upstream attempts it took
    pub attempts: u32,
    pub registered_at: DateTime<Utc>,
}

/// Admission-controlled, fault-tolerant gateway to the register endpoint
pub struct RegisterPdfGateway {
    config: GatewayConfig,
    register_lock_ttl: Duration,
    locks: DocumentLocks,
    idempotency: IdempotencyCache<RegisterReceipt>,
    breaker: CircuitBreaker,
    queue: AdmissionQueue,
    users: UserStateStore,
    upstream: Arc<dyn UpstreamCaller>,
    audit: AuditLogger,
    maintenance: Mutex<Vec<JoinHandle<()>>>,
    /// `register_document` calls between entry and their audit record
    active: AtomicUsize,
    /// Signalled whenever an active call finishes
    idle: Notify,
    closing: AtomicBool,
}

/// Counts one `register_document` call for the duration of the call
struct ActiveRequest<'a>(&'a RegisterPdfGateway);

impl Drop for ActiveRequest<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
        self.0.idle.notify_waiters();
    }
}

impl RegisterPdfGateway {
    /// Build a gateway; fails on non-positive configuration values
    pub fn new(config: GatewayConfig, upstream: Arc<dyn UpstreamCaller>) -> Result<Self> {
        config.validate()?;

        let register_lock_ttl = config.register_lock_ttl();
        let budget = config.operation_budget();

        Ok(Self {
            register_lock_ttl,
            locks: DocumentLocks::new(config.doc_lock_ttl),
            idempotency: IdempotencyCache::new(config.idempotency_ttl, budget),
            breaker: CircuitBreaker::new(
                "register_pdf",
                BreakerConfig {
                    failure_threshold: config.cb_failure_threshold,
                    cooldown: config.cb_cooldown,
                },
            ),
            queue: AdmissionQueue::new(AdmissionConfig {
                max_concurrency: config.max_concurrency,
                max_waiting: config.queue_max_size,
                max_wait: config.queue_wait,
            }),
            users: UserStateStore::new(config.user_entry_ttl, config.user_cleanup_interval),
            upstream,
            audit: AuditLogger::new(),
            maintenance: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            idle: Notify::new(),
            closing: AtomicBool::new(false),
            config,
        })
    }

    /// Use `audit` for outcome records
    pub fn with_audit(mut self, audit: AuditLogger) -> Self {
        self.audit = audit;
        self
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn locks(&self) -> &DocumentLocks {
        &self.locks
    }

    pub fn users(&self) -> &UserStateStore {
        &self.users
    }

    /// Run a sibling document operation (stamping, visual signature,
    /// archival, form fill) under the document lock with the default TTL.
    ///
    /// The operation receives the lock token so it can call
    /// [`RegisterPdfGateway::renew_lock`] if it may outlive the TTL. The lock
    /// is released on every path, including cancellation.
    pub async fn run_exclusive<F, Fut, T>(&self, document_id: &str, operation: F) -> Result<T>
    where
        F: FnOnce(LockToken) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let lock = self.locks.lock(document_id, self.locks.default_ttl())?;
        let result = operation(lock.token()).await;
        if let Err(e) = lock.release() {
            warn!(document_id = document_id, error = %e, "Document lock was reclaimed during operation");
        }
        result
    }

    /// Extend a held document lock
    pub fn renew_lock(&self, document_id: &str, token: LockToken, ttl: Duration) -> Result<()> {
        self.locks.renew(document_id, token, ttl)
    }

    /// Start the background sweepers. Calling twice is a no-op.
    pub fn spawn_maintenance(&self) {
        let mut tasks = self
            .maintenance
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !tasks.is_empty() {
            return;
        }
        tasks.push(self.locks.spawn_sweeper(self.config.sweep_interval));
        tasks.push(self.idempotency.spawn_sweeper(self.config.sweep_interval));
        tasks.push(self.users.spawn_cleanup_task());
        info!(tasks = tasks.len(), "Gateway maintenance tasks started");
    }

    /// Refuse new register calls, wait up to `grace` for the ones already
    /// running to finish, then stop the sweepers. Returns whether
    /// everything drained.
    ///
    /// Calls past the shutdown point but not yet admitted to the queue fail
    /// with `ShuttingDown`; calls already running upstream finish normally.
    /// `run_exclusive` operations are not tracked.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        info!(grace_ms = grace.as_millis() as u64, "Gateway shutting down");
        let deadline = tokio::time::Instant::now() + grace;
        self.closing.store(true, Ordering::SeqCst);
        self.queue.close();

        let drained = self.wait_idle(deadline).await
            && self
                .queue
                .drain(deadline.saturating_duration_since(tokio::time::Instant::now()))
                .await;
        if !drained {
            warn!(
                active = self.active.load(Ordering::SeqCst),
                running = self.queue.running(),
                "Shutdown grace elapsed with register calls still running"
            );
        }

        let tasks = std::mem::take(
            &mut *self
                .maintenance
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for task in tasks {
            task.abort();
        }
        info!("Gateway stopped");
        drained
    }

    /// Register the caller as active. Fails once shutdown has begun.
    fn enter(&self) -> Result<ActiveRequest<'_>> {
        // Count first so shutdown either sees this call or we see `closing`
        self.active.fetch_add(1, Ordering::SeqCst);
        let active = ActiveRequest(self);
        if self.closing.load(Ordering::SeqCst) {
            return Err(GatewayError::ShuttingDown);
        }
        Ok(active)
    }

    async fn wait_idle(&self, deadline: tokio::time::Instant) -> bool {
        loop {
            let idle = self.idle.notified();
            if self.active.load(Ordering::SeqCst) == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, idle).await.is_err() {
                return self.active.load(Ordering::SeqCst) == 0;
            }
        }
    }

    pub fn stats(&self) -> GatewayStats {
        GatewayStats {
            breaker_state: self.breaker.state(),
            consecutive_failures: self.breaker.consecutive_failures(),
            active_requests: self.active.load(Ordering::SeqCst),
            queue: self.queue.stats(),
            locks_held: self.locks.held_count(),
            idempotency: self.idempotency.stats(),
            users: self.users.stats(),
        }
    }
}

/// Snapshot of gateway state
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStats {
    pub breaker_state: BreakerState,
    pub consecutive_failures: u32,
    /// Register calls in progress, queued or not
    pub active_requests: usize,
    pub queue: AdmissionStats,
    pub locks_held: usize,
    pub idempotency: IdempotencyStats,
    pub users: UserStoreStats,
}
