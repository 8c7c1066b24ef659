//! Register-PDF request flow

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use chrono::Utc;
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use super::{RegisterPdfGateway, RegisterReceipt};
use crate::guard::{request_fingerprint, Begin};
use crate::logging::{AuditEvent, AuditOutcome};
use crate::types::{ErrorClass, GatewayError, Result};
use crate::upstream::UpstreamError;

const OPERATION: &str = "register_pdf";

/// What a register request did, for the audit trail
struct Settled {
    result: Result<RegisterReceipt>,
    outcome: AuditOutcome,
    attempts: u32,
}

impl Settled {
    fn rejected(error: GatewayError) -> Self {
        Self {
            result: Err(error),
            outcome: AuditOutcome::Rejected,
            attempts: 0,
        }
    }

    fn replayed(result: Result<RegisterReceipt>) -> Self {
        Self {
            result,
            outcome: AuditOutcome::Replayed,
            attempts: 0,
        }
    }
}

impl RegisterPdfGateway {
    /// Register a PDF with the upstream service.
    ///
    /// Holds the document lock for the whole call. A key that already has a
    /// terminal record is answered from the record without contacting
    /// upstream; a key whose first request is still running waits for that
    /// request's outcome.
    pub async fn register_document(
        &self,
        document_id: &str,
        idempotency_key: &str,
        payload: JsonValue,
    ) -> Result<RegisterReceipt> {
        let started = Instant::now();
        // Held until the audit record is written
        let active = self.enter();

        let settled = match &active {
            Ok(_) => {
                self.register_with_lock(document_id, idempotency_key, &payload)
                    .await
            }
            Err(e) => Settled::rejected(e.clone()),
        };

        let mut event = AuditEvent::new(OPERATION, document_id, settled.outcome)
            .with_key(idempotency_key)
            .with_attempts(settled.attempts)
            .with_duration(started.elapsed().as_millis() as u64);
        if let Err(e) = &settled.result {
            event = event.with_error(e);
        }
        self.audit.log(event).await;

        settled.result
    }

    async fn register_with_lock(
        &self,
        document_id: &str,
        idempotency_key: &str,
        payload: &JsonValue,
    ) -> Settled {
        let lock = match self.locks.lock(document_id, self.register_lock_ttl) {
            Ok(lock) => lock,
            Err(e) => {
                debug!(document_id = document_id, "Document busy");
                return Settled::rejected(e);
            }
        };

        let settled = self
            .register_locked(document_id, idempotency_key, payload)
            .await;
        if let Err(e) = lock.release() {
            warn!(
                document_id = document_id,
                error = %e,
                "Document lock was reclaimed before register finished"
            );
        }
        settled
    }

    async fn register_locked(
        &self,
        document_id: &str,
        idempotency_key: &str,
        payload: &JsonValue,
    ) -> Settled {
        let fingerprint = request_fingerprint(document_id, payload);
        let ticket = match self.idempotency.begin(idempotency_key, &fingerprint) {
            Ok(Begin::Fresh(ticket)) => ticket,
            Ok(Begin::Completed(receipt)) => return Settled::replayed(Ok(receipt)),
            Ok(Begin::Failed(error)) => return Settled::replayed(Err(error)),
            Ok(Begin::InProgress(in_flight)) => {
                debug!(key = idempotency_key, "Waiting for in-flight register");
                let result = in_flight.wait(self.config.operation_budget()).await;
                return match result {
                    Err(e @ GatewayError::StillInProgress { .. }) => Settled::rejected(e),
                    result => Settled::replayed(result),
                };
            }
            Err(e) => return Settled::rejected(e),
        };

        let attempts = AtomicU32::new(0);
        let result = match self.breaker.check() {
            Ok(()) => {
                self.queue
                    .submit(|| self.call_with_retries(document_id, payload, &attempts))
                    .await
            }
            Err(e) => Err(e),
        };
        let attempts = attempts.load(Ordering::Relaxed);

        let outcome = match &result {
            Ok(receipt) => {
                info!(
                    document_id = document_id,
                    attempts = attempts,
                    "PDF registered"
                );
                ticket.complete(receipt.clone());
                AuditOutcome::Registered
            }
            // Overload says nothing about the request; let the key be retried
            Err(e) if e.class() == ErrorClass::Overload => {
                ticket.withdraw(e.clone());
                AuditOutcome::Rejected
            }
            Err(e) => {
                warn!(document_id = document_id, attempts = attempts, error = %e, "Register failed");
                ticket.fail(e.clone());
                AuditOutcome::Failed
            }
        };

        Settled {
            result,
            outcome,
            attempts,
        }
    }

    /// Call upstream up to `max_attempts` times, each attempt bounded by the
    /// upstream timeout and admitted by the breaker.
    ///
    /// Only timeouts and transient failures are retried or counted against
    /// the breaker. An upstream that answers with a rejection is healthy.
    async fn call_with_retries(
        &self,
        document_id: &str,
        payload: &JsonValue,
        attempts: &AtomicU32,
    ) -> Result<RegisterReceipt> {
        let max_attempts = self.config.max_attempts();
        let timeout = self.config.upstream_timeout;
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            let permit = self.breaker.try_acquire()?;
            attempts.store(attempt, Ordering::Relaxed);

            let call = self.upstream.register_pdf(document_id, payload, timeout);
            let result = match tokio::time::timeout(timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(UpstreamError::Timeout),
            };

            match result {
                Ok(response) => {
                    permit.success();
                    return Ok(RegisterReceipt {
                        document_id: document_id.to_string(),
                        response,
                        attempts: attempt,
                        registered_at: Utc::now(),
                    });
                }
                Err(e) if e.is_transient() => {
                    permit.failure();
                    warn!(
                        document_id = document_id,
                        attempt = attempt,
                        max_attempts = max_attempts,
                        error = %e,
                        "Upstream attempt failed"
                    );
                    last_error = Some(e);
                    if attempt < max_attempts {
                        tokio::time::sleep(self.config.retry_backoff * attempt).await;
                    }
                }
                Err(e) => {
                    permit.success();
                    return Err(GatewayError::Upstream(e.to_string()));
                }
            }
        }

        let last = last_error.map(|e| e.to_string()).unwrap_or_default();
        Err(GatewayError::Upstream(format!(
            "gave up after {} attempts: {}",
            max_attempts, last
        )))
    }
}
