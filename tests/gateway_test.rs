//! Integration tests for the register-PDF gateway
//!
//! The upstream is a scripted in-process stub, so these exercise the full
//! lock / idempotency / breaker / admission sequence without a network.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use padsign_gateway::guard::BreakerState;
use padsign_gateway::{
    GatewayConfig, GatewayError, RegisterPdfGateway, UpstreamCaller, UpstreamError,
};
use serde_json::{json, Value as JsonValue};
use tokio_test::{assert_err, assert_ok};

/// Upstream stub: answers from a script, then with a fallback
struct ScriptedUpstream {
    calls: AtomicUsize,
    script: Mutex<VecDeque<Result<JsonValue, UpstreamError>>>,
    fallback: Result<JsonValue, UpstreamError>,
    delay: Duration,
}

impl ScriptedUpstream {
    fn ok() -> Self {
        Self::answering(Ok(json!({"status": "registered"})))
    }

    fn answering(fallback: Result<JsonValue, UpstreamError>) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            script: Mutex::new(VecDeque::new()),
            fallback,
            delay: Duration::ZERO,
        }
    }

    fn with_script(self, script: Vec<Result<JsonValue, UpstreamError>>) -> Self {
        *self.script.lock().unwrap() = script.into();
        self
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UpstreamCaller for ScriptedUpstream {
    async fn register_pdf(
        &self,
        document_id: &str,
        _payload: &JsonValue,
        _timeout: Duration,
    ) -> Result<JsonValue, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let scripted = self.script.lock().unwrap().pop_front();
        scripted
            .unwrap_or_else(|| self.fallback.clone())
            .map(|mut body| {
                if let Some(obj) = body.as_object_mut() {
                    obj.insert("document_id".into(), json!(document_id));
                }
                body
            })
    }
}

/// Short durations so tests finish quickly
fn test_config() -> GatewayConfig {
    GatewayConfig {
        upstream_timeout: Duration::from_millis(500),
        upstream_retries: 1,
        retry_backoff: Duration::from_millis(10),
        max_concurrency: 2,
        queue_max_size: 4,
        queue_wait: Duration::from_millis(500),
        cb_failure_threshold: 5,
        cb_cooldown: Duration::from_secs(30),
        idempotency_ttl: Duration::from_secs(60),
        doc_lock_ttl: Duration::from_secs(5),
        ..Default::default()
    }
}

fn gateway(config: GatewayConfig, upstream: Arc<ScriptedUpstream>) -> Arc<RegisterPdfGateway> {
    Arc::new(RegisterPdfGateway::new(config, upstream).unwrap())
}

fn payload() -> JsonValue {
    json!({"pdf": "JVBERi0xLjQK", "title": "Lease agreement"})
}

#[tokio::test]
async fn test_completed_key_is_replayed() {
    let upstream = Arc::new(ScriptedUpstream::ok());
    let gw = gateway(test_config(), upstream.clone());

    let first = assert_ok!(gw.register_document("doc1", "key1", payload()).await);
    let second = assert_ok!(gw.register_document("doc1", "key1", payload()).await);

    assert_eq!(first, second);
    assert_eq!(first.response["document_id"], "doc1");
    assert_eq!(first.attempts, 1);
    assert_eq!(upstream.calls(), 1);
    assert_eq!(gw.stats().idempotency.completed, 1);
    assert!(!gw.locks().is_locked("doc1"));
}

#[tokio::test]
async fn test_key_is_fresh_after_ttl() {
    let upstream = Arc::new(ScriptedUpstream::ok());
    let config = GatewayConfig {
        idempotency_ttl: Duration::from_millis(100),
        ..test_config()
    };
    let gw = gateway(config, upstream.clone());

    assert_ok!(gw.register_document("doc1", "key1", payload()).await);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_ok!(gw.register_document("doc1", "key1", payload()).await);

    assert_eq!(upstream.calls(), 2);
}

#[tokio::test]
async fn test_failed_key_is_replayed() {
    let upstream = Arc::new(ScriptedUpstream::answering(Err(UpstreamError::Transient(
        "HTTP 503".into(),
    ))));
    let gw = gateway(test_config(), upstream.clone());

    let first = assert_err!(gw.register_document("doc1", "key1", payload()).await);
    let second = assert_err!(gw.register_document("doc1", "key1", payload()).await);

    assert!(matches!(first, GatewayError::Upstream(_)));
    assert_eq!(first, second);
    // Both attempts of the first request, none for the replay
    assert_eq!(upstream.calls(), 2);
    assert_eq!(gw.stats().idempotency.failed, 1);
}

#[tokio::test]
async fn test_key_reused_for_other_payload() {
    let upstream = Arc::new(ScriptedUpstream::ok());
    let gw = gateway(test_config(), upstream.clone());

    assert_ok!(gw.register_document("doc1", "key1", payload()).await);
    let err = assert_err!(
        gw.register_document("doc1", "key1", json!({"pdf": "other"}))
            .await
    );
    assert_eq!(err, GatewayError::IdempotencyKeyReused { key: "key1".into() });

    let err = assert_err!(gw.register_document("doc2", "key1", payload()).await);
    assert_eq!(err.status_code(), 422);
    assert_eq!(upstream.calls(), 1);
}

#[tokio::test]
async fn test_breaker_opens_after_threshold() {
    let upstream = Arc::new(ScriptedUpstream::answering(Err(UpstreamError::Transient(
        "HTTP 502".into(),
    ))));
    let gw = gateway(test_config(), upstream.clone());

    // Two attempts per request: four failures
    for i in 0..2 {
        let err = assert_err!(
            gw.register_document(&format!("doc{}", i), &format!("key{}", i), payload())
                .await
        );
        assert!(matches!(err, GatewayError::Upstream(_)));
    }
    assert_eq!(gw.stats().breaker_state, BreakerState::Closed);

    // Fifth failure opens the breaker and the retry is refused
    let err = assert_err!(gw.register_document("doc2", "key2", payload()).await);
    assert!(matches!(err, GatewayError::DependencyUnavailable(_)));
    assert_eq!(gw.stats().breaker_state, BreakerState::Open);
    assert_eq!(upstream.calls(), 5);

    let started = Instant::now();
    let err = assert_err!(gw.register_document("doc3", "key3", payload()).await);
    assert!(matches!(err, GatewayError::DependencyUnavailable(_)));
    assert!(started.elapsed() < Duration::from_millis(100));
    assert_eq!(upstream.calls(), 5);
}

#[tokio::test]
async fn test_breaker_probe_closes_after_cooldown() {
    let upstream = Arc::new(
        ScriptedUpstream::ok().with_script(vec![Err(UpstreamError::Timeout)]),
    );
    let config = GatewayConfig {
        cb_failure_threshold: 1,
        cb_cooldown: Duration::from_millis(100),
        ..test_config()
    };
    let gw = gateway(config, upstream.clone());

    assert_err!(gw.register_document("doc1", "key1", payload()).await);
    let err = assert_err!(gw.register_document("doc2", "key2", payload()).await);
    assert!(matches!(err, GatewayError::DependencyUnavailable(_)));

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_ok!(gw.register_document("doc3", "key3", payload()).await);
    assert_eq!(gw.breaker().state(), BreakerState::Closed);
    assert_eq!(upstream.calls(), 2);
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let upstream = Arc::new(ScriptedUpstream::ok().with_script(vec![
        Err(UpstreamError::Transient("connection reset".into())),
        Err(UpstreamError::Timeout),
    ]));
    let config = GatewayConfig {
        upstream_retries: 2,
        ..test_config()
    };
    let gw = gateway(config, upstream.clone());

    let receipt = assert_ok!(gw.register_document("doc1", "key1", payload()).await);
    assert_eq!(receipt.attempts, 3);
    assert_eq!(upstream.calls(), 3);
    assert_eq!(gw.breaker().consecutive_failures(), 0);
}

#[tokio::test]
async fn test_rejection_is_not_retried() {
    let upstream = Arc::new(ScriptedUpstream::answering(Err(UpstreamError::Rejected(
        "HTTP 400: missing pdf".into(),
    ))));
    let config = GatewayConfig {
        upstream_retries: 2,
        ..test_config()
    };
    let gw = gateway(config, upstream.clone());

    let err = assert_err!(gw.register_document("doc1", "key1", payload()).await);
    assert!(matches!(err, GatewayError::Upstream(ref msg) if msg.contains("missing pdf")));
    assert_eq!(upstream.calls(), 1);
    assert_eq!(gw.breaker().consecutive_failures(), 0);
}

#[tokio::test]
async fn test_upstream_timeout_is_enforced() {
    let upstream = Arc::new(ScriptedUpstream::ok().with_delay(Duration::from_secs(2)));
    let config = GatewayConfig {
        upstream_timeout: Duration::from_millis(100),
        ..test_config()
    };
    let gw = gateway(config, upstream.clone());

    let started = Instant::now();
    let err = assert_err!(gw.register_document("doc1", "key1", payload()).await);
    assert!(matches!(err, GatewayError::Upstream(ref msg) if msg.contains("timed out")));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(gw.breaker().consecutive_failures(), 2);
}

#[tokio::test]
async fn test_same_document_conflicts() {
    let upstream = Arc::new(ScriptedUpstream::ok().with_delay(Duration::from_millis(300)));
    let gw = gateway(test_config(), upstream.clone());

    let first = {
        let gw = gw.clone();
        tokio::spawn(async move { gw.register_document("doc1", "key1", payload()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = assert_err!(gw.register_document("doc1", "key2", payload()).await);
    assert_eq!(
        err,
        GatewayError::AlreadyLocked {
            document_id: "doc1".into()
        }
    );
    assert!(err.is_retryable());

    assert_ok!(first.await.unwrap());
    assert_eq!(upstream.calls(), 1);
    assert_eq!(gw.stats().locks_held, 0);
}

#[tokio::test]
async fn test_lock_released_after_failure() {
    let upstream = Arc::new(ScriptedUpstream::answering(Err(UpstreamError::Permanent(
        "invalid body".into(),
    ))));
    let gw = gateway(test_config(), upstream);

    assert_err!(gw.register_document("doc1", "key1", payload()).await);
    assert!(!gw.locks().is_locked("doc1"));

    // Another operation on the same document can proceed
    assert_ok!(gw.run_exclusive("doc1", |_| async { Ok(()) }).await);
}

#[tokio::test]
async fn test_queue_full_rejects_and_frees_key() {
    let upstream = Arc::new(ScriptedUpstream::ok().with_delay(Duration::from_millis(300)));
    let config = GatewayConfig {
        max_concurrency: 1,
        queue_max_size: 1,
        queue_wait: Duration::from_secs(2),
        ..test_config()
    };
    let gw = gateway(config, upstream.clone());

    let mut handles = Vec::new();
    for i in 0..2 {
        let gw = gw.clone();
        handles.push(tokio::spawn(async move {
            gw.register_document(&format!("doc{}", i), &format!("key{}", i), payload())
                .await
        }));
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    let err = assert_err!(gw.register_document("doc9", "key9", payload()).await);
    assert_eq!(err, GatewayError::QueueFull);
    assert_eq!(gw.stats().queue.rejected_full, 1);

    for handle in handles {
        assert_ok!(handle.await.unwrap());
    }

    // Overload does not poison the key
    assert_ok!(gw.register_document("doc9", "key9", payload()).await);
    assert_eq!(upstream.calls(), 3);
}

#[tokio::test]
async fn test_queue_wait_timeout() {
    let upstream = Arc::new(ScriptedUpstream::ok().with_delay(Duration::from_millis(400)));
    let config = GatewayConfig {
        max_concurrency: 1,
        queue_wait: Duration::from_millis(100),
        upstream_timeout: Duration::from_secs(1),
        ..test_config()
    };
    let gw = gateway(config, upstream.clone());

    let first = {
        let gw = gw.clone();
        tokio::spawn(async move { gw.register_document("doc1", "key1", payload()).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;

    let err = assert_err!(gw.register_document("doc2", "key2", payload()).await);
    assert_eq!(err, GatewayError::QueueWaitTimeout);
    assert_eq!(err.status_code(), 503);

    assert_ok!(first.await.unwrap());
    assert_eq!(upstream.calls(), 1);
    assert_eq!(gw.stats().idempotency.in_progress, 0);
}

#[tokio::test]
async fn test_concurrency_never_exceeds_limit() {
    let upstream = Arc::new(ScriptedUpstream::ok().with_delay(Duration::from_millis(100)));
    let config = GatewayConfig {
        max_concurrency: 2,
        queue_max_size: 8,
        queue_wait: Duration::from_secs(2),
        ..test_config()
    };
    let gw = gateway(config, upstream.clone());

    let mut handles = Vec::new();
    for i in 0..6 {
        let gw = gw.clone();
        handles.push(tokio::spawn(async move {
            gw.register_document(&format!("doc{}", i), &format!("key{}", i), payload())
                .await
        }));
    }

    let mut peak = 0;
    for _ in 0..20 {
        peak = peak.max(gw.stats().queue.running);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    for handle in handles {
        assert_ok!(handle.await.unwrap());
    }

    assert!(peak <= 2);
    assert_eq!(upstream.calls(), 6);
    assert_eq!(gw.stats().queue.admitted, 6);
}

#[tokio::test]
async fn test_run_exclusive_holds_document() {
    let upstream = Arc::new(ScriptedUpstream::ok());
    let gw = gateway(test_config(), upstream.clone());

    let inner = gw.clone();
    let stamped = gw
        .run_exclusive("doc1", |token| async move {
            let err = inner
                .register_document("doc1", "key1", payload())
                .await
                .unwrap_err();
            assert!(matches!(err, GatewayError::AlreadyLocked { .. }));
            inner.renew_lock("doc1", token, Duration::from_secs(10))?;
            Ok("stamped")
        })
        .await;

    assert_eq!(assert_ok!(stamped), "stamped");
    assert!(!gw.locks().is_locked("doc1"));
    assert_eq!(upstream.calls(), 0);
}

#[tokio::test]
async fn test_shutdown_drains_and_refuses_new_work() {
    let upstream = Arc::new(ScriptedUpstream::ok().with_delay(Duration::from_millis(200)));
    let gw = gateway(test_config(), upstream.clone());
    gw.spawn_maintenance();

    let in_flight = {
        let gw = gw.clone();
        tokio::spawn(async move { gw.register_document("doc1", "key1", payload()).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert!(gw.shutdown(Duration::from_secs(1)).await);
    assert_ok!(in_flight.await.unwrap());

    let err = assert_err!(gw.register_document("doc2", "key2", payload()).await);
    assert_eq!(err, GatewayError::ShuttingDown);
    assert_eq!(gw.stats().idempotency.in_progress, 0);
}

#[tokio::test]
async fn test_shutdown_waits_for_whole_register_call() {
    let upstream = Arc::new(ScriptedUpstream::ok().with_delay(Duration::from_millis(150)));
    let config = GatewayConfig {
        max_concurrency: 1,
        queue_wait: Duration::from_secs(2),
        ..test_config()
    };
    let gw = gateway(config, upstream.clone());

    let mut handles = Vec::new();
    for i in 0..2 {
        let gw = gw.clone();
        handles.push(tokio::spawn(async move {
            gw.register_document(&format!("doc{}", i), &format!("key{}", i), payload())
                .await
        }));
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
    assert_eq!(gw.stats().active_requests, 2);

    assert!(gw.shutdown(Duration::from_secs(2)).await);

    // Every call has finalized: locks released, records settled
    let stats = gw.stats();
    assert_eq!(stats.active_requests, 0);
    assert_eq!(stats.locks_held, 0);
    assert_eq!(stats.idempotency.in_progress, 0);

    // The running call finished; the queued one was refused
    let results: Vec<_> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();
    assert!(results[0].is_ok());
    assert_eq!(results[1], Err(GatewayError::ShuttingDown));
    assert_eq!(upstream.calls(), 1);
}

#[tokio::test]
async fn test_user_sessions_tracked() {
    let gw = gateway(test_config(), Arc::new(ScriptedUpstream::ok()));

    let mut attributes = HashMap::new();
    attributes.insert("tenant".to_string(), json!("acme"));
    gw.users().start_session("alice", attributes);
    assert!(gw.users().record_operation("alice"));

    let stats = gw.stats();
    assert_eq!(stats.users.active_entries, 1);
    assert_eq!(gw.users().get("alice").unwrap().operations, 1);
}

#[test]
fn test_invalid_config_rejected() {
    let config = GatewayConfig {
        max_concurrency: 0,
        ..GatewayConfig::default()
    };
    let result = RegisterPdfGateway::new(config, Arc::new(ScriptedUpstream::ok()));
    assert!(matches!(result, Err(GatewayError::Config(_))));
}
