//! Idempotency cache to prevent duplicate upstream side effects
//!
//! A client-supplied key maps to the outcome of the first request that used
//! it. While that request runs, the record is `InProgress` and later callers
//! with the same key wait for it instead of executing again. Terminal
//! records (`Completed` / `Failed`) are replayed verbatim until their TTL
//! lapses, after which the key is fresh again.
//!
//! Each record remembers a fingerprint of the request that created it, so a
//! key reused for a different request is refused rather than answered with
//! an unrelated result.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

use crate::store::TtlMap;
use crate::types::{GatewayError, Result};

/// Terminal result of an idempotent operation
pub type Outcome<T> = std::result::Result<T, GatewayError>;

/// Fingerprint of a register request: SHA-256 over document id and payload
pub fn request_fingerprint(document_id: &str, payload: &JsonValue) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update(b"\n");
    hasher.update(payload.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Record lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    InProgress,
    Completed,
    Failed,
}

#[derive(Clone)]
enum RecordState<T> {
    InProgress {
        attempt: Uuid,
        done: watch::Receiver<Option<Outcome<T>>>,
    },
    Completed(T),
    Failed(GatewayError),
}

#[derive(Clone)]
struct IdempotencyRecord<T> {
    fingerprint: String,
    created_at: DateTime<Utc>,
    state: RecordState<T>,
}

impl<T> IdempotencyRecord<T> {
    fn status(&self) -> RecordStatus {
        match self.state {
            RecordState::InProgress { .. } => RecordStatus::InProgress,
            RecordState::Completed(_) => RecordStatus::Completed,
            RecordState::Failed(_) => RecordStatus::Failed,
        }
    }

    fn is_attempt(&self, id: Uuid) -> bool {
        matches!(self.state, RecordState::InProgress { attempt, .. } if attempt == id)
    }
}

/// Result of [`IdempotencyCache::begin`]
pub enum Begin<'a, T>
where
    T: Clone + Send + Sync + 'static,
{
    /// First use of the key; the caller must run the operation and settle
    /// the ticket
    Fresh(IdempotencyTicket<'a, T>),
    /// Another caller is running the operation
    InProgress(InFlight<T>),
    Completed(T),
    Failed(GatewayError),
}

/// Idempotency records keyed by client key
pub struct IdempotencyCache<T> {
    records: Arc<TtlMap<String, IdempotencyRecord<T>>>,
    /// Retention of terminal records
    ttl: Duration,
    /// Lifetime of an `InProgress` record whose owner never settles
    in_progress_ttl: Duration,
}

impl<T> IdempotencyCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(ttl: Duration, in_progress_ttl: Duration) -> Self {
        Self {
            records: Arc::new(TtlMap::new("idempotency")),
            ttl,
            in_progress_ttl,
        }
    }

    /// Look up `key`, registering an `InProgress` record if it is unused.
    ///
    /// Fails with `IdempotencyKeyReused` when the key is held by a request
    /// with a different fingerprint.
    pub fn begin(&self, key: &str, fingerprint: &str) -> Result<Begin<'_, T>> {
        let attempt = Uuid::new_v4();
        let (tx, rx) = watch::channel(None);
        let record = IdempotencyRecord {
            fingerprint: fingerprint.to_string(),
            created_at: Utc::now(),
            state: RecordState::InProgress { attempt, done: rx },
        };

        let existing = match self
            .records
            .try_insert(key.to_string(), record, self.in_progress_ttl)
        {
            Ok(()) => {
                debug!(key = key, "Idempotency key registered");
                return Ok(Begin::Fresh(IdempotencyTicket {
                    cache: self,
                    key: key.to_string(),
                    fingerprint: fingerprint.to_string(),
                    attempt,
                    tx,
                    settled: false,
                }));
            }
            Err(existing) => existing,
        };

        if existing.fingerprint != fingerprint {
            return Err(GatewayError::IdempotencyKeyReused {
                key: key.to_string(),
            });
        }

        debug!(key = key, status = ?existing.status(), "Idempotency key already known");
        Ok(match existing.state {
            RecordState::InProgress { done, .. } => Begin::InProgress(InFlight {
                key: key.to_string(),
                done,
            }),
            RecordState::Completed(result) => Begin::Completed(result),
            RecordState::Failed(error) => Begin::Failed(error),
        })
    }

    /// Status of a live record
    pub fn status(&self, key: &str) -> Option<RecordStatus> {
        self.records.get(key).map(|r| r.status())
    }

    /// When a live record was created
    pub fn created_at(&self, key: &str) -> Option<DateTime<Utc>> {
        self.records.get(key).map(|r| r.created_at)
    }

    pub fn stats(&self) -> IdempotencyStats {
        let mut stats = IdempotencyStats::default();
        for record in self.records.live_values() {
            match record.status() {
                RecordStatus::InProgress => stats.in_progress += 1,
                RecordStatus::Completed => stats.completed += 1,
                RecordStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    pub fn sweep(&self) -> usize {
        self.records.sweep()
    }

    pub fn spawn_sweeper(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        TtlMap::spawn_sweeper(Arc::clone(&self.records), interval)
    }

    fn settle(&self, ticket: &IdempotencyTicket<'_, T>, state: RecordState<T>) {
        let record = IdempotencyRecord {
            fingerprint: ticket.fingerprint.clone(),
            created_at: Utc::now(),
            state,
        };
        let attempt = ticket.attempt;
        match self
            .records
            .replace_if(&ticket.key, record.clone(), self.ttl, |r| r.is_attempt(attempt))
        {
            Ok(Some(_)) => {}
            // Our InProgress record expired; keep the result if nobody took the key
            Ok(None) => {
                if self
                    .records
                    .try_insert(ticket.key.clone(), record, self.ttl)
                    .is_err()
                {
                    debug!(key = %ticket.key, "Idempotency key was taken by a newer request after expiry");
                }
            }
            Err(_) => {
                debug!(key = %ticket.key, "Idempotency key was reclaimed by a newer request");
            }
        }
    }

    fn withdraw(&self, ticket: &IdempotencyTicket<'_, T>) {
        let attempt = ticket.attempt;
        if let Ok(Some(_)) = self.records.remove_if(&ticket.key, |r| r.is_attempt(attempt)) {
            debug!(key = %ticket.key, "Idempotency record withdrawn");
        }
    }
}

/// Obligation to settle a freshly registered key
#[must_use = "settle the ticket with complete(), fail() or withdraw()"]
pub struct IdempotencyTicket<'a, T>
where
    T: Clone + Send + Sync + 'static,
{
    cache: &'a IdempotencyCache<T>,
    key: String,
    fingerprint: String,
    attempt: Uuid,
    tx: watch::Sender<Option<Outcome<T>>>,
    settled: bool,
}

impl<T> IdempotencyTicket<'_, T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Store the result and wake waiting duplicates
    pub fn complete(mut self, result: T) {
        self.settled = true;
        self.cache.settle(&self, RecordState::Completed(result.clone()));
        self.tx.send_replace(Some(Ok(result)));
    }

    /// Store the failure so retries fail fast, and wake waiting duplicates
    pub fn fail(mut self, error: GatewayError) {
        self.settled = true;
        self.cache.settle(&self, RecordState::Failed(error.clone()));
        self.tx.send_replace(Some(Err(error)));
    }

    /// Forget the key so a retry runs as a fresh request. Waiting duplicates
    /// receive `error`.
    pub fn withdraw(mut self, error: GatewayError) {
        self.settled = true;
        self.cache.withdraw(&self);
        self.tx.send_replace(Some(Err(error)));
    }
}

impl<T> Drop for IdempotencyTicket<'_, T>
where
    T: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        if !self.settled {
            // Cancelled or panicked mid-operation; waiters see the channel close
            self.cache.withdraw(self);
        }
    }
}

/// Handle on an operation another caller is running
pub struct InFlight<T> {
    key: String,
    done: watch::Receiver<Option<Outcome<T>>>,
}

impl<T: Clone> InFlight<T> {
    /// Wait up to `timeout` for the running operation's outcome.
    ///
    /// Times out (or observes an abandoned operation) as `StillInProgress`.
    pub async fn wait(mut self, timeout: Duration) -> Outcome<T> {
        let still_running = GatewayError::StillInProgress {
            key: self.key.clone(),
        };
        match tokio::time::timeout(timeout, self.done.wait_for(Option::is_some)).await {
            Ok(Ok(value)) => (*value).clone().unwrap_or(Err(still_running)),
            Ok(Err(_)) => {
                debug!(key = %self.key, "In-flight operation abandoned");
                Err(still_running)
            }
            Err(_) => Err(still_running),
        }
    }
}

/// Record counts by status
#[derive(Debug, Clone, Default, Serialize)]
pub struct IdempotencyStats {
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
}
