//! Per-document operation locks
//!
//! At most one live lock exists per document. A lock can only be released
//! by the token that acquired it.
//!
//! # Liveness over exclusion
//!
//! Locks carry a TTL and are **force-reclaimable once it lapses**: if the
//! holder crashes or hangs, the next caller acquires the document after the
//! TTL even though the original holder never released it. The previous
//! holder may therefore still be running when a new holder starts. Callers
//! whose work can outlive the TTL must pick a longer TTL or call
//! [`DocumentLocks::renew`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::store::TtlMap;
use crate::types::{GatewayError, Result};

/// Proof of lock ownership
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockToken(Uuid);

impl LockToken {
    fn mint() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for LockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone)]
struct LockEntry {
    token: LockToken,
    acquired_at: Instant,
}

/// Table of document locks
pub struct DocumentLocks {
    entries: Arc<TtlMap<String, LockEntry>>,
    default_ttl: Duration,
}

impl DocumentLocks {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: Arc::new(TtlMap::new("document_locks")),
            default_ttl,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Acquire the lock for `document_id`, failing if a live lock exists
    pub fn acquire(&self, document_id: &str, ttl: Duration) -> Result<LockToken> {
        let token = LockToken::mint();
        let entry = LockEntry {
            token,
            acquired_at: Instant::now(),
        };
        match self.entries.try_insert(document_id.to_string(), entry, ttl) {
            Ok(()) => {
                debug!(document_id = document_id, token = %token, "Document lock acquired");
                Ok(token)
            }
            Err(held) => {
                debug!(
                    document_id = document_id,
                    held_ms = held.acquired_at.elapsed().as_millis() as u64,
                    "Document already locked"
                );
                Err(GatewayError::AlreadyLocked {
                    document_id: document_id.to_string(),
                })
            }
        }
    }

    /// Acquire with the default TTL
    pub fn acquire_default(&self, document_id: &str) -> Result<LockToken> {
        self.acquire(document_id, self.default_ttl)
    }

    /// Acquire and wrap the token in a guard that releases on drop
    pub fn lock(&self, document_id: &str, ttl: Duration) -> Result<DocumentLockGuard<'_>> {
        let token = self.acquire(document_id, ttl)?;
        Ok(DocumentLockGuard {
            locks: self,
            document_id: document_id.to_string(),
            token,
            released: false,
        })
    }

    /// Release a lock held by `token`.
    ///
    /// Releasing a lock that already expired is a no-op. Releasing a live
    /// lock held by someone else fails with `TokenMismatch`.
    pub fn release(&self, document_id: &str, token: LockToken) -> Result<()> {
        match self.entries.remove_if(document_id, |e| e.token == token) {
            Ok(Some(entry)) => {
                debug!(
                    document_id = document_id,
                    held_ms = entry.acquired_at.elapsed().as_millis() as u64,
                    "Document lock released"
                );
                Ok(())
            }
            Ok(None) => {
                warn!(document_id = document_id, token = %token, "Document lock expired before release");
                Ok(())
            }
            Err(_) => Err(GatewayError::TokenMismatch {
                document_id: document_id.to_string(),
            }),
        }
    }

    /// Extend a live lock held by `token` to expire `ttl` from now
    pub fn renew(&self, document_id: &str, token: LockToken, ttl: Duration) -> Result<()> {
        let acquired_at = match self.entries.get_entry(document_id) {
            Some(entry) if entry.value.token == token => entry.value.acquired_at,
            _ => {
                return Err(GatewayError::TokenMismatch {
                    document_id: document_id.to_string(),
                })
            }
        };
        let renewed = LockEntry { token, acquired_at };
        match self
            .entries
            .replace_if(document_id, renewed, ttl, |e| e.token == token)
        {
            Ok(Some(_)) => {
                debug!(document_id = document_id, ttl_ms = ttl.as_millis() as u64, "Document lock renewed");
                Ok(())
            }
            _ => Err(GatewayError::TokenMismatch {
                document_id: document_id.to_string(),
            }),
        }
    }

    pub fn is_locked(&self, document_id: &str) -> bool {
        self.entries.contains_key(document_id)
    }

    /// Number of live locks
    pub fn held_count(&self) -> usize {
        self.entries.live_count()
    }

    /// Drop expired locks
    pub fn sweep(&self) -> usize {
        self.entries.sweep()
    }

    pub fn spawn_sweeper(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        TtlMap::spawn_sweeper(Arc::clone(&self.entries), interval)
    }
}

/// Holds a document lock until released or dropped
pub struct DocumentLockGuard<'a> {
    locks: &'a DocumentLocks,
    document_id: String,
    token: LockToken,
    released: bool,
}

impl DocumentLockGuard<'_> {
    pub fn token(&self) -> LockToken {
        self.token
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn renew(&self, ttl: Duration) -> Result<()> {
        self.locks.renew(&self.document_id, self.token, ttl)
    }

    /// Release now, reporting a token mismatch if the lock was reclaimed
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.locks.release(&self.document_id, self.token)
    }
}

impl Drop for DocumentLockGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.locks.release(&self.document_id, self.token) {
            warn!(document_id = %self.document_id, error = %e, "Document lock release on drop failed");
        }
    }
}
