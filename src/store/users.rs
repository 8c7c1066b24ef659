//! User state management
//!
//! Session-scoped user entries with their own TTL. Entries are created on
//! session start, refreshed on activity and swept when they expire.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, info};

use super::ttl_map::TtlMap;

/// An authenticated user's session state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserEntry {
    pub user_id: String,

    /// Attributes from the authorization context (roles, company, ...)
    pub attributes: HashMap<String, JsonValue>,

    pub created_at: DateTime<Utc>,

    pub last_activity: DateTime<Utc>,

    /// Number of gateway operations performed in this session
    pub operations: u64,
}

impl UserEntry {
    fn new(user_id: String, attributes: HashMap<String, JsonValue>) -> Self {
        let now = Utc::now();
        Self {
            user_id,
            attributes,
            created_at: now,
            last_activity: now,
            operations: 0,
        }
    }
}

/// In-memory user store with expiration
pub struct UserStateStore {
    entries: Arc<TtlMap<String, UserEntry>>,
    ttl: Duration,
    cleanup_interval: Duration,
}

impl UserStateStore {
    pub fn new(ttl: Duration, cleanup_interval: Duration) -> Self {
        Self {
            entries: Arc::new(TtlMap::new("users")),
            ttl,
            cleanup_interval,
        }
    }

    /// Start a session, or refresh the existing one with new attributes
    pub fn start_session(&self, user_id: &str, attributes: HashMap<String, JsonValue>) -> UserEntry {
        let mut created = false;
        let init_attributes = attributes.clone();
        let entry = self.entries.upsert(
            user_id.to_string(),
            self.ttl,
            || {
                created = true;
                UserEntry::new(user_id.to_string(), init_attributes)
            },
            |existing| {
                existing.attributes = attributes;
                existing.last_activity = Utc::now();
            },
        );
        if created {
            info!(user_id = user_id, "Created user session");
        }
        entry
    }

    /// Refresh a live session's TTL. Returns false if there is none.
    pub fn touch(&self, user_id: &str) -> bool {
        self.update(user_id, |_| {})
    }

    /// Count an operation against a live session and refresh it
    pub fn record_operation(&self, user_id: &str) -> bool {
        self.update(user_id, |entry| entry.operations += 1)
    }

    fn update(&self, user_id: &str, f: impl FnOnce(&mut UserEntry)) -> bool {
        self.entries
            .update(user_id, self.ttl, |entry| {
                f(entry);
                entry.last_activity = Utc::now();
            })
            .is_some()
    }

    pub fn get(&self, user_id: &str) -> Option<UserEntry> {
        self.entries.get(user_id)
    }

    /// End a session explicitly
    pub fn end_session(&self, user_id: &str) -> bool {
        let removed = self.entries.remove(user_id).is_some();
        if removed {
            debug!(user_id = user_id, "Ended user session");
        }
        removed
    }

    /// Remove expired entries
    pub fn cleanup(&self) -> usize {
        let removed = self.entries.sweep();
        if removed > 0 {
            info!("Cleaned up {} expired user entries", removed);
        }
        removed
    }

    pub fn stats(&self) -> UserStoreStats {
        let total = self.entries.len();
        let active = self.entries.live_count();
        UserStoreStats {
            total_entries: total,
            active_entries: active,
            expired_entries: total.saturating_sub(active),
        }
    }

    /// Spawn the periodic cleanup task
    pub fn spawn_cleanup_task(&self) -> tokio::task::JoinHandle<()> {
        TtlMap::spawn_sweeper(Arc::clone(&self.entries), self.cleanup_interval)
    }
}

/// User store statistics
#[derive(Debug, Clone, Serialize)]
pub struct UserStoreStats {
    pub total_entries: usize,
    pub active_entries: usize,
    pub expired_entries: usize,
}
