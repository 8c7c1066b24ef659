//! Generic key-value map with per-entry expiry
//!
//! Every entry carries an expiry instant. Readers treat an expired entry as
//! absent (lazy expiry), so correctness never depends on the sweeper; the
//! periodic [`TtlMap::sweep`] only bounds memory growth.
//!
//! Backed by a sharded `DashMap`: operations on the same key are linearized
//! by the shard lock, operations on keys in different shards never contend.
//! No shard lock is held across an `.await`.

use std::borrow::Borrow;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info};

/// Longest TTL honoured; larger values are capped
pub const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// A value with its expiry instant
#[derive(Debug, Clone)]
pub struct TtlEntry<V> {
    pub value: V,
    pub expires_at: Instant,
}

impl<V> TtlEntry<V> {
    fn new(value: V, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Self::deadline(ttl),
        }
    }

    /// Expiry instant `ttl` from now, capped at [`MAX_TTL`]
    fn deadline(ttl: Duration) -> Instant {
        let now = Instant::now();
        now.checked_add(ttl.min(MAX_TTL)).unwrap_or(now)
    }

    /// Check if this entry has expired
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    /// Time left before expiry
    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}

/// Concurrent map whose entries expire
pub struct TtlMap<K, V>
where
    K: Eq + Hash,
{
    entries: DashMap<K, TtlEntry<V>>,
    /// Name used in log lines
    name: &'static str,
}

impl<K, V> TtlMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(name: &'static str) -> Self {
        Self {
            entries: DashMap::new(),
            name,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Insert or overwrite an entry
    pub fn put(&self, key: K, value: V, ttl: Duration) {
        self.entries.insert(key, TtlEntry::new(value, ttl));
    }

    /// Get a live entry's value
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.get_entry(key).map(|e| e.value)
    }

    /// Get a live entry together with its expiry
    pub fn get_entry<Q>(&self, key: &Q) -> Option<TtlEntry<V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired() {
                return Some(entry.clone());
            }
            drop(entry); // Release the shard before removing
            self.entries.remove_if(key, |_, e| e.is_expired());
        }
        None
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.get_entry(key).is_some()
    }

    /// Remove an entry, returning its value if it was still live
    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries
            .remove(key)
            .filter(|(_, e)| !e.is_expired())
            .map(|(_, e)| e.value)
    }

    /// Insert only if no live entry exists for `key`.
    ///
    /// On conflict the live value is returned unchanged. An expired entry
    /// counts as vacant and is replaced.
    pub fn try_insert(&self, key: K, value: V, ttl: Duration) -> Result<(), V> {
        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    occupied.insert(TtlEntry::new(value, ttl));
                    Ok(())
                } else {
                    Err(occupied.get().value.clone())
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(TtlEntry::new(value, ttl));
                Ok(())
            }
        }
    }

    /// Remove a live entry only if `predicate` accepts its value.
    ///
    /// Returns `Ok(Some(value))` when removed, `Ok(None)` when there was no
    /// live entry, and `Err(value)` when a live entry was rejected.
    pub fn remove_if<Q, F>(&self, key: &Q, predicate: F) -> Result<Option<V>, V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        F: FnOnce(&V) -> bool,
    {
        let mut live = false;
        let mut rejected = None;
        let removed = self.entries.remove_if(key, |_, entry| {
            if entry.is_expired() {
                return true;
            }
            live = true;
            if predicate(&entry.value) {
                true
            } else {
                rejected = Some(entry.value.clone());
                false
            }
        });

        if let Some(value) = rejected {
            return Err(value);
        }
        match removed {
            Some((_, entry)) if live => Ok(Some(entry.value)),
            _ => Ok(None),
        }
    }

    /// Mutate a live entry in place and push its expiry to `ttl` from now.
    ///
    /// The change runs under the shard lock, so concurrent updates to the
    /// same key never overwrite each other. Returns the updated value, or
    /// `None` when there was no live entry.
    pub fn update<Q, F>(&self, key: &Q, ttl: Duration, f: F) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        F: FnOnce(&mut V),
    {
        let mut entry = self.entries.get_mut(key)?;
        if entry.is_expired() {
            drop(entry);
            self.entries.remove_if(key, |_, e| e.is_expired());
            return None;
        }
        f(&mut entry.value);
        entry.expires_at = TtlEntry::<V>::deadline(ttl);
        Some(entry.value.clone())
    }

    /// Update the live entry for `key` in place, or insert `init()` when
    /// there is none (an expired entry counts as vacant). Either way the
    /// entry expires `ttl` from now. Returns the stored value.
    pub fn upsert<I, F>(&self, key: K, ttl: Duration, init: I, update: F) -> V
    where
        I: FnOnce() -> V,
        F: FnOnce(&mut V),
    {
        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if entry.is_expired() {
                    *entry = TtlEntry::new(init(), ttl);
                } else {
                    update(&mut entry.value);
                    entry.expires_at = TtlEntry::<V>::deadline(ttl);
                }
                entry.value.clone()
            }
            Entry::Vacant(vacant) => vacant.insert(TtlEntry::new(init(), ttl)).value.clone(),
        }
    }

    /// Replace the value and expiry of a live entry if `predicate` accepts it.
    ///
    /// Same return convention as [`TtlMap::remove_if`].
    pub fn replace_if<Q, F>(
        &self,
        key: &Q,
        value: V,
        ttl: Duration,
        predicate: F,
    ) -> Result<Option<V>, V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        F: FnOnce(&V) -> bool,
    {
        let Some(mut entry) = self.entries.get_mut(key) else {
            return Ok(None);
        };
        if entry.is_expired() {
            drop(entry);
            self.entries.remove_if(key, |_, e| e.is_expired());
            return Ok(None);
        }
        if !predicate(&entry.value) {
            return Err(entry.value.clone());
        }
        let previous = std::mem::replace(&mut *entry, TtlEntry::new(value, ttl));
        Ok(Some(previous.value))
    }

    /// Remove every expired entry, returning how many were dropped
    pub fn sweep(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired());
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(map = self.name, removed = removed, "Swept expired entries");
        }
        removed
    }

    /// Number of stored entries, including expired ones not yet swept
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of live entries
    pub fn live_count(&self) -> usize {
        self.entries.iter().filter(|e| !e.is_expired()).count()
    }

    /// Snapshot of live values
    pub fn live_values(&self) -> Vec<V> {
        self.entries
            .iter()
            .filter(|e| !e.is_expired())
            .map(|e| e.value.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

impl<K, V> TtlMap<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Spawn a background task that sweeps the map every `interval`
    pub fn spawn_sweeper(map: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        info!(
            map = map.name,
            interval_ms = interval.as_millis() as u64,
            "TTL sweeper started"
        );
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                map.sweep();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHORT: Duration = Duration::from_millis(30);
    const LONG: Duration = Duration::from_secs(60);

    #[test]
    fn test_put_get_remove() {
        let map: TtlMap<String, u32> = TtlMap::new("test");
        map.put("a".to_string(), 1, LONG);
        assert_eq!(map.get("a"), Some(1));
        assert_eq!(map.remove("a"), Some(1));
        assert_eq!(map.get("a"), None);
    }

    #[test]
    fn test_lazy_expiry_without_sweep() {
        let map: TtlMap<String, u32> = TtlMap::new("test");
        map.put("a".to_string(), 1, SHORT);
        std::thread::sleep(SHORT * 2);
        assert_eq!(map.get("a"), None);
        // The expired entry was dropped on access
        assert!(map.is_empty());
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let map: TtlMap<String, u32> = TtlMap::new("test");
        map.put("old".to_string(), 1, SHORT);
        map.put("new".to_string(), 2, LONG);
        std::thread::sleep(SHORT * 2);
        assert_eq!(map.len(), 2);
        assert_eq!(map.sweep(), 1);
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("new"), Some(2));
    }

    #[test]
    fn test_try_insert_respects_live_entry() {
        let map: TtlMap<String, u32> = TtlMap::new("test");
        assert!(map.try_insert("k".to_string(), 1, SHORT).is_ok());
        assert_eq!(map.try_insert("k".to_string(), 2, LONG), Err(1));

        std::thread::sleep(SHORT * 2);
        assert!(map.try_insert("k".to_string(), 3, LONG).is_ok());
        assert_eq!(map.get("k"), Some(3));
    }

    #[test]
    fn test_remove_if() {
        let map: TtlMap<String, u32> = TtlMap::new("test");
        map.put("k".to_string(), 7, LONG);
        assert_eq!(map.remove_if("k", |v| *v == 8), Err(7));
        assert_eq!(map.remove_if("k", |v| *v == 7), Ok(Some(7)));
        assert_eq!(map.remove_if("k", |_| true), Ok(None));
    }

    #[test]
    fn test_replace_if_extends_expiry() {
        let map: TtlMap<String, u32> = TtlMap::new("test");
        map.put("k".to_string(), 1, SHORT);
        assert_eq!(map.replace_if("k", 2, LONG, |v| *v == 1), Ok(Some(1)));
        std::thread::sleep(SHORT * 2);
        assert_eq!(map.get("k"), Some(2));
        assert_eq!(map.replace_if("missing", 2, LONG, |_| true), Ok(None));
    }

    #[test]
    fn test_update_in_place() {
        let map: TtlMap<String, u32> = TtlMap::new("test");
        assert_eq!(map.update("k", LONG, |v| *v += 1), None);

        map.put("k".to_string(), 1, SHORT);
        assert_eq!(map.update("k", LONG, |v| *v += 1), Some(2));
        std::thread::sleep(SHORT * 2);
        // Expiry was pushed out by the update
        assert_eq!(map.get("k"), Some(2));
    }

    #[test]
    fn test_upsert_inserts_then_updates() {
        let map: TtlMap<String, u32> = TtlMap::new("test");
        assert_eq!(map.upsert("k".to_string(), SHORT, || 10, |v| *v += 1), 10);
        assert_eq!(map.upsert("k".to_string(), SHORT, || 10, |v| *v += 1), 11);

        std::thread::sleep(SHORT * 2);
        assert_eq!(map.upsert("k".to_string(), LONG, || 10, |v| *v += 1), 10);
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        let map: Arc<TtlMap<String, u64>> = Arc::new(TtlMap::new("test"));
        map.put("k".to_string(), 0, LONG);

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let map = Arc::clone(&map);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        map.update("k", LONG, |v| *v += 1);
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(map.get("k"), Some(8000));
    }

    #[test]
    fn test_huge_ttl_is_capped() {
        let map: TtlMap<String, u32> = TtlMap::new("test");
        map.put("k".to_string(), 1, Duration::MAX);
        assert_eq!(map.get("k"), Some(1));
    }

    #[tokio::test]
    async fn test_sweeper_task() {
        let map: Arc<TtlMap<String, u32>> = Arc::new(TtlMap::new("test"));
        map.put("k".to_string(), 1, Duration::from_millis(10));
        let handle = TtlMap::spawn_sweeper(Arc::clone(&map), Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(map.is_empty());
        handle.abort();
    }
}
