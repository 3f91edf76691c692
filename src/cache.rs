// src/cache.rs
//! Explicit keyed stores for short-lived process state.
//!
//! Results caching and rate-limit windows both live in a [`TtlStore`] owned by
//! whoever needs it, instead of a process-wide cache.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::models::PollId;

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

impl<V> Entry<V> {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// A map whose entries disappear `ttl` after they were written.
pub struct TtlStore<K, V> {
    entries: Mutex<HashMap<K, Entry<V>>>,
    ttl: Duration,
}

impl<K, V> TtlStore<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<K, Entry<V>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let mut entries = self.lock();
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: K, value: V) {
        let expires_at = Instant::now() + self.ttl;
        self.lock().insert(key, Entry { value, expires_at });
    }

    /// Returns true when a live entry was removed.
    pub fn remove(&self, key: &K) -> bool {
        let now = Instant::now();
        self.lock()
            .remove(key)
            .is_some_and(|entry| entry.is_live(now))
    }

    /// Read-modify-write under one lock. A live entry keeps its original
    /// deadline; a missing or expired one starts a fresh window. Returns the
    /// stored value and the time left until it expires.
    pub fn update<F>(&self, key: K, f: F) -> (V, Duration)
    where
        F: FnOnce(Option<&V>) -> V,
    {
        let now = Instant::now();
        let mut entries = self.lock();
        let current = entries.get(&key).filter(|entry| entry.is_live(now));
        let expires_at = current.map_or(now + self.ttl, |entry| entry.expires_at);
        let value = f(current.map(|entry| &entry.value));
        entries.insert(
            key,
            Entry {
                value: value.clone(),
                expires_at,
            },
        );
        (value, expires_at.saturating_duration_since(now))
    }

    /// Drops every entry for which `keep` returns false. Returns how many were dropped.
    pub fn retain<F>(&self, mut keep: F) -> usize
    where
        F: FnMut(&K, &V) -> bool,
    {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|key, entry| keep(key, &entry.value));
        before - entries.len()
    }

    /// Evicts entries whose ttl has elapsed. Returns how many were evicted.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-poll view counters. Never expire on their own; dropped with the poll.
#[derive(Default)]
pub struct ViewCounter {
    views: Mutex<HashMap<PollId, u64>>,
}

impl ViewCounter {
    pub fn increment(&self, poll_id: PollId) -> u64 {
        let mut views = self.views.lock().unwrap_or_else(PoisonError::into_inner);
        let count = views.entry(poll_id).or_insert(0);
        *count += 1;
        *count
    }

    pub fn get(&self, poll_id: PollId) -> u64 {
        self.views
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&poll_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn forget(&self, poll_id: PollId) {
        self.views
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&poll_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let store = TtlStore::new(Duration::from_secs(30));
        store.insert("results", 7);
        assert_eq!(store.get(&"results"), Some(7));

        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(store.get(&"results"), Some(7));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(store.get(&"results"), None);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn update_keeps_the_original_window() {
        let store = TtlStore::new(Duration::from_secs(60));
        let (count, left) = store.update("k", |n| n.copied().unwrap_or(0) + 1);
        assert_eq!((count, left), (1, Duration::from_secs(60)));

        tokio::time::advance(Duration::from_secs(45)).await;
        let (count, left) = store.update("k", |n| n.copied().unwrap_or(0) + 1);
        assert_eq!((count, left), (2, Duration::from_secs(15)));

        tokio::time::advance(Duration::from_secs(15)).await;
        let (count, _) = store.update("k", |n| n.copied().unwrap_or(0) + 1);
        assert_eq!(count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn purge_and_retain_report_what_they_dropped() {
        let store = TtlStore::new(Duration::from_secs(10));
        store.insert(1, "a");
        store.insert(2, "b");
        tokio::time::advance(Duration::from_secs(11)).await;
        store.insert(3, "c");

        assert_eq!(store.purge_expired(), 2);
        assert_eq!(store.retain(|k, _| *k != 3), 1);
        assert!(!store.remove(&3));
    }

    #[test]
    fn view_counter_counts_per_poll() {
        let views = ViewCounter::default();
        let poll = PollId::new();
        assert_eq!(views.increment(poll), 1);
        assert_eq!(views.increment(poll), 2);
        assert_eq!(views.get(PollId::new()), 0);
        views.forget(poll);
        assert_eq!(views.get(poll), 0);
    }
}
