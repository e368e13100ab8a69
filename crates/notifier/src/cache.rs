//! Bounded, idle-expiring cache of per-credential clients.
//!
//! Entries expire after `ttl` without use. Capacity eviction is least recently
//! used, handled by [`lru::LruCache`].

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lru::LruCache;
use tokio::time::Instant;

struct Entry<V> {
    value: Arc<V>,
    last_used: Instant,
}

/// Cache of shared client instances keyed by credential.
pub struct ClientCache<K: Hash + Eq, V> {
    entries: Mutex<LruCache<K, Entry<V>>>,
    ttl: Duration,
}

impl<K, V> ClientCache<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    /// Return the cached client for `key`, building it with `init` when absent
    /// or expired.
    pub fn get_or_insert_with<F>(&self, key: &K, init: F) -> Arc<V>
    where
        F: FnOnce() -> V,
    {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(entry) = entries.get_mut(key) {
            if now.duration_since(entry.last_used) < self.ttl {
                entry.last_used = now;
                return entry.value.clone();
            }
        }

        // idle entries sit at the cold end; drop them before inserting
        while let Some((_, entry)) = entries.peek_lru() {
            if now.duration_since(entry.last_used) < self.ttl {
                break;
            }
            entries.pop_lru();
        }

        let value = Arc::new(init());
        entries.put(
            key.clone(),
            Entry {
                value: value.clone(),
                last_used: now,
            },
        );
        value
    }

    /// Drop the client for `key`, e.g. after its credentials were rotated.
    pub fn invalidate(&self, key: &K) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.pop(key);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
