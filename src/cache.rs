//! Expiring key-value stores.
//!
//! Rate limits, breach de-duplication and TLS lookups all need "remember this
//! for a while" state. They take an `ExpiringStore` instead of reaching for a
//! module-level map, so the TTL is explicit and tests can swap the store.

use std::hash::Hash;
use std::time::Duration;

use moka::sync::Cache;

/// A key-value store whose entries expire after a fixed TTL.
pub trait ExpiringStore<K, V>: Send + Sync {
    fn get(&self, key: &K) -> Option<V>;
    fn insert(&self, key: K, value: V);
    fn remove(&self, key: &K);

    /// Insert `value` only if no live entry exists. Returns `true` when inserted.
    fn claim(&self, key: K, value: V) -> bool;

    /// Evict expired entries now instead of lazily.
    fn sweep(&self);

    fn ttl(&self) -> Duration;
}

/// In-process `ExpiringStore` backed by moka.
pub struct MemoryStore<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    cache: Cache<K, V>,
    ttl: Duration,
}

impl<K, V> MemoryStore<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Unbounded store: entries leave only when their TTL runs out.
    pub fn new(ttl: Duration) -> Self {
        Self {
            cache: Cache::builder().time_to_live(ttl).build(),
            ttl,
        }
    }

    /// Size-bounded store for plain caches.
    pub fn with_capacity(max_entries: u64, ttl: Duration) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(max_entries)
                .time_to_live(ttl)
                .build(),
            ttl,
        }
    }

    /// Approximate number of live entries.
    pub fn len(&self) -> u64 {
        self.cache.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> ExpiringStore<K, V> for MemoryStore<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn get(&self, key: &K) -> Option<V> {
        self.cache.get(key)
    }

    fn insert(&self, key: K, value: V) {
        self.cache.insert(key, value);
    }

    fn remove(&self, key: &K) {
        self.cache.invalidate(key);
    }

    fn claim(&self, key: K, value: V) -> bool {
        self.cache.entry(key).or_insert(value).is_fresh()
    }

    fn sweep(&self) {
        self.cache.run_pending_tasks();
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_is_exclusive_until_expiry() {
        let store: MemoryStore<String, ()> = MemoryStore::new(Duration::from_millis(50));
        assert!(store.claim("alice:1".to_string(), ()));
        assert!(!store.claim("alice:1".to_string(), ()));
        assert!(store.claim("bob:1".to_string(), ()));

        std::thread::sleep(Duration::from_millis(120));
        assert!(store.get(&"alice:1".to_string()).is_none());
        assert!(store.claim("alice:1".to_string(), ()));
    }

    #[test]
    fn test_sweep_evicts_expired_entries() {
        let store: MemoryStore<u32, u32> = MemoryStore::new(Duration::from_millis(20));
        store.insert(1, 10);
        store.insert(2, 20);
        store.sweep();
        assert_eq!(store.len(), 2);

        std::thread::sleep(Duration::from_millis(60));
        store.sweep();
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_claims_survive_many_distinct_keys() {
        let store: MemoryStore<String, ()> = MemoryStore::new(Duration::from_secs(60));
        for i in 0..12_000 {
            assert!(store.claim(format!("caller-{}:1", i), ()));
        }
        store.sweep();
        for i in 0..100 {
            assert!(!store.claim(format!("caller-{}:1", i), ()));
        }
    }

    #[test]
    fn test_remove() {
        let store: MemoryStore<u32, &'static str> = MemoryStore::new(Duration::from_secs(60));
        store.insert(7, "seven");
        assert_eq!(store.get(&7), Some("seven"));
        store.remove(&7);
        assert_eq!(store.get(&7), None);
        assert_eq!(store.ttl(), Duration::from_secs(60));
    }
}
