//! Process-local TTL map.
//!
//! Maps opaque string keys to typed values with a per-entry absolute expiry.
//! Reads purge expired entries they encounter; the cleanup scheduler performs
//! eager eviction on an interval. A single writer lock around the underlying
//! map is the whole concurrency story: parallel reads, serialized writes.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    expires_at: Instant,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug)]
pub struct TtlStore<V> {
    entries: RwLock<HashMap<String, Entry<V>>>,
    default_ttl: Duration,
}

impl<V: Clone + Send + Sync> TtlStore<V> {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            default_ttl,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Insert or replace a value under the default TTL.
    pub async fn set(&self, key: impl Into<String>, value: V) {
        self.set_with_ttl(key, value, self.default_ttl).await;
    }

    pub async fn set_with_ttl(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let entry = Entry {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.entries.write().await.insert(key.into(), entry);
    }

    /// Fetch a live value. An expired entry is removed on the spot and
    /// reported as absent.
    pub async fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(entry) if !entry.is_expired(now) => return Some(entry.value.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        // Lazy eviction: upgrade to a write lock and re-check, another writer
        // may have replaced the entry in between.
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get(key) {
            if entry.is_expired(Instant::now()) {
                entries.remove(key);
            } else {
                return Some(entry.value.clone());
            }
        }
        None
    }

    pub async fn has(&self, key: &str) -> bool {
        self.get(key).await.is_some()
    }

    /// Remove an entry, reporting whether a live entry existed.
    pub async fn delete(&self, key: &str) -> bool {
        let now = Instant::now();
        match self.entries.write().await.remove(key) {
            Some(entry) => !entry.is_expired(now),
            None => false,
        }
    }

    /// Push an existing live entry's expiry `ttl` from now.
    pub async fn update_ttl(&self, key: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        match entries.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.expires_at = now + ttl;
                true
            }
            Some(_) => {
                entries.remove(key);
                false
            }
            None => false,
        }
    }

    /// Keys of unexpired entries, in no particular order.
    pub async fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .iter()
            .filter(|(_, e)| !e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Count of unexpired entries.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .values()
            .filter(|e| !e.is_expired(now))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    /// Eagerly evict every expired entry, reporting how many were removed.
    pub async fn sweep(&self) -> usize {
        self.drain_expired().await.len()
    }

    /// Eagerly evict every expired entry, handing the values back so callers
    /// can release resources the values own (temp files and the like).
    pub async fn drain_expired(&self) -> Vec<(String, V)> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|k| entries.remove(&k).map(|e| (k, e.value)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[tokio::test]
    async fn set_get_roundtrip() {
        let store = TtlStore::new(Duration::from_secs(60));
        store.set("k", "v".to_string()).await;
        assert_eq!(store.get("k").await.as_deref(), Some("v"));
        assert!(store.has("k").await);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn expired_entries_are_absent_and_purged() {
        let store = TtlStore::new(Duration::from_secs(60));
        store
            .set_with_ttl("k", "v".to_string(), Duration::from_millis(30))
            .await;
        assert_eq!(store.get("k").await.as_deref(), Some("v"));
        sleep(Duration::from_millis(60)).await;
        assert_eq!(store.get("k").await, None);
        assert!(!store.keys().await.contains(&"k".to_string()));
        // the lazy purge actually removed the entry
        assert_eq!(store.entries.read().await.len(), 0);
    }

    #[tokio::test]
    async fn delete_reports_liveness() {
        let store = TtlStore::new(Duration::from_secs(60));
        store.set("k", 1u32).await;
        assert!(store.delete("k").await);
        assert!(!store.delete("k").await);
    }

    #[tokio::test]
    async fn update_ttl_extends_life() {
        let store = TtlStore::new(Duration::from_secs(60));
        store
            .set_with_ttl("k", 1u32, Duration::from_millis(40))
            .await;
        assert!(store.update_ttl("k", Duration::from_secs(60)).await);
        sleep(Duration::from_millis(60)).await;
        assert_eq!(store.get("k").await, Some(1));
        assert!(!store.update_ttl("missing", Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn sweep_counts_and_removes() {
        let store = TtlStore::new(Duration::from_secs(60));
        store
            .set_with_ttl("a", 1u32, Duration::from_millis(10))
            .await;
        store
            .set_with_ttl("b", 2u32, Duration::from_millis(10))
            .await;
        store.set("c", 3u32).await;
        sleep(Duration::from_millis(30)).await;
        assert_eq!(store.sweep().await, 2);
        assert_eq!(store.len().await, 1);
        assert_eq!(store.keys().await, vec!["c".to_string()]);
    }

    #[tokio::test]
    async fn drain_hands_back_values() {
        let store = TtlStore::new(Duration::from_secs(60));
        store
            .set_with_ttl("a", "one".to_string(), Duration::from_millis(10))
            .await;
        sleep(Duration::from_millis(30)).await;
        let drained = store.drain_expired().await;
        assert_eq!(drained, vec![("a".to_string(), "one".to_string())]);
    }
}
