use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

struct Entry<V> {
    value: V,
    stored_at: Instant,
    ttl: Duration,
}

impl<V> Entry<V> {
    fn expired(&self) -> bool {
        self.stored_at.elapsed() > self.ttl
    }
}

struct Inner<V> {
    entries: HashMap<String, Entry<V>>,
    /// First-insertion order; re-setting an existing key keeps its slot.
    order: VecDeque<String>,
}

/// Time-boxed response cache with an insertion-order size cap.
///
/// Expiry is enforced on both paths: a read past the TTL deletes the
/// entry and reports a miss, and a periodic `sweep_expired` purges
/// entries nobody reads.
#[derive(Clone)]
pub struct TtlCache<V> {
    inner: Arc<RwLock<Inner<V>>>,
    capacity: usize,
    default_ttl: Duration,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(capacity: usize, default_ttl: Duration) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            })),
            capacity,
            default_ttl,
        }
    }

    pub async fn insert(&self, key: impl Into<String>, value: V) {
        self.insert_with_ttl(key, value, self.default_ttl).await;
    }

    /// Store a value. At capacity the single oldest insertion is evicted
    /// first — insertion order, not recency of use.
    pub async fn insert_with_ttl(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let key = key.into();
        let mut inner = self.inner.write().await;

        if !inner.entries.contains_key(&key) {
            if inner.entries.len() >= self.capacity {
                if let Some(oldest) = inner.order.pop_front() {
                    inner.entries.remove(&oldest);
                }
            }
            inner.order.push_back(key.clone());
        }

        inner.entries.insert(
            key,
            Entry {
                value,
                stored_at: Instant::now(),
                ttl,
            },
        );
    }

    /// Fetch a live value. Expired entries are deleted on read and
    /// reported as a miss even if the sweeper has not caught them yet.
    pub async fn get(&self, key: &str) -> Option<V> {
        let mut inner = self.inner.write().await;
        match inner.entries.get(key) {
            Some(entry) if !entry.expired() => return Some(entry.value.clone()),
            Some(_) => {}
            None => return None,
        }
        inner.entries.remove(key);
        inner.order.retain(|k| k != key);
        None
    }

    /// Drop every expired entry; returns how many were removed.
    pub async fn sweep_expired(&self) -> usize {
        let mut inner = self.inner.write().await;
        let before = inner.entries.len();
        inner.entries.retain(|_, e| !e.expired());
        let removed = before - inner.entries.len();
        if removed > 0 {
            let live: Vec<String> = inner.entries.keys().cloned().collect();
            inner.order.retain(|k| live.contains(k));
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.entries.is_empty()
    }

    pub async fn clear(&self) {
        let mut inner = self.inner.write().await;
        inner.entries.clear();
        inner.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_before_ttl_hits_after_ttl_misses() {
        let cache: TtlCache<String> = TtlCache::new(10, Duration::from_secs(300));
        cache
            .insert_with_ttl("k", "v".to_string(), Duration::from_millis(100))
            .await;

        assert_eq!(cache.get("k").await.as_deref(), Some("v"));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(cache.get("k").await.is_none());
        // delete-on-read removed it entirely
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn full_cache_evicts_oldest_insertion() {
        let cache: TtlCache<u32> = TtlCache::new(2, Duration::from_secs(300));
        cache.insert("first", 1).await;
        cache.insert("second", 2).await;
        cache.insert("third", 3).await;

        assert!(cache.get("first").await.is_none());
        assert_eq!(cache.get("second").await, Some(2));
        assert_eq!(cache.get("third").await, Some(3));
        assert_eq!(cache.len().await, 2);
    }

    #[tokio::test]
    async fn resetting_a_key_keeps_its_insertion_slot() {
        let cache: TtlCache<u32> = TtlCache::new(2, Duration::from_secs(300));
        cache.insert("a", 1).await;
        cache.insert("b", 2).await;
        cache.insert("a", 10).await; // refresh, not a new insertion
        cache.insert("c", 3).await; // evicts "a", still the oldest slot

        assert!(cache.get("a").await.is_none());
        assert_eq!(cache.get("b").await, Some(2));
        assert_eq!(cache.get("c").await, Some(3));
    }

    #[tokio::test]
    async fn sweep_purges_expired_entries() {
        let cache: TtlCache<u32> = TtlCache::new(10, Duration::from_secs(300));
        cache
            .insert_with_ttl("short", 1, Duration::from_millis(50))
            .await;
        cache.insert("long", 2).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(cache.sweep_expired().await, 1);
        assert_eq!(cache.len().await, 1);
        assert_eq!(cache.get("long").await, Some(2));
    }
}
