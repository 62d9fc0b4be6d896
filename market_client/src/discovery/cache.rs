use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    fetched_at: Instant,
}

/// Read-through cache whose entries go stale after a fixed TTL.
///
/// Stale entries are kept until explicitly invalidated so a failed refresh
/// can still fall back to the last known value.
#[derive(Debug, Clone)]
pub struct TtlCache<K, V> {
    entries: Arc<RwLock<HashMap<K, Entry<V>>>>,
    ttl: Duration,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Value if present and younger than the TTL
    pub async fn get_fresh(&self, key: &K) -> Option<V> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|e| e.fetched_at.elapsed() < self.ttl)
            .map(|e| e.value.clone())
    }

    /// Value regardless of age
    pub async fn get_any(&self, key: &K) -> Option<V> {
        self.entries.read().await.get(key).map(|e| e.value.clone())
    }

    /// Last writer wins; all writers compute the same value for a key
    pub async fn insert(&self, key: K, value: V) {
        self.entries.write().await.insert(
            key,
            Entry {
                value,
                fetched_at: Instant::now(),
            },
        );
    }

    pub async fn invalidate(&self, key: &K) -> bool {
        self.entries.write().await.remove(key).is_some()
    }

    pub async fn invalidate_where<F>(&self, mut predicate: F)
    where
        F: FnMut(&K) -> bool,
    {
        self.entries.write().await.retain(|k, _| !predicate(k));
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
