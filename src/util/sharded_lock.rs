//! Generic per-key striped async mutex map, generalized from the
//! per-user lock pattern in `evaluators::behavior::ProfileStore` for reuse
//! anywhere the crate needs exclusive per-key state (the policy engine's
//! per-user counters today).

use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::sync::Mutex;

pub struct ShardedLockMap<K, V> {
    shards: Mutex<FxHashMap<K, Arc<Mutex<V>>>>,
}

impl<K, V> Default for ShardedLockMap<K, V>
where
    K: std::hash::Hash + Eq,
{
    fn default() -> Self {
        Self {
            shards: Mutex::new(FxHashMap::default()),
        }
    }
}

impl<K, V> ShardedLockMap<K, V>
where
    K: std::hash::Hash + Eq + Clone,
    V: Default,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the per-key lock, creating a default-initialized entry on
    /// first access. The caller holds the returned `Arc<Mutex<V>>` across
    /// its own read-then-update critical section.
    pub async fn lock_for(&self, key: &K) -> Arc<Mutex<V>> {
        let mut shards = self.shards.lock().await;
        shards.entry(key.clone()).or_insert_with(|| Arc::new(Mutex::new(V::default()))).clone()
    }

    pub async fn len(&self) -> usize {
        self.shards.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn distinct_keys_get_distinct_locks() {
        let map: ShardedLockMap<String, u32> = ShardedLockMap::new();
        let a = map.lock_for(&"a".to_string()).await;
        let b = map.lock_for(&"b".to_string()).await;
        *a.lock().await = 1;
        *b.lock().await = 2;
        assert_eq!(*a.lock().await, 1);
        assert_eq!(*b.lock().await, 2);
    }

    #[tokio::test]
    async fn same_key_returns_same_lock() {
        let map: ShardedLockMap<String, u32> = ShardedLockMap::new();
        let a = map.lock_for(&"a".to_string()).await;
        *a.lock().await = 7;
        let a_again = map.lock_for(&"a".to_string()).await;
        assert_eq!(*a_again.lock().await, 7);
        assert_eq!(map.len().await, 1);
    }
}
