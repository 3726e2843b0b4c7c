use dashmap::DashMap;

use crate::{CacheEntry, CacheError, Instant, InvalidationPolicy, QueryCache, QueryKey};

/// Process lifetime cache. Keys are sharded, so unrelated keys don't contend.
#[derive(Debug, Default)]
pub struct InMemoryCache {
    entries: DashMap<QueryKey, CacheEntry>,
}

impl InMemoryCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl QueryCache for InMemoryCache {
    fn save(&self, key: &QueryKey, entry: CacheEntry) -> Result<(), CacheError> {
        self.entries.insert(key.clone(), entry);
        Ok(())
    }

    fn get(&self, key: &QueryKey) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    fn invalidate(&self, key: &QueryKey) -> Result<(), CacheError> {
        self.entries.remove(key);
        Ok(())
    }

    fn clear(&self) -> Result<(), CacheError> {
        self.entries.clear();
        Ok(())
    }

    fn is_valid(&self, key: &QueryKey, now: Instant, policy: InvalidationPolicy) -> bool {
        self.entries
            .get(key)
            .map(|entry| entry.is_valid(now, policy))
            .unwrap_or(false)
    }
}
