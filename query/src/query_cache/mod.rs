use serde::{de::DeserializeOwned, Serialize};

use crate::{CacheError, Instant, InvalidationPolicy, QueryKey};

/// A serialized value and the time it was saved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// The serialized value.
    pub value: String,
    /// When the value was saved.
    pub saved_at: Instant,
}

impl CacheEntry {
    /// Creates an entry.
    pub fn new(value: impl Into<String>, saved_at: Instant) -> Self {
        Self {
            value: value.into(),
            saved_at,
        }
    }

    /// Whether this entry is valid at `now` under `policy`.
    pub fn is_valid(&self, now: Instant, policy: InvalidationPolicy) -> bool {
        policy.is_valid(self.saved_at, now)
    }
}

/// Storage for the last good value of each query key.
///
/// Implementations are shared by every query of a client and must keep keys independent of
/// each other. Writes replace the whole entry; a reader never observes half of one.
pub trait QueryCache: Send + Sync {
    /// Stores `entry` under `key`, replacing any previous entry.
    fn save(&self, key: &QueryKey, entry: CacheEntry) -> Result<(), CacheError>;

    /// Reads the entry under `key`.
    fn get(&self, key: &QueryKey) -> Result<Option<CacheEntry>, CacheError>;

    /// Removes the entry under `key`. Removing a missing entry is not an error.
    fn invalidate(&self, key: &QueryKey) -> Result<(), CacheError>;

    /// Removes every entry.
    fn clear(&self) -> Result<(), CacheError>;

    /// Whether an entry exists under `key` and is valid at `now`. Never mutates.
    fn is_valid(&self, key: &QueryKey, now: Instant, policy: InvalidationPolicy) -> bool {
        match self.get(key) {
            Ok(Some(entry)) => entry.is_valid(now, policy),
            Ok(None) => false,
            Err(error) => {
                tracing::warn!(%key, %error, "cache validity check failed");
                false
            }
        }
    }
}

/// Typed access on top of any [`QueryCache`]. Values are stored as JSON.
pub trait QueryCacheExt: QueryCache {
    /// Serializes and stores `value`.
    fn save_value<V: Serialize>(
        &self,
        key: &QueryKey,
        value: &V,
        saved_at: Instant,
    ) -> Result<(), CacheError> {
        let encoded = serde_json::to_string(value).map_err(|error| CacheError::Encode {
            key: key.clone(),
            reason: error.to_string(),
        })?;
        self.save(key, CacheEntry::new(encoded, saved_at))
    }

    /// Reads and deserializes the value under `key`.
    fn get_value<V: DeserializeOwned>(&self, key: &QueryKey) -> Result<Option<V>, CacheError> {
        let Some(entry) = self.get(key)? else {
            return Ok(None);
        };
        serde_json::from_str(&entry.value)
            .map(Some)
            .map_err(|error| CacheError::InvalidEntry {
                key: key.clone(),
                reason: error.to_string(),
            })
    }
}

impl<C: QueryCache + ?Sized> QueryCacheExt for C {}

/// Reads a value that is valid at `now`. Every failure is a miss.
pub(crate) fn read_valid<V: DeserializeOwned>(
    cache: &dyn QueryCache,
    key: &QueryKey,
    now: Instant,
    policy: InvalidationPolicy,
) -> Option<V> {
    if !cache.is_valid(key, now, policy) {
        return None;
    }
    match cache.get_value(key) {
        Ok(value) => value,
        Err(error) => {
            tracing::warn!(%key, %error, "treating unreadable cache entry as a miss");
            None
        }
    }
}

/// Writes through to the cache. Failures are logged and skipped.
pub(crate) fn write_through<V: Serialize>(
    cache: &dyn QueryCache,
    key: &QueryKey,
    value: &V,
    now: Instant,
) {
    if let Err(error) = cache.save_value(key, value, now) {
        tracing::warn!(%key, %error, "failed to write query value to cache");
    }
}

mod in_memory;
pub use in_memory::InMemoryCache;

#[cfg(feature = "file_cache")]
mod file_system;
#[cfg(feature = "file_cache")]
pub use file_system::FileSystemCache;

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn typed_values_round_trip_through_json() {
        let cache = InMemoryCache::new();
        let key = QueryKey::new("cards");

        cache
            .save_value(&key, &vec!["A".to_string(), "B".to_string()], Instant::from_millis(1))
            .unwrap();

        let stored = cache.get(&key).unwrap().unwrap();
        assert_eq!(stored.value, r#"["A","B"]"#);
        assert_eq!(
            cache.get_value::<Vec<String>>(&key).unwrap(),
            Some(vec!["A".to_string(), "B".to_string()])
        );
    }

    #[test]
    fn undecodable_entry_is_an_error_and_a_miss() {
        let cache = InMemoryCache::new();
        let key = QueryKey::new("count");
        cache
            .save(&key, CacheEntry::new("not json", Instant::from_millis(1)))
            .unwrap();

        assert!(matches!(
            cache.get_value::<u32>(&key),
            Err(CacheError::InvalidEntry { .. })
        ));
        assert_eq!(
            read_valid::<u32>(
                &cache,
                &key,
                Instant::from_millis(2),
                InvalidationPolicy::NeverExpires
            ),
            None
        );
    }

    #[test]
    fn read_valid_respects_expiry() {
        let cache = InMemoryCache::new();
        let key = QueryKey::new("count");
        let saved_at = Instant::from_millis(0);
        write_through(&cache, &key, &7_u32, saved_at);

        let policy = InvalidationPolicy::ExpiresAfter(Duration::from_secs(10));
        assert_eq!(
            read_valid::<u32>(&cache, &key, saved_at + Duration::from_secs(9), policy),
            Some(7)
        );
        assert_eq!(
            read_valid::<u32>(&cache, &key, saved_at + Duration::from_secs(10), policy),
            None
        );
    }
}
