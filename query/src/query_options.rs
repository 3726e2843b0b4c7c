use std::{fmt, rc::Rc, time::Duration};

use crate::{Instant, QueryKey};

/// How long a cache entry stays valid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InvalidationPolicy {
    /// Entries are valid for as long as they exist.
    #[default]
    NeverExpires,
    /// Entries are valid while `saved_at + duration > now`.
    ExpiresAfter(Duration),
}

impl InvalidationPolicy {
    /// Whether an entry saved at `saved_at` is still valid at `now`.
    pub fn is_valid(&self, saved_at: Instant, now: Instant) -> bool {
        match self {
            InvalidationPolicy::NeverExpires => true,
            InvalidationPolicy::ExpiresAfter(ttl) => saved_at + *ttl > now,
        }
    }
}

/// How the cache is used relative to the network.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UsagePolicy {
    /// Serve a valid cached value and skip the fetch entirely.
    PreferCache,
    /// Always fetch. On failure, serve a valid cached value instead of the error.
    /// The error is logged, not surfaced.
    #[default]
    PreferNetworkFallbackToCache,
    /// Serve a valid cached value immediately, then fetch and replace it.
    NetworkThenReconcileWithCache,
}

/// Cache behavior of a query. Immutable once the query is built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryCacheConfig {
    /// Time to live of cache entries.
    pub invalidation: InvalidationPolicy,
    /// Cache versus network preference.
    pub usage: UsagePolicy,
}

impl QueryCacheConfig {
    /// Creates a config from both policies.
    pub fn new(invalidation: InvalidationPolicy, usage: UsagePolicy) -> Self {
        Self {
            invalidation,
            usage,
        }
    }

    /// Set the invalidation policy.
    pub fn set_invalidation(self, invalidation: InvalidationPolicy) -> Self {
        QueryCacheConfig {
            invalidation,
            ..self
        }
    }

    /// Set the usage policy.
    pub fn set_usage(self, usage: UsagePolicy) -> Self {
        QueryCacheConfig { usage, ..self }
    }

    /// Warns about policies that can never hit the cache.
    pub fn validate(self) -> Self {
        if let InvalidationPolicy::ExpiresAfter(ttl) = self.invalidation {
            if ttl.is_zero() && self.usage != UsagePolicy::PreferNetworkFallbackToCache {
                tracing::warn!(
                    usage = ?self.usage,
                    "cache entries expire immediately, the cache will never be served"
                );
            }
        }
        self
    }
}

/// What a query does when it is created.
#[derive(Clone)]
pub enum FetchingBehavior<R> {
    /// Wait for the first `refetch`. A valid cache entry may seed the state if the usage
    /// policy allows serving cache before the network.
    StartWhenRequested,
    /// Fetch right away with this request.
    StartImmediately(R),
}

impl<R> Default for FetchingBehavior<R> {
    fn default() -> Self {
        FetchingBehavior::StartWhenRequested
    }
}

impl<R: fmt::Debug> fmt::Debug for FetchingBehavior<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StartWhenRequested => write!(f, "StartWhenRequested"),
            Self::StartImmediately(request) => {
                f.debug_tuple("StartImmediately").field(request).finish()
            }
        }
    }
}

/// Periodic re-fetching.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PollingBehavior {
    /// Only fetch when asked.
    #[default]
    NoPolling,
    /// Re-fetch the last request on this period.
    ///
    /// A tick that finds the previous fetch still in flight is skipped, so a fetch slower than
    /// the period is never made stale by polling.
    PollEvery(Duration),
}

/// Derives the cache key of a request from the query's base key.
pub type KeyAdapter<R> = Rc<dyn Fn(&QueryKey, &R) -> QueryKey>;

/// Client wide defaults.
/// Only differs from [`QueryOptions`] in that every field has a concrete value.
#[derive(Debug, Clone, Copy)]
pub struct DefaultQueryOptions {
    /// Cache policy used by queries that don't override it.
    pub cache_config: QueryCacheConfig,
    /// Polling used by queries that don't override it.
    pub polling: PollingBehavior,
}

impl Default for DefaultQueryOptions {
    fn default() -> Self {
        Self {
            cache_config: DEFAULT_CACHE_CONFIG,
            polling: PollingBehavior::NoPolling,
        }
    }
}

const DEFAULT_CACHE_CONFIG: QueryCacheConfig = QueryCacheConfig {
    invalidation: InvalidationPolicy::NeverExpires,
    usage: UsagePolicy::PreferNetworkFallbackToCache,
};

/// Options for a single value [`Query`](crate::Query).
///
/// Fields left as `None` fall back to the client's [`DefaultQueryOptions`].
#[derive(Clone)]
pub struct QueryOptions<R> {
    /// What happens at construction.
    pub behavior: FetchingBehavior<R>,
    /// Polling override.
    pub polling: Option<PollingBehavior>,
    /// Cache policy override.
    pub cache_config: Option<QueryCacheConfig>,
    /// Derives a per-request cache key. Defaults to the query key itself.
    pub key_adapter: Option<KeyAdapter<R>>,
}

impl<R> Default for QueryOptions<R> {
    fn default() -> Self {
        Self {
            behavior: FetchingBehavior::StartWhenRequested,
            polling: None,
            cache_config: None,
            key_adapter: None,
        }
    }
}

impl<R> QueryOptions<R> {
    /// Set the start-up behavior.
    pub fn set_behavior(self, behavior: FetchingBehavior<R>) -> Self {
        QueryOptions { behavior, ..self }
    }

    /// Set the polling behavior.
    pub fn set_polling(self, polling: PollingBehavior) -> Self {
        QueryOptions {
            polling: Some(polling),
            ..self
        }
    }

    /// Set the cache config.
    pub fn set_cache_config(self, cache_config: QueryCacheConfig) -> Self {
        QueryOptions {
            cache_config: Some(cache_config),
            ..self
        }
    }

    /// Set the key adapter.
    pub fn set_key_adapter(self, adapter: impl Fn(&QueryKey, &R) -> QueryKey + 'static) -> Self {
        QueryOptions {
            key_adapter: Some(Rc::new(adapter)),
            ..self
        }
    }
}

impl<R: fmt::Debug> fmt::Debug for QueryOptions<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryOptions")
            .field("behavior", &self.behavior)
            .field("polling", &self.polling)
            .field("cache_config", &self.cache_config)
            .field("key_adapter", &self.key_adapter.as_ref().map(|_| "..."))
            .finish()
    }
}

/// Options for a [`PaginatedQuery`](crate::PaginatedQuery).
#[derive(Clone)]
pub struct PaginatedQueryOptions<R> {
    /// What happens at construction. `StartImmediately` fetches the first page.
    pub behavior: FetchingBehavior<R>,
    /// Cache policy override, evaluated per page.
    pub cache_config: Option<QueryCacheConfig>,
    /// Derives a per-request base key; the page is appended to it.
    pub key_adapter: Option<KeyAdapter<R>>,
}

impl<R> Default for PaginatedQueryOptions<R> {
    fn default() -> Self {
        Self {
            behavior: FetchingBehavior::StartWhenRequested,
            cache_config: None,
            key_adapter: None,
        }
    }
}

impl<R> PaginatedQueryOptions<R> {
    /// Set the start-up behavior.
    pub fn set_behavior(self, behavior: FetchingBehavior<R>) -> Self {
        PaginatedQueryOptions { behavior, ..self }
    }

    /// Set the cache config.
    pub fn set_cache_config(self, cache_config: QueryCacheConfig) -> Self {
        PaginatedQueryOptions {
            cache_config: Some(cache_config),
            ..self
        }
    }

    /// Set the key adapter.
    pub fn set_key_adapter(self, adapter: impl Fn(&QueryKey, &R) -> QueryKey + 'static) -> Self {
        PaginatedQueryOptions {
            key_adapter: Some(Rc::new(adapter)),
            ..self
        }
    }
}

pub(crate) fn resolve_key<R>(
    adapter: &Option<KeyAdapter<R>>,
    key: &QueryKey,
    request: &R,
) -> QueryKey {
    match adapter {
        Some(adapter) => adapter(key, request),
        None => key.clone(),
    }
}
