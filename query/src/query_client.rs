use std::{future::Future, sync::Arc};

use serde::Serialize;

use crate::{
    query_cache::write_through, Clock, DefaultQueryOptions, FetchError, InMemoryCache, Instant,
    Invalidation, Mutation, PageKey, PaginatedQuery, PaginatedQueryOptions, Query, QueryBus,
    QueryCache, QueryConsumer, QueryError, QueryInvalidator, QueryKey, QueryOptions,
    QueryRegistry, QueryRequest, QueryState, QueryValue, SystemClock,
};

/// The Query Client bundles everything queries share.
/// Exposes utility functions to manage queries.
///
/// Queries can be:
/// - [Created](Self::create_query), along with [paginated](Self::create_paginated_query)
///   queries and [mutations](Self::create_mutation).
/// - [Consumed](Self::consumer) by key, without owning them.
/// - [Invalidated](Self::invalidate_query)
///     - The query under the key refetches right away.
/// - [Introspected](Self::peek_query_state)
///     - Lets you see the current state of a query.
/// - [Manually updated](Self::set_query_data)
///     - Useful when you already know the new value and don't want to wait for a refetch.
///
/// Cloning is cheap and every clone shares the same cache, bus and registry.
#[derive(Clone)]
pub struct QueryClient {
    cache: Arc<dyn QueryCache>,
    bus: QueryBus,
    registry: QueryRegistry,
    clock: Arc<dyn Clock>,
    default_options: DefaultQueryOptions,
}

impl QueryClient {
    /// Creates a new Query Client over `cache`.
    pub fn new(cache: Arc<dyn QueryCache>) -> Self {
        Self {
            cache,
            bus: QueryBus::new(),
            registry: QueryRegistry::new(),
            clock: Arc::new(SystemClock),
            default_options: DefaultQueryOptions::default(),
        }
    }

    /// Creates a new Query Client with a fresh [`InMemoryCache`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryCache::new()))
    }

    /// Replaces the client wide defaults.
    pub fn with_options(self, default_options: DefaultQueryOptions) -> Self {
        Self {
            default_options: DefaultQueryOptions {
                cache_config: default_options.cache_config.validate(),
                ..default_options
            },
            ..self
        }
    }

    /// Replaces the clock used to stamp and validate cache entries.
    pub fn with_clock(self, clock: Arc<dyn Clock>) -> Self {
        Self { clock, ..self }
    }

    /// The shared cache.
    pub fn cache(&self) -> &Arc<dyn QueryCache> {
        &self.cache
    }

    /// The notification bus.
    pub fn bus(&self) -> &QueryBus {
        &self.bus
    }

    /// The query registry.
    pub fn registry(&self) -> &QueryRegistry {
        &self.registry
    }

    /// The client wide defaults.
    pub fn default_options(&self) -> DefaultQueryOptions {
        self.default_options
    }

    /// The current time according to the client's clock.
    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    /// Creates a query under `key`, registered so consumers can find it.
    ///
    /// A query created later under the same key takes over the registration.
    pub fn create_query<R, V, E, Fu>(
        &self,
        key: QueryKey,
        fetcher: impl Fn(R) -> Fu + 'static,
        options: QueryOptions<R>,
    ) -> Query<R, V>
    where
        R: QueryRequest,
        V: QueryValue,
        E: Into<FetchError>,
        Fu: Future<Output = Result<V, E>> + 'static,
    {
        Query::new(self, key, fetcher, options)
    }

    /// Creates a paginated query under `key`.
    pub fn create_paginated_query<R, P, T, E, Fu>(
        &self,
        key: QueryKey,
        fetcher: impl Fn(R, P) -> Fu + 'static,
        options: PaginatedQueryOptions<R>,
    ) -> PaginatedQuery<R, P, T>
    where
        R: QueryRequest,
        P: PageKey,
        T: QueryValue,
        E: Into<FetchError>,
        Fu: Future<Output = Result<Vec<T>, E>> + 'static,
    {
        PaginatedQuery::new(self, key, fetcher, options)
    }

    /// Creates a mutation. Its success callback gets an invalidator bound to this client.
    pub fn create_mutation<R, V, E, Fu>(
        &self,
        fetcher: impl Fn(R) -> Fu + 'static,
    ) -> Mutation<R, V>
    where
        R: 'static,
        V: Clone + 'static,
        E: Into<FetchError>,
        Fu: Future<Output = Result<V, E>> + 'static,
    {
        Mutation::new(self.invalidator(), fetcher)
    }

    /// Observes the query registered under `key`.
    ///
    /// Fails if nothing is registered or the query holds another value type.
    pub fn consumer<R, V>(&self, key: &QueryKey) -> Result<QueryConsumer<R, V>, QueryError>
    where
        R: Clone + 'static,
        V: Clone + 'static,
    {
        QueryConsumer::resolve(&self.registry, &self.bus, key)
    }

    /// Asks the query under `key` to refetch. Returns how many queries received it.
    pub fn invalidate_query<R: 'static>(
        &self,
        key: &QueryKey,
        invalidation: Invalidation<R>,
    ) -> usize {
        self.bus.invalidate(key, invalidation)
    }

    /// An invalidator bound to this client's bus.
    pub fn invalidator(&self) -> QueryInvalidator {
        QueryInvalidator::new(self.bus.clone())
    }

    /// The state of the query registered under `key`, if there is one.
    pub fn peek_query_state<V>(&self, key: &QueryKey) -> Option<QueryState<V>>
    where
        V: Clone + 'static,
    {
        match self.registry.resolve::<V>(key) {
            Ok(query) => Some(query.state()),
            Err(error) => {
                tracing::debug!(%key, %error, "no query state to peek");
                None
            }
        }
    }

    /// Stores `value` under `key` and hands it to every live query on that key.
    pub fn set_query_data<V>(&self, key: &QueryKey, value: V)
    where
        V: Serialize + 'static,
    {
        write_through(self.cache.as_ref(), key, &value, self.now());
        self.bus.publish_new_data(key, Some(value));
    }

    /// Drops the cached value under `key` and tells live queries on that key.
    pub fn remove_query_data<V: 'static>(&self, key: &QueryKey) {
        if let Err(error) = self.cache.invalidate(key) {
            tracing::warn!(%key, %error, "failed to remove cached query data");
        }
        self.bus.publish_new_data::<V>(key, None);
    }

    /// Drops every cached value. Live queries keep their state.
    pub fn clear_cache(&self) {
        if let Err(error) = self.cache.clear() {
            tracing::warn!(%error, "failed to clear query cache");
        }
    }
}

impl std::fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryClient")
            .field("registry", &self.registry)
            .field("bus", &self.bus)
            .field("default_options", &self.default_options)
            .finish()
    }
}
