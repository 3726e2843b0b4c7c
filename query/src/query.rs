use std::{
    cell::{Cell, RefCell},
    future::Future,
    rc::Rc,
};

use futures::Stream;
use futures_channel::oneshot;

use crate::{
    query_cache::{read_valid, write_through},
    query_executor::{make_fetcher, spawn_polling, Fetcher},
    query_options::resolve_key,
    AnyQuery, BusSubscription, FetchError, FetchingBehavior, Invalidation, KeyAdapter,
    PollingBehavior, QueryCacheConfig, QueryClient, QueryError, QueryId, QueryKey, QueryOptions,
    QueryRequest, QueryState, QueryValue, StatePublisher, StateStream, UsagePolicy,
};

/// A single value query.
///
/// Owns the fetch lifecycle for one key: it consults the cache per its policy, calls the fetcher,
/// writes successful values through to the cache and publishes every state change.
///
/// Create one with [`QueryClient::create_query`]. Must be used inside a
/// [`LocalSet`](tokio::task::LocalSet). Dropping the query disposes it.
pub struct Query<R, V>
where
    R: QueryRequest,
    V: QueryValue,
{
    inner: Rc<QueryInner<R, V>>,
}

struct QueryInner<R, V> {
    id: QueryId,
    key: QueryKey,
    config: QueryCacheConfig,
    polling: PollingBehavior,
    key_adapter: Option<KeyAdapter<R>>,
    client: QueryClient,
    fetcher: Fetcher<R, V>,

    // State
    state: StatePublisher<V>,
    last_request: RefCell<Option<R>>,

    // Stale fetch guard
    generation: Cell<u64>,
    // Set while the fetch of the current generation has not landed
    in_flight: Cell<bool>,

    // Cancellation
    poll_cancellation: RefCell<Option<oneshot::Sender<()>>>,

    subscriptions: RefCell<Vec<BusSubscription>>,
    disposed: Cell<bool>,
}

/// A fetch that has been issued but whose result has not been applied yet.
struct PendingFetch<V> {
    generation: u64,
    cache_key: QueryKey,
    result: futures::future::LocalBoxFuture<'static, Result<V, FetchError>>,
}

impl<R, V> Query<R, V>
where
    R: QueryRequest,
    V: QueryValue,
{
    pub(crate) fn new<Fu, E>(
        client: &QueryClient,
        key: QueryKey,
        fetcher: impl Fn(R) -> Fu + 'static,
        options: QueryOptions<R>,
    ) -> Self
    where
        Fu: Future<Output = Result<V, E>> + 'static,
        E: Into<FetchError>,
    {
        let defaults = client.default_options();
        let QueryOptions {
            behavior,
            polling,
            cache_config,
            key_adapter,
        } = options;

        let inner = Rc::new(QueryInner {
            id: QueryId::next(),
            key,
            config: cache_config.unwrap_or(defaults.cache_config).validate(),
            polling: polling.unwrap_or(defaults.polling),
            key_adapter,
            client: client.clone(),
            fetcher: make_fetcher(fetcher),
            state: StatePublisher::new(QueryState::Idle),
            last_request: RefCell::new(None),
            generation: Cell::new(0),
            in_flight: Cell::new(false),
            poll_cancellation: RefCell::new(None),
            subscriptions: RefCell::new(Vec::new()),
            disposed: Cell::new(false),
        });

        inner.subscribe_to_bus();
        client
            .registry()
            .register_owned(inner.id, AnyQuery::new(inner.key.clone(), inner.state.clone()));

        match behavior {
            FetchingBehavior::StartWhenRequested => inner.seed_from_cache(),
            FetchingBehavior::StartImmediately(request) => inner.refetch(request),
        }

        Query { inner }
    }

    /// The key this query is registered under.
    pub fn key(&self) -> &QueryKey {
        &self.inner.key
    }

    /// Identity of this instance.
    pub fn id(&self) -> QueryId {
        self.inner.id
    }

    /// The effective cache policy.
    pub fn cache_config(&self) -> QueryCacheConfig {
        self.inner.config
    }

    /// The current state.
    pub fn state(&self) -> QueryState<V> {
        self.inner.state.get()
    }

    /// The current value, if the last transition was a success.
    pub fn value(&self) -> Option<V> {
        self.inner.state.value()
    }

    /// Publisher of every state change.
    pub fn state_publisher(&self) -> &StatePublisher<V> {
        &self.inner.state
    }

    /// Stream of states, starting with the current one.
    pub fn state_stream(&self) -> StateStream<V> {
        self.inner.state.stream()
    }

    /// Stream of succeeded values.
    pub fn value_stream(&self) -> impl Stream<Item = V> {
        self.inner.state.values()
    }

    /// A type erased handle, as stored in the registry.
    pub fn handle(&self) -> AnyQuery<V> {
        AnyQuery::new(self.inner.key.clone(), self.inner.state.clone())
    }

    /// The request of the most recent refetch.
    pub fn last_request(&self) -> Option<R> {
        self.inner.last_request.borrow().clone()
    }

    /// Starts a refetch with `request`. Returns immediately; observe the state for the outcome.
    pub fn refetch(&self, request: R) {
        self.inner.refetch(request)
    }

    /// Refetches with the last request.
    pub fn refetch_last(&self) -> Result<(), QueryError> {
        let request = self
            .last_request()
            .ok_or_else(|| QueryError::NoPreviousRequest(self.inner.key.clone()))?;
        self.inner.refetch(request);
        Ok(())
    }

    /// Like [`refetch`](Self::refetch), but waits for the fetch and returns the resulting state.
    ///
    /// If a newer fetch was issued meanwhile, the returned state is whatever that one left.
    pub async fn fetch(&self, request: R) -> QueryState<V> {
        if let Some(pending) = self.inner.begin_refetch(request) {
            let PendingFetch {
                generation,
                cache_key,
                result,
            } = pending;
            let result = result.await;
            self.inner.complete(generation, &cache_key, result);
        }
        self.state()
    }

    /// Stops polling, drops bus subscriptions and unregisters. In-flight fetches finish but
    /// their results are discarded.
    pub fn dispose(&self) {
        self.inner.dispose()
    }

    /// Whether [`dispose`](Self::dispose) has been called.
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.get()
    }
}

impl<R, V> Drop for Query<R, V>
where
    R: QueryRequest,
    V: QueryValue,
{
    fn drop(&mut self) {
        self.inner.dispose()
    }
}

impl<R, V> std::fmt::Debug for Query<R, V>
where
    R: QueryRequest + std::fmt::Debug,
    V: QueryValue,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("id", &self.inner.id)
            .field("key", &self.inner.key)
            .field("state", &self.inner.state.get())
            .field("last_request", &self.inner.last_request.borrow())
            .field("config", &self.inner.config)
            .field("polling", &self.inner.polling)
            .finish()
    }
}

impl<R, V> QueryInner<R, V>
where
    R: QueryRequest,
    V: QueryValue,
{
    fn subscribe_to_bus(self: &Rc<Self>) {
        let bus = self.client.bus();

        let weak = Rc::downgrade(self);
        let invalidation = bus.on_invalidate::<R>(&self.key, move |invalidation| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            match invalidation {
                Invalidation::NewRequest(request) => inner.refetch(request),
                Invalidation::LastRequest => {
                    let last = inner.last_request.borrow().clone();
                    match last {
                        Some(request) => inner.refetch(request),
                        None => {
                            tracing::debug!(key = %inner.key, "invalidated before any request")
                        }
                    }
                }
            }
        });

        let weak = Rc::downgrade(self);
        let id = self.id;
        let new_data = bus.on_new_data_from::<V>(&self.key, move |origin, value| {
            if origin == Some(id) {
                return;
            }
            let (Some(inner), Some(value)) = (weak.upgrade(), value) else {
                return;
            };
            inner.set_state(QueryState::Succeeded(value.clone()));
        });

        self.subscriptions
            .borrow_mut()
            .extend([invalidation, new_data]);
    }

    fn cached(&self, cache_key: &QueryKey) -> Option<V> {
        read_valid(
            self.client.cache().as_ref(),
            cache_key,
            self.client.now(),
            self.config.invalidation,
        )
    }

    fn seed_from_cache(&self) {
        if matches!(
            self.config.usage,
            UsagePolicy::PreferCache | UsagePolicy::NetworkThenReconcileWithCache
        ) {
            if let Some(value) = self.cached(&self.key) {
                self.set_state(QueryState::Succeeded(value));
            }
        }
    }

    fn refetch(self: &Rc<Self>, request: R) {
        if let Some(pending) = self.begin_refetch(request) {
            self.spawn_completion(pending);
        }
    }

    /// Everything a refetch does up to the network call. `None` when the cache answered.
    fn begin_refetch(self: &Rc<Self>, request: R) -> Option<PendingFetch<V>> {
        if self.disposed.get() {
            tracing::warn!(key = %self.key, "refetch on a disposed query");
            return None;
        }

        *self.last_request.borrow_mut() = Some(request.clone());
        self.cancel_polling();

        let cache_key = resolve_key(&self.key_adapter, &self.key, &request);
        let cached = match self.config.usage {
            UsagePolicy::PreferCache | UsagePolicy::NetworkThenReconcileWithCache => {
                self.cached(&cache_key)
            }
            UsagePolicy::PreferNetworkFallbackToCache => None,
        };

        match (self.config.usage, cached) {
            (UsagePolicy::PreferCache, Some(value)) => {
                // A cache answer supersedes anything still in flight.
                self.bump_generation();
                self.in_flight.set(false);
                self.set_state(QueryState::Succeeded(value));
                return None;
            }
            (UsagePolicy::NetworkThenReconcileWithCache, Some(value)) => {
                self.set_state(QueryState::Succeeded(value))
            }
            _ => self.set_state(QueryState::Loading),
        }

        let pending = self.issue_fetch(request.clone(), cache_key.clone());
        self.start_polling(request, cache_key);
        Some(pending)
    }

    fn bump_generation(&self) -> u64 {
        let generation = self.generation.get() + 1;
        self.generation.set(generation);
        generation
    }

    fn issue_fetch(&self, request: R, cache_key: QueryKey) -> PendingFetch<V> {
        self.in_flight.set(true);
        PendingFetch {
            generation: self.bump_generation(),
            cache_key,
            result: (self.fetcher)(request),
        }
    }

    fn spawn_completion(self: &Rc<Self>, pending: PendingFetch<V>) {
        let weak = Rc::downgrade(self);
        tokio::task::spawn_local(async move {
            let PendingFetch {
                generation,
                cache_key,
                result,
            } = pending;
            let result = result.await;
            if let Some(inner) = weak.upgrade() {
                inner.complete(generation, &cache_key, result);
            }
        });
    }

    fn complete(&self, generation: u64, cache_key: &QueryKey, result: Result<V, FetchError>) {
        if self.disposed.get() {
            tracing::debug!(key = %self.key, "discarding fetch result of a disposed query");
            return;
        }
        if generation != self.generation.get() {
            tracing::debug!(
                key = %self.key,
                generation,
                current = self.generation.get(),
                "discarding stale fetch result"
            );
            return;
        }
        self.in_flight.set(false);

        match result {
            Ok(value) => {
                write_through(
                    self.client.cache().as_ref(),
                    cache_key,
                    &value,
                    self.client.now(),
                );
                self.set_state(QueryState::Succeeded(value.clone()));
                self.client
                    .bus()
                    .publish_new_data_from(Some(self.id), &self.key, Some(value));
            }
            Err(error) => {
                if self.config.usage == UsagePolicy::PreferNetworkFallbackToCache {
                    if let Some(value) = self.cached(cache_key) {
                        tracing::warn!(
                            key = %cache_key,
                            %error,
                            "fetch failed, serving cached value"
                        );
                        self.set_state(QueryState::Succeeded(value));
                        return;
                    }
                }
                self.set_state(QueryState::Failed(error));
            }
        }
    }

    fn start_polling(self: &Rc<Self>, request: R, cache_key: QueryKey) {
        let PollingBehavior::PollEvery(period) = self.polling else {
            return;
        };
        if period.is_zero() {
            tracing::warn!(key = %self.key, "ignoring zero poll interval");
            return;
        }

        let (sender, receiver) = oneshot::channel();
        *self.poll_cancellation.borrow_mut() = Some(sender);

        let weak = Rc::downgrade(self);
        spawn_polling(period, receiver, move || {
            let Some(inner) = weak.upgrade() else {
                return false;
            };
            if inner.disposed.get() {
                return false;
            }
            if inner.in_flight.get() {
                tracing::debug!(key = %inner.key, "skipping poll tick, fetch still in flight");
                return true;
            }
            tracing::debug!(key = %inner.key, "polling");
            let pending = inner.issue_fetch(request.clone(), cache_key.clone());
            inner.spawn_completion(pending);
            true
        });
    }

    fn cancel_polling(&self) {
        if let Some(sender) = self.poll_cancellation.borrow_mut().take() {
            let _ = sender.send(());
        }
    }

    fn set_state(&self, state: QueryState<V>) {
        if self.disposed.get() {
            return;
        }
        self.state.set(state);
    }

    fn dispose(&self) {
        if self.disposed.replace(true) {
            return;
        }
        self.cancel_polling();
        let subscriptions = std::mem::take(&mut *self.subscriptions.borrow_mut());
        drop(subscriptions);
        self.client.registry().unregister_owned(&self.key, self.id);
    }
}
