use std::{
    cell::{Cell, RefCell},
    future::Future,
    rc::Rc,
};

use futures::Stream;

use crate::{
    query_cache::{read_valid, write_through},
    query_executor::{make_page_fetcher, PageFetcher},
    query_options::resolve_key,
    AnyQuery, BusSubscription, FetchError, FetchingBehavior, Invalidation, KeyAdapter, PageKey,
    PaginatedQueryOptions, QueryCacheConfig, QueryClient, QueryError, QueryId, QueryKey,
    QueryRequest, QueryState, QueryValue, StatePublisher, StateStream, UsagePolicy,
};

/// A query that accumulates pages of items.
///
/// [`refetch_all`](Self::refetch_all) starts over from the first page,
/// [`fetch_next_page`](Self::fetch_next_page) appends the page after the last one. The succeeded
/// value is every fetched page concatenated in page order. Each page is cached under its own key:
/// the query key (or the adapter's key for the request) with the page key appended.
///
/// Must be used inside a [`LocalSet`](tokio::task::LocalSet). Dropping the query disposes it.
pub struct PaginatedQuery<R, P, T>
where
    R: QueryRequest,
    P: PageKey,
    T: QueryValue,
{
    inner: Rc<PaginatedInner<R, P, T>>,
}

/// One requested page. `items` stays `None` until the page arrives.
struct PageSlot<P, T> {
    page: P,
    items: Option<Vec<T>>,
}

struct PaginatedInner<R, P, T> {
    id: QueryId,
    key: QueryKey,
    config: QueryCacheConfig,
    key_adapter: Option<KeyAdapter<R>>,
    client: QueryClient,
    fetcher: PageFetcher<R, P, T>,

    state: StatePublisher<Vec<T>>,
    last_request: RefCell<Option<R>>,
    pages: RefCell<Vec<PageSlot<P, T>>>,

    // Bumped by every refetch_all, so pages of an abandoned run are dropped.
    generation: Cell<u64>,

    subscriptions: RefCell<Vec<BusSubscription>>,
    disposed: Cell<bool>,
}

impl<R, P, T> PaginatedQuery<R, P, T>
where
    R: QueryRequest,
    P: PageKey,
    T: QueryValue,
{
    pub(crate) fn new<Fu, E>(
        client: &QueryClient,
        key: QueryKey,
        fetcher: impl Fn(R, P) -> Fu + 'static,
        options: PaginatedQueryOptions<R>,
    ) -> Self
    where
        Fu: Future<Output = Result<Vec<T>, E>> + 'static,
        E: Into<FetchError>,
    {
        let PaginatedQueryOptions {
            behavior,
            cache_config,
            key_adapter,
        } = options;

        let inner = Rc::new(PaginatedInner {
            id: QueryId::next(),
            key,
            config: cache_config
                .unwrap_or(client.default_options().cache_config)
                .validate(),
            key_adapter,
            client: client.clone(),
            fetcher: make_page_fetcher(fetcher),
            state: StatePublisher::new(QueryState::Idle),
            last_request: RefCell::new(None),
            pages: RefCell::new(Vec::new()),
            generation: Cell::new(0),
            subscriptions: RefCell::new(Vec::new()),
            disposed: Cell::new(false),
        });

        inner.subscribe_to_bus();
        client
            .registry()
            .register_owned(inner.id, AnyQuery::new(inner.key.clone(), inner.state.clone()));

        match behavior {
            FetchingBehavior::StartWhenRequested => inner.seed_from_cache(),
            FetchingBehavior::StartImmediately(request) => inner.refetch_all(request),
        }

        PaginatedQuery { inner }
    }

    /// The key this query is registered under.
    pub fn key(&self) -> &QueryKey {
        &self.inner.key
    }

    /// The current state. The succeeded value is the accumulated items.
    pub fn state(&self) -> QueryState<Vec<T>> {
        self.inner.state.get()
    }

    /// Every item fetched since the last [`refetch_all`](Self::refetch_all), in page order.
    pub fn items(&self) -> Vec<T> {
        self.inner.accumulated()
    }

    /// The last requested page, or the first page if nothing was requested.
    pub fn current_page(&self) -> P {
        self.inner
            .pages
            .borrow()
            .last()
            .map(|slot| slot.page.clone())
            .unwrap_or_else(P::first)
    }

    /// Number of pages requested since the last [`refetch_all`](Self::refetch_all).
    pub fn page_count(&self) -> usize {
        self.inner.pages.borrow().len()
    }

    /// The request pages are fetched with.
    pub fn last_request(&self) -> Option<R> {
        self.inner.last_request.borrow().clone()
    }

    /// Publisher of every state change.
    pub fn state_publisher(&self) -> &StatePublisher<Vec<T>> {
        &self.inner.state
    }

    /// Stream of states, starting with the current one.
    pub fn state_stream(&self) -> StateStream<Vec<T>> {
        self.inner.state.stream()
    }

    /// Stream of accumulated items, one per successful page.
    pub fn value_stream(&self) -> impl Stream<Item = Vec<T>> {
        self.inner.state.values()
    }

    /// A type erased handle, as stored in the registry.
    pub fn handle(&self) -> AnyQuery<Vec<T>> {
        AnyQuery::new(self.inner.key.clone(), self.inner.state.clone())
    }

    /// Drops every page and fetches the first page for `request`.
    pub fn refetch_all(&self, request: R) {
        self.inner.refetch_all(request)
    }

    /// Fetches the page after the last requested one, with the last request.
    pub fn fetch_next_page(&self) -> Result<(), QueryError> {
        self.inner.fetch_next_page()
    }

    /// Drops bus subscriptions and unregisters. Pages still in flight are discarded.
    pub fn dispose(&self) {
        self.inner.dispose()
    }

    /// Whether [`dispose`](Self::dispose) has been called.
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.get()
    }
}

impl<R, P, T> Drop for PaginatedQuery<R, P, T>
where
    R: QueryRequest,
    P: PageKey,
    T: QueryValue,
{
    fn drop(&mut self) {
        self.inner.dispose()
    }
}

impl<R, P, T> std::fmt::Debug for PaginatedQuery<R, P, T>
where
    R: QueryRequest + std::fmt::Debug,
    P: PageKey,
    T: QueryValue,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaginatedQuery")
            .field("key", &self.inner.key)
            .field("current_page", &self.current_page())
            .field("page_count", &self.page_count())
            .field("last_request", &self.inner.last_request.borrow())
            .field("state", &self.inner.state.get())
            .finish()
    }
}

impl<R, P, T> PaginatedInner<R, P, T>
where
    R: QueryRequest,
    P: PageKey,
    T: QueryValue,
{
    fn subscribe_to_bus(self: &Rc<Self>) {
        let weak = Rc::downgrade(self);
        let invalidation = self
            .client
            .bus()
            .on_invalidate::<R>(&self.key, move |invalidation| {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                match invalidation {
                    Invalidation::NewRequest(request) => inner.refetch_all(request),
                    Invalidation::LastRequest => {
                        let last = inner.last_request.borrow().clone();
                        match last {
                            Some(request) => inner.refetch_all(request),
                            None => {
                                tracing::debug!(key = %inner.key, "invalidated before any request")
                            }
                        }
                    }
                }
            });
        self.subscriptions.borrow_mut().push(invalidation);
    }

    fn page_cache_key(&self, request: &R, page: &P) -> QueryKey {
        resolve_key(&self.key_adapter, &self.key, request).append_key(page)
    }

    fn cached(&self, cache_key: &QueryKey) -> Option<Vec<T>> {
        read_valid(
            self.client.cache().as_ref(),
            cache_key,
            self.client.now(),
            self.config.invalidation,
        )
    }

    fn seed_from_cache(&self) {
        if !matches!(
            self.config.usage,
            UsagePolicy::PreferCache | UsagePolicy::NetworkThenReconcileWithCache
        ) {
            return;
        }
        let first = P::first();
        if let Some(items) = self.cached(&self.key.append_key(&first)) {
            self.pages.borrow_mut().push(PageSlot {
                page: first,
                items: Some(items),
            });
            self.publish_accumulated();
        }
    }

    fn refetch_all(self: &Rc<Self>, request: R) {
        if self.disposed.get() {
            tracing::warn!(key = %self.key, "refetch on a disposed query");
            return;
        }
        *self.last_request.borrow_mut() = Some(request.clone());
        self.generation.set(self.generation.get() + 1);
        self.pages.borrow_mut().clear();
        self.fetch_page(request, P::first());
    }

    fn fetch_next_page(self: &Rc<Self>) -> Result<(), QueryError> {
        let request = self
            .last_request
            .borrow()
            .clone()
            .ok_or_else(|| QueryError::NoPreviousRequest(self.key.clone()))?;
        if self.disposed.get() {
            tracing::warn!(key = %self.key, "fetching a page of a disposed query");
            return Ok(());
        }
        let page = self
            .pages
            .borrow()
            .last()
            .map(|slot| slot.page.next())
            .unwrap_or_else(P::first);
        self.fetch_page(request, page);
        Ok(())
    }

    fn fetch_page(self: &Rc<Self>, request: R, page: P) {
        let index = {
            let mut pages = self.pages.borrow_mut();
            pages.push(PageSlot {
                page: page.clone(),
                items: None,
            });
            pages.len() - 1
        };

        let cache_key = self.page_cache_key(&request, &page);
        let cached = match self.config.usage {
            UsagePolicy::PreferCache | UsagePolicy::NetworkThenReconcileWithCache => {
                self.cached(&cache_key)
            }
            UsagePolicy::PreferNetworkFallbackToCache => None,
        };

        match (self.config.usage, cached) {
            (UsagePolicy::PreferCache, Some(items)) => {
                self.store_page(index, items);
                return;
            }
            (UsagePolicy::NetworkThenReconcileWithCache, Some(items)) => {
                self.store_page(index, items)
            }
            _ => self.set_state(QueryState::Loading),
        }

        let generation = self.generation.get();
        let result = (self.fetcher)(request, page.clone());
        let weak = Rc::downgrade(self);
        tokio::task::spawn_local(async move {
            let result = result.await;
            if let Some(inner) = weak.upgrade() {
                inner.complete_page(generation, index, &page, &cache_key, result);
            }
        });
    }

    fn complete_page(
        &self,
        generation: u64,
        index: usize,
        page: &P,
        cache_key: &QueryKey,
        result: Result<Vec<T>, FetchError>,
    ) {
        if self.disposed.get() {
            tracing::debug!(key = %self.key, "discarding page of a disposed query");
            return;
        }
        let slot_matches = self
            .pages
            .borrow()
            .get(index)
            .is_some_and(|slot| slot.page.query_key_value() == page.query_key_value());
        if generation != self.generation.get() || !slot_matches {
            tracing::debug!(key = %self.key, page = ?page, "discarding stale page");
            return;
        }

        match result {
            Ok(items) => {
                write_through(
                    self.client.cache().as_ref(),
                    cache_key,
                    &items,
                    self.client.now(),
                );
                self.store_page(index, items);
            }
            Err(error) => {
                if self.config.usage == UsagePolicy::PreferNetworkFallbackToCache {
                    if let Some(items) = self.cached(cache_key) {
                        tracing::warn!(
                            key = %cache_key,
                            %error,
                            "page fetch failed, serving cached page"
                        );
                        self.store_page(index, items);
                        return;
                    }
                }
                // Rewind to the last page before the failed one, so the next call retries it.
                self.pages.borrow_mut().truncate(index);
                self.set_state(QueryState::Failed(error));
            }
        }
    }

    fn store_page(&self, index: usize, items: Vec<T>) {
        if let Some(slot) = self.pages.borrow_mut().get_mut(index) {
            slot.items = Some(items);
        }
        self.publish_accumulated();
    }

    fn accumulated(&self) -> Vec<T> {
        self.pages
            .borrow()
            .iter()
            .filter_map(|slot| slot.items.as_ref())
            .flatten()
            .cloned()
            .collect()
    }

    fn publish_accumulated(&self) {
        let items = self.accumulated();
        self.set_state(QueryState::Succeeded(items));
    }

    fn set_state(&self, state: QueryState<Vec<T>>) {
        if self.disposed.get() {
            return;
        }
        self.state.set(state);
    }

    fn dispose(&self) {
        if self.disposed.replace(true) {
            return;
        }
        let subscriptions = std::mem::take(&mut *self.subscriptions.borrow_mut());
        drop(subscriptions);
        self.client.registry().unregister_owned(&self.key, self.id);
    }
}
