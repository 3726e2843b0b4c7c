use std::marker::PhantomData;

use futures::Stream;

use crate::{
    AnyQuery, Invalidation, QueryBus, QueryError, QueryKey, QueryRegistry, QueryState,
    StatePublisher, StateStream,
};

/// Observes a query owned elsewhere, found by key.
///
/// A consumer never fetches. [`refetch`](Self::refetch) goes through the bus to whichever query
/// listens on the key.
pub struct QueryConsumer<R, V> {
    query: AnyQuery<V>,
    bus: QueryBus,
    request: PhantomData<fn(R)>,
}

impl<R, V> QueryConsumer<R, V>
where
    R: Clone + 'static,
    V: Clone + 'static,
{
    pub(crate) fn resolve(
        registry: &QueryRegistry,
        bus: &QueryBus,
        key: &QueryKey,
    ) -> Result<Self, QueryError> {
        Ok(QueryConsumer {
            query: registry.resolve(key)?,
            bus: bus.clone(),
            request: PhantomData,
        })
    }

    /// The key of the observed query.
    pub fn key(&self) -> &QueryKey {
        self.query.key()
    }

    /// The observed query's current state.
    pub fn state(&self) -> QueryState<V> {
        self.query.state()
    }

    /// Publisher of the observed query's state changes.
    pub fn state_publisher(&self) -> &StatePublisher<V> {
        self.query.state_publisher()
    }

    /// Stream of states, starting with the current one.
    pub fn state_stream(&self) -> StateStream<V> {
        self.query.state_publisher().stream()
    }

    /// Stream of succeeded values.
    pub fn value_stream(&self) -> impl Stream<Item = V> {
        self.query.state_publisher().values()
    }

    /// Asks the owning query to refetch. Returns how many queries received it.
    pub fn refetch(&self, invalidation: Invalidation<R>) -> usize {
        self.bus.invalidate(self.query.key(), invalidation)
    }
}

impl<R, V> Clone for QueryConsumer<R, V> {
    fn clone(&self) -> Self {
        Self {
            query: self.query.clone(),
            bus: self.bus.clone(),
            request: PhantomData,
        }
    }
}

impl<R, V: std::fmt::Debug> std::fmt::Debug for QueryConsumer<R, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryConsumer")
            .field("query", &self.query)
            .finish()
    }
}
