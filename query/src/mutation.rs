use std::{cell::Cell, future::Future, rc::Rc};

use futures::{future::LocalBoxFuture, Stream};

use crate::{
    query_executor::{make_fetcher, Fetcher},
    FetchError, Invalidation, QueryBus, QueryKey, QueryState, StatePublisher, StateStream,
};

/// Sends refetch requests to queries by key, without a reference to them.
#[derive(Clone, Debug)]
pub struct QueryInvalidator {
    bus: QueryBus,
}

impl QueryInvalidator {
    pub(crate) fn new(bus: QueryBus) -> Self {
        Self { bus }
    }

    /// Asks the query under `key` to refetch. Returns how many queries received it.
    pub fn invalidate<R: 'static>(&self, key: &QueryKey, invalidation: Invalidation<R>) -> usize {
        self.bus.invalidate(key, invalidation)
    }

    /// Asks the query under `key` to refetch with its last request, whatever its type.
    pub fn refetch_last(&self, key: &QueryKey) -> usize {
        self.bus.refetch_last(key)
    }
}

/// A fetch for side effects, such as a write to a server.
///
/// Has the same lifecycle as a query but no cache, no key and no polling. When several executions
/// overlap, the last one started decides the state.
pub struct Mutation<R, V> {
    fetcher: Fetcher<R, V>,
    state: StatePublisher<V>,
    invalidator: QueryInvalidator,
    generation: Rc<Cell<u64>>,
}

impl<R, V> Mutation<R, V>
where
    R: 'static,
    V: Clone + 'static,
{
    pub(crate) fn new<Fu, E>(
        invalidator: QueryInvalidator,
        fetcher: impl Fn(R) -> Fu + 'static,
    ) -> Self
    where
        Fu: Future<Output = Result<V, E>> + 'static,
        E: Into<FetchError>,
    {
        Mutation {
            fetcher: make_fetcher(fetcher),
            state: StatePublisher::new(QueryState::Idle),
            invalidator,
            generation: Rc::new(Cell::new(0)),
        }
    }

    /// The current state.
    pub fn state(&self) -> QueryState<V> {
        self.state.get()
    }

    /// Publisher of every state change.
    pub fn state_publisher(&self) -> &StatePublisher<V> {
        &self.state
    }

    /// Stream of states, starting with the current one.
    pub fn state_stream(&self) -> StateStream<V> {
        self.state.stream()
    }

    /// Stream of succeeded values.
    pub fn value_stream(&self) -> impl Stream<Item = V> {
        self.state.values()
    }

    /// Runs the mutation in the background. On success, `on_success` receives the value and an
    /// invalidator for refreshing dependent queries.
    ///
    /// Must be called inside a [`LocalSet`](tokio::task::LocalSet).
    pub fn execute(&self, request: R, on_success: impl FnOnce(&V, &QueryInvalidator) + 'static) {
        let pending = self.begin(request);
        let state = self.state.clone();
        let generation = self.generation.clone();
        let invalidator = self.invalidator.clone();
        tokio::task::spawn_local(async move {
            let (issued, result) = pending;
            let result = result.await;
            if let Some(value) = complete(&state, &generation, issued, result) {
                on_success(&value, &invalidator);
            }
        });
    }

    /// Runs the mutation and returns its resulting state.
    pub async fn run(&self, request: R) -> QueryState<V> {
        let (issued, result) = self.begin(request);
        let result = result.await;
        complete(&self.state, &self.generation, issued, result);
        self.state()
    }

    fn begin(&self, request: R) -> (u64, LocalBoxFuture<'static, Result<V, FetchError>>) {
        let issued = self.generation.get() + 1;
        self.generation.set(issued);
        self.state.set(QueryState::Loading);
        (issued, (self.fetcher)(request))
    }
}

fn complete<V: Clone + 'static>(
    state: &StatePublisher<V>,
    generation: &Cell<u64>,
    issued: u64,
    result: Result<V, FetchError>,
) -> Option<V> {
    if issued != generation.get() {
        tracing::debug!(issued, current = generation.get(), "discarding stale mutation result");
        return None;
    }
    match result {
        Ok(value) => {
            state.set(QueryState::Succeeded(value.clone()));
            Some(value)
        }
        Err(error) => {
            tracing::debug!(%error, "mutation failed");
            state.set(QueryState::Failed(error));
            None
        }
    }
}

impl<R, V> std::fmt::Debug for Mutation<R, V>
where
    V: std::fmt::Debug + Clone + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutation")
            .field("state", &self.state.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, time::Duration};

    use tokio::task::LocalSet;

    use super::*;
    use crate::{
        test_util::{manual_client, offline, settle, CallCounter},
        QueryOptions,
    };

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn success_can_invalidate_dependent_queries() {
        LocalSet::new()
            .run_until(async {
                let (client, _) = manual_client();
                let calls = CallCounter::default();
                let cards = client.create_query(
                    QueryKey::new("cards"),
                    {
                        let calls = calls.clone();
                        move |_: ()| {
                            calls.hit();
                            let count = calls.get();
                            async move { Ok::<_, FetchError>(count) }
                        }
                    },
                    QueryOptions::default(),
                );
                cards.fetch(()).await;

                let add_card = client.create_mutation(|name: String| async move {
                    Ok::<_, FetchError>(format!("added {name}"))
                });
                add_card.execute("C".to_string(), |_, invalidator| {
                    invalidator
                        .invalidate(&QueryKey::new("cards"), Invalidation::<()>::LastRequest);
                });
                assert!(add_card.state().is_loading());
                settle().await;

                assert_eq!(add_card.state(), QueryState::Succeeded("added C".to_string()));
                assert_eq!(calls.get(), 2);
                assert_eq!(cards.value(), Some(2));
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn failure_skips_on_success() {
        LocalSet::new()
            .run_until(async {
                let (client, _) = manual_client();
                let called = Rc::new(Cell::new(false));
                let mutation = client.create_mutation(|_: u32| async { Err::<u32, _>(offline()) });

                let on_success = called.clone();
                mutation.execute(1, move |_, _| on_success.set(true));
                settle().await;

                assert!(mutation.state().is_failed());
                assert!(!called.get());
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn last_execution_wins() {
        LocalSet::new()
            .run_until(async {
                let (client, _) = manual_client();
                let mutation = client.create_mutation(|delay: u64| async move {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    Ok::<_, FetchError>(delay)
                });
                let successes = Rc::new(RefCell::new(Vec::new()));

                for delay in [50, 10] {
                    let successes = successes.clone();
                    mutation.execute(delay, move |value, _| successes.borrow_mut().push(*value));
                }
                tokio::time::sleep(Duration::from_millis(100)).await;

                assert_eq!(mutation.state(), QueryState::Succeeded(10));
                assert_eq!(*successes.borrow(), vec![10]);
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn run_returns_the_final_state() {
        let (client, _) = manual_client();
        let mutation = client.create_mutation(|n: u32| async move { Ok::<_, FetchError>(n + 1) });

        assert_eq!(mutation.run(1).await, QueryState::Succeeded(2));
    }
}
