use std::{cell::Cell, rc::Rc, sync::Arc, time::Duration};

use crate::{FetchError, InMemoryCache, Instant, ManualClock, QueryClient};

/// Lets spawned fetches finish.
pub(crate) async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

/// Client over an in-memory cache and a manual clock starting at zero.
pub(crate) fn manual_client() -> (QueryClient, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(Instant::from_millis(0)));
    let client = QueryClient::new(Arc::new(InMemoryCache::new())).with_clock(clock.clone());
    (client, clock)
}

/// Counts fetcher calls.
#[derive(Clone, Default)]
pub(crate) struct CallCounter(Rc<Cell<usize>>);

impl CallCounter {
    pub(crate) fn hit(&self) {
        self.0.set(self.0.get() + 1);
    }

    pub(crate) fn get(&self) -> usize {
        self.0.get()
    }
}

pub(crate) fn offline() -> FetchError {
    FetchError::msg("offline")
}
