#![warn(missing_docs)]
#![forbid(unsafe_code)]

//! # About Keyed Query
//!
//! Keyed Query is an asynchronous state management library for data that lives behind a fetch
//! function, typically a remote API.
//!
//! A Query provides:
//! - an observable lifecycle (`Idle`, `Loading`, `Succeeded`, `Failed`)
//! - caching under a string key, in memory or on disk
//! - cache policies (prefer cache, network with cache fallback, cache then reconcile)
//! - invalidation from anywhere in the program, by key
//! - polling
//! - paginated accumulation of results
//! - discarding of stale responses
//!
//! ## The main entry points are:
//! - [`QueryClient`] - Owns the cache, the notification bus and the registry. Create one and pass
//!   it around.
//! - [`QueryClient::create_query`] - A single value query.
//! - [`QueryClient::create_paginated_query`] - A query that accumulates pages.
//! - [`QueryClient::consumer`] - Observe a query you don't own, by key.
//! - [`QueryClient::invalidate_query`] - Ask the query under a key to refetch.
//!
//! # Feature Flags
//! - `file_cache` (default) - Enables [`FileSystemCache`], a cache persisted to a directory.
//!
//! # A Simple Example
//!
//! Queries run their fetches on the current thread, so drive them inside a
//! [`LocalSet`](tokio::task::LocalSet).
//!
//! ```no_run
//! use keyed_query::*;
//!
//! #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
//! struct Track {
//!     name: String,
//! }
//!
//! async fn get_track(id: u32) -> Result<Track, FetchError> {
//!     Ok(Track { name: format!("track {id}") })
//! }
//!
//! # async fn run() {
//! let client = QueryClient::in_memory();
//! let query = client.create_query(QueryKey::new("track"), get_track, QueryOptions::default());
//!
//! let state = query.fetch(7).await;
//! assert_eq!(state.value().map(|track| track.name.as_str()), Some("track 7"));
//!
//! // Somewhere else, with only the client and the key.
//! client.invalidate_query(&QueryKey::new("track"), Invalidation::NewRequest(8_u32));
//! # }
//! ```

mod error;
mod instant;
mod mutation;
mod paginated_query;
mod query;
mod query_bus;
mod query_cache;
mod query_client;
mod query_consumer;
mod query_executor;
mod query_key;
mod query_options;
mod query_registry;
mod query_state;
mod state_publisher;

pub use error::*;
pub use instant::*;
pub use mutation::*;
pub use paginated_query::*;
pub use query::*;
pub use query_bus::*;
pub use query_cache::*;
pub use query_client::*;
pub use query_consumer::*;
pub use query_key::*;
pub use query_options::*;
pub use query_registry::*;
pub use query_state::*;
pub use state_publisher::*;

/// Convenience trait for query request requirements.
pub trait QueryRequest: Clone + 'static {}
impl<R> QueryRequest for R where R: Clone + 'static {}

/// Convenience trait for query value requirements.
pub trait QueryValue:
    std::fmt::Debug + Clone + serde::Serialize + serde::de::DeserializeOwned + 'static
{
}
impl<V> QueryValue for V where
    V: std::fmt::Debug + Clone + serde::Serialize + serde::de::DeserializeOwned + 'static
{
}

#[cfg(test)]
pub(crate) mod test_util;
