use std::{fmt, sync::Arc};

use crate::QueryKey;

/// An opaque error produced by a fetcher.
///
/// Cheap to clone, so it can live inside a [`QueryState`](crate::QueryState) that is handed out
/// to every observer. Anything that converts into [`anyhow::Error`] converts into it.
#[derive(Clone)]
pub struct FetchError(Arc<anyhow::Error>);

impl FetchError {
    /// Creates an error from a message.
    pub fn msg(message: impl fmt::Display + fmt::Debug + Send + Sync + 'static) -> Self {
        FetchError(Arc::new(anyhow::Error::msg(message)))
    }

    /// The wrapped error.
    pub fn inner(&self) -> &Arc<anyhow::Error> {
        &self.0
    }

    /// Attempts to view the wrapped error as a concrete type.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.0.downcast_ref::<E>()
    }

    /// Returns `true` if the wrapped error is an `E`.
    pub fn is<E>(&self) -> bool
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.0.is::<E>()
    }
}

impl<T: Into<anyhow::Error>> From<T> for FetchError {
    fn from(error: T) -> Self {
        FetchError(Arc::new(error.into()))
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl fmt::Debug for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FetchError").field(&self.0.to_string()).finish()
    }
}

impl PartialEq for FetchError {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || self.0.to_string() == other.0.to_string()
    }
}

/// Errors raised by cache backends.
///
/// The query engines never surface these: a failed read is a cache miss and a failed write is
/// skipped, both logged.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The backing store could not be read or written.
    #[error("cache io error: {0}")]
    Io(#[from] std::io::Error),
    /// A stored entry could not be decoded.
    #[error("invalid cache entry for `{key}`: {reason}")]
    InvalidEntry {
        /// Key of the broken entry.
        key: QueryKey,
        /// Decoder message.
        reason: String,
    },
    /// A value could not be encoded for storage.
    #[error("could not encode value for `{key}`: {reason}")]
    Encode {
        /// Key the value was meant for.
        key: QueryKey,
        /// Encoder message.
        reason: String,
    },
}

/// Errors returned by query operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum QueryError {
    /// Nothing is registered under this key.
    #[error("no query registered for key `{0}`")]
    UnresolvedKey(QueryKey),
    /// A query is registered under this key, but with a different value type.
    #[error("query `{key}` is not registered with value type `{expected}`")]
    TypeMismatch {
        /// The key that was resolved.
        key: QueryKey,
        /// The value type the caller asked for.
        expected: &'static str,
    },
    /// The operation needs a previous request and there is none.
    #[error("query `{0}` has not been fetched with a request yet")]
    NoPreviousRequest(QueryKey),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("teapot")]
    struct Teapot;

    #[test]
    fn fetch_error_wraps_any_error() {
        let error: FetchError = Teapot.into();
        assert_eq!(error.to_string(), "teapot");
        assert!(error.downcast_ref::<Teapot>().is_some());
        assert!(error.is::<Teapot>());
    }

    #[test]
    fn fetch_error_accepts_anyhow_errors() {
        let error: FetchError = anyhow::anyhow!("server returned {}", 503).into();
        assert_eq!(error.to_string(), "server returned 503");
        assert!(!error.is::<Teapot>());

        let message = FetchError::msg("offline");
        assert_eq!(message.downcast_ref::<&str>(), Some(&"offline"));
    }

    #[test]
    fn fetch_errors_compare_by_message() {
        assert_eq!(FetchError::msg("boom"), FetchError::msg("boom"));
        assert_ne!(FetchError::msg("boom"), FetchError::msg("bang"));
    }

    #[test]
    fn query_error_messages_name_the_key() {
        let error = QueryError::UnresolvedKey(QueryKey::new("cards"));
        assert_eq!(error.to_string(), "no query registered for key `cards`");
    }
}
