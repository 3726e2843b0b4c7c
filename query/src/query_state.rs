use crate::FetchError;

/// The lifecycle of a query.
///
/// Only one variant is active at a time. Consumers never change it; the owning engine drives
/// every transition.
#[derive(Clone, PartialEq, Default)]
pub enum QueryState<V> {
    /// The query has never been fetched.
    #[default]
    Idle,

    /// A fetch is in flight and there is no value to show for it.
    Loading,

    /// The last fetch (or a cache read) produced this value.
    Succeeded(V),

    /// The last fetch failed and no cached value was served in its place.
    Failed(FetchError),
}

impl<V> QueryState<V> {
    /// Returns the value, only when succeeded.
    pub fn value(&self) -> Option<&V> {
        match self {
            QueryState::Succeeded(value) => Some(value),
            QueryState::Idle | QueryState::Loading | QueryState::Failed(_) => None,
        }
    }

    /// Consumes the state and returns the value, only when succeeded.
    pub fn into_value(self) -> Option<V> {
        match self {
            QueryState::Succeeded(value) => Some(value),
            _ => None,
        }
    }

    /// Returns the error, only when failed.
    pub fn error(&self) -> Option<&FetchError> {
        match self {
            QueryState::Failed(error) => Some(error),
            _ => None,
        }
    }

    /// Never fetched.
    pub fn is_idle(&self) -> bool {
        matches!(self, QueryState::Idle)
    }

    /// Fetch in flight.
    pub fn is_loading(&self) -> bool {
        matches!(self, QueryState::Loading)
    }

    /// Holds a value.
    pub fn is_succeeded(&self) -> bool {
        matches!(self, QueryState::Succeeded(_))
    }

    /// Holds an error.
    pub fn is_failed(&self) -> bool {
        matches!(self, QueryState::Failed(_))
    }

    /// Maps the succeeded value, keeping the other variants.
    pub fn map<R>(self, mapper: impl FnOnce(V) -> R) -> QueryState<R> {
        match self {
            QueryState::Idle => QueryState::Idle,
            QueryState::Loading => QueryState::Loading,
            QueryState::Succeeded(value) => QueryState::Succeeded(mapper(value)),
            QueryState::Failed(error) => QueryState::Failed(error),
        }
    }
}

impl<V> std::fmt::Debug for QueryState<V>
where
    V: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Loading => write!(f, "Loading"),
            Self::Succeeded(arg0) => f.debug_tuple("Succeeded").field(arg0).finish(),
            Self::Failed(arg0) => f.debug_tuple("Failed").field(arg0).finish(),
        }
    }
}
