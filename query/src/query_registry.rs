use std::{
    any::{Any, TypeId},
    cell::RefCell,
    collections::HashMap,
    rc::Rc,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::{QueryError, QueryKey, QueryState, StatePublisher};

/// Identity of one query instance, used to tell instances sharing a key apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryId(u64);

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

impl QueryId {
    pub(crate) fn next() -> Self {
        QueryId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Type erased view of a live query: its state and a way to observe it.
///
/// Holding one never issues fetches; only the owning engine does.
pub struct AnyQuery<V> {
    key: QueryKey,
    publisher: StatePublisher<V>,
}

impl<V> Clone for AnyQuery<V> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            publisher: self.publisher.clone(),
        }
    }
}

impl<V> AnyQuery<V>
where
    V: Clone + 'static,
{
    pub(crate) fn new(key: QueryKey, publisher: StatePublisher<V>) -> Self {
        Self { key, publisher }
    }

    /// The key the query is registered under.
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// The current state.
    pub fn state(&self) -> QueryState<V> {
        self.publisher.get()
    }

    /// Publisher of every state change.
    pub fn state_publisher(&self) -> &StatePublisher<V> {
        &self.publisher
    }
}

impl<V> std::fmt::Debug for AnyQuery<V>
where
    V: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnyQuery")
            .field("key", &self.key)
            .field("publisher", &self.publisher)
            .finish()
    }
}

struct RegistryEntry {
    owner: Option<QueryId>,
    value_type: TypeId,
    handle: Rc<dyn Any>,
}

/// Maps a key to the one live query that owns it, so many consumers can share its fetch
/// lifecycle.
#[derive(Clone, Default)]
pub struct QueryRegistry {
    entries: Rc<RefCell<HashMap<QueryKey, RegistryEntry>>>,
}

impl QueryRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handle` under its key. The last registration for a key wins.
    pub fn register<V>(&self, handle: AnyQuery<V>)
    where
        V: Clone + 'static,
    {
        self.insert(None, handle)
    }

    pub(crate) fn register_owned<V>(&self, owner: QueryId, handle: AnyQuery<V>)
    where
        V: Clone + 'static,
    {
        self.insert(Some(owner), handle)
    }

    fn insert<V>(&self, owner: Option<QueryId>, handle: AnyQuery<V>)
    where
        V: Clone + 'static,
    {
        let key = handle.key().clone();
        let previous = self.entries.borrow_mut().insert(
            key.clone(),
            RegistryEntry {
                owner,
                value_type: TypeId::of::<V>(),
                handle: Rc::new(handle),
            },
        );
        if previous.is_some() {
            tracing::debug!(%key, "replacing registered query");
        }
    }

    /// Looks up the query under `key`.
    ///
    /// Fails with [`QueryError::UnresolvedKey`] if nothing is registered and with
    /// [`QueryError::TypeMismatch`] if the query holds another value type.
    pub fn resolve<V>(&self, key: &QueryKey) -> Result<AnyQuery<V>, QueryError>
    where
        V: Clone + 'static,
    {
        let entries = self.entries.borrow();
        let entry = entries
            .get(key)
            .ok_or_else(|| QueryError::UnresolvedKey(key.clone()))?;

        let mismatch = || QueryError::TypeMismatch {
            key: key.clone(),
            expected: std::any::type_name::<V>(),
        };
        if entry.value_type != TypeId::of::<V>() {
            return Err(mismatch());
        }
        entry
            .handle
            .downcast_ref::<AnyQuery<V>>()
            .cloned()
            .ok_or_else(mismatch)
    }

    /// Removes the entry under `key`. Returns whether one existed.
    pub fn unregister(&self, key: &QueryKey) -> bool {
        self.entries.borrow_mut().remove(key).is_some()
    }

    /// Removes the entry under `key` only if `owner` registered it.
    pub(crate) fn unregister_owned(&self, key: &QueryKey, owner: QueryId) -> bool {
        let mut entries = self.entries.borrow_mut();
        match entries.get(key) {
            Some(entry) if entry.owner == Some(owner) => {
                entries.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Whether something is registered under `key`.
    pub fn contains(&self, key: &QueryKey) -> bool {
        self.entries.borrow().contains_key(key)
    }

    /// Number of registered queries.
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }
}

impl std::fmt::Debug for QueryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryRegistry")
            .field("keys", &self.entries.borrow().keys().collect::<Vec<_>>())
            .finish()
    }
}
