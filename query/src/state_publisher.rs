use std::{
    cell::RefCell,
    pin::Pin,
    rc::{Rc, Weak},
    task::{Context, Poll},
};

use futures::{Stream, StreamExt};
use futures_channel::mpsc;
use slotmap::{new_key_type, SlotMap};

use crate::QueryState;

new_key_type! {
    /// Identifies a listener registered on a [`StatePublisher`].
    pub struct ListenerKey;
}

type Listener<V> = Rc<dyn Fn(&QueryState<V>)>;

/// Shared, observable state of one query.
///
/// Every clone points at the same state. The owning engine is the only writer; everyone else
/// reads it or listens to it.
pub struct StatePublisher<V> {
    inner: Rc<PublisherInner<V>>,
}

struct PublisherInner<V> {
    state: RefCell<QueryState<V>>,
    listeners: RefCell<SlotMap<ListenerKey, Listener<V>>>,
}

impl<V> Clone for StatePublisher<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<V> std::fmt::Debug for StatePublisher<V>
where
    V: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatePublisher")
            .field("state", &self.inner.state.borrow())
            .field("listeners", &self.inner.listeners.borrow().len())
            .finish()
    }
}

impl<V> StatePublisher<V>
where
    V: Clone + 'static,
{
    pub(crate) fn new(initial: QueryState<V>) -> Self {
        Self {
            inner: Rc::new(PublisherInner {
                state: RefCell::new(initial),
                listeners: RefCell::new(SlotMap::with_key()),
            }),
        }
    }

    /// The current state.
    pub fn get(&self) -> QueryState<V> {
        self.inner.state.borrow().clone()
    }

    /// Reads the current state without cloning it.
    pub fn with<T>(&self, func: impl FnOnce(&QueryState<V>) -> T) -> T {
        func(&self.inner.state.borrow())
    }

    /// The current value, if the state is succeeded.
    pub fn value(&self) -> Option<V> {
        self.with(|state| state.value().cloned())
    }

    /// Calls `listener` on every state change until [`unsubscribe`](Self::unsubscribe).
    pub fn subscribe(&self, listener: impl Fn(&QueryState<V>) + 'static) -> ListenerKey {
        self.inner
            .listeners
            .borrow_mut()
            .insert(Rc::new(listener))
    }

    /// Removes a listener. Returns whether it was registered.
    pub fn unsubscribe(&self, key: ListenerKey) -> bool {
        self.inner.listeners.borrow_mut().remove(key).is_some()
    }

    /// Number of live listeners, streams included.
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.borrow().len()
    }

    /// A stream of states: the current one first, then every change.
    /// Dropping the stream unsubscribes it.
    pub fn stream(&self) -> StateStream<V> {
        let (sender, receiver) = mpsc::unbounded();
        let _ = sender.unbounded_send(self.get());
        let key = self.subscribe(move |state| {
            let _ = sender.unbounded_send(state.clone());
        });
        StateStream {
            receiver,
            key,
            publisher: Rc::downgrade(&self.inner),
        }
    }

    /// A stream of succeeded values only.
    pub fn values(&self) -> impl Stream<Item = V> {
        self.stream()
            .filter_map(|state| futures::future::ready(state.into_value()))
    }

    pub(crate) fn set(&self, state: QueryState<V>) {
        *self.inner.state.borrow_mut() = state.clone();

        // Listeners may subscribe, unsubscribe or read state while being notified.
        let listeners: Vec<Listener<V>> =
            self.inner.listeners.borrow().values().cloned().collect();
        for listener in listeners {
            listener(&state);
        }
    }
}

/// Stream returned by [`StatePublisher::stream`].
pub struct StateStream<V> {
    receiver: mpsc::UnboundedReceiver<QueryState<V>>,
    key: ListenerKey,
    publisher: Weak<PublisherInner<V>>,
}

impl<V> Stream for StateStream<V> {
    type Item = QueryState<V>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_next_unpin(cx)
    }
}

impl<V> Drop for StateStream<V> {
    fn drop(&mut self) {
        if let Some(publisher) = self.publisher.upgrade() {
            publisher.listeners.borrow_mut().remove(self.key);
        }
    }
}
