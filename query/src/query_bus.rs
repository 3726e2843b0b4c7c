use std::{
    any::Any,
    cell::RefCell,
    collections::HashMap,
    rc::{Rc, Weak},
};

use slotmap::{new_key_type, SlotMap};

use crate::{query_registry::QueryId, QueryKey};

/// How an invalidated query should refetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidation<R> {
    /// Refetch with the request the query last used. Ignored by queries never fetched.
    LastRequest,
    /// Refetch with this request, which becomes the query's last request.
    NewRequest(R),
}

#[derive(Clone)]
enum ErasedInvalidation {
    LastRequest,
    NewRequest(Rc<dyn Any>),
}

#[derive(Clone)]
enum BusMessage {
    NewData {
        origin: Option<QueryId>,
        value: Option<Rc<dyn Any>>,
    },
    Invalidate(ErasedInvalidation),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageKind {
    NewData,
    Invalidate,
}

impl BusMessage {
    fn kind(&self) -> MessageKind {
        match self {
            BusMessage::NewData { .. } => MessageKind::NewData,
            BusMessage::Invalidate(_) => MessageKind::Invalidate,
        }
    }
}

new_key_type! {
    struct SubscriptionKey;
}

struct Subscriber {
    kind: MessageKind,
    handler: Rc<dyn Fn(&BusMessage)>,
}

type Channels = RefCell<HashMap<QueryKey, SlotMap<SubscriptionKey, Subscriber>>>;

/// Key scoped message channel shared by the queries of one client.
///
/// Carries two kinds of message per key: new data for the key, and requests to refetch it.
/// Delivery is synchronous: every subscriber of the key present when `publish` starts has been
/// called when it returns. Subscribers expecting a different payload type skip the message.
#[derive(Clone, Default)]
pub struct QueryBus {
    channels: Rc<Channels>,
}

impl QueryBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Asks the live query under `key` to refetch. Returns how many subscribers were reached.
    pub fn invalidate<R: 'static>(&self, key: &QueryKey, invalidation: Invalidation<R>) -> usize {
        let erased = match invalidation {
            Invalidation::LastRequest => ErasedInvalidation::LastRequest,
            Invalidation::NewRequest(request) => ErasedInvalidation::NewRequest(Rc::new(request)),
        };
        self.publish(key, BusMessage::Invalidate(erased))
    }

    /// Asks the live query under `key` to refetch its last request, whatever its request type.
    pub fn refetch_last(&self, key: &QueryKey) -> usize {
        self.publish(
            key,
            BusMessage::Invalidate(ErasedInvalidation::LastRequest),
        )
    }

    /// Announces a new value (or the absence of one) for `key`.
    pub fn publish_new_data<V: 'static>(&self, key: &QueryKey, value: Option<V>) -> usize {
        self.publish_new_data_from(None, key, value)
    }

    pub(crate) fn publish_new_data_from<V: 'static>(
        &self,
        origin: Option<QueryId>,
        key: &QueryKey,
        value: Option<V>,
    ) -> usize {
        let value = value.map(|value| Rc::new(value) as Rc<dyn Any>);
        self.publish(key, BusMessage::NewData { origin, value })
    }

    /// Listens for refetch requests on `key` carrying requests of type `R`.
    pub fn on_invalidate<R>(
        &self,
        key: &QueryKey,
        handler: impl Fn(Invalidation<R>) + 'static,
    ) -> BusSubscription
    where
        R: Clone + 'static,
    {
        let channel = key.clone();
        self.subscribe(
            key,
            MessageKind::Invalidate,
            Rc::new(move |message| {
                let BusMessage::Invalidate(invalidation) = message else {
                    return;
                };
                match invalidation {
                    ErasedInvalidation::LastRequest => handler(Invalidation::LastRequest),
                    ErasedInvalidation::NewRequest(request) => {
                        match request.downcast_ref::<R>() {
                            Some(request) => handler(Invalidation::NewRequest(request.clone())),
                            None => tracing::debug!(
                                key = %channel,
                                expected = std::any::type_name::<R>(),
                                "ignoring invalidation with a different request type"
                            ),
                        }
                    }
                }
            }),
        )
    }

    /// Listens for new data on `key` carrying values of type `V`.
    /// `None` means the value for the key was removed.
    pub fn on_new_data<V>(
        &self,
        key: &QueryKey,
        handler: impl Fn(Option<&V>) + 'static,
    ) -> BusSubscription
    where
        V: 'static,
    {
        self.on_new_data_from(key, move |_, value| handler(value))
    }

    pub(crate) fn on_new_data_from<V>(
        &self,
        key: &QueryKey,
        handler: impl Fn(Option<QueryId>, Option<&V>) + 'static,
    ) -> BusSubscription
    where
        V: 'static,
    {
        let channel = key.clone();
        self.subscribe(
            key,
            MessageKind::NewData,
            Rc::new(move |message| {
                let BusMessage::NewData { origin, value } = message else {
                    return;
                };
                match value {
                    None => handler(*origin, None),
                    Some(value) => match value.downcast_ref::<V>() {
                        Some(value) => handler(*origin, Some(value)),
                        None => tracing::debug!(
                            key = %channel,
                            expected = std::any::type_name::<V>(),
                            "ignoring new data with a different value type"
                        ),
                    },
                }
            }),
        )
    }

    /// Number of live subscriptions on `key`, of either kind.
    pub fn subscriber_count(&self, key: &QueryKey) -> usize {
        self.channels
            .borrow()
            .get(key)
            .map(|subscribers| subscribers.len())
            .unwrap_or(0)
    }

    fn subscribe(
        &self,
        key: &QueryKey,
        kind: MessageKind,
        handler: Rc<dyn Fn(&BusMessage)>,
    ) -> BusSubscription {
        let slot = self
            .channels
            .borrow_mut()
            .entry(key.clone())
            .or_default()
            .insert(Subscriber { kind, handler });

        BusSubscription {
            key: key.clone(),
            slot,
            channels: Rc::downgrade(&self.channels),
        }
    }

    fn publish(&self, key: &QueryKey, message: BusMessage) -> usize {
        let kind = message.kind();

        // Snapshot, so handlers can publish or (un)subscribe while we dispatch.
        let handlers: Vec<Rc<dyn Fn(&BusMessage)>> = self
            .channels
            .borrow()
            .get(key)
            .map(|subscribers| {
                subscribers
                    .values()
                    .filter(|subscriber| subscriber.kind == kind)
                    .map(|subscriber| subscriber.handler.clone())
                    .collect()
            })
            .unwrap_or_default();

        for handler in handlers.iter() {
            handler(&message);
        }
        handlers.len()
    }
}

impl std::fmt::Debug for QueryBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryBus")
            .field("keys", &self.channels.borrow().len())
            .finish()
    }
}

/// A live subscription on a [`QueryBus`]. Dropping it unsubscribes.
#[must_use = "dropping a subscription unsubscribes it"]
pub struct BusSubscription {
    key: QueryKey,
    slot: SubscriptionKey,
    channels: Weak<Channels>,
}

impl BusSubscription {
    /// The key this subscription listens on.
    pub fn key(&self) -> &QueryKey {
        &self.key
    }
}

impl Drop for BusSubscription {
    fn drop(&mut self) {
        let Some(channels) = self.channels.upgrade() else {
            return;
        };
        let mut channels = channels.borrow_mut();
        if let Some(subscribers) = channels.get_mut(&self.key) {
            subscribers.remove(self.slot);
            if subscribers.is_empty() {
                channels.remove(&self.key);
            }
        }
    }
}

impl std::fmt::Debug for BusSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusSubscription")
            .field("key", &self.key)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[test]
    fn invalidation_reaches_typed_subscribers() {
        let bus = QueryBus::new();
        let key = QueryKey::new("cards");
        let seen = Rc::new(RefCell::new(Vec::new()));

        let _subscription = bus.on_invalidate::<u32>(&key, {
            let seen = seen.clone();
            move |invalidation| seen.borrow_mut().push(invalidation)
        });

        assert_eq!(bus.invalidate(&key, Invalidation::NewRequest(7_u32)), 1);
        assert_eq!(bus.refetch_last(&key), 1);

        assert_eq!(
            *seen.borrow(),
            vec![Invalidation::NewRequest(7), Invalidation::LastRequest]
        );
    }

    #[test]
    fn mismatched_request_type_is_skipped() {
        let bus = QueryBus::new();
        let key = QueryKey::new("cards");
        let calls = Rc::new(Cell::new(0));

        let _subscription = bus.on_invalidate::<u32>(&key, {
            let calls = calls.clone();
            move |_| calls.set(calls.get() + 1)
        });

        bus.invalidate(&key, Invalidation::NewRequest("seven".to_string()));
        assert_eq!(calls.get(), 0);

        // LastRequest carries no payload, so it reaches every request type.
        bus.invalidate::<String>(&key, Invalidation::LastRequest);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn messages_are_scoped_by_key_and_kind() {
        let bus = QueryBus::new();
        let calls = Rc::new(Cell::new(0));

        let _subscription = bus.on_new_data::<u32>(&QueryKey::new("a"), {
            let calls = calls.clone();
            move |_| calls.set(calls.get() + 1)
        });

        assert_eq!(bus.publish_new_data(&QueryKey::new("b"), Some(1_u32)), 0);
        assert_eq!(bus.refetch_last(&QueryKey::new("a")), 0);
        assert_eq!(calls.get(), 0);

        assert_eq!(bus.publish_new_data(&QueryKey::new("a"), Some(1_u32)), 1);
        assert_eq!(bus.publish_new_data::<u32>(&QueryKey::new("a"), None), 1);
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn new_data_carries_value() {
        let bus = QueryBus::new();
        let key = QueryKey::new("cards");
        let seen = Rc::new(RefCell::new(Vec::new()));

        let _subscription = bus.on_new_data::<Vec<String>>(&key, {
            let seen = seen.clone();
            move |value| seen.borrow_mut().push(value.cloned())
        });

        bus.publish_new_data(&key, Some(vec!["A".to_string()]));
        bus.publish_new_data::<Vec<String>>(&key, None);
        bus.publish_new_data(&key, Some(3_u8));

        assert_eq!(*seen.borrow(), vec![Some(vec!["A".to_string()]), None]);
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let bus = QueryBus::new();
        let key = QueryKey::new("cards");

        let subscription = bus.on_invalidate::<u32>(&key, |_| {});
        assert_eq!(bus.subscriber_count(&key), 1);
        assert_eq!(subscription.key(), &key);

        drop(subscription);
        assert_eq!(bus.subscriber_count(&key), 0);
        assert_eq!(bus.refetch_last(&key), 0);
    }

    #[test]
    fn handlers_may_publish_and_unsubscribe_while_dispatching() {
        let bus = QueryBus::new();
        let key = QueryKey::new("cards");
        let echoed = Rc::new(Cell::new(false));
        let held: Rc<RefCell<Option<BusSubscription>>> = Rc::new(RefCell::new(None));

        let subscription = bus.on_invalidate::<u32>(&key, {
            let bus = bus.clone();
            let key = key.clone();
            let held = held.clone();
            move |_| {
                bus.publish_new_data(&key, Some(1_u32));
                held.borrow_mut().take();
            }
        });
        *held.borrow_mut() = Some(subscription);

        let _echo = bus.on_new_data::<u32>(&key, {
            let echoed = echoed.clone();
            move |_| echoed.set(true)
        });

        assert_eq!(bus.refetch_last(&key), 1);
        assert!(echoed.get());
        assert_eq!(bus.refetch_last(&key), 0);
    }
}
