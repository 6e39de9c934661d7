//! The server's event stub: multicast dispatch to subscribed clients.
//!
//! Subscriptions arrive as `add_<Event>` calls and register a
//! [RemoteDelegate] under the client-issued handler key; firing an event
//! walks the subscribers in registration order. The table is guarded by a
//! reader-writer lock: firing reads, (un)subscribing writes.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::config::EventDispatchMode;
use crate::guid::Guid;
use crate::service::RemoteDelegate;

struct EventSubscription {
    handler_key: Guid,
    session_id: Guid,
    delegate: RemoteDelegate,
}

/// Multicast table keyed by `(service, event)`.
pub struct EventStub {
    mode: EventDispatchMode,
    handlers: RwLock<HashMap<(String, String), Vec<EventSubscription>>>,
}

impl EventStub {
    pub(crate) fn new(mode: EventDispatchMode) -> Self {
        Self {
            mode,
            handlers: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn subscribe(
        &self,
        service: &str,
        event: &str,
        session_id: Guid,
        delegate: RemoteDelegate,
    ) {
        let mut handlers = self.handlers.write().unwrap();
        handlers
            .entry((service.to_string(), event.to_string()))
            .or_insert_with(Vec::new)
            .push(EventSubscription {
                handler_key: delegate.handler_key(),
                session_id,
                delegate,
            });
    }

    /// Remove one subscription; `false` when the key is unknown.
    pub(crate) fn unsubscribe(&self, service: &str, event: &str, handler_key: Guid) -> bool {
        let mut handlers = self.handlers.write().unwrap();
        if let Some(subscriptions) = handlers.get_mut(&(service.to_string(), event.to_string())) {
            let before = subscriptions.len();
            subscriptions.retain(|subscription| subscription.handler_key != handler_key);
            return subscriptions.len() < before;
        }
        false
    }

    /// Drop every subscription a disconnecting session left behind.
    pub(crate) fn remove_session(&self, session_id: Guid) {
        let mut handlers = self.handlers.write().unwrap();
        for subscriptions in handlers.values_mut() {
            subscriptions.retain(|subscription| subscription.session_id != session_id);
        }
    }

    /// Invoke every subscriber of `service.event` with `arguments`.
    /// Returns the number of subscribers reached.
    pub fn fire(&self, service: &str, event: &str, arguments: Vec<serde_json::Value>) -> usize {
        let key = (service.to_string(), event.to_string());
        match self.mode {
            EventDispatchMode::PreserveOrder => {
                let handlers = self.handlers.read().unwrap();
                let subscriptions = match handlers.get(&key) {
                    Some(subscriptions) => subscriptions,
                    None => return 0,
                };
                for subscription in subscriptions {
                    subscription.delegate.invoke(arguments.clone());
                }
                subscriptions.len()
            }
            EventDispatchMode::BestEffort => {
                let delegates = {
                    let handlers = self.handlers.read().unwrap();
                    match handlers.get(&key) {
                        Some(subscriptions) => subscriptions
                            .iter()
                            .map(|subscription| subscription.delegate.clone())
                            .collect::<Vec<_>>(),
                        None => return 0,
                    }
                };
                let count = delegates.len();
                for delegate in delegates {
                    let arguments = arguments.clone();
                    async_std::task::spawn(async move { delegate.invoke(arguments) });
                }
                count
            }
        }
    }

    /// Current subscriber count of `service.event`.
    pub fn handler_count(&self, service: &str, event: &str) -> usize {
        let handlers = self.handlers.read().unwrap();
        handlers
            .get(&(service.to_string(), event.to_string()))
            .map_or(0, Vec::len)
    }
}

impl std::fmt::Debug for EventStub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.handlers.read().unwrap();
        f.debug_struct("EventStub")
            .field("mode", &self.mode)
            .field(
                "handlers",
                &handlers
                    .iter()
                    .map(|(key, subscriptions)| (key, subscriptions.len()))
                    .collect::<HashMap<_, _>>(),
            )
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_delegate(counter: Arc<AtomicUsize>) -> RemoteDelegate {
        RemoteDelegate::new(
            Guid::random(),
            Arc::new(move |_key, _args| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    #[test]
    fn subscribe_fire_unsubscribe_delta_is_zero() {
        let stub = EventStub::new(EventDispatchMode::PreserveOrder);
        let before = stub.handler_count("Service", "Event");

        let counter = Arc::new(AtomicUsize::new(0));
        let delegate = counting_delegate(Arc::clone(&counter));
        let key = delegate.handler_key();
        stub.subscribe("Service", "Event", Guid::random(), delegate);

        assert_eq!(stub.fire("Service", "Event", vec![]), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        assert!(stub.unsubscribe("Service", "Event", key));
        assert_eq!(stub.handler_count("Service", "Event"), before);
        assert_eq!(stub.fire("Service", "Event", vec![]), 0);
    }

    #[test]
    fn unsubscribe_unknown_key_is_false() {
        let stub = EventStub::new(EventDispatchMode::PreserveOrder);
        assert!(!stub.unsubscribe("Service", "Event", Guid::random()));
    }

    #[test]
    fn fire_preserves_registration_order() {
        let stub = EventStub::new(EventDispatchMode::PreserveOrder);
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        for index in 0..4 {
            let order = Arc::clone(&order);
            stub.subscribe(
                "Service",
                "Event",
                Guid::random(),
                RemoteDelegate::new(
                    Guid::random(),
                    Arc::new(move |_key, _args| order.lock().unwrap().push(index)),
                ),
            );
        }
        stub.fire("Service", "Event", vec![]);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn remove_session_drops_all_its_subscriptions() {
        let stub = EventStub::new(EventDispatchMode::PreserveOrder);
        let session = Guid::random();
        let counter = Arc::new(AtomicUsize::new(0));
        stub.subscribe("Service", "A", session, counting_delegate(Arc::clone(&counter)));
        stub.subscribe("Service", "B", session, counting_delegate(Arc::clone(&counter)));
        stub.subscribe(
            "Service",
            "A",
            Guid::random(),
            counting_delegate(Arc::clone(&counter)),
        );

        stub.remove_session(session);
        assert_eq!(stub.handler_count("Service", "A"), 1);
        assert_eq!(stub.handler_count("Service", "B"), 0);
    }
}
