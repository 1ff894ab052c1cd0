//! In-process publish/subscribe keyed by event type.
//!
//! ## Guarantees
//! - Delivery order within a type is registration order.
//! - Wildcard handlers run after the typed handlers and see the full envelope.
//! - A failing or panicking handler is logged and skipped; the remaining
//!   handlers still run.
//! - Handlers may subscribe or unsubscribe (themselves or others) while being
//!   invoked. The registry lock is never held during a handler call, and a
//!   handler removed mid-dispatch is not called again for that event.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, error, warn};

use crate::envelope::{Envelope, Event, EventKind};
use crate::error::DecodeError;

/// Error type handlers may return.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
pub type HandlerResult = Result<(), HandlerError>;

type EventHandler = dyn Fn(&Event) -> HandlerResult + Send + Sync;
type EnvelopeHandler = dyn Fn(&Envelope) -> HandlerResult + Send + Sync;

/// What a subscription listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Kind(EventKind),
    Wildcard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

#[derive(Clone)]
enum Handler {
    Event(Arc<EventHandler>),
    Envelope(Arc<EnvelopeHandler>),
}

struct Registration {
    id: SubscriptionId,
    handler: Handler,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    topics: HashMap<Topic, Vec<Registration>>,
}

impl Registry {
    fn insert(&mut self, topic: Topic, handler: Handler) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.topics.entry(topic).or_default().push(Registration { id, handler });
        id
    }

    fn remove(&mut self, topic: Topic, id: SubscriptionId) -> bool {
        let Some(list) = self.topics.get_mut(&topic) else {
            return false;
        };
        let before = list.len();
        list.retain(|r| r.id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            self.topics.remove(&topic);
        }
        removed
    }

    fn contains(&self, topic: Topic, id: SubscriptionId) -> bool {
        self.topics
            .get(&topic)
            .map(|list| list.iter().any(|r| r.id == id))
            .unwrap_or(false)
    }

    fn snapshot(&self, topic: Topic) -> Vec<(SubscriptionId, Handler)> {
        self.topics
            .get(&topic)
            .map(|list| list.iter().map(|r| (r.id, r.handler.clone())).collect())
            .unwrap_or_default()
    }
}

/// Capability to remove exactly one registration.
///
/// Dropping it does not unsubscribe.
#[derive(Clone)]
pub struct Subscription {
    topic: Topic,
    id: SubscriptionId,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Remove the registration. Returns `false` if it was already gone.
    pub fn unsubscribe(&self) -> bool {
        let Some(registry) = self.registry.upgrade() else {
            return false;
        };
        let removed = match registry.lock() {
            Ok(mut guard) => guard.remove(self.topic, self.id),
            Err(_) => false,
        };
        removed
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("id", &self.id)
            .finish()
    }
}

/// Result of delivering one envelope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Handlers that returned `Ok`.
    pub delivered: usize,
    /// Handlers that returned an error or panicked.
    pub failed: usize,
}

/// Shared handle to a subscription registry. Cloning shares the registry.
#[derive(Clone, Default)]
pub struct Dispatcher {
    registry: Arc<Mutex<Registry>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, topic: Topic, handler: Handler) -> Subscription {
        let id = match self.registry.lock() {
            Ok(mut guard) => guard.insert(topic, handler),
            Err(poisoned) => poisoned.into_inner().insert(topic, handler),
        };
        Subscription { topic, id, registry: Arc::downgrade(&self.registry) }
    }

    /// Register a handler for one event kind.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&Event) -> HandlerResult + Send + Sync + 'static,
    {
        self.register(Topic::Kind(kind), Handler::Event(Arc::new(handler)))
    }

    /// Register a wildcard handler that sees every decodable envelope.
    pub fn on_any<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Envelope) -> HandlerResult + Send + Sync + 'static,
    {
        self.register(Topic::Wildcard, Handler::Envelope(Arc::new(handler)))
    }

    /// Remove one registration, or every registration on `topic` when `id`
    /// is `None`. Returns how many were removed.
    pub fn off(&self, topic: Topic, id: Option<SubscriptionId>) -> usize {
        let Ok(mut guard) = self.registry.lock() else {
            return 0;
        };
        match id {
            Some(id) => usize::from(guard.remove(topic, id)),
            None => guard.topics.remove(&topic).map(|list| list.len()).unwrap_or(0),
        }
    }

    /// Remove every registration.
    pub fn clear(&self) {
        if let Ok(mut guard) = self.registry.lock() {
            guard.topics.clear();
        }
    }

    pub fn handler_count(&self, topic: Topic) -> usize {
        self.registry
            .lock()
            .map(|g| g.topics.get(&topic).map(|l| l.len()).unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.registry.lock().map(|g| g.topics.is_empty()).unwrap_or(true)
    }

    fn still_registered(&self, topic: Topic, id: SubscriptionId) -> bool {
        self.registry.lock().map(|g| g.contains(topic, id)).unwrap_or(false)
    }

    /// Decode `envelope` and deliver it: typed handlers first, then wildcard
    /// handlers. Undecodable envelopes reach no handler.
    pub fn dispatch(&self, envelope: &Envelope) -> Result<DispatchOutcome, DecodeError> {
        let event = Event::decode(envelope)?;
        Ok(self.deliver(&event, envelope))
    }

    /// Deliver an already decoded event.
    pub fn dispatch_event(&self, event: &Event) -> DispatchOutcome {
        let envelope = event.to_envelope();
        self.deliver(event, &envelope)
    }

    fn deliver(&self, event: &Event, envelope: &Envelope) -> DispatchOutcome {
        let mut outcome = DispatchOutcome::default();
        let typed = Topic::Kind(event.kind());
        let (typed_handlers, wildcard_handlers) = match self.registry.lock() {
            Ok(guard) => (guard.snapshot(typed), guard.snapshot(Topic::Wildcard)),
            Err(_) => return outcome,
        };

        let runs = typed_handlers
            .into_iter()
            .map(|h| (typed, h))
            .chain(wildcard_handlers.into_iter().map(|h| (Topic::Wildcard, h)));

        for (topic, (id, handler)) in runs {
            if !self.still_registered(topic, id) {
                continue;
            }
            let result = catch_unwind(AssertUnwindSafe(|| match &handler {
                Handler::Event(f) => f(event),
                Handler::Envelope(f) => f(envelope),
            }));
            match result {
                Ok(Ok(())) => outcome.delivered += 1,
                Ok(Err(e)) => {
                    outcome.failed += 1;
                    warn!(event = %event.kind(), subscription = id.0, error = %e, "handler failed");
                }
                Err(_) => {
                    outcome.failed += 1;
                    error!(event = %event.kind(), subscription = id.0, "handler panicked");
                }
            }
        }

        if outcome.delivered + outcome.failed == 0 {
            debug!(event = %event.kind(), "no subscribers");
        }
        outcome
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let topics = self.registry.lock().map(|g| g.topics.len()).unwrap_or(0);
        f.debug_struct("Dispatcher").field("topics", &topics).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::ViewerCount;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn viewer_count(n: u32) -> Envelope {
        Event::ViewerCount(ViewerCount { count: n }).to_envelope()
    }

    #[test]
    fn test_on_and_dispatch() {
        let d = Dispatcher::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        d.on(EventKind::RoomViewerCount, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let outcome = d.dispatch(&viewer_count(3)).unwrap();
        assert_eq!(outcome.delivered, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_other_kinds_not_delivered() {
        let d = Dispatcher::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        d.on(EventKind::ChatMessage, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        d.dispatch(&viewer_count(1)).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_off_all_for_topic() {
        let d = Dispatcher::new();
        d.on(EventKind::Pong, |_| Ok(()));
        d.on(EventKind::Pong, |_| Ok(()));
        assert_eq!(d.off(Topic::Kind(EventKind::Pong), None), 2);
        assert_eq!(d.handler_count(Topic::Kind(EventKind::Pong)), 0);
    }

    #[test]
    fn test_off_single() {
        let d = Dispatcher::new();
        let a = d.on(EventKind::Pong, |_| Ok(()));
        d.on(EventKind::Pong, |_| Ok(()));
        assert_eq!(d.off(a.topic(), Some(a.id())), 1);
        assert_eq!(d.handler_count(Topic::Kind(EventKind::Pong)), 1);
        assert!(!a.unsubscribe(), "already removed");
    }

    #[test]
    fn test_unknown_envelope_is_error() {
        let d = Dispatcher::new();
        let env = Envelope::new("nope", serde_json::json!({}));
        assert!(d.dispatch(&env).is_err());
    }

    #[test]
    fn test_failing_handlers_do_not_stop_delivery() {
        let d = Dispatcher::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = Arc::clone(&log);
        d.on(EventKind::RoomViewerCount, move |_| {
            l.lock().unwrap().push("a");
            Err("first handler failed".into())
        });
        d.on(EventKind::RoomViewerCount, |_| panic!("second handler blew up"));
        let l = Arc::clone(&log);
        d.on(EventKind::RoomViewerCount, move |_| {
            l.lock().unwrap().push("c");
            Ok(())
        });
        let l = Arc::clone(&log);
        d.on_any(move |_| {
            l.lock().unwrap().push("any");
            Ok(())
        });

        let outcome = d.dispatch(&viewer_count(4)).unwrap();
        assert_eq!(outcome, DispatchOutcome { delivered: 2, failed: 2 });
        assert_eq!(*log.lock().unwrap(), vec!["a", "c", "any"]);

        // The registry survives the panic.
        let again = d.dispatch(&viewer_count(5)).unwrap();
        assert_eq!(again, DispatchOutcome { delivered: 2, failed: 2 });
    }

    #[test]
    fn test_subscription_outliving_dispatcher() {
        let sub = {
            let d = Dispatcher::new();
            d.on(EventKind::Ping, |_| Ok(()))
        };
        assert!(!sub.unsubscribe());
    }
}
