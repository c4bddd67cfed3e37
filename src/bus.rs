//! Event bus
//!
//! The only path between producers (instrumentation sources) and consumers
//! (direct subscribers and sinks). `emit` stamps the event with a timestamp and
//! the session id, then fans it out synchronously: subscribers for the event
//! type first, then every sink, each in registration order.
//!
//! A panicking subscriber or a failing sink is logged and skipped; delivery to
//! the rest continues. Listener and sink lists are snapshotted before
//! iteration, so a callback may subscribe, unsubscribe or remove a sink while
//! it runs.

use chrono::Utc;
use eyre::Result;
use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use crate::event::{Event, EventKind};
use crate::identity;
use crate::storage::KeyValueStore;

/// Callback invoked for every event of one type
pub type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

/// A consumer that externalizes every event it receives
pub trait Sink: Send + Sync {
    /// Short name used in log lines
    fn name(&self) -> &str;

    /// Forward one event. Errors are logged by the bus and never propagate.
    fn send(&self, event: &Event) -> Result<()>;
}

#[derive(Clone)]
struct ListenerEntry {
    id: u64,
    callback: Listener,
}

struct BusInner {
    listeners: RwLock<HashMap<String, Vec<ListenerEntry>>>,
    sinks: RwLock<Vec<Arc<dyn Sink>>>,
    session: Arc<dyn KeyValueStore>,
    // Serializes get-or-create of the session id across emitting threads
    session_guard: Mutex<()>,
    next_id: AtomicU64,
}

/// Process-wide publish/subscribe hub
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_total())
            .field("sinks", &self.sink_count())
            .finish()
    }
}

impl EventBus {
    /// Create a bus whose session id lives in `session`
    pub fn new(session: Arc<dyn KeyValueStore>) -> Self {
        Self {
            inner: Arc::new(BusInner {
                listeners: RwLock::new(HashMap::new()),
                sinks: RwLock::new(Vec::new()),
                session,
                session_guard: Mutex::new(()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register `callback` for `event_type`
    ///
    /// Subscribing the same callback twice creates two registrations, each
    /// removed independently by its own handle. Dropping the handle does not
    /// unsubscribe.
    pub fn subscribe<F>(&self, event_type: &str, callback: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.subscribe_listener(event_type, Arc::new(callback))
    }

    pub fn subscribe_listener(&self, event_type: &str, callback: Listener) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut listeners = self.inner.listeners.write().unwrap_or_else(PoisonError::into_inner);
        listeners
            .entry(event_type.to_string())
            .or_default()
            .push(ListenerEntry { id, callback });
        log::debug!("Subscribed listener {} to '{}'", id, event_type);

        Subscription {
            bus: Arc::downgrade(&self.inner),
            event_type: event_type.to_string(),
            id,
        }
    }

    /// Stamp and deliver an event, returning the delivered copy
    pub fn emit(&self, kind: EventKind) -> Event {
        let event = Event::new(kind, Utc::now().timestamp_millis(), self.session_id());
        self.dispatch(&event);
        event
    }

    /// Current session id, created lazily in session storage
    pub fn session_id(&self) -> String {
        let _guard = self.inner.session_guard.lock().unwrap_or_else(PoisonError::into_inner);
        identity::session_id(self.inner.session.as_ref())
    }

    fn dispatch(&self, event: &Event) {
        let listeners: Vec<ListenerEntry> = {
            let map = self.inner.listeners.read().unwrap_or_else(PoisonError::into_inner);
            map.get(event.event_type()).cloned().unwrap_or_default()
        };

        for entry in listeners {
            if catch_unwind(AssertUnwindSafe(|| (entry.callback)(event))).is_err() {
                log::error!("Listener {} panicked handling '{}'", entry.id, event.event_type());
            }
        }

        let sinks = self.sinks();
        for sink in sinks {
            match catch_unwind(AssertUnwindSafe(|| sink.send(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::warn!("Sink '{}' failed on '{}': {:#}", sink.name(), event.event_type(), e),
                Err(_) => log::error!("Sink '{}' panicked on '{}'", sink.name(), event.event_type()),
            }
        }
    }

    pub fn add_sink(&self, sink: Arc<dyn Sink>) {
        log::info!("Adding sink '{}'", sink.name());
        self.inner
            .sinks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sink);
    }

    /// Remove a sink by identity; returns whether it was registered
    pub fn remove_sink(&self, sink: &Arc<dyn Sink>) -> bool {
        let mut sinks = self.inner.sinks.write().unwrap_or_else(PoisonError::into_inner);
        let before = sinks.len();
        sinks.retain(|s| !Arc::ptr_eq(s, sink));
        before != sinks.len()
    }

    /// Snapshot of the registered sinks
    pub fn sinks(&self) -> Vec<Arc<dyn Sink>> {
        self.inner.sinks.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn sink_count(&self) -> usize {
        self.inner.sinks.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn listener_count(&self, event_type: &str) -> usize {
        self.inner
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event_type)
            .map(Vec::len)
            .unwrap_or(0)
    }

    fn listener_total(&self) -> usize {
        self.inner
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Vec::len)
            .sum()
    }
}

/// Handle removing exactly one registration
#[derive(Debug)]
pub struct Subscription {
    bus: Weak<BusInner>,
    event_type: String,
    id: u64,
}

impl Subscription {
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Remove the registration; a no-op if the bus is gone
    pub fn unsubscribe(self) {
        let Some(inner) = self.bus.upgrade() else {
            return;
        };
        let mut listeners = inner.listeners.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entries) = listeners.get_mut(&self.event_type) {
            entries.retain(|e| e.id != self.id);
            if entries.is_empty() {
                listeners.remove(&self.event_type);
            }
        }
        log::debug!("Unsubscribed listener {} from '{}'", self.id, self.event_type);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::Barrier;
    use std::time::Duration;

    fn bus() -> EventBus {
        EventBus::new(Arc::new(MemoryStore::new()))
    }

    fn ping(n: i64) -> EventKind {
        EventKind::custom("ping", json!({ "n": n }))
    }

    #[derive(Default)]
    struct RecordingSink {
        name: String,
        seen: Mutex<Vec<Event>>,
    }

    impl RecordingSink {
        fn named(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn seen(&self) -> Vec<Event> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl Sink for RecordingSink {
        fn name(&self) -> &str {
            &self.name
        }

        fn send(&self, event: &Event) -> Result<()> {
            self.seen.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    struct FailingSink;

    impl Sink for FailingSink {
        fn name(&self) -> &str {
            "failing"
        }

        fn send(&self, _event: &Event) -> Result<()> {
            eyre::bail!("quota exceeded")
        }
    }

    #[test]
    fn test_emit_stamps_timestamp_and_session() {
        let bus = bus();
        let sink = RecordingSink::named("rec");
        bus.add_sink(sink.clone());

        let emitted = bus.emit(ping(1));
        let seen = sink.seen();

        assert_eq!(seen.len(), 1);
        assert!(seen[0].timestamp > 0);
        assert!(seen[0].session_id.starts_with("session_"));
        assert_eq!(seen[0], emitted);
    }

    #[test]
    fn test_every_sink_gets_every_event_in_order() {
        let bus = bus();
        let a = RecordingSink::named("a");
        let b = RecordingSink::named("b");
        bus.add_sink(a.clone());
        bus.add_sink(b.clone());

        for n in 0..10 {
            bus.emit(ping(n));
        }

        for sink in [a, b] {
            let ns: Vec<i64> = sink
                .seen()
                .iter()
                .map(|e| e.payload()["n"].as_i64().unwrap())
                .collect();
            assert_eq!(ns, (0..10).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_session_id_stable_across_emits() {
        let bus = bus();
        let first = bus.emit(ping(1));
        let second = bus.emit(ping(2));
        assert_eq!(first.session_id, second.session_id);
    }

    /// Session storage with a slow read, widening the get-then-set window
    struct SlowSession(MemoryStore);

    impl KeyValueStore for SlowSession {
        fn get(&self, key: &str) -> Result<Option<String>> {
            std::thread::sleep(Duration::from_millis(5));
            self.0.get(key)
        }
        fn set(&self, key: &str, value: &str) -> Result<()> {
            self.0.set(key, value)
        }
        fn remove(&self, key: &str) -> Result<()> {
            self.0.remove(key)
        }
    }

    #[test]
    fn test_concurrent_first_emits_share_one_session() {
        let bus = EventBus::new(Arc::new(SlowSession(MemoryStore::new())));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|n| {
                let bus = bus.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    bus.emit(ping(n)).session_id
                })
            })
            .collect();

        let ids: HashSet<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(ids.len(), 1);
        assert_eq!(ids.into_iter().next().unwrap(), bus.session_id());
    }

    #[test]
    fn test_subscribers_run_in_order_before_sinks() {
        let bus = bus();
        let order = Arc::new(Mutex::new(Vec::new()));

        struct OrderSink(Arc<Mutex<Vec<String>>>);
        impl Sink for OrderSink {
            fn name(&self) -> &str {
                "order"
            }
            fn send(&self, _event: &Event) -> Result<()> {
                self.0.lock().unwrap().push("sink".to_string());
                Ok(())
            }
        }

        bus.add_sink(Arc::new(OrderSink(order.clone())));
        for label in ["first", "second"] {
            let order = order.clone();
            bus.subscribe("ping", move |_| order.lock().unwrap().push(label.to_string()));
        }

        bus.emit(ping(0));
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "sink"]);
    }

    #[test]
    fn test_subscriber_only_sees_its_type() {
        let bus = bus();
        let count = Arc::new(Mutex::new(0));
        let c = count.clone();
        bus.subscribe("pong", move |_| *c.lock().unwrap() += 1);

        bus.emit(ping(0));
        bus.emit(EventKind::custom("pong", json!({})));
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn test_panicking_subscriber_is_isolated() {
        let bus = bus();
        let sink = RecordingSink::named("rec");
        bus.add_sink(sink.clone());
        let after = Arc::new(Mutex::new(Vec::new()));

        bus.subscribe("ping", |event| {
            if event.payload()["n"] == 1 {
                panic!("boom");
            }
        });
        let a = after.clone();
        bus.subscribe("ping", move |event| a.lock().unwrap().push(event.payload()["n"].as_i64().unwrap()));

        bus.emit(ping(1));
        bus.emit(ping(2));

        assert_eq!(*after.lock().unwrap(), vec![1, 2]);
        assert_eq!(sink.seen().len(), 2);
    }

    #[test]
    fn test_failing_sink_does_not_block_others() {
        let bus = bus();
        let sink = RecordingSink::named("rec");
        bus.add_sink(Arc::new(FailingSink));
        bus.add_sink(sink.clone());

        bus.emit(ping(0));
        assert_eq!(sink.seen().len(), 1);
    }

    #[test]
    fn test_unsubscribe_removes_only_that_registration() {
        let bus = bus();
        let count = Arc::new(Mutex::new(0));
        let callback: Listener = {
            let count = count.clone();
            Arc::new(move |_: &Event| *count.lock().unwrap() += 1)
        };

        let first = bus.subscribe_listener("ping", callback.clone());
        let _second = bus.subscribe_listener("ping", callback);
        assert_eq!(bus.listener_count("ping"), 2);

        first.unsubscribe();
        assert_eq!(bus.listener_count("ping"), 1);

        bus.emit(ping(0));
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn test_remove_sink_by_identity() {
        let bus = bus();
        let a: Arc<dyn Sink> = RecordingSink::named("a");
        let b: Arc<dyn Sink> = RecordingSink::named("b");
        bus.add_sink(a.clone());
        bus.add_sink(b.clone());

        assert!(bus.remove_sink(&a));
        assert!(!bus.remove_sink(&a));
        assert_eq!(bus.sink_count(), 1);
        assert!(Arc::ptr_eq(&bus.sinks()[0], &b));
    }

    #[test]
    fn test_sink_removing_itself_mid_emit() {
        let bus = bus();
        let later = RecordingSink::named("later");

        struct SelfRemoving {
            bus: EventBus,
            me: Mutex<Option<Arc<dyn Sink>>>,
        }
        impl Sink for SelfRemoving {
            fn name(&self) -> &str {
                "self-removing"
            }
            fn send(&self, _event: &Event) -> Result<()> {
                if let Some(me) = self.me.lock().unwrap().take() {
                    self.bus.remove_sink(&me);
                }
                Ok(())
            }
        }

        let remover = Arc::new(SelfRemoving {
            bus: bus.clone(),
            me: Mutex::new(None),
        });
        let as_sink: Arc<dyn Sink> = remover.clone();
        *remover.me.lock().unwrap() = Some(as_sink.clone());
        bus.add_sink(as_sink);
        bus.add_sink(later.clone());

        bus.emit(ping(1));
        bus.emit(ping(2));

        assert_eq!(later.seen().len(), 2);
        assert_eq!(bus.sink_count(), 1);
    }

    #[test]
    fn test_subscribe_from_inside_callback() {
        let bus = bus();
        let inner_bus = bus.clone();
        bus.subscribe("ping", move |_| {
            inner_bus.subscribe("pong", |_| {});
        });

        bus.emit(ping(0));
        assert_eq!(bus.listener_count("pong"), 1);
    }
}
