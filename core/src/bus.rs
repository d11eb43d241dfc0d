//! Process-wide event bus: named topics carrying JSON payloads. Listeners run
//! in registration order; a panicking listener is logged and skipped so the
//! rest still receive the event.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;

pub const REPOS_UPDATE: &str = "repos:update";
pub const SESSIONS_UPDATE: &str = "sessions:update";
pub const TASKS_UPDATE: &str = "tasks:update";

type Listener = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Default)]
struct Topics {
    listeners: HashMap<String, Vec<(u64, Listener)>>,
}

/// Typed pub/sub hub shared by the engine, the task tracker and the server.
pub struct EventBus {
    topics: Mutex<Topics>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            topics: Mutex::new(Topics::default()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Register a listener on `topic`. The returned subscription detaches the
    /// listener when `unsubscribe` is called (or when dropped).
    pub fn subscribe(
        self: &Arc<Self>,
        topic: &str,
        listener: impl Fn(&Value) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut topics = self.topics.lock().unwrap_or_else(|p| p.into_inner());
        topics
            .listeners
            .entry(topic.to_string())
            .or_default()
            .push((id, Arc::new(listener)));
        Subscription {
            bus: Arc::downgrade(self),
            topic: topic.to_string(),
            id,
        }
    }

    /// Deliver `payload` to every listener on `topic`, in registration order.
    /// Listener panics are contained: they log a warning and do not stop
    /// delivery to the remaining listeners.
    pub fn emit(&self, topic: &str, payload: &Value) {
        let listeners: Vec<Listener> = {
            let topics = self.topics.lock().unwrap_or_else(|p| p.into_inner());
            match topics.listeners.get(topic) {
                Some(list) => list.iter().map(|(_, l)| l.clone()).collect(),
                None => return,
            }
        };
        for listener in listeners {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| listener(payload)));
            if result.is_err() {
                tracing::warn!("event listener panicked on topic {topic}");
            }
        }
    }

    fn remove(&self, topic: &str, id: u64) {
        let mut topics = self.topics.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(list) = topics.listeners.get_mut(topic) {
            list.retain(|(lid, _)| *lid != id);
            if list.is_empty() {
                topics.listeners.remove(topic);
            }
        }
    }
}

/// Handle to a registered listener; detaches it on `unsubscribe` or drop.
pub struct Subscription {
    bus: Weak<EventBus>,
    topic: String,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {
        // Drop does the work.
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(&self.topic, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn listeners_run_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = order.clone();
        let _s1 = bus.subscribe("t", move |_| o1.lock().unwrap().push(1));
        let o2 = order.clone();
        let _s2 = bus.subscribe("t", move |_| o2.lock().unwrap().push(2));
        bus.emit("t", &serde_json::json!({}));
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn panicking_listener_does_not_block_delivery() {
        let bus = EventBus::new();
        let _bad = bus.subscribe(SESSIONS_UPDATE, |_| panic!("boom"));
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let _good = bus.subscribe(SESSIONS_UPDATE, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit(SESSIONS_UPDATE, &serde_json::json!({"sessions": []}));
        bus.emit(SESSIONS_UPDATE, &serde_json::json!({"sessions": []}));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unsubscribe_detaches_listener() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let sub = bus.subscribe("t", move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit("t", &serde_json::json!({}));
        sub.unsubscribe();
        bus.emit("t", &serde_json::json!({}));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
