//! Event emission and bubbling.
//!
//! Every symbol node owns an emitter; emitters form a chain up to the
//! coordinator. Listeners run synchronously in registration order, then
//! the event is re-emitted to the parent unless a listener stopped
//! propagation.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::core::value::Value;

pub const EVENT_SET: &str = "set";
pub const EVENT_GET: &str = "get";
pub const EVENT_CLEARED: &str = "cleared";
pub const EVENT_CHANGED: &str = "changed";
pub const EVENT_INVALIDATED: &str = "invalidated";

pub const EVENT_CREATED: &str = "created";
pub const EVENT_DESTROYED: &str = "destroyed";

pub const EVENT_CONNECTED: &str = "connected";
pub const EVENT_DISCONNECTED: &str = "disconnected";
pub const EVENT_SOURCE_CHANGED: &str = "sourceChanged";
pub const EVENT_CONNECTION_LOST: &str = "connectionLost";
pub const EVENT_RECONNECTED: &str = "reconnected";
pub const EVENT_KILLED: &str = "killed";
pub const EVENT_REINITIALIZED: &str = "reinitialized";

#[derive(Debug)]
pub struct SymbolEvent {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    /// Operation that produced the event (`read`, `write`, ...).
    pub context: String,
    /// Path of the symbol the event originated at.
    pub source: String,
    pub payload: Option<Value>,
    stopped: AtomicBool,
}

impl SymbolEvent {
    pub fn new(name: &str, source: &str, context: &str, payload: Option<Value>) -> Self {
        Self {
            name: name.to_string(),
            timestamp: Utc::now(),
            context: context.to_string(),
            source: source.to_string(),
            payload,
            stopped: AtomicBool::new(false),
        }
    }

    /// Halt the bubbling walk after the current listener set.
    pub fn stop_propagation(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn propagation_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

pub type Listener = Arc<dyn Fn(&SymbolEvent) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Entry {
    id: u64,
    event: String,
    once: bool,
    callback: Listener,
}

#[derive(Default)]
pub struct Emitter {
    entries: Mutex<Vec<Entry>>,
    parent: Mutex<Option<Weak<Emitter>>>,
    next_id: AtomicU64,
}

impl Emitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_parent(&self, parent: &Arc<Emitter>) {
        *self.parent.lock() = Some(Arc::downgrade(parent));
    }

    pub fn on(&self, event: &str, callback: Listener) -> ListenerId {
        self.register(event, false, callback)
    }

    pub fn once(&self, event: &str, callback: Listener) -> ListenerId {
        self.register(event, true, callback)
    }

    pub fn off(&self, id: ListenerId) {
        self.entries.lock().retain(|entry| entry.id != id.0);
    }

    fn register(&self, event: &str, once: bool, callback: Listener) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.entries.lock().push(Entry {
            id,
            event: event.to_string(),
            once,
            callback,
        });
        ListenerId(id)
    }

    /// Run matching listeners, then bubble to the parent.
    pub fn emit(&self, event: &SymbolEvent) {
        self.dispatch(event);
        if event.propagation_stopped() {
            return;
        }
        let parent = self.parent.lock().as_ref().and_then(Weak::upgrade);
        if let Some(parent) = parent {
            parent.emit(event);
        }
    }

    /// Run matching listeners without bubbling.
    pub fn emit_local(&self, event: &SymbolEvent) {
        self.dispatch(event);
    }

    fn dispatch(&self, event: &SymbolEvent) {
        // Collect outside the lock so listeners may re-enter on/off.
        let matched: Vec<Listener> = {
            let mut entries = self.entries.lock();
            let matched = entries
                .iter()
                .filter(|entry| entry.event == event.name)
                .map(|entry| Arc::clone(&entry.callback))
                .collect();
            entries.retain(|entry| !(entry.once && entry.event == event.name));
            matched
        };
        for callback in matched {
            callback(event);
        }
    }
}
