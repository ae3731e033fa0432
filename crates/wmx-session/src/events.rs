//! Listener registration and fan-out.
//!
//! Listeners are registered explicitly and keyed by a generated id, so
//! removal is deterministic. Delivery is a channel send per listener: a
//! listener whose receiver is gone (or slow to the point of being dropped)
//! never blocks or breaks notification of the others.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use wmx_core::SessionSnapshot;

/// Raw output from one session's PTY.
#[derive(Debug, Clone)]
pub struct OutputEvent {
    pub session_id: String,
    pub data: Vec<u8>,
}

/// A set of listeners for one event type.
pub struct ListenerHub<T: Clone + Send + 'static> {
    listeners: Mutex<HashMap<String, mpsc::UnboundedSender<T>>>,
}

impl<T: Clone + Send + 'static> ListenerHub<T> {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
        }
    }

    /// Register a listener. Returns its id and the receiving end.
    pub fn add(&self) -> (String, mpsc::UnboundedReceiver<T>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = crate::generate_id(16);
        self.listeners
            .lock()
            .expect("listener map poisoned")
            .insert(id.clone(), tx);
        (id, rx)
    }

    /// Remove a listener by id. Returns whether it existed.
    pub fn remove(&self, id: &str) -> bool {
        self.listeners
            .lock()
            .expect("listener map poisoned")
            .remove(id)
            .is_some()
    }

    /// Deliver an event to every registered listener, dropping listeners
    /// whose receiver has gone away.
    pub fn emit(&self, event: &T) {
        let mut listeners = self.listeners.lock().expect("listener map poisoned");
        listeners.retain(|_, tx| tx.send(event.clone()).is_ok());
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().expect("listener map poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone + Send + 'static> Default for ListenerHub<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Callbacks a session raises from its read pump. The registry points these
/// at its listener hubs; tests point them at channels or counters.
#[derive(Clone)]
pub struct SessionEvents {
    pub on_output: Arc<dyn Fn(&str, &[u8]) + Send + Sync>,
    pub on_state: Arc<dyn Fn(SessionSnapshot) + Send + Sync>,
}

impl SessionEvents {
    /// Events that go nowhere. Used by tests and by sessions being torn down.
    pub fn discard() -> Self {
        Self {
            on_output: Arc::new(|_, _| {}),
            on_state: Arc::new(|_| {}),
        }
    }
}
