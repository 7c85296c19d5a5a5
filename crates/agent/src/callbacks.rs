//! Stream callbacks: where line-buffered model output is delivered.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Completion marker passed with the last delivery of a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// The model's finish reason ("stop", "tool_calls", ...)
    pub reason: String,
}

/// `(delta, completion, session_id)`
pub type StreamCallback = Arc<dyn Fn(&str, Option<&Completion>, Option<&str>) + Send + Sync>;

/// Identity of a registered callback, used to unregister it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

/// Registered stream callbacks, called in registration order.
#[derive(Default)]
pub struct StreamCallbacks {
    next_id: AtomicU64,
    callbacks: RwLock<Vec<(CallbackId, StreamCallback)>>,
}

impl StreamCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, callback: impl Fn(&str, Option<&Completion>, Option<&str>) + Send + Sync + 'static) -> CallbackId {
        let id = CallbackId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(callback)));
        id
    }

    /// Remove a callback. Returns `false` if it was not registered.
    pub fn unregister(&self, id: CallbackId) -> bool {
        let mut callbacks = self.callbacks.write().unwrap_or_else(PoisonError::into_inner);
        let before = callbacks.len();
        callbacks.retain(|(cid, _)| *cid != id);
        callbacks.len() < before
    }

    pub fn emit(&self, delta: &str, completion: Option<&Completion>, session_id: Option<&str>) {
        let snapshot: Vec<StreamCallback> = self
            .callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for callback in snapshot {
            callback(delta, completion, session_id);
        }
    }

    pub fn len(&self) -> usize {
        self.callbacks.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
