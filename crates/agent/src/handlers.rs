//! Ordered callback lists.
//!
//! Every handler registered on a list is called for every dispatch, in
//! registration order. There is no first-match short circuit.

use std::sync::{Arc, PoisonError, RwLock};

/// A registered callback.
pub type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Fan-out list of handlers for one channel.
pub struct HandlerList<T> {
    handlers: RwLock<Vec<Handler<T>>>,
}

impl<T> HandlerList<T> {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Append a handler after every previously registered one.
    pub fn push(&self, handler: Handler<T>) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    /// Call every handler with `value`. Returns how many ran.
    ///
    /// The list is snapshotted first so a handler may register another
    /// handler without deadlocking; the new one runs from the next dispatch.
    pub fn dispatch(&self, value: &T) -> usize {
        let snapshot: Vec<Handler<T>> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for handler in &snapshot {
            handler(value);
        }
        snapshot.len()
    }

    pub fn len(&self) -> usize {
        self.handlers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for HandlerList<T> {
    fn default() -> Self {
        Self::new()
    }
}
