//! Explicit subscribe/emit event signals (§9: "implement as explicit
//! subscribe/emit, not as exceptions or coroutines").
//!
//! Endpoints and routers use this for `connection_established`,
//! `connection_lost`, `id_assigned`, and BLOB stream events, decoupling the
//! emitter from whatever the caller wants to do about it.

use parking_lot::Mutex;
use std::sync::Arc;

type Callback<T> = Box<dyn Fn(&T) + Send + Sync>;

/// A multi-subscriber event emitter for values of type `T`.
pub struct Signal<T> {
    subscribers: Arc<Mutex<Vec<Callback<T>>>>,
}

impl<T> Signal<T> {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Register a callback. Callbacks run synchronously, in registration
    /// order, on the thread that calls [`Signal::emit`].
    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.subscribers.lock().push(Box::new(callback));
    }

    pub fn emit(&self, value: &T) {
        for callback in self.subscribers.lock().iter() {
            callback(value);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl<T> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            subscribers: self.subscribers.clone(),
        }
    }
}
