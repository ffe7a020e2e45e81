//! Callbacks and accumulators for dispatch outcomes.
//!
//! Each outcome category either notifies its handlers or appends to its
//! accumulator. Handlers run synchronously on the dispatch worker that produced
//! the outcome, so they should be quick.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

/// Shared callback signature.
pub type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Ordered list of callbacks.
///
/// The same `Arc` cannot be added twice; two distinct closures with identical
/// bodies are still two handlers.
pub struct HandlerList<T> {
    handlers: RwLock<Vec<Handler<T>>>,
}

impl<T> HandlerList<T> {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Returns `false` when this exact handler is already registered.
    pub fn add(&self, handler: Handler<T>) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        if handlers.iter().any(|h| Arc::ptr_eq(h, &handler)) {
            return false;
        }
        handlers.push(handler);
        true
    }

    pub fn remove(&self, handler: &Handler<T>) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let before = handlers.len();
        handlers.retain(|h| !Arc::ptr_eq(h, handler));
        handlers.len() != before
    }

    pub fn len(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every handler in registration order.
    pub fn notify(&self, value: &T) {
        // Clone the list so a handler can register another one without deadlocking.
        let handlers: Vec<Handler<T>> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for handler in handlers {
            handler(value);
        }
    }
}

impl<T> Default for HandlerList<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Append-only collection of outcomes.
pub struct Accumulator<T> {
    items: Mutex<Vec<T>>,
}

impl<T> Accumulator<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
        }
    }

    fn items(&self) -> MutexGuard<'_, Vec<T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, item: T) {
        self.items().push(item);
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }

    /// Borrow the collected items for the duration of `f`.
    pub fn inspect<R>(&self, f: impl FnOnce(&[T]) -> R) -> R {
        f(&self.items())
    }
}

impl<T: Clone> Accumulator<T> {
    pub fn snapshot(&self) -> Vec<T> {
        self.items().clone()
    }
}

impl<T> Default for Accumulator<T> {
    fn default() -> Self {
        Self::new()
    }
}
