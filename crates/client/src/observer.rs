// Named-event observer with explicit cancellation handles.
//
// Emission runs over a snapshot of the handlers registered at the time of
// the call, so a handler may subscribe or cancel without disturbing the
// delivery in progress.

use std::sync::{Arc, Mutex, PoisonError, Weak};

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Registration<E> {
    id: u64,
    event: String,
    handler: Handler<E>,
}

struct Handlers<E> {
    next_id: u64,
    registrations: Vec<Registration<E>>,
}

pub struct Observer<E> {
    handlers: Arc<Mutex<Handlers<E>>>,
}

impl<E> Clone for Observer<E> {
    fn clone(&self) -> Self {
        Self { handlers: Arc::clone(&self.handlers) }
    }
}

impl<E> Default for Observer<E> {
    fn default() -> Self {
        Self { handlers: Arc::new(Mutex::new(Handlers { next_id: 1, registrations: Vec::new() })) }
    }
}

impl<E: 'static> Observer<E> {
    pub fn subscribe<F>(&self, event: &str, handler: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let mut handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
        let id = handlers.next_id;
        handlers.next_id += 1;
        handlers.registrations.push(Registration {
            id,
            event: event.to_string(),
            handler: Arc::new(handler),
        });

        let weak: Weak<Mutex<Handlers<E>>> = Arc::downgrade(&self.handlers);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(handlers) = weak.upgrade() {
                    handlers
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .registrations
                        .retain(|registration| registration.id != id);
                }
            })),
        }
    }

    /// Deliver `payload` to every handler of `event`. Returns how many ran.
    pub fn emit(&self, event: &str, payload: &E) -> usize {
        let snapshot: Vec<Handler<E>> = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .registrations
            .iter()
            .filter(|registration| registration.event == event)
            .map(|registration| Arc::clone(&registration.handler))
            .collect();

        for handler in &snapshot {
            handler(payload);
        }
        snapshot.len()
    }

    pub fn handler_count(&self, event: &str) -> usize {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .registrations
            .iter()
            .filter(|registration| registration.event == event)
            .count()
    }
}

/// Cancels one observer registration. Dropping the handle leaves the
/// registration in place.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("active", &self.cancel.is_some()).finish()
    }
}
