//! Listener registries and the unsubscribe handle they hand out.
//!
//! Transports use `Listeners<SyncMessage>` / `Listeners<TransportEvent>` to fan
//! out inbound traffic; the coordinator hands out `Subscription`s for watchers.

use std::sync::{Arc, Mutex, PoisonError, Weak};

/// Handle returned by every `on_*`/`watch` registration.
///
/// Calling `unsubscribe()` removes the listener. Dropping the handle without
/// calling it keeps the listener registered.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Subscription {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    /// Give up the handle; the listener stays registered for good.
    pub fn detach(mut self) {
        self.cancel = None;
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

pub type Listener<T> = Arc<dyn Fn(T) + Send + Sync>;

struct Registry<T> {
    next_id: u64,
    entries: Vec<(u64, Listener<T>)>,
}

/// Ordered set of callbacks; every emitted item reaches each listener once.
pub struct Listeners<T> {
    inner: Arc<Mutex<Registry<T>>>,
}

impl<T> Clone for Listeners<T> {
    fn clone(&self) -> Self {
        Listeners {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for Listeners<T> {
    fn default() -> Self {
        Listeners {
            inner: Arc::new(Mutex::new(Registry {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }
}

impl<T: Clone + Send + 'static> Listeners<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Listener<T>) -> Subscription {
        let id = {
            let mut reg = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            let id = reg.next_id;
            reg.next_id += 1;
            reg.entries.push((id, listener));
            id
        };
        let weak: Weak<Mutex<Registry<T>>> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                let mut reg = inner.lock().unwrap_or_else(PoisonError::into_inner);
                reg.entries.retain(|(entry_id, _)| *entry_id != id);
            }
        })
    }

    /// Deliver `item` to every listener, in registration order.
    ///
    /// The registry lock is released before callbacks run, so a listener may
    /// unsubscribe itself.
    pub fn emit(&self, item: T) {
        let snapshot: Vec<Listener<T>> = {
            let reg = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            reg.entries.iter().map(|(_, l)| l.clone()).collect()
        };
        for listener in snapshot {
            listener(item.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .clear();
    }
}
