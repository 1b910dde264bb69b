//! Snapshot-before-dispatch observer registry.
//!
//! Every delivery pass clones the current listener list under the lock and
//! then calls the listeners with the lock released. Adding or removing a
//! listener therefore only affects passes that start afterwards, and a
//! listener may safely (un)register listeners from inside its callback.

use crate::error::ListenerError;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};

pub type Listener<T> = Arc<dyn Fn(&T) -> Result<(), ListenerError> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Registry<T> {
    next_id: u64,
    listeners: Vec<(ListenerId, Listener<T>)>,
}

pub struct Subject<T> {
    name: &'static str,
    registry: Mutex<Registry<T>>,
}

impl<T> Subject<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            registry: Mutex::new(Registry {
                next_id: 0,
                listeners: Vec::new(),
            }),
        }
    }

    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&T) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        let id = ListenerId(registry.next_id);
        registry.next_id += 1;
        registry.listeners.push((id, Arc::new(listener)));
        id
    }

    /// Returns `false` when `id` was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        let before = registry.listeners.len();
        registry.listeners.retain(|(existing, _)| *existing != id);
        registry.listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .listeners
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<(ListenerId, Listener<T>)> {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .listeners
            .clone()
    }

    /// Delivers `event` to every listener registered when the pass starts, in
    /// registration order. Returns how many listeners completed without error.
    pub fn notify(&self, event: &T) -> usize {
        let mut delivered = 0;
        for (id, listener) in self.snapshot() {
            let outcome = catch_unwind(AssertUnwindSafe(|| listener(event)))
                .unwrap_or(Err(ListenerError::Panicked));
            match outcome {
                Ok(()) => delivered += 1,
                Err(err) => {
                    tracing::warn!(subject = self.name, listener = id.0, error = %err, "listener failed");
                }
            }
        }
        delivered
    }
}
