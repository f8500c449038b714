//! Synchronous listener registry.
//!
//! Notification iterates over a snapshot of the listeners taken under the
//! lock, so a listener may register or unregister others from inside a
//! callback; the change applies from the next notification on.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Handle returned by [`Observer::register`].
pub type ListenerId = u64;

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

pub struct Observer<E> {
    listeners: Mutex<Vec<(ListenerId, Listener<E>)>>,
    next_id: AtomicU64,
}

impl<E> Observer<E> {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn register(&self, callback: impl Fn(&E) + Send + Sync + 'static) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .expect("observer poisoned")
            .push((id, Arc::new(callback)));
        id
    }

    /// Remove a listener. Unknown ids are ignored.
    pub fn unregister(&self, id: ListenerId) {
        self.listeners
            .lock()
            .expect("observer poisoned")
            .retain(|(lid, _)| *lid != id);
    }

    pub fn notify(&self, event: &E) {
        let snapshot: Vec<Listener<E>> = {
            let guard = self.listeners.lock().expect("observer poisoned");
            guard.iter().map(|(_, cb)| Arc::clone(cb)).collect()
        };
        for cb in snapshot {
            cb(event);
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().expect("observer poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E> Default for Observer<E> {
    fn default() -> Self {
        Self::new()
    }
}
