//! Thread-safe observer registry.
//!
//! `notify` snapshots the listener list before calling anyone, so listeners
//! may add or remove listeners (including themselves) from inside a
//! callback. A panicking listener is logged and skipped; the remaining
//! listeners are still called and the caller's state transition completes.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Handle returned by [`Listeners::add`], used for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

pub struct Listeners<E> {
    entries: RwLock<Vec<(ListenerId, Callback<E>)>>,
    next_id: AtomicU64,
}

impl<E> Default for Listeners<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Listeners<E> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn add(&self, listener: impl Fn(&E) + Send + Sync + 'static) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(listener)));
        id
    }

    /// Returns whether a listener was removed.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Call every registered listener with `event`.
    pub fn notify(&self, event: &E) {
        let snapshot: Vec<Callback<E>> = self
            .entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();

        for callback in snapshot {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                log::error!("Listener panicked during notification; continuing with the rest");
            }
        }
    }
}
