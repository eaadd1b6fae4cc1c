//! Observer registry with per-listener failure isolation.
//!
//! Every registered listener receives every event. A listener that returns an
//! error or panics is logged and skipped; delivery to the others continues and
//! nothing propagates to the notifier.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Callback signature for listeners.
pub type Listener<T> = Arc<dyn Fn(&T) -> anyhow::Result<()> + Send + Sync>;

/// Handle returned by [`Listeners::add`], used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub struct Listeners<T> {
    name: &'static str,
    entries: RwLock<Vec<(ListenerId, Listener<T>)>>,
    next_id: AtomicU64,
}

impl<T> Listeners<T> {
    /// `name` labels log lines for failing listeners.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn add<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((id, Arc::new(listener)));
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != id);
        entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `event` to every listener; returns how many accepted it.
    pub fn notify(&self, event: &T) -> usize {
        // Snapshot so a listener may register or unregister without deadlocking.
        let snapshot: Vec<(ListenerId, Listener<T>)> = self
            .entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        let mut delivered = 0;
        for (id, listener) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| (*listener)(event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    tracing::warn!(registry = self.name, listener = id.0, error = %e, "listener failed");
                }
                Err(_) => {
                    tracing::warn!(registry = self.name, listener = id.0, "listener panicked");
                }
            }
        }
        delivered
    }
}
