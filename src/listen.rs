//! Listener registries
//!
//! [`Listenable`] is an id-keyed set of callbacks. Registration hands back a
//! [`ListenerId`] that removes exactly that registration later, so the same
//! callback can be registered more than once by unrelated owners.

use std::panic::catch_unwind;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::error;
use tracing::trace;

/// Handle returned by [`Listenable::add`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub(crate) u64);

pub struct Listenable<L: ?Sized> {
    listeners: DashMap<u64, Arc<L>>,
    next_id: AtomicU64,
}

impl<L: ?Sized> Default for Listenable<L> {
    fn default() -> Self {
        Self {
            listeners: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<L: ?Sized> std::fmt::Debug for Listenable<L> {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Listenable")
            .field("listeners", &self.listeners.len())
            .finish_non_exhaustive()
    }
}

impl<L: ?Sized> Listenable<L> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &self,
        listener: Arc<L>,
    ) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.insert(id, listener);
        trace!(listener_id = id, "Listener registered");
        ListenerId(id)
    }

    /// Returns false if `id` was not (or no longer) registered
    pub fn remove(
        &self,
        id: ListenerId,
    ) -> bool {
        self.listeners.remove(&id.0).is_some()
    }

    pub fn clear(&self) {
        self.listeners.clear();
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Calls `f` for every listener registered at the time of the call.
    ///
    /// The registry is snapshotted first so a listener may add or remove
    /// registrations from inside its callback. A panicking listener is logged
    /// and skipped; the remaining listeners still run.
    pub fn for_each<F>(
        &self,
        f: F,
    ) where
        F: Fn(&L),
    {
        let snapshot: Vec<(u64, Arc<L>)> = self
            .listeners
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();

        for (id, listener) in snapshot {
            if catch_unwind(AssertUnwindSafe(|| f(listener.as_ref()))).is_err() {
                error!(listener_id = id, "Listener panicked");
            }
        }
    }
}
