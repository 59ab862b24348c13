use std::panic::AssertUnwindSafe;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use dashmap::DashMap;
use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::error;

use super::CachedNode;
use crate::Error;
use crate::ListenerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheEventKind {
    NodeCreated,
    NodeChanged,
    NodeDeleted,
    /// A refresh finished; carries no node
    Refreshed,
}

#[derive(Debug, Clone)]
pub struct CacheEvent {
    pub kind: CacheEventKind,
    pub path: String,
    /// New node for create/change, last known node for delete
    pub node: Option<Arc<CachedNode>>,
}

impl CacheEvent {
    pub(crate) fn node(
        kind: CacheEventKind,
        node: Arc<CachedNode>,
    ) -> Self {
        Self {
            kind,
            path: node.path().to_string(),
            node: Some(node),
        }
    }

    pub(crate) fn refreshed(path: &str) -> Self {
        Self {
            kind: CacheEventKind::Refreshed,
            path: path.to_string(),
            node: None,
        }
    }
}

pub trait CacheListener: Send + Sync + 'static {
    fn event(
        &self,
        event: &CacheEvent,
    );
}

impl<F> CacheListener for F
where
    F: Fn(&CacheEvent) + Send + Sync + 'static,
{
    fn event(
        &self,
        event: &CacheEvent,
    ) {
        self(event)
    }
}

/// Receives failures that happened off the caller's thread, such as a
/// fetch issued by a watch.
pub trait UnhandledErrorListener: Send + Sync + 'static {
    fn unhandled_error(
        &self,
        message: &str,
        error: &Error,
    );
}

impl<F> UnhandledErrorListener for F
where
    F: Fn(&str, &Error) + Send + Sync + 'static,
{
    fn unhandled_error(
        &self,
        message: &str,
        error: &Error,
    ) {
        self(message, error)
    }
}

/// Cache listener registry.
///
/// Each listener gets its own unbounded queue drained by its own task, so
/// delivery is ordered per listener and a slow listener only delays itself.
/// Dispatch never blocks the caller.
#[derive(Default)]
pub struct CacheListeners {
    workers: DashMap<u64, mpsc::UnboundedSender<CacheEvent>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for CacheListeners {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("CacheListeners")
            .field("listeners", &self.workers.len())
            .finish()
    }
}

impl CacheListeners {
    /// Registers `listener` and spawns its delivery task.
    ///
    /// # Panics
    /// Must be called within a tokio runtime.
    pub fn add(
        &self,
        listener: Arc<dyn CacheListener>,
    ) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, mut rx) = mpsc::unbounded_channel::<CacheEvent>();

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let delivery = AssertUnwindSafe(async { listener.event(&event) }).catch_unwind();
                if delivery.await.is_err() {
                    error!(listener_id = id, kind = ?event.kind, path = %event.path, "Cache listener panicked");
                }
            }
            debug!(listener_id = id, "Cache listener worker stopped");
        });

        self.workers.insert(id, tx);
        ListenerId(id)
    }

    /// Stops delivery to the listener once its queued events are drained
    pub fn remove(
        &self,
        id: ListenerId,
    ) -> bool {
        self.workers.remove(&id.0).is_some()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub(crate) fn dispatch(
        &self,
        event: CacheEvent,
    ) {
        for worker in self.workers.iter() {
            // A closed queue means the worker is gone; nothing to deliver to
            let _ = worker.value().send(event.clone());
        }
    }

    pub(crate) fn clear(&self) {
        self.workers.clear();
    }
}
