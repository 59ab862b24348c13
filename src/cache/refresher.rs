use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

#[cfg(test)]
use mockall::automock;
use tracing::trace;

use super::token::RefreshCompletion;

/// Receives the single quiescence notification of a [`Refresher`]
#[cfg_attr(test, automock)]
pub(crate) trait RefreshObserver: Send + Sync + 'static {
    fn refreshed(
        &self,
        path: &str,
        cancelled: bool,
    );
}

/// Counts the fetches of one logical refresh.
///
/// Every dispatched fetch calls [`increment`](Self::increment) before it is
/// spawned and [`decrement`](Self::decrement) once done, success or not. A
/// fetch that spawns follow-up fetches increments for them before its own
/// decrement, so the count only reaches zero once the whole fan-out is done.
pub(crate) struct Refresher {
    observer: Arc<dyn RefreshObserver>,
    path: String,
    completion: Option<RefreshCompletion>,
    count: AtomicI64,
    fired: AtomicBool,
}

impl Refresher {
    pub(crate) fn new(
        observer: Arc<dyn RefreshObserver>,
        path: impl Into<String>,
        completion: Option<RefreshCompletion>,
    ) -> Arc<Self> {
        Arc::new(Self {
            observer,
            path: path.into(),
            completion,
            count: AtomicI64::new(0),
            fired: AtomicBool::new(false),
        })
    }

    pub(crate) fn increment(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn decrement(&self) {
        let remaining = self.count.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining <= 0 && !self.fired.swap(true, Ordering::AcqRel) {
            self.fire();
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.completion.as_ref().is_some_and(|c| c.is_cancelled())
    }

    fn fire(&self) {
        let cancelled = self.is_cancelled();
        trace!(path = %self.path, cancelled, "Refresh complete");

        self.observer.refreshed(&self.path, cancelled);
        if !cancelled {
            if let Some(completion) = &self.completion {
                completion.complete(Ok(()));
            }
        }
    }
}
