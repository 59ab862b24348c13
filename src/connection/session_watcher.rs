use std::sync::Arc;

use arc_swap::ArcSwap;
use crossbeam_channel::bounded;
use crossbeam_channel::Receiver;
use crossbeam_channel::Sender;
use crossbeam_channel::TrySendError;
use tokio::time::Instant;
use tracing::trace;

use crate::constants::MAX_BACKGROUND_FAILURES;
use crate::Error;
use crate::KeeperState;
use crate::TransportEvent;

/// Session lifecycle as seen by this client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Session opened (or reopened) but not yet confirmed by the service
    Latent,
    Connected,
    Disconnected,
    Expired,
    /// Terminal
    Closed,
}

/// Current belief about session liveness.
///
/// State and timestamp are swapped together so readers never observe a
/// state paired with another transition's timestamp.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Moment of the last connectivity transition (or reset)
    pub since: Instant,
}

impl ConnectionStatus {
    fn new(state: ConnectionState) -> Self {
        Self {
            state,
            since: Instant::now(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

/// Result of applying one session event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SessionTransition {
    pub(crate) previous: ConnectionState,
    pub(crate) current: ConnectionState,
}

impl SessionTransition {
    pub(crate) fn connectivity_changed(&self) -> bool {
        (self.previous == ConnectionState::Connected) != (self.current == ConnectionState::Connected)
    }

    pub(crate) fn expired(&self) -> bool {
        self.current == ConnectionState::Expired
    }
}

/// Bounded FIFO of failures raised on the callback context.
///
/// When full, the oldest failure is dropped to make room.
pub(crate) struct BackgroundFailures {
    tx: Sender<Error>,
    rx: Receiver<Error>,
}

impl BackgroundFailures {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self { tx, rx }
    }

    pub(crate) fn push(
        &self,
        failure: Error,
    ) {
        let mut pending = failure;
        loop {
            match self.tx.try_send(pending) {
                Ok(()) => return,
                Err(TrySendError::Full(back)) => {
                    if let Ok(dropped) = self.rx.try_recv() {
                        trace!(error = %dropped, "Background failure queue full, dropping oldest");
                    }
                    pending = back;
                }
                // Both ends live in self
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }

    pub(crate) fn poll(&self) -> Option<Error> {
        self.rx.try_recv().ok()
    }

    pub(crate) fn len(&self) -> usize {
        self.rx.len()
    }
}

/// Leaf of the connection layer: turns raw session events into status
/// updates and keeps failures that could not be reported synchronously.
pub(crate) struct SessionWatcher {
    status: ArcSwap<ConnectionStatus>,
    failures: BackgroundFailures,
}

impl SessionWatcher {
    pub(crate) fn new() -> Self {
        Self {
            status: ArcSwap::from_pointee(ConnectionStatus::new(ConnectionState::Latent)),
            failures: BackgroundFailures::new(MAX_BACKGROUND_FAILURES),
        }
    }

    pub(crate) fn status(&self) -> ConnectionStatus {
        **self.status.load()
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.status.load().is_connected()
    }

    pub(crate) fn failures(&self) -> &BackgroundFailures {
        &self.failures
    }

    /// Unconditionally moves to `state` and restarts the clock.
    ///
    /// Returns false if the watcher is already closed (closed is terminal).
    pub(crate) fn mark(
        &self,
        state: ConnectionState,
    ) -> bool {
        let previous = self.status.rcu(|current| {
            if current.state == ConnectionState::Closed {
                Arc::clone(current)
            } else {
                Arc::new(ConnectionStatus::new(state))
            }
        });
        previous.state != ConnectionState::Closed
    }

    /// Applies a session event.
    ///
    /// Returns `None` for node events and for anything arriving after close.
    /// The timestamp restarts only when connectivity flips.
    pub(crate) fn observe(
        &self,
        event: &TransportEvent,
    ) -> Option<SessionTransition> {
        if !event.is_session_event() {
            return None;
        }

        let next = match event.state {
            KeeperState::SyncConnected => ConnectionState::Connected,
            KeeperState::Disconnected => ConnectionState::Disconnected,
            KeeperState::Expired => ConnectionState::Expired,
        };

        let mut transition = None;
        self.status.rcu(|current| {
            if current.state == ConnectionState::Closed {
                transition = None;
                return Arc::clone(current);
            }

            let t = SessionTransition {
                previous: current.state,
                current: next,
            };
            transition = Some(t);

            if t.connectivity_changed() {
                Arc::new(ConnectionStatus::new(next))
            } else {
                Arc::new(ConnectionStatus {
                    state: next,
                    since: current.since,
                })
            }
        });
        transition
    }
}
