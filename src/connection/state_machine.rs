use std::panic::catch_unwind;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::trace;
use tracing::warn;

use super::ConnectionState;
use super::ConnectionStatus;
use super::SessionWatcher;
use crate::metrics::BACKGROUND_EXCEPTIONS;
use crate::metrics::CONNECTIONS_TIMED_OUT;
use crate::metrics::SESSION_EXPIRED;
use crate::ConnectionConfig;
use crate::Connector;
use crate::Error;
use crate::EventHandler;
use crate::Listenable;
use crate::Result;
use crate::Session;
use crate::TransportError;
use crate::TransportEvent;

/// Listener for raw session events that is not displaced by
/// [`ConnectionStateMachine::substitute_observer`]
pub type ConnectionListener = dyn Fn(&TransportEvent) + Send + Sync;

/// Tracks the health of one logical session with the remote service.
///
/// Wraps a [`SessionWatcher`] and the current transport handle. Status reads
/// ([`is_connected`](Self::is_connected), the fast path of
/// [`acquire_handle`](Self::acquire_handle)) never take a lock. Expiration
/// triggers a transparent session reset on the delivery context; failures of
/// that reset are queued and surface on the next `acquire_handle`.
///
/// # Example
/// ```ignore
/// let connection = ConnectionStateMachine::new(connector, settings.connection.clone());
/// connection.start()?;
/// let session = connection.acquire_handle()?;
/// let children = session.get_children("/services", false).await?;
/// ```
pub struct ConnectionStateMachine {
    me: Weak<ConnectionStateMachine>,
    connector: Arc<dyn Connector>,
    config: ConnectionConfig,
    watcher: SessionWatcher,

    /// Current session handle; `None` before start, after close, or after a
    /// failed reset
    session: ArcSwapOption<Arc<dyn Session>>,

    /// Bumped on every (re)open and on close. Events tagged with an older
    /// generation come from a discarded session and are dropped.
    generation: AtomicU64,

    /// Serializes start/reset/close; never taken on the read path
    lifecycle: Mutex<()>,

    observer: ArcSwapOption<EventHandler>,
    listeners: Listenable<ConnectionListener>,
}

impl std::fmt::Debug for ConnectionStateMachine {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("ConnectionStateMachine")
            .field("config", &self.config)
            .field("status", &self.watcher.status())
            .field("generation", &self.generation.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl ConnectionStateMachine {
    pub fn new(
        connector: Arc<dyn Connector>,
        config: ConnectionConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            connector,
            config,
            watcher: SessionWatcher::new(),
            session: ArcSwapOption::empty(),
            generation: AtomicU64::new(0),
            lifecycle: Mutex::new(()),
            observer: ArcSwapOption::empty(),
            listeners: Listenable::new(),
        })
    }

    /// Starts session timing and opens the transport session.
    ///
    /// # Errors
    /// - [`Error::Closed`] if the machine was closed
    /// - [`Error::Transport`] if the transport refuses to create a session
    pub fn start(&self) -> Result<()> {
        debug!(connect_string = %self.config.connect_string, "Starting");
        let _guard = self.lifecycle.lock();
        self.open_session()
    }

    /// Returns the live session handle or fails.
    ///
    /// Checks, in order:
    /// 1. a queued background failure (oldest first) is returned as the error
    /// 2. a closed machine fails with [`Error::Closed`]
    /// 3. a session that has been disconnected for at least the connection
    ///    timeout fails with [`Error::ConnectionTimeout`]
    ///
    /// Otherwise the handle is returned, even if the session is still
    /// connecting: the transport queues requests until connected.
    pub fn acquire_handle(&self) -> Result<Arc<dyn Session>> {
        if let Some(failure) = self.watcher.failures().poll() {
            error!(error = %failure, "Background failure caught");
            BACKGROUND_EXCEPTIONS
                .with_label_values(&[&self.config.connect_string])
                .inc();
            return Err(failure);
        }

        let status = self.watcher.status();
        if status.state == ConnectionState::Closed {
            return Err(Error::Closed);
        }

        if !status.is_connected() {
            let elapsed = status.since.elapsed();
            if elapsed >= self.config.connection_timeout() {
                error!(?elapsed, state = ?status.state, "Connection timed out");
                CONNECTIONS_TIMED_OUT
                    .with_label_values(&[&self.config.connect_string])
                    .inc();
                return Err(Error::ConnectionTimeout { elapsed });
            }
        }

        if let Some(session) = self.current_session() {
            return Ok(session);
        }

        if self.generation.load(Ordering::Acquire) == 0 {
            return Err(Error::NotStarted);
        }

        // A previous reset failed; try to reopen lazily
        let _guard = self.lifecycle.lock();
        if let Some(session) = self.current_session() {
            return Ok(session);
        }
        self.open_session()?;
        self.current_session()
            .ok_or(Error::Transport(TransportError::ConnectionLoss))
    }

    /// Lock-free read of the current connectivity
    pub fn is_connected(&self) -> bool {
        self.watcher.is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        self.watcher.status().state
    }

    pub fn status(&self) -> ConnectionStatus {
        self.watcher.status()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Atomically replaces the forwarding observer and returns the previous one.
    pub fn substitute_observer(
        &self,
        observer: Option<EventHandler>,
    ) -> Option<EventHandler> {
        self.observer
            .swap(observer.map(Arc::new))
            .map(|previous| (*previous).clone())
    }

    /// Additional receivers of raw events, independent from the observer
    pub fn listenable(&self) -> &Listenable<ConnectionListener> {
        &self.listeners
    }

    /// Drains one queued background failure (FIFO)
    pub fn poll_next_failure(&self) -> Option<Error> {
        self.watcher.failures().poll()
    }

    pub fn pending_failures(&self) -> usize {
        self.watcher.failures().len()
    }

    /// Sole mutator of the connection status.
    ///
    /// Called by the transport (through the handler registered at connect
    /// time) on its delivery context. Never panics into the caller and never
    /// blocks on network I/O.
    pub fn on_transport_event(
        &self,
        event: &TransportEvent,
    ) {
        if let Some(transition) = self.watcher.observe(event) {
            if transition.connectivity_changed() {
                info!(
                    previous = ?transition.previous,
                    current = ?transition.current,
                    "Connection state changed"
                );
            }

            if transition.expired() {
                self.handle_expired_session();
            }
        }

        self.forward(event);
    }

    /// Closes the transport session. Idempotent.
    pub fn close(&self) -> Result<()> {
        let _guard = self.lifecycle.lock();
        if !self.watcher.mark(ConnectionState::Closed) {
            return Ok(());
        }
        debug!("Closing");

        // Anything the old session still delivers is stale from now on
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.listeners.clear();
        if let Some(session) = self.session.swap(None) {
            session.close()?;
        }
        Ok(())
    }

    fn current_session(&self) -> Option<Arc<dyn Session>> {
        self.session.load().as_deref().cloned()
    }

    /// Replaces the session. Caller must hold `lifecycle`.
    fn open_session(&self) -> Result<()> {
        if self.watcher.status().state == ConnectionState::Closed {
            return Err(Error::Closed);
        }

        self.watcher.mark(ConnectionState::Latent);
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;

        if let Some(previous) = self.session.swap(None) {
            if let Err(e) = previous.close() {
                warn!(error = %e, "Failed to close previous session");
            }
        }

        let session = self.connector.connect(
            &self.config.connect_string,
            self.config.session_timeout(),
            self.event_handler(generation),
        )?;
        self.session.store(Some(Arc::new(session)));
        trace!(generation, "Session opened");
        Ok(())
    }

    fn event_handler(
        &self,
        generation: u64,
    ) -> EventHandler {
        let me = self.me.clone();
        Arc::new(move |event: &TransportEvent| {
            let Some(machine) = me.upgrade() else {
                return;
            };
            if machine.generation.load(Ordering::Acquire) != generation {
                trace!(generation, ?event, "Dropping event from a discarded session");
                return;
            }
            machine.on_transport_event(event);
        })
    }

    fn handle_expired_session(&self) {
        warn!("Session expired event received");
        SESSION_EXPIRED.with_label_values(&[&self.config.connect_string]).inc();

        let _guard = self.lifecycle.lock();
        if let Err(e) = self.open_session() {
            error!(error = %e, "Session reset failed");
            self.watcher.failures().push(Error::SessionExpired { source: Box::new(e) });
        }
    }

    fn forward(
        &self,
        event: &TransportEvent,
    ) {
        if let Some(observer) = self.observer.load_full() {
            if catch_unwind(AssertUnwindSafe(|| observer(event))).is_err() {
                error!(?event, "Connection observer panicked");
            }
        }

        self.listeners.for_each(|listener| listener(event));
    }
}
