//! Transport abstraction for the remote coordination service
//!
//! The wire-level session client lives outside this crate. This module only
//! pins down what the connection layer and the node cache need from it:
//! opening a session that reports events through a single callback, and the
//! three read operations that can arm one-shot watches.
//!
//! Implementations must deliver every event of one session through the
//! handler passed to [`Connector::connect`], in order. Watches armed with
//! `watch = true` fire at most once and are delivered to the same handler.

mod event;

pub use event::*;

// Trait definition of the current module
// -----------------------------------------------------------------------------

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)]
use mockall::automock;

use crate::TransportError;

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Callback receiving every event of a session.
///
/// Invoked on the transport's delivery context; it must not block.
pub type EventHandler = Arc<dyn Fn(&TransportEvent) + Send + Sync>;

/// Opens sessions against the remote service.
#[cfg_attr(test, automock)]
pub trait Connector: Send + Sync + 'static {
    /// Opens a new session and returns its handle immediately.
    ///
    /// This must not wait for the connection to be established: the session
    /// connects in the background, queues requests until connected and reports
    /// progress through `handler` (`EventType::None` events).
    ///
    /// # Errors
    /// Returns an error only when the session cannot even be created (e.g.
    /// a malformed connect string).
    fn connect(
        &self,
        connect_string: &str,
        session_timeout: Duration,
        handler: EventHandler,
    ) -> TransportResult<Arc<dyn Session>>;
}

/// A live (or connecting) session handle.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Session: Send + Sync + 'static {
    /// Returns the node's stat, or `None` when absent. With `watch`, arms a
    /// watch that fires on creation, deletion or data change.
    async fn exists(
        &self,
        path: &str,
        watch: bool,
    ) -> TransportResult<Option<Stat>>;

    /// Returns the node's payload and stat.
    ///
    /// # Errors
    /// [`TransportError::NoNode`] when the node does not exist; no watch is
    /// armed in that case.
    async fn get_data(
        &self,
        path: &str,
        watch: bool,
    ) -> TransportResult<(Bytes, Stat)>;

    /// Returns the names (not paths) of the node's children.
    ///
    /// # Errors
    /// [`TransportError::NoNode`] when the node does not exist.
    async fn get_children(
        &self,
        path: &str,
        watch: bool,
    ) -> TransportResult<Vec<String>>;

    /// Closes the session. Ephemeral nodes owned by it are removed remotely.
    fn close(&self) -> TransportResult<()>;
}
