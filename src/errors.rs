//! Client Coordination Error Hierarchy
//!
//! Defines the error types surfaced by the connection layer and the node
//! cache, split by where they originate: the remote transport, the session
//! bookkeeping, or local configuration.

use std::time::Duration;

use config::ConfigError;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No live session could be confirmed within the configured budget
    #[error("Connection timed out after {elapsed:?}")]
    ConnectionTimeout { elapsed: Duration },

    /// The session was expired by the remote service and re-opening it
    /// failed. Only ever delivered through the background failure queue.
    #[error("Session expired and could not be re-established: {source}")]
    SessionExpired {
        #[source]
        source: Box<Error>,
    },

    /// A single fetch issued by a refresh failed
    #[error("Fetch of {path} failed: {source}")]
    FetchFailed {
        path: String,
        #[source]
        source: TransportError,
    },

    /// Builder or settings misuse detected locally
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Settings loading failures
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Transport failures returned from connect/close
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// `acquire_handle` called before `start`
    #[error("Connection has not been started")]
    NotStarted,

    /// Operation attempted on a closed connection or cache
    #[error("Closed")]
    Closed,

    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// The holder cancelled the refresh token before it completed
    #[error("Refresh cancelled")]
    RefreshCancelled,
}

/// Errors reported by the remote transport.
///
/// Cloneable so a single failure can be queued and fanned out to several
/// listeners.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The requested node does not exist
    #[error("No node at {path}")]
    NoNode { path: String },

    /// The connection to the service was lost while the request was in flight
    #[error("Connection loss")]
    ConnectionLoss,

    /// The session backing the request has expired
    #[error("Session expired")]
    SessionExpired,

    #[error("{0}")]
    Other(String),
}

impl TransportError {
    pub fn is_no_node(&self) -> bool {
        matches!(self, TransportError::NoNode { .. })
    }
}
