//! Session liveness tracking
//!
//! Provides the connection layer every cache sits on:
//! - [`ConnectionStateMachine`] - start/close, `acquire_handle` with timeout
//!   and background failure surfacing, transparent reset on expiration
//! - [`ConnectionStatus`] / [`ConnectionState`] - the current belief about
//!   the session, swapped atomically as one value
//!
//! ```text
//!   Latent ──▶ Connected ⇄ Disconnected
//!                 │             │
//!                 ▼             ▼
//!              Expired ──(reset)──▶ Latent
//!
//!   any ──close()──▶ Closed
//! ```

mod session_watcher;
mod state_machine;

pub use session_watcher::ConnectionState;
pub use session_watcher::ConnectionStatus;
pub(crate) use session_watcher::*;
pub use state_machine::*;

#[cfg(test)]
mod state_machine_test;
