//! # d-curator
//!
//! Client-side coordination primitives on top of a hierarchical,
//! watch-based coordination service:
//!
//! - [`ConnectionStateMachine`] tracks session liveness, enforces the
//!   connection timeout, resets expired sessions and queues failures raised
//!   on the transport's delivery context
//! - [`CuratorCache`] mirrors a node or a subtree locally and notifies
//!   [`CacheListener`]s of creations, changes and deletions
//! - [`metrics`] counts background failures, connection timeouts and
//!   session expirations
//!
//! The wire-level client is abstracted behind [`Connector`] and [`Session`].
//!
//! ```ignore
//! let settings = Settings::new()?.validate()?;
//! let connection = ConnectionStateMachine::new(connector, settings.connection.clone());
//! connection.start()?;
//!
//! let cache = CuratorCache::builder(connection, "/services")
//!     .with_config(settings.cache.clone())
//!     .build()?;
//! cache.listenable().add(Arc::new(|event: &CacheEvent| println!("{:?} {}", event.kind, event.path)));
//! cache.start()?.wait().await?;
//! ```

mod cache;
mod config;
mod connection;
mod constants;
mod errors;
mod listen;
pub mod metrics;
mod transport;
pub mod utils;

pub use cache::*;
pub use config::*;
pub use connection::*;
pub use errors::*;
pub use listen::*;
pub use transport::*;

//-----------------------------------------------------------
// Test utils

#[cfg(test)]
pub mod test_utils;
