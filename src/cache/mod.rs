//! Locally mirrored view of remote nodes
//!
//! A [`CuratorCache`] keeps a snapshot of one node or a whole subtree, kept
//! fresh with one-shot watches:
//! - [`CuratorCacheBuilder`] - mode, eviction, comparator and flags
//! - [`CacheSelector`] - which paths are fetched, and how much of each
//! - [`NodeComparator`] - which re-fetches count as a change
//! - [`RefreshToken`] - completion handle of one refresh
//! - [`CacheListener`] - ordered, per-listener change notifications

mod builder;
mod comparator;
mod curator_cache;
mod listener;
mod node;
mod refresher;
mod selector;
mod store;
mod token;

pub use builder::CuratorCacheBuilder;
pub use comparator::*;
pub use curator_cache::*;
pub use listener::*;
pub use node::*;
pub(crate) use refresher::*;
pub use selector::*;
pub use store::EvictionPolicy;
pub use token::RefreshToken;
pub(crate) use token::refresh_channel;
