use bytes::Bytes;

use crate::Stat;

/// Immutable snapshot of one remote node as last fetched.
///
/// Stored behind `Arc` and replaced on every write; which parts are present
/// depends on the [`CacheAction`](crate::CacheAction) chosen for the path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedNode {
    path: String,
    stat: Option<Stat>,
    data: Option<Bytes>,
    children: Option<Vec<String>>,
}

impl CachedNode {
    pub fn new(
        path: impl Into<String>,
        stat: Option<Stat>,
        data: Option<Bytes>,
        children: Option<Vec<String>>,
    ) -> Self {
        Self {
            path: path.into(),
            stat,
            data,
            children,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn stat(&self) -> Option<&Stat> {
        self.stat.as_ref()
    }

    /// Payload, `None` if never fetched or released with `clear_data_bytes`
    pub fn data(&self) -> Option<&Bytes> {
        self.data.as_ref()
    }

    /// Child names, only kept for actions that fetch children
    pub fn children(&self) -> Option<&[String]> {
        self.children.as_deref()
    }

    pub fn version(&self) -> Option<i32> {
        self.stat.map(|s| s.version)
    }

    pub fn is_ephemeral(&self) -> bool {
        self.stat.is_some_and(|s| s.is_ephemeral())
    }

    /// Copy of this node with the payload released
    pub fn without_data(&self) -> Self {
        Self {
            path: self.path.clone(),
            stat: self.stat,
            data: None,
            children: self.children.clone(),
        }
    }

    /// True if `self` was fetched from an older remote state than `other`.
    ///
    /// Nodes without a stat are never considered stale.
    pub(crate) fn is_older_than(
        &self,
        other: &CachedNode,
    ) -> bool {
        match (self.stat, other.stat) {
            (Some(mine), Some(theirs)) => (mine.mzxid, mine.pzxid) < (theirs.mzxid, theirs.pzxid),
            _ => false,
        }
    }
}
