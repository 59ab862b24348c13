use std::fmt::Debug;
use std::sync::Arc;

#[cfg(test)]
use mockall::automock;

use super::CachedNode;

/// Decides whether a fresh fetch differs enough from the cached node to
/// report `NodeChanged`. Must be pure and deterministic.
#[cfg_attr(test, automock)]
pub trait NodeComparator: Send + Sync + Debug + 'static {
    fn is_same(
        &self,
        old: &CachedNode,
        new: &CachedNode,
    ) -> bool;
}

/// Stock comparators
pub struct NodeComparators;

impl NodeComparators {
    /// Same payload bytes and same ephemeral/persistent kind
    pub fn data_and_type() -> Arc<dyn NodeComparator> {
        Arc::new(DataAndType)
    }

    /// Same data version, payload ignored
    pub fn version_only() -> Arc<dyn NodeComparator> {
        Arc::new(VersionOnly)
    }

    /// Identical stat and payload
    pub fn stat_and_data() -> Arc<dyn NodeComparator> {
        Arc::new(StatAndData)
    }
}

#[derive(Debug)]
struct DataAndType;

impl NodeComparator for DataAndType {
    fn is_same(
        &self,
        old: &CachedNode,
        new: &CachedNode,
    ) -> bool {
        old.data() == new.data() && old.is_ephemeral() == new.is_ephemeral()
    }
}

#[derive(Debug)]
struct VersionOnly;

impl NodeComparator for VersionOnly {
    fn is_same(
        &self,
        old: &CachedNode,
        new: &CachedNode,
    ) -> bool {
        old.version() == new.version()
    }
}

#[derive(Debug)]
struct StatAndData;

impl NodeComparator for StatAndData {
    fn is_same(
        &self,
        old: &CachedNode,
        new: &CachedNode,
    ) -> bool {
        old.stat() == new.stat() && old.data() == new.data()
    }
}
