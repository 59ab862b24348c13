use std::fmt::Debug;
use std::sync::Arc;

#[cfg(test)]
use mockall::automock;
use serde::Deserialize;
use serde::Serialize;

use crate::utils::path::depth_below;

/// What to fetch, and keep, for one path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheAction {
    /// Not fetched or stored; children may still be traversed
    NotStored,
    StatOnly,
    StatAndData,
    StatDataAndChildren,
    ChildrenOnly,
}

impl CacheAction {
    pub fn is_stored(&self) -> bool {
        !matches!(self, CacheAction::NotStored)
    }

    pub fn wants_stat(&self) -> bool {
        matches!(
            self,
            CacheAction::StatOnly | CacheAction::StatAndData | CacheAction::StatDataAndChildren
        )
    }

    pub fn wants_data(&self) -> bool {
        matches!(self, CacheAction::StatAndData | CacheAction::StatDataAndChildren)
    }

    pub fn wants_children(&self) -> bool {
        matches!(self, CacheAction::StatDataAndChildren | CacheAction::ChildrenOnly)
    }
}

/// Shapes a subtree cache.
///
/// Consulted once per discovered path, so the cached tree grows lazily as
/// children show up. Implementations must be pure and deterministic.
#[cfg_attr(test, automock)]
pub trait CacheSelector: Send + Sync + Debug + 'static {
    /// Whether the children of `path` are listed, watched and cached
    fn traverse_children(
        &self,
        base_path: &str,
        path: &str,
    ) -> bool;

    fn action_for_path(
        &self,
        base_path: &str,
        path: &str,
    ) -> CacheAction;
}

/// Stock selectors
pub struct CacheSelectors;

impl CacheSelectors {
    /// Whole subtree, stat and data of every node
    pub fn stat_and_data() -> Arc<dyn CacheSelector> {
        Arc::new(UniformSelector(CacheAction::StatAndData))
    }

    /// Whole subtree, stat only
    pub fn stat_only() -> Arc<dyn CacheSelector> {
        Arc::new(UniformSelector(CacheAction::StatOnly))
    }

    /// Whole subtree, child lists only
    pub fn children_only() -> Arc<dyn CacheSelector> {
        Arc::new(UniformSelector(CacheAction::ChildrenOnly))
    }

    /// Nodes at most `depth` levels below the base get `action`; nothing
    /// deeper is traversed.
    pub fn max_depth(
        depth: usize,
        action: CacheAction,
    ) -> Arc<dyn CacheSelector> {
        Arc::new(MaxDepthSelector { depth, action })
    }
}

#[derive(Debug)]
struct UniformSelector(CacheAction);

impl CacheSelector for UniformSelector {
    fn traverse_children(
        &self,
        _base_path: &str,
        _path: &str,
    ) -> bool {
        true
    }

    fn action_for_path(
        &self,
        _base_path: &str,
        _path: &str,
    ) -> CacheAction {
        self.0
    }
}

#[derive(Debug)]
struct MaxDepthSelector {
    depth: usize,
    action: CacheAction,
}

impl CacheSelector for MaxDepthSelector {
    fn traverse_children(
        &self,
        base_path: &str,
        path: &str,
    ) -> bool {
        depth_below(base_path, path).is_some_and(|d| d < self.depth)
    }

    fn action_for_path(
        &self,
        base_path: &str,
        path: &str,
    ) -> CacheAction {
        match depth_below(base_path, path) {
            Some(d) if d <= self.depth => self.action,
            _ => CacheAction::NotStored,
        }
    }
}
