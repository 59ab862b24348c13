use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::CacheAction;
use super::CacheSelector;
use super::CacheSelectors;
use super::CuratorCache;
use super::EvictionPolicy;
use super::NodeComparator;
use super::NodeComparators;
use crate::utils::path::validate_path;
use crate::CacheConfig;
use crate::ConnectionStateMachine;
use crate::Error;
use crate::Result;

/// Bounded retention presets, sized from [`CacheConfig`] at build time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Retention {
    Unbounded,
    Weak,
    Soft,
}

/// What a built cache mirrors
#[derive(Debug, Clone)]
pub(crate) enum CacheMode {
    /// Descendants of the base path, shaped by the selector
    Subtree(Arc<dyn CacheSelector>),
    /// The base path only
    SingleNode(CacheAction),
}

/// Resolved settings handed to [`CuratorCache`]
#[derive(Debug, Clone)]
pub(crate) struct CacheOptions {
    pub(crate) base_path: String,
    pub(crate) mode: CacheMode,
    pub(crate) comparator: Arc<dyn NodeComparator>,
    pub(crate) eviction: EvictionPolicy,
    pub(crate) send_refresh_events: bool,
    pub(crate) refresh_on_start: bool,
    pub(crate) sort_children: bool,
}

/// Configures a [`CuratorCache`].
///
/// Defaults: unbounded store, subtree mode with
/// [`CacheSelectors::stat_and_data`], [`NodeComparators::data_and_type`],
/// refresh events on, refresh on start, sorted children.
///
/// # Example
/// ```ignore
/// let cache = CuratorCacheBuilder::new(connection, "/services")
///     .with_config(settings.cache.clone())
///     .expire_after_write(Duration::from_secs(300))
///     .build()?;
/// let ready = cache.start()?;
/// ready.wait().await?;
/// ```
pub struct CuratorCacheBuilder {
    connection: Arc<ConnectionStateMachine>,
    path: String,
    config: CacheConfig,
    retention: Retention,
    eviction: EvictionPolicy,
    send_refresh_events: bool,
    refresh_on_start: bool,
    sort_children: bool,
    comparator: Arc<dyn NodeComparator>,
    selector: Option<Arc<dyn CacheSelector>>,
    single_node: Option<CacheAction>,
}

impl CuratorCacheBuilder {
    pub fn new(
        connection: Arc<ConnectionStateMachine>,
        path: impl Into<String>,
    ) -> Self {
        let config = CacheConfig::default();
        Self {
            connection,
            path: path.into(),
            send_refresh_events: config.send_refresh_events,
            refresh_on_start: config.refresh_on_start,
            sort_children: config.sort_children,
            config,
            retention: Retention::Unbounded,
            eviction: EvictionPolicy::unbounded(),
            comparator: NodeComparators::data_and_type(),
            selector: None,
            single_node: None,
        }
    }

    /// Seeds the flags and retention capacities from loaded settings.
    ///
    /// Overwrites earlier calls to the flag setters.
    pub fn with_config(
        mut self,
        config: CacheConfig,
    ) -> Self {
        self.send_refresh_events = config.send_refresh_events;
        self.refresh_on_start = config.refresh_on_start;
        self.sort_children = config.sort_children;
        self.config = config;
        self
    }

    /// Small LRU bound (`CacheConfig::weak_values_capacity`)
    pub fn using_weak_values(mut self) -> Self {
        self.retention = Retention::Weak;
        self
    }

    /// Large LRU bound (`CacheConfig::soft_values_capacity`)
    pub fn using_soft_values(mut self) -> Self {
        self.retention = Retention::Soft;
        self
    }

    pub fn bounded_by_entries(
        mut self,
        max_entries: usize,
    ) -> Self {
        self.eviction.max_entries = Some(max_entries);
        self
    }

    pub fn expire_after_write(
        mut self,
        ttl: Duration,
    ) -> Self {
        self.eviction.expire_after_write = Some(ttl);
        self
    }

    pub fn expire_after_access(
        mut self,
        idle: Duration,
    ) -> Self {
        self.eviction.expire_after_access = Some(idle);
        self
    }

    pub fn sending_refresh_events(
        mut self,
        enabled: bool,
    ) -> Self {
        self.send_refresh_events = enabled;
        self
    }

    pub fn refreshing_when_started(
        mut self,
        enabled: bool,
    ) -> Self {
        self.refresh_on_start = enabled;
        self
    }

    pub fn sorting_children(
        mut self,
        enabled: bool,
    ) -> Self {
        self.sort_children = enabled;
        self
    }

    pub fn with_node_comparator(
        mut self,
        comparator: Arc<dyn NodeComparator>,
    ) -> Self {
        self.comparator = comparator;
        self
    }

    /// Subtree mode shaped by `selector`
    pub fn with_cache_selector(
        mut self,
        selector: Arc<dyn CacheSelector>,
    ) -> Self {
        self.selector = Some(selector);
        self
    }

    /// Single-node mode caching stat and data
    pub fn for_single_node(self) -> Self {
        self.for_single_node_with(CacheAction::StatAndData)
    }

    pub fn for_single_node_with(
        mut self,
        action: CacheAction,
    ) -> Self {
        self.selector = None;
        self.single_node = Some(action);
        self
    }

    /// # Errors
    /// [`Error::Configuration`] when:
    /// - both a selector and single-node mode are set
    /// - the path is empty or not absolute
    /// - a bound is zero or the cache settings are invalid
    pub fn build(self) -> Result<CuratorCache> {
        validate_path(&self.path).map_err(Error::Configuration)?;
        self.config.validate()?;

        let mode = match (self.selector, self.single_node) {
            (Some(_), Some(_)) => {
                return Err(Error::Configuration(
                    "a cache is either single-node or selector driven, not both".into(),
                ));
            }
            (None, Some(action)) => CacheMode::SingleNode(action),
            (Some(selector), None) => CacheMode::Subtree(selector),
            (None, None) => CacheMode::Subtree(CacheSelectors::stat_and_data()),
        };

        let mut eviction = self.eviction;
        let retained = match self.retention {
            Retention::Unbounded => None,
            Retention::Weak => Some(self.config.weak_values_capacity),
            Retention::Soft => Some(self.config.soft_values_capacity),
        };
        eviction.max_entries = match (eviction.max_entries, retained) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        if eviction.max_entries == Some(0) {
            return Err(Error::Configuration("max_entries must be greater than 0".into()));
        }
        if eviction.expire_after_write == Some(Duration::ZERO) || eviction.expire_after_access == Some(Duration::ZERO)
        {
            return Err(Error::Configuration("expiry durations must be greater than 0".into()));
        }

        debug!(path = %self.path, ?mode, ?eviction, "Building cache");
        Ok(CuratorCache::new(
            self.connection,
            CacheOptions {
                base_path: self.path,
                mode,
                comparator: self.comparator,
                eviction,
                send_refresh_events: self.send_refresh_events,
                refresh_on_start: self.refresh_on_start,
                sort_children: self.sort_children,
            },
        ))
    }
}
