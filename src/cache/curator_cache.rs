use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::trace;
use tracing::warn;

use super::builder::CacheMode;
use super::builder::CacheOptions;
use super::refresh_channel;
use super::store::CacheStore;
use super::store::Upsert;
use super::CacheAction;
use super::CacheEvent;
use super::CacheEventKind;
use super::CacheListeners;
use super::CachedNode;
use super::CuratorCacheBuilder;
use super::RefreshObserver;
use super::RefreshToken;
use super::Refresher;
use super::UnhandledErrorListener;
use crate::utils::path::is_descendant;
use crate::utils::path::make_path;
use crate::ConnectionStateMachine;
use crate::Error;
use crate::EventType;
use crate::KeeperState;
use crate::Listenable;
use crate::ListenerId;
use crate::Result;
use crate::Session;
use crate::TransportError;
use crate::TransportEvent;

const LATENT: u8 = 0;
const STARTED: u8 = 1;
const CLOSED: u8 = 2;

/// Locally mirrored view of a node or a subtree.
///
/// Fetches go through the connection's session handle and arm one-shot
/// watches; watch events and reconnections trigger further fetches. Reads
/// are served from the local snapshot, so during an outage they return the
/// last known state.
///
/// Listener notifications are delivered after the store change is
/// committed.
pub struct CuratorCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    me: Weak<CacheInner>,
    connection: Arc<ConnectionStateMachine>,
    options: CacheOptions,
    store: CacheStore,
    listeners: CacheListeners,
    unhandled_errors: Listenable<dyn UnhandledErrorListener>,
    refresh_count: AtomicU64,
    state: AtomicU8,
    /// Connectivity as last seen by this cache, for reconnect detection
    connected: AtomicBool,
    connection_listener: Mutex<Option<ListenerId>>,
    runtime: Mutex<Option<Handle>>,
}

impl std::fmt::Debug for CuratorCache {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("CuratorCache")
            .field("base_path", &self.inner.options.base_path)
            .field("mode", &self.inner.options.mode)
            .field("size", &self.inner.store.len())
            .finish_non_exhaustive()
    }
}

impl CuratorCache {
    pub fn builder(
        connection: Arc<ConnectionStateMachine>,
        path: impl Into<String>,
    ) -> CuratorCacheBuilder {
        CuratorCacheBuilder::new(connection, path)
    }

    pub(crate) fn new(
        connection: Arc<ConnectionStateMachine>,
        options: CacheOptions,
    ) -> Self {
        let inner = Arc::new_cyclic(|me| CacheInner {
            me: me.clone(),
            connection,
            store: CacheStore::new(options.eviction),
            options,
            listeners: CacheListeners::default(),
            unhandled_errors: Listenable::new(),
            refresh_count: AtomicU64::new(0),
            state: AtomicU8::new(LATENT),
            connected: AtomicBool::new(false),
            connection_listener: Mutex::new(None),
            runtime: Mutex::new(None),
        });
        Self { inner }
    }

    pub fn base_path(&self) -> &str {
        &self.inner.options.base_path
    }

    /// Subscribes to the connection and, unless disabled, issues the initial
    /// `refresh_all`.
    ///
    /// Returns the token of that initial refresh (already resolved when
    /// refresh on start is off).
    ///
    /// # Errors
    /// - [`Error::IllegalState`] if already started or called outside a tokio
    ///   runtime
    /// - [`Error::Closed`] if the cache was closed
    pub fn start(&self) -> Result<RefreshToken> {
        self.inner.start()
    }

    /// Re-fetches everything in scope
    pub fn refresh_all(&self) -> RefreshToken {
        self.inner.refresh(&self.inner.options.base_path)
    }

    /// Re-fetches `path` and, in subtree mode, everything below it
    pub fn refresh(
        &self,
        path: &str,
    ) -> RefreshToken {
        self.inner.refresh(path)
    }

    /// Drops `path` from the snapshot without notifying listeners.
    ///
    /// Returns true if it was cached.
    pub fn clear(
        &self,
        path: &str,
    ) -> bool {
        self.inner.store.remove(path).is_some()
    }

    pub fn clear_all(&self) {
        self.inner.store.clear();
    }

    pub fn exists(
        &self,
        path: &str,
    ) -> bool {
        self.inner.store.contains(path)
    }

    pub fn get(
        &self,
        path: &str,
    ) -> Option<Arc<CachedNode>> {
        self.inner.store.get(path)
    }

    pub fn get_all(&self) -> Vec<Arc<CachedNode>> {
        self.inner.store.entries().into_iter().map(|(_, node)| node).collect()
    }

    /// Path-sorted snapshot of the cache
    pub fn entries(&self) -> Vec<(String, Arc<CachedNode>)> {
        self.inner.store.entries()
    }

    pub fn paths(&self) -> Vec<String> {
        self.inner.store.entries().into_iter().map(|(path, _)| path).collect()
    }

    pub fn size(&self) -> usize {
        self.inner.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.store.is_empty()
    }

    /// Cached direct children of `path` as `(name, node)`, sorted by name
    pub fn children_at_path(
        &self,
        path: &str,
    ) -> Vec<(String, Arc<CachedNode>)> {
        self.inner.store.children_of(path)
    }

    /// Releases the payload of a cached node, keeping its metadata
    pub fn clear_data_bytes(
        &self,
        path: &str,
    ) {
        self.clear_data_bytes_if_version(path, -1);
    }

    /// Releases the payload if the cached version equals `if_version`, or
    /// unconditionally when `if_version` is negative.
    ///
    /// Returns whether the payload was released.
    pub fn clear_data_bytes_if_version(
        &self,
        path: &str,
        if_version: i32,
    ) -> bool {
        self.inner.store.update(path, |node| {
            if if_version < 0 || node.version() == Some(if_version) {
                Some(node.without_data())
            } else {
                None
            }
        })
    }

    /// Number of refreshes completed so far, whatever triggered them
    pub fn refresh_count(&self) -> u64 {
        self.inner.refresh_count.load(Ordering::Acquire)
    }

    pub fn listenable(&self) -> &CacheListeners {
        &self.inner.listeners
    }

    /// Receivers of failures raised by background fetches
    pub fn unhandled_errors(&self) -> &Listenable<dyn UnhandledErrorListener> {
        &self.inner.unhandled_errors
    }

    /// Unsubscribes from the connection, stops listener delivery and empties
    /// the snapshot. Idempotent.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl Drop for CuratorCache {
    fn drop(&mut self) {
        self.inner.close();
    }
}

impl RefreshObserver for CacheInner {
    fn refreshed(
        &self,
        path: &str,
        cancelled: bool,
    ) {
        let count = self.refresh_count.fetch_add(1, Ordering::AcqRel) + 1;
        trace!(%path, count, cancelled, "Refresh finished");

        if !cancelled && self.options.send_refresh_events && !self.is_closed() {
            self.listeners.dispatch(CacheEvent::refreshed(path));
        }
    }
}

impl CacheInner {
    fn start(&self) -> Result<RefreshToken> {
        let handle = Handle::try_current()
            .map_err(|_| Error::IllegalState("cache must be started within a tokio runtime".into()))?;

        if let Err(current) = self
            .state
            .compare_exchange(LATENT, STARTED, Ordering::AcqRel, Ordering::Acquire)
        {
            return Err(if current == CLOSED {
                Error::Closed
            } else {
                Error::IllegalState("cache already started".into())
            });
        }
        *self.runtime.lock() = Some(handle);

        let me = self.me.clone();
        let id = self.connection.listenable().add(Arc::new(move |event: &TransportEvent| {
            if let Some(cache) = me.upgrade() {
                cache.on_connection_event(event);
            }
        }));
        *self.connection_listener.lock() = Some(id);
        self.connected.store(self.connection.is_connected(), Ordering::Release);

        debug!(path = %self.options.base_path, "Cache started");
        if self.options.refresh_on_start {
            Ok(self.refresh(&self.options.base_path))
        } else {
            Ok(RefreshToken::completed())
        }
    }

    fn close(&self) {
        if self.state.swap(CLOSED, Ordering::AcqRel) == CLOSED {
            return;
        }
        debug!(path = %self.options.base_path, "Closing cache");

        if let Some(id) = self.connection_listener.lock().take() {
            self.connection.listenable().remove(id);
        }
        self.runtime.lock().take();
        self.listeners.clear();
        self.unhandled_errors.clear();
        self.store.clear();
    }

    fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) == CLOSED
    }

    fn refresh(
        &self,
        path: &str,
    ) -> RefreshToken {
        match self.state.load(Ordering::Acquire) {
            LATENT => return RefreshToken::failed(Error::NotStarted),
            CLOSED => return RefreshToken::failed(Error::Closed),
            _ => {}
        }
        if self.scope(path).is_none() {
            return RefreshToken::failed(Error::IllegalState(format!(
                "{path} is outside of cache {}",
                self.options.base_path
            )));
        }

        if let Err(e) = self.connection.acquire_handle() {
            self.notify_unhandled("Refresh could not be issued", &e);
            return RefreshToken::failed(e);
        }

        let (token, completion) = refresh_channel();
        let refresher = Refresher::new(self.observer(), path, Some(completion));
        self.fetch(path.to_string(), &refresher, true);
        token
    }

    /// Fire-and-forget refresh for watch events and reconnections
    fn background_refresh(
        &self,
        path: &str,
        full: bool,
    ) {
        let refresher = Refresher::new(self.observer(), path, None);
        self.fetch(path.to_string(), &refresher, full);
    }

    fn observer(&self) -> Arc<dyn RefreshObserver> {
        match self.me.upgrade() {
            Some(me) => me as Arc<dyn RefreshObserver>,
            None => Arc::new(Detached),
        }
    }

    /// `(action, traverse_children)` for an in-scope path
    fn scope(
        &self,
        path: &str,
    ) -> Option<(CacheAction, bool)> {
        let base = self.options.base_path.as_str();
        match &self.options.mode {
            CacheMode::SingleNode(action) => (path == base).then_some((*action, false)),
            CacheMode::Subtree(selector) if path == base => {
                Some((CacheAction::NotStored, selector.traverse_children(base, path)))
            }
            CacheMode::Subtree(selector) if is_descendant(base, path) => Some((
                selector.action_for_path(base, path),
                selector.traverse_children(base, path),
            )),
            CacheMode::Subtree(_) => None,
        }
    }

    /// Spawns one fetch of `path` accounted to `refresher`.
    ///
    /// `full` re-fetches every child; otherwise only children not cached
    /// yet are fetched.
    fn fetch(
        &self,
        path: String,
        refresher: &Arc<Refresher>,
        full: bool,
    ) {
        refresher.increment();

        let task = self.me.upgrade().map(|cache| {
            let refresher = Arc::clone(refresher);
            async move {
                if !cache.is_closed() {
                    if let Err(e) = cache.load(&path, &refresher, full).await {
                        cache.notify_unhandled("Background fetch failed", &e);
                    }
                }
                refresher.decrement();
            }
        });

        match task {
            Some(task) => {
                if !self.spawn(task) {
                    refresher.decrement();
                }
            }
            None => refresher.decrement(),
        }
    }

    fn spawn<F>(
        &self,
        task: F,
    ) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = self.runtime.lock().clone();
        match handle {
            Some(handle) => {
                handle.spawn(task);
                true
            }
            None => false,
        }
    }

    async fn load(
        &self,
        path: &str,
        refresher: &Arc<Refresher>,
        full: bool,
    ) -> Result<()> {
        let Some((action, traverse)) = self.scope(path) else {
            return Ok(());
        };
        let session = self.connection.acquire_handle()?;
        // Registered before the first read so a delete processed meanwhile
        // wins over whatever this fetch saw
        let fetch = self.store.begin_fetch();
        let fetch_failed = |source: TransportError| Error::FetchFailed {
            path: path.to_string(),
            source,
        };

        let mut stat = None;
        let mut data = None;
        if action.wants_data() {
            match session.get_data(path, true).await {
                Ok((bytes, s)) => {
                    stat = Some(s);
                    data = Some(bytes);
                }
                Err(e) if e.is_no_node() => return self.node_absent(&session, path, refresher).await,
                Err(e) => return Err(fetch_failed(e)),
            }
        } else if action.wants_stat() {
            match session.exists(path, true).await.map_err(fetch_failed)? {
                Some(s) => stat = Some(s),
                None => return self.node_absent(&session, path, refresher).await,
            }
        }

        let children = if action.wants_children() || traverse {
            match session.get_children(path, true).await {
                Ok(mut names) => {
                    if self.options.sort_children {
                        names.sort();
                    }
                    Some(names)
                }
                Err(e) if e.is_no_node() => return self.node_absent(&session, path, refresher).await,
                Err(e) => return Err(fetch_failed(e)),
            }
        } else {
            None
        };

        if action.is_stored() {
            let kept_children = if action.wants_children() {
                children.clone()
            } else {
                None
            };
            self.commit(CachedNode::new(path, stat, data, kept_children), fetch.epoch());
        }

        if self.store.deleted_since(path, fetch.epoch()) {
            trace!(%path, "Removed while fetching, skipping children");
            return Ok(());
        }
        if traverse {
            if let Some(names) = children {
                self.reconcile_children(path, names, refresher, full);
            }
        }
        Ok(())
    }

    /// The node vanished: drop it (and below) and, for the base path, arm
    /// an `exists` watch so its creation triggers a refresh.
    async fn node_absent(
        &self,
        session: &Arc<dyn Session>,
        path: &str,
        refresher: &Arc<Refresher>,
    ) -> Result<()> {
        self.remove_subtree(path);

        if path == self.options.base_path {
            let appeared = session
                .exists(path, true)
                .await
                .map_err(|source| Error::FetchFailed {
                    path: path.to_string(),
                    source,
                })?;
            if appeared.is_some() {
                trace!(%path, "Base node appeared while arming its watch");
                self.fetch(path.to_string(), refresher, true);
            }
        }
        Ok(())
    }

    fn reconcile_children(
        &self,
        parent: &str,
        names: Vec<String>,
        refresher: &Arc<Refresher>,
        full: bool,
    ) {
        let current: HashSet<&str> = names.iter().map(String::as_str).collect();

        let mut vanished: Vec<String> = self
            .store
            .paths_below(parent)
            .into_iter()
            .filter_map(|p| {
                let rest = p[parent.len()..].trim_start_matches('/');
                let child = rest.split('/').next().unwrap_or(rest);
                (!current.contains(child)).then(|| make_path(parent, child))
            })
            .collect();
        vanished.sort();
        vanished.dedup();
        for child in vanished {
            trace!(%parent, %child, "Child vanished");
            self.remove_subtree(&child);
        }

        for name in &names {
            let child = make_path(parent, name);
            let Some((action, traverse)) = self.scope(&child) else {
                continue;
            };
            if !action.is_stored() && !traverse {
                continue;
            }
            if full || !action.is_stored() || !self.store.contains(&child) {
                self.fetch(child, refresher, full);
            }
        }
    }

    /// Stores a fetch result. Events are enqueued under the entry lock so
    /// per-path delivery order matches store order.
    fn commit(
        &self,
        node: CachedNode,
        fetched_at: u64,
    ) {
        if self.is_closed() {
            return;
        }
        self.store.upsert(Arc::new(node), fetched_at, |outcome, node| match outcome {
            Upsert::Inserted => {
                trace!(path = %node.path(), "Node created");
                self.listeners
                    .dispatch(CacheEvent::node(CacheEventKind::NodeCreated, Arc::clone(node)));
            }
            Upsert::Replaced(previous) => {
                if !self.options.comparator.is_same(previous, node) {
                    trace!(path = %node.path(), "Node changed");
                    self.listeners
                        .dispatch(CacheEvent::node(CacheEventKind::NodeChanged, Arc::clone(node)));
                }
            }
            Upsert::Stale | Upsert::Deleted => {}
        });
    }

    fn remove_subtree(
        &self,
        path: &str,
    ) {
        self.store.remove_subtree(path, |node| {
            trace!(path = %node.path(), "Node deleted");
            self.listeners
                .dispatch(CacheEvent::node(CacheEventKind::NodeDeleted, Arc::clone(node)));
        });
    }

    /// Registered as a connection listener; runs on the transport's
    /// delivery context and must not block.
    fn on_connection_event(
        &self,
        event: &TransportEvent,
    ) {
        if self.is_closed() {
            return;
        }

        if event.is_session_event() {
            let connected = event.state == KeeperState::SyncConnected;
            let was_connected = self.connected.swap(connected, Ordering::AcqRel);
            if connected && !was_connected {
                info!(path = %self.options.base_path, "Connection (re)established, refreshing cache");
                self.background_refresh(&self.options.base_path, true);
            }
            return;
        }

        let Some(path) = event.path.as_deref() else {
            return;
        };
        if self.scope(path).is_none() {
            return;
        }
        trace!(%path, event_type = ?event.event_type, "Watch fired");

        match event.event_type {
            EventType::NodeCreated => self.background_refresh(path, true),
            EventType::NodeDataChanged | EventType::NodeChildrenChanged => self.background_refresh(path, false),
            EventType::NodeDeleted => {
                self.remove_subtree(path);
                if path == self.options.base_path {
                    // Re-arm the creation watch
                    self.background_refresh(path, true);
                }
            }
            EventType::None => {}
        }
    }

    fn notify_unhandled(
        &self,
        message: &str,
        error: &Error,
    ) {
        if self.unhandled_errors.is_empty() {
            error!(path = %self.options.base_path, %error, "{message}");
            return;
        }
        warn!(path = %self.options.base_path, %error, "{message}");
        self.unhandled_errors.for_each(|listener| listener.unhandled_error(message, error));
    }
}

/// Observer for refreshers created while the cache is being dropped
struct Detached;

impl RefreshObserver for Detached {
    fn refreshed(
        &self,
        path: &str,
        _cancelled: bool,
    ) {
        trace!(%path, "Refresh finished after cache was dropped");
    }
}
