//! In-memory stand-in for the remote service.
//!
//! Keeps a node tree and per-session one-shot watches with the usual
//! semantics:
//! - `exists`/`get_data` watches fire on create, data change and delete
//! - `get_children` watches fire on child add/remove and on delete
//! - a fired watch is gone until re-armed by the next read
//!
//! Events are delivered synchronously on the caller's thread, outside any
//! internal lock, the way a transport delivery thread would.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::utils::path::parent_path;
use crate::Connector;
use crate::EventHandler;
use crate::EventType;
use crate::KeeperState;
use crate::Session;
use crate::Stat;
use crate::TransportError;
use crate::TransportEvent;
use crate::TransportResult;

#[derive(Debug, Clone)]
struct StoredNode {
    data: Bytes,
    stat: Stat,
}

struct SessionState {
    id: i64,
    handler: EventHandler,
    closed: AtomicBool,
    data_watches: Mutex<HashSet<String>>,
    child_watches: Mutex<HashSet<String>>,
}

#[derive(Default)]
struct EnsembleInner {
    nodes: Mutex<BTreeMap<String, StoredNode>>,
    zxid: AtomicI64,
    next_session_id: AtomicI64,
    sessions: Mutex<Vec<Arc<SessionState>>>,
    refuse_connect: AtomicBool,
    failing_paths: Mutex<HashSet<String>>,
    held_reads: Mutex<BTreeMap<String, HeldRead>>,
    reads: AtomicUsize,
}

struct HeldRead {
    reached: oneshot::Sender<()>,
    release: oneshot::Receiver<()>,
}

/// Control side of [`MockEnsemble::hold_next_read_of`]
pub struct ReadHold {
    reached: oneshot::Receiver<()>,
    release: oneshot::Sender<()>,
}

impl ReadHold {
    /// Waits until the held read has taken its snapshot
    pub async fn reached(&mut self) {
        let _ = (&mut self.reached).await;
    }

    /// Lets the held read return
    pub fn release(self) {
        let _ = self.release.send(());
    }
}

/// Shared tree plus every session opened against it
#[derive(Clone, Default)]
pub struct MockEnsemble {
    inner: Arc<EnsembleInner>,
}

impl MockEnsemble {
    pub fn new() -> Self {
        let ensemble = Self::default();
        ensemble.inner.nodes.lock().insert(
            "/".to_string(),
            StoredNode {
                data: Bytes::new(),
                stat: Stat::default(),
            },
        );
        ensemble
    }

    pub fn connector(&self) -> Arc<InMemoryConnector> {
        Arc::new(InMemoryConnector {
            ensemble: self.clone(),
        })
    }

    /// Makes the next `connect` calls fail
    pub fn refuse_connections(
        &self,
        refuse: bool,
    ) {
        self.inner.refuse_connect.store(refuse, Ordering::SeqCst);
    }

    /// Makes every read of `path` fail with `TransportError::Other`
    pub fn fail_reads_of(
        &self,
        path: &str,
    ) {
        self.inner.failing_paths.lock().insert(path.to_string());
    }

    /// The next `get_data` of `path` reads the node (arming its watch) and
    /// then waits for [`ReadHold::release`] before returning
    pub fn hold_next_read_of(
        &self,
        path: &str,
    ) -> ReadHold {
        let (reached_tx, reached_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel();
        self.inner.held_reads.lock().insert(
            path.to_string(),
            HeldRead {
                reached: reached_tx,
                release: release_rx,
            },
        );
        ReadHold {
            reached: reached_rx,
            release: release_tx,
        }
    }

    pub fn heal_reads_of(
        &self,
        path: &str,
    ) {
        self.inner.failing_paths.lock().remove(path);
    }

    pub fn read_count(&self) -> usize {
        self.inner.reads.load(Ordering::SeqCst)
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.lock().iter().filter(|s| !s.closed.load(Ordering::SeqCst)).count()
    }

    /// Delivers a connectivity event to every open session
    pub fn session_event(
        &self,
        state: KeeperState,
    ) {
        let sessions: Vec<_> = self.open_sessions();
        for session in sessions {
            (session.handler)(&TransportEvent::session(state));
        }
    }

    /// Expires every open session: watches are dropped, the session is
    /// closed and an `Expired` event is delivered.
    pub fn expire_sessions(&self) {
        let sessions: Vec<_> = self.open_sessions();
        for session in sessions {
            session.closed.store(true, Ordering::SeqCst);
            session.data_watches.lock().clear();
            session.child_watches.lock().clear();
            (session.handler)(&TransportEvent::session(KeeperState::Expired));
        }
    }

    pub fn create(
        &self,
        path: &str,
        data: impl Into<Bytes>,
    ) -> TransportResult<()> {
        self.create_with_owner(path, data, 0)
    }

    pub fn create_ephemeral(
        &self,
        path: &str,
        data: impl Into<Bytes>,
        owner: i64,
    ) -> TransportResult<()> {
        self.create_with_owner(path, data, owner)
    }

    fn create_with_owner(
        &self,
        path: &str,
        data: impl Into<Bytes>,
        owner: i64,
    ) -> TransportResult<()> {
        let parent = parent_path(path);
        let zxid = self.next_zxid();
        let data = data.into();
        {
            let mut nodes = self.inner.nodes.lock();
            if nodes.contains_key(path) {
                return Err(TransportError::Other(format!("Node exists: {path}")));
            }
            let Some(parent_node) = nodes.get_mut(&parent) else {
                return Err(TransportError::NoNode { path: parent });
            };
            parent_node.stat.cversion += 1;
            parent_node.stat.num_children += 1;
            parent_node.stat.pzxid = zxid;

            nodes.insert(
                path.to_string(),
                StoredNode {
                    stat: Stat {
                        czxid: zxid,
                        mzxid: zxid,
                        ctime: zxid,
                        mtime: zxid,
                        ephemeral_owner: owner,
                        data_length: data.len() as i32,
                        pzxid: zxid,
                        ..Stat::default()
                    },
                    data,
                },
            );
        }

        self.fire(path, EventType::NodeCreated, false);
        self.fire(&parent, EventType::NodeChildrenChanged, true);
        Ok(())
    }

    pub fn set_data(
        &self,
        path: &str,
        data: impl Into<Bytes>,
    ) -> TransportResult<()> {
        let zxid = self.next_zxid();
        let data = data.into();
        {
            let mut nodes = self.inner.nodes.lock();
            let Some(node) = nodes.get_mut(path) else {
                return Err(TransportError::NoNode { path: path.to_string() });
            };
            node.stat.version += 1;
            node.stat.mzxid = zxid;
            node.stat.mtime = zxid;
            node.stat.data_length = data.len() as i32;
            node.data = data;
        }

        self.fire(path, EventType::NodeDataChanged, false);
        Ok(())
    }

    /// Overwrites the payload without bumping the version
    pub fn replace_data_silently(
        &self,
        path: &str,
        data: impl Into<Bytes>,
    ) {
        if let Some(node) = self.inner.nodes.lock().get_mut(path) {
            node.data = data.into();
        }
    }

    pub fn delete(
        &self,
        path: &str,
    ) -> TransportResult<()> {
        let parent = parent_path(path);
        let zxid = self.next_zxid();
        {
            let mut nodes = self.inner.nodes.lock();
            let prefix = format!("{path}/");
            if nodes.keys().any(|k| k.starts_with(&prefix)) {
                return Err(TransportError::Other(format!("Node not empty: {path}")));
            }
            if nodes.remove(path).is_none() {
                return Err(TransportError::NoNode { path: path.to_string() });
            }
            if let Some(parent_node) = nodes.get_mut(&parent) {
                parent_node.stat.cversion += 1;
                parent_node.stat.num_children -= 1;
                parent_node.stat.pzxid = zxid;
            }
        }

        self.fire(path, EventType::NodeDeleted, false);
        self.fire(path, EventType::NodeDeleted, true);
        self.fire(&parent, EventType::NodeChildrenChanged, true);
        Ok(())
    }

    fn next_zxid(&self) -> i64 {
        self.inner.zxid.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn open_sessions(&self) -> Vec<Arc<SessionState>> {
        self.inner
            .sessions
            .lock()
            .iter()
            .filter(|s| !s.closed.load(Ordering::SeqCst))
            .cloned()
            .collect()
    }

    /// Consumes matching one-shot watches of every session and delivers the
    /// event after all locks are released.
    fn fire(
        &self,
        path: &str,
        event_type: EventType,
        child_watch: bool,
    ) {
        let mut targets = Vec::new();
        for session in self.open_sessions() {
            let watches = if child_watch {
                &session.child_watches
            } else {
                &session.data_watches
            };
            if watches.lock().remove(path) {
                targets.push(session);
            }
        }

        let event = TransportEvent::node(event_type, path);
        for session in targets {
            (session.handler)(&event);
        }
    }

    fn read_guard(
        &self,
        session: &SessionState,
        path: &str,
    ) -> TransportResult<()> {
        self.inner.reads.fetch_add(1, Ordering::SeqCst);
        if session.closed.load(Ordering::SeqCst) {
            return Err(TransportError::SessionExpired);
        }
        if self.inner.failing_paths.lock().contains(path) {
            return Err(TransportError::Other(format!("Injected failure reading {path}")));
        }
        Ok(())
    }
}

pub struct InMemoryConnector {
    ensemble: MockEnsemble,
}

impl Connector for InMemoryConnector {
    fn connect(
        &self,
        _connect_string: &str,
        _session_timeout: Duration,
        handler: EventHandler,
    ) -> TransportResult<Arc<dyn Session>> {
        let inner = &self.ensemble.inner;
        if inner.refuse_connect.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionLoss);
        }

        let session = Arc::new(SessionState {
            id: inner.next_session_id.fetch_add(1, Ordering::SeqCst) + 1,
            handler,
            closed: AtomicBool::new(false),
            data_watches: Mutex::new(HashSet::new()),
            child_watches: Mutex::new(HashSet::new()),
        });
        inner.sessions.lock().push(Arc::clone(&session));

        Ok(Arc::new(InMemorySession {
            ensemble: self.ensemble.clone(),
            session,
        }))
    }
}

pub struct InMemorySession {
    ensemble: MockEnsemble,
    session: Arc<SessionState>,
}

impl InMemorySession {
    pub fn id(&self) -> i64 {
        self.session.id
    }
}

#[async_trait]
impl Session for InMemorySession {
    async fn exists(
        &self,
        path: &str,
        watch: bool,
    ) -> TransportResult<Option<Stat>> {
        self.ensemble.read_guard(&self.session, path)?;
        let stat = self.ensemble.inner.nodes.lock().get(path).map(|n| n.stat);
        if watch {
            self.session.data_watches.lock().insert(path.to_string());
        }
        Ok(stat)
    }

    async fn get_data(
        &self,
        path: &str,
        watch: bool,
    ) -> TransportResult<(Bytes, Stat)> {
        self.ensemble.read_guard(&self.session, path)?;
        let node = self.ensemble.inner.nodes.lock().get(path).cloned();
        let result = match node {
            Some(node) => {
                if watch {
                    self.session.data_watches.lock().insert(path.to_string());
                }
                Ok((node.data, node.stat))
            }
            None => Err(TransportError::NoNode { path: path.to_string() }),
        };

        let held = self.ensemble.inner.held_reads.lock().remove(path);
        if let Some(held) = held {
            let _ = held.reached.send(());
            let _ = held.release.await;
        }
        result
    }

    async fn get_children(
        &self,
        path: &str,
        watch: bool,
    ) -> TransportResult<Vec<String>> {
        self.ensemble.read_guard(&self.session, path)?;
        let children = {
            let nodes = self.ensemble.inner.nodes.lock();
            if !nodes.contains_key(path) {
                return Err(TransportError::NoNode { path: path.to_string() });
            }
            let prefix = if path == "/" {
                "/".to_string()
            } else {
                format!("{path}/")
            };
            // Reverse order so callers relying on sorting are exercised
            nodes
                .keys()
                .filter_map(|k| k.strip_prefix(&prefix))
                .filter(|rest| !rest.is_empty() && !rest.contains('/'))
                .map(str::to_string)
                .rev()
                .collect::<Vec<_>>()
        };
        if watch {
            self.session.child_watches.lock().insert(path.to_string());
        }
        Ok(children)
    }

    fn close(&self) -> TransportResult<()> {
        self.session.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
