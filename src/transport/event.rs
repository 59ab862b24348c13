use serde::Deserialize;
use serde::Serialize;

/// Kind of change reported by a session event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// Connectivity/session change, carries no path
    None,
    NodeCreated,
    NodeDeleted,
    NodeDataChanged,
    NodeChildrenChanged,
}

/// Session state reported alongside every event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeeperState {
    SyncConnected,
    Disconnected,
    Expired,
}

/// A raw event delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportEvent {
    pub event_type: EventType,
    pub state: KeeperState,
    pub path: Option<String>,
}

impl TransportEvent {
    /// Connectivity event (`EventType::None`)
    pub fn session(state: KeeperState) -> Self {
        Self {
            event_type: EventType::None,
            state,
            path: None,
        }
    }

    /// Watch event fired for `path` on a connected session
    pub fn node(
        event_type: EventType,
        path: impl Into<String>,
    ) -> Self {
        Self {
            event_type,
            state: KeeperState::SyncConnected,
            path: Some(path.into()),
        }
    }

    pub fn is_session_event(&self) -> bool {
        self.event_type == EventType::None
    }
}

/// Node metadata returned with every read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Stat {
    /// Transaction id that created the node
    pub czxid: i64,
    /// Transaction id of the last modification
    pub mzxid: i64,
    pub ctime: i64,
    pub mtime: i64,
    /// Data version, bumped on every data change
    pub version: i32,
    /// Children version, bumped on every child add/remove
    pub cversion: i32,
    pub aversion: i32,
    /// Owning session id for ephemeral nodes, 0 otherwise
    pub ephemeral_owner: i64,
    pub data_length: i32,
    pub num_children: i32,
    pub pzxid: i64,
}

impl Stat {
    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral_owner != 0
    }
}
