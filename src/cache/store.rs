use std::collections::BTreeMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::trace;

use super::CachedNode;
use crate::utils::path::is_descendant;
use crate::utils::path::node_name;
use crate::utils::path::parent_path;

/// Bounds applied to a [`CacheStore`]. All bounds combine; the default is
/// unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionPolicy {
    /// Least recently used entries are evicted above this count
    pub max_entries: Option<usize>,
    /// Entries older than this (since last write) are treated as absent
    pub expire_after_write: Option<Duration>,
    /// Entries not read or written for this long are treated as absent
    pub expire_after_access: Option<Duration>,
}

impl EvictionPolicy {
    pub fn unbounded() -> Self {
        Self::default()
    }

    fn expires(&self) -> bool {
        self.expire_after_write.is_some() || self.expire_after_access.is_some()
    }
}

struct Entry {
    node: Arc<CachedNode>,
    written: Instant,
    accessed: Instant,
    /// Monotonic access stamp; lowest is the LRU victim
    stamp: u64,
}

/// Outcome of [`CacheStore::upsert`]
#[derive(Debug)]
pub(crate) enum Upsert {
    Inserted,
    Replaced(Arc<CachedNode>),
    /// The incoming node was fetched from an older remote state
    Stale,
    /// The path (or an ancestor) was removed after the fetch started
    Deleted,
}

/// Registration of one in-flight fetch.
///
/// Results of the fetch may only be committed with [`epoch`](Self::epoch);
/// dropping the guard lets the store forget deletions no fetch can race
/// with any more.
pub(crate) struct FetchGuard<'a> {
    store: &'a CacheStore,
    epoch: u64,
}

impl FetchGuard<'_> {
    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }
}

impl Drop for FetchGuard<'_> {
    fn drop(&mut self) {
        self.store.end_fetch(self.epoch);
    }
}

/// Path-keyed snapshot of the mirrored tree.
///
/// Per-key locking only; reads return point-in-time values. Expiry is
/// applied lazily: expired entries are invisible to every read and are
/// dropped when touched.
///
/// Removals leave a tombstone stamped with a fresh deletion epoch. A fetch
/// registered (see [`begin_fetch`](Self::begin_fetch)) before that epoch
/// cannot write the path or anything below it back.
pub(crate) struct CacheStore {
    entries: DashMap<String, Entry>,
    policy: EvictionPolicy,
    clock: AtomicU64,
    /// `stamp -> path`, maintained only when `max_entries` is set.
    /// Never locked while waiting for an `entries` shard.
    recency: Mutex<BTreeMap<u64, String>>,
    epoch: AtomicU64,
    tombstones: DashMap<String, u64>,
    /// Open fetch epochs with their number of fetches
    in_flight: Mutex<BTreeMap<u64, usize>>,
}

impl CacheStore {
    pub(crate) fn new(policy: EvictionPolicy) -> Self {
        Self {
            entries: DashMap::new(),
            policy,
            clock: AtomicU64::new(0),
            recency: Mutex::new(BTreeMap::new()),
            epoch: AtomicU64::new(0),
            tombstones: DashMap::new(),
            in_flight: Mutex::new(BTreeMap::new()),
        }
    }

    /// Current deletion epoch
    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Registers a fetch; call before issuing any remote read
    pub(crate) fn begin_fetch(&self) -> FetchGuard<'_> {
        let mut in_flight = self.in_flight.lock();
        let epoch = self.epoch();
        *in_flight.entry(epoch).or_insert(0) += 1;
        FetchGuard { store: self, epoch }
    }

    fn end_fetch(
        &self,
        epoch: u64,
    ) {
        let mut in_flight = self.in_flight.lock();
        if let Some(count) = in_flight.get_mut(&epoch) {
            *count -= 1;
            if *count == 0 {
                in_flight.remove(&epoch);
            }
        }
        if self.tombstones.is_empty() {
            return;
        }
        // Tombstones no open or future fetch predates are dead weight
        match in_flight.keys().next().copied() {
            Some(oldest) => self.tombstones.retain(|_, deleted_at| *deleted_at > oldest),
            None => self.tombstones.clear(),
        }
    }

    /// Whether `path` or one of its ancestors was removed after `epoch`
    pub(crate) fn deleted_since(
        &self,
        path: &str,
        epoch: u64,
    ) -> bool {
        if self.tombstones.is_empty() {
            return false;
        }
        let mut current = path.to_string();
        loop {
            if self.tombstones.get(current.as_str()).is_some_and(|t| *t > epoch) {
                return true;
            }
            if current == "/" {
                return false;
            }
            current = parent_path(&current);
        }
    }

    #[cfg(test)]
    pub(crate) fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    /// Reads and marks the entry as recently used
    pub(crate) fn get(
        &self,
        path: &str,
    ) -> Option<Arc<CachedNode>> {
        let now = Instant::now();
        {
            let mut entry = self.entries.get_mut(path)?;
            if !self.is_expired(&entry, now) {
                entry.accessed = now;
                let stamp = self.tick();
                self.restamp(Some(entry.stamp), stamp, path);
                entry.stamp = stamp;
                return Some(Arc::clone(&entry.node));
            }
        }
        self.drop_if_expired(path, now);
        None
    }

    /// Reads without affecting recency
    pub(crate) fn peek(
        &self,
        path: &str,
    ) -> Option<Arc<CachedNode>> {
        let now = Instant::now();
        let entry = self.entries.get(path)?;
        if self.is_expired(&entry, now) {
            None
        } else {
            Some(Arc::clone(&entry.node))
        }
    }

    pub(crate) fn contains(
        &self,
        path: &str,
    ) -> bool {
        self.peek(path).is_some()
    }

    /// Inserts or replaces `node`, fetched under deletion epoch
    /// `fetched_at`, unless the cached copy is newer or the path was
    /// removed since.
    ///
    /// `on_commit` runs while the entry is still locked, so whatever it
    /// enqueues is ordered with every other write to the same path. It must
    /// not call back into the store.
    ///
    /// Enforces `max_entries` afterwards; the node just written is never the
    /// victim.
    pub(crate) fn upsert<F>(
        &self,
        node: Arc<CachedNode>,
        fetched_at: u64,
        on_commit: F,
    ) -> Upsert
    where
        F: FnOnce(&Upsert, &Arc<CachedNode>),
    {
        let now = Instant::now();
        let path = node.path().to_string();

        let outcome = match self.entries.entry(path.clone()) {
            _ if self.deleted_since(&path, fetched_at) => {
                trace!(%path, "Ignoring fetch result of a removed node");
                Upsert::Deleted
            }
            MapEntry::Vacant(vacant) => {
                let stamp = self.tick();
                self.restamp(None, stamp, &path);
                let entry = vacant.insert(Entry {
                    node: Arc::clone(&node),
                    written: now,
                    accessed: now,
                    stamp,
                });
                let outcome = Upsert::Inserted;
                on_commit(&outcome, &entry.node);
                outcome
            }
            MapEntry::Occupied(mut occupied) => {
                let expired = self.is_expired(occupied.get(), now);
                if !expired && node.is_older_than(&occupied.get().node) {
                    trace!(%path, "Ignoring stale fetch result");
                    Upsert::Stale
                } else {
                    let stamp = self.tick();
                    self.restamp(Some(occupied.get().stamp), stamp, &path);
                    let previous = std::mem::replace(
                        occupied.get_mut(),
                        Entry {
                            node: Arc::clone(&node),
                            written: now,
                            accessed: now,
                            stamp,
                        },
                    );
                    let outcome = if expired {
                        Upsert::Inserted
                    } else {
                        Upsert::Replaced(previous.node)
                    };
                    on_commit(&outcome, &node);
                    outcome
                }
            }
        };

        if matches!(outcome, Upsert::Inserted | Upsert::Replaced(_)) {
            self.enforce_capacity(&path);
        }
        outcome
    }

    /// Replaces the entry with `f(current)` when `f` returns `Some`.
    ///
    /// Write time and recency are left untouched.
    pub(crate) fn update<F>(
        &self,
        path: &str,
        f: F,
    ) -> bool
    where
        F: FnOnce(&CachedNode) -> Option<CachedNode>,
    {
        let now = Instant::now();
        let Some(mut entry) = self.entries.get_mut(path) else {
            return false;
        };
        if self.is_expired(&entry, now) {
            return false;
        }
        match f(&entry.node) {
            Some(replacement) => {
                entry.node = Arc::new(replacement);
                true
            }
            None => false,
        }
    }

    /// Drops `path` without leaving a tombstone
    pub(crate) fn remove(
        &self,
        path: &str,
    ) -> Option<Arc<CachedNode>> {
        let now = Instant::now();
        let (_, entry) = self.entries.remove(path)?;
        self.unstamp(entry.stamp);
        if self.is_expired(&entry, now) {
            None
        } else {
            Some(entry.node)
        }
    }

    /// Removes `path` and everything below it, deepest first, and
    /// tombstones `path`.
    ///
    /// `on_removed` runs for each live node while its entry is still
    /// locked; it must not call back into the store.
    pub(crate) fn remove_subtree<F>(
        &self,
        path: &str,
        mut on_removed: F,
    ) -> Vec<Arc<CachedNode>>
    where
        F: FnMut(&Arc<CachedNode>),
    {
        let deleted_at = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        self.tombstones.insert(path.to_string(), deleted_at);

        let mut doomed: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.key() == path || is_descendant(path, e.key()))
            .map(|e| e.key().clone())
            .collect();
        doomed.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));

        let now = Instant::now();
        let mut removed = Vec::with_capacity(doomed.len());
        for p in doomed {
            let MapEntry::Occupied(occupied) = self.entries.entry(p) else {
                continue;
            };
            let stamp = occupied.get().stamp;
            if !self.is_expired(occupied.get(), now) {
                let node = Arc::clone(&occupied.get().node);
                on_removed(&node);
                removed.push(node);
            }
            occupied.remove();
            self.unstamp(stamp);
        }
        removed
    }

    pub(crate) fn clear(&self) {
        self.entries.clear();
        self.recency.lock().clear();
    }

    /// Number of live entries
    pub(crate) fn len(&self) -> usize {
        if !self.policy.expires() {
            return self.entries.len();
        }
        let now = Instant::now();
        self.entries.iter().filter(|e| !self.is_expired(e.value(), now)).count()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sorted snapshot of all live entries
    pub(crate) fn entries(&self) -> Vec<(String, Arc<CachedNode>)> {
        let now = Instant::now();
        let mut snapshot: Vec<_> = self
            .entries
            .iter()
            .filter(|e| !self.is_expired(e.value(), now))
            .map(|e| (e.key().clone(), Arc::clone(&e.node)))
            .collect();
        snapshot.sort_by(|a, b| a.0.cmp(&b.0));
        snapshot
    }

    /// Live paths strictly below `base`
    pub(crate) fn paths_below(
        &self,
        base: &str,
    ) -> Vec<String> {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|e| is_descendant(base, e.key()) && !self.is_expired(e.value(), now))
            .map(|e| e.key().clone())
            .collect()
    }

    /// Cached direct children of `parent`, keyed by node name
    pub(crate) fn children_of(
        &self,
        parent: &str,
    ) -> Vec<(String, Arc<CachedNode>)> {
        let now = Instant::now();
        let mut children: Vec<_> = self
            .entries
            .iter()
            .filter(|e| is_descendant(parent, e.key()) && parent_path(e.key()) == parent)
            .filter(|e| !self.is_expired(e.value(), now))
            .map(|e| (node_name(e.key()).to_string(), Arc::clone(&e.node)))
            .collect();
        children.sort_by(|a, b| a.0.cmp(&b.0));
        children
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn restamp(
        &self,
        previous: Option<u64>,
        stamp: u64,
        path: &str,
    ) {
        if self.policy.max_entries.is_none() {
            return;
        }
        let mut recency = self.recency.lock();
        if let Some(previous) = previous {
            recency.remove(&previous);
        }
        recency.insert(stamp, path.to_string());
    }

    fn unstamp(
        &self,
        stamp: u64,
    ) {
        if self.policy.max_entries.is_some() {
            self.recency.lock().remove(&stamp);
        }
    }

    fn is_expired(
        &self,
        entry: &Entry,
        now: Instant,
    ) -> bool {
        if let Some(ttl) = self.policy.expire_after_write {
            if now.saturating_duration_since(entry.written) >= ttl {
                return true;
            }
        }
        if let Some(idle) = self.policy.expire_after_access {
            if now.saturating_duration_since(entry.accessed) >= idle {
                return true;
            }
        }
        false
    }

    fn drop_if_expired(
        &self,
        path: &str,
        now: Instant,
    ) {
        if let Some((_, entry)) = self.entries.remove_if(path, |_, entry| self.is_expired(entry, now)) {
            self.unstamp(entry.stamp);
        }
    }

    /// Pops least recently used entries until the bound holds.
    ///
    /// The recency lock is released before an entry shard is locked; a
    /// victim touched in between keeps its place.
    fn enforce_capacity(
        &self,
        keep: &str,
    ) {
        let Some(max) = self.policy.max_entries else {
            return;
        };

        let mut spared = Vec::new();
        while self.entries.len() > max {
            let victim = {
                let mut recency = self.recency.lock();
                loop {
                    match recency.pop_first() {
                        Some((stamp, path)) if path == keep => spared.push((stamp, path)),
                        other => break other,
                    }
                }
            };
            let Some((stamp, path)) = victim else {
                break;
            };
            if self.entries.remove_if(&path, |_, entry| entry.stamp == stamp).is_some() {
                trace!(%path, max, "Evicting least recently used entry");
            }
        }

        if !spared.is_empty() {
            let mut recency = self.recency.lock();
            recency.extend(spared);
        }
    }
}
