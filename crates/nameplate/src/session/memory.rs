//! In-process coordination service.
//!
//! [`MemoryEnsemble`] keeps a hierarchical namespace behind a single mutex and
//! hands out [`MemorySession`]s against it. It implements the full session
//! contract: ephemeral and sequential nodes, one-shot watches, session expiry
//! and connection suspension. The operator-side controls
//! ([`MemoryEnsemble::expire_session`], [`MemoryEnsemble::suspend`],
//! [`MemoryEnsemble::resume`]) stand in for the failures a networked service
//! produces.
//!
//! Dropping a [`MemorySession`] expires it, which mirrors a process exiting
//! and the service timing its session out.

use crate::error::{CoordinationError, Result};
use crate::path::{self, validate_path};
use crate::session::{
    Acl, CoordinationSession, CreateMode, EventKind, NodeStat, SessionConfig, SessionId,
    SessionState, Watch, WatchedEvent,
};
use crate::time::{SystemClock, TimeSource};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{oneshot, watch};

type Clock = dyn TimeSource<u64> + Send + Sync;

struct Node {
    data: Bytes,
    version: u64,
    created_ms: u64,
    modified_ms: u64,
    ephemeral_owner: Option<SessionId>,
    acl: Vec<Acl>,
    next_sequence: u64,
}

struct Watcher {
    owner: SessionId,
    tx: oneshot::Sender<WatchedEvent>,
}

struct SessionEntry {
    state: watch::Sender<SessionState>,
}

struct Namespace {
    nodes: BTreeMap<String, Node>,
    data_watches: HashMap<String, Vec<Watcher>>,
    child_watches: HashMap<String, Vec<Watcher>>,
    sessions: HashMap<SessionId, SessionEntry>,
    next_session: u64,
}

impl Namespace {
    fn new(now: u64) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_owned(),
            Node {
                data: Bytes::new(),
                version: 0,
                created_ms: now,
                modified_ms: now,
                ephemeral_owner: None,
                acl: Vec::new(),
                next_sequence: 0,
            },
        );
        Self {
            nodes,
            data_watches: HashMap::new(),
            child_watches: HashMap::new(),
            sessions: HashMap::new(),
            next_session: 1,
        }
    }

    fn check(&self, id: SessionId) -> Result<()> {
        match self.sessions.get(&id).map(|s| *s.state.borrow()) {
            Some(SessionState::Connected) => Ok(()),
            Some(SessionState::Suspended) => Err(CoordinationError::ConnectionLoss),
            _ => Err(CoordinationError::SessionExpired),
        }
    }

    fn child_names(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_owned()
        } else {
            format!("{path}/")
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| {
                let rest = &key[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_owned())
            })
            .collect()
    }

    fn stat(&self, path: &str, node: &Node) -> NodeStat {
        NodeStat {
            version: node.version,
            created_ms: node.created_ms,
            modified_ms: node.modified_ms,
            ephemeral_owner: node.ephemeral_owner,
            num_children: self.child_names(path).len(),
        }
    }

    fn stat_of(&self, path: &str) -> Option<NodeStat> {
        self.nodes.get(path).map(|node| self.stat(path, node))
    }

    fn fire(watches: &mut HashMap<String, Vec<Watcher>>, path: &str, kind: EventKind) {
        if let Some(watchers) = watches.remove(path) {
            for watcher in watchers {
                // The receiver may have been dropped; nobody to tell.
                let _ = watcher.tx.send(WatchedEvent {
                    kind,
                    path: path.to_owned(),
                });
            }
        }
    }

    fn register(
        watches: &mut HashMap<String, Vec<Watcher>>,
        owner: SessionId,
        path: &str,
    ) -> Watch {
        let (tx, rx) = oneshot::channel();
        watches
            .entry(path.to_owned())
            .or_default()
            .push(Watcher { owner, tx });
        rx
    }

    fn create(
        &mut self,
        owner: SessionId,
        path: &str,
        data: Bytes,
        mode: CreateMode,
        acl: &[Acl],
        now: u64,
    ) -> Result<String> {
        validate_path(path)?;
        if path == "/" {
            return Err(CoordinationError::NodeExists {
                path: path.to_owned(),
            });
        }

        let parent_path = path::parent(path).to_owned();
        let sequence = {
            let parent = self
                .nodes
                .get_mut(&parent_path)
                .ok_or_else(|| CoordinationError::NoNode {
                    path: parent_path.clone(),
                })?;
            if parent.ephemeral_owner.is_some() {
                return Err(CoordinationError::NoChildrenForEphemerals { path: parent_path });
            }
            if mode.is_sequential() {
                let seq = parent.next_sequence;
                parent.next_sequence += 1;
                Some(seq)
            } else {
                None
            }
        };

        let actual = match sequence {
            Some(seq) => format!("{path}{seq:010}"),
            None => path.to_owned(),
        };
        if self.nodes.contains_key(&actual) {
            return Err(CoordinationError::NodeExists { path: actual });
        }

        self.nodes.insert(
            actual.clone(),
            Node {
                data,
                version: 0,
                created_ms: now,
                modified_ms: now,
                ephemeral_owner: mode.is_ephemeral().then_some(owner),
                acl: acl.to_vec(),
                next_sequence: 0,
            },
        );
        Self::fire(&mut self.data_watches, &actual, EventKind::NodeCreated);
        Self::fire(
            &mut self.child_watches,
            &parent_path,
            EventKind::NodeChildrenChanged,
        );
        Ok(actual)
    }

    fn delete(&mut self, path: &str) -> Result<()> {
        validate_path(path)?;
        if path == "/" {
            return Err(CoordinationError::BadPath {
                path: path.to_owned(),
                reason: "cannot delete the namespace root",
            });
        }
        if !self.nodes.contains_key(path) {
            return Err(CoordinationError::NoNode {
                path: path.to_owned(),
            });
        }
        if !self.child_names(path).is_empty() {
            return Err(CoordinationError::NotEmpty {
                path: path.to_owned(),
            });
        }

        self.nodes.remove(path);
        Self::fire(&mut self.data_watches, path, EventKind::NodeDeleted);
        Self::fire(&mut self.child_watches, path, EventKind::NodeDeleted);
        Self::fire(
            &mut self.child_watches,
            path::parent(path),
            EventKind::NodeChildrenChanged,
        );
        Ok(())
    }

    fn set(&mut self, path: &str, data: Bytes, now: u64) -> Result<NodeStat> {
        validate_path(path)?;
        let node = self
            .nodes
            .get_mut(path)
            .ok_or_else(|| CoordinationError::NoNode {
                path: path.to_owned(),
            })?;
        node.data = data;
        node.version += 1;
        node.modified_ms = now;

        Self::fire(&mut self.data_watches, path, EventKind::NodeDataChanged);
        self.stat_of(path).ok_or_else(|| CoordinationError::NoNode {
            path: path.to_owned(),
        })
    }

    fn get(&self, path: &str) -> Result<(Bytes, NodeStat)> {
        validate_path(path)?;
        let node = self.nodes.get(path).ok_or_else(|| CoordinationError::NoNode {
            path: path.to_owned(),
        })?;
        Ok((node.data.clone(), self.stat(path, node)))
    }

    fn children(&self, path: &str) -> Result<Vec<String>> {
        validate_path(path)?;
        if !self.nodes.contains_key(path) {
            return Err(CoordinationError::NoNode {
                path: path.to_owned(),
            });
        }
        Ok(self.child_names(path))
    }

    /// Ends a session. Its own watch registrations are dropped first so their
    /// receivers see the session end, then its ephemerals are deleted, firing
    /// everyone else's watches.
    fn end_session(&mut self, id: SessionId, state: SessionState) -> bool {
        let Some(entry) = self.sessions.remove(&id) else {
            return false;
        };

        for watches in [&mut self.data_watches, &mut self.child_watches] {
            for watchers in watches.values_mut() {
                watchers.retain(|w| w.owner != id);
            }
            watches.retain(|_, watchers| !watchers.is_empty());
        }

        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.ephemeral_owner == Some(id))
            .map(|(path, _)| path.clone())
            .collect();
        for path in owned {
            // Ephemeral nodes never have children, so this cannot fail with
            // `NotEmpty`.
            let _ = self.delete(&path);
        }

        entry.state.send_replace(state);
        true
    }
}

struct Shared {
    namespace: Mutex<Namespace>,
    clock: Arc<Clock>,
}

/// An in-process coordination service.
///
/// Cloning is cheap; all clones serve the same namespace.
#[derive(Clone)]
pub struct MemoryEnsemble {
    shared: Arc<Shared>,
}

impl Default for MemoryEnsemble {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEnsemble {
    /// Creates an empty namespace stamped by the wall clock.
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }

    /// Creates an empty namespace stamped by `clock`.
    pub fn with_clock<T>(clock: T) -> Self
    where
        T: TimeSource<u64> + Send + Sync + 'static,
    {
        let clock: Arc<Clock> = Arc::new(clock);
        let namespace = Namespace::new(clock.current_millis());
        Self {
            shared: Arc::new(Shared {
                namespace: Mutex::new(namespace),
                clock,
            }),
        }
    }

    /// Opens a new session.
    ///
    /// Credentials and the session timeout are accepted for interface parity;
    /// the in-process service neither authenticates nor expires sessions on
    /// its own.
    pub fn connect(&self, config: &SessionConfig) -> MemorySession {
        let mut ns = self.shared.namespace.lock();
        let id = SessionId(ns.next_session);
        ns.next_session += 1;
        let (tx, rx) = watch::channel(SessionState::Connected);
        ns.sessions.insert(id, SessionEntry { state: tx });
        tracing::debug!(
            session = %id,
            connect = %config.connect,
            user = config.credentials.as_ref().map(|c| c.username.as_str()),
            "memory session opened"
        );

        MemorySession {
            id,
            shared: Arc::clone(&self.shared),
            state: rx,
        }
    }

    /// Expires a session as if the service stopped hearing from it.
    ///
    /// Returns `false` if the session was already gone.
    pub fn expire_session(&self, id: SessionId) -> bool {
        self.shared
            .namespace
            .lock()
            .end_session(id, SessionState::Lost)
    }

    /// Simulates a dropped connection: the session survives but every
    /// operation fails with `ConnectionLoss` until [`resume`](Self::resume).
    pub fn suspend(&self, id: SessionId) -> bool {
        self.transition(id, SessionState::Suspended)
    }

    pub fn resume(&self, id: SessionId) -> bool {
        self.transition(id, SessionState::Connected)
    }

    fn transition(&self, id: SessionId, state: SessionState) -> bool {
        let ns = self.shared.namespace.lock();
        match ns.sessions.get(&id) {
            Some(entry) => {
                entry.state.send_replace(state);
                true
            }
            None => false,
        }
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.shared.namespace.lock().sessions.len()
    }

    /// ACL entries recorded for `path`.
    pub fn acl(&self, path: &str) -> Option<Vec<Acl>> {
        self.shared
            .namespace
            .lock()
            .nodes
            .get(path)
            .map(|node| node.acl.clone())
    }
}

/// A session against a [`MemoryEnsemble`].
pub struct MemorySession {
    id: SessionId,
    shared: Arc<Shared>,
    state: watch::Receiver<SessionState>,
}

impl MemorySession {
    fn now(&self) -> u64 {
        self.shared.clock.current_millis()
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.shared
            .namespace
            .lock()
            .end_session(self.id, SessionState::Closed);
    }
}

#[async_trait]
impl CoordinationSession for MemorySession {
    fn session_id(&self) -> SessionId {
        self.id
    }

    fn state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    async fn create(
        &self,
        path: &str,
        data: Bytes,
        mode: CreateMode,
        acl: &[Acl],
    ) -> Result<String> {
        let now = self.now();
        let mut ns = self.shared.namespace.lock();
        ns.check(self.id)?;
        ns.create(self.id, path, data, mode, acl, now)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let mut ns = self.shared.namespace.lock();
        ns.check(self.id)?;
        ns.delete(path)
    }

    async fn exists(&self, path: &str) -> Result<Option<NodeStat>> {
        let ns = self.shared.namespace.lock();
        ns.check(self.id)?;
        validate_path(path)?;
        Ok(ns.stat_of(path))
    }

    async fn exists_watch(&self, path: &str) -> Result<(Option<NodeStat>, Watch)> {
        let mut ns = self.shared.namespace.lock();
        ns.check(self.id)?;
        validate_path(path)?;
        let stat = ns.stat_of(path);
        let watch = Namespace::register(&mut ns.data_watches, self.id, path);
        Ok((stat, watch))
    }

    async fn get(&self, path: &str) -> Result<(Bytes, NodeStat)> {
        let ns = self.shared.namespace.lock();
        ns.check(self.id)?;
        ns.get(path)
    }

    async fn get_watch(&self, path: &str) -> Result<(Bytes, NodeStat, Watch)> {
        let mut ns = self.shared.namespace.lock();
        ns.check(self.id)?;
        let (data, stat) = ns.get(path)?;
        let watch = Namespace::register(&mut ns.data_watches, self.id, path);
        Ok((data, stat, watch))
    }

    async fn set(&self, path: &str, data: Bytes) -> Result<NodeStat> {
        let now = self.now();
        let mut ns = self.shared.namespace.lock();
        ns.check(self.id)?;
        ns.set(path, data, now)
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        let ns = self.shared.namespace.lock();
        ns.check(self.id)?;
        ns.children(path)
    }

    async fn children_watch(&self, path: &str) -> Result<(Vec<String>, Watch)> {
        let mut ns = self.shared.namespace.lock();
        ns.check(self.id)?;
        let children = ns.children(path)?;
        let watch = Namespace::register(&mut ns.child_watches, self.id, path);
        Ok((children, watch))
    }

    async fn close(&self) -> Result<()> {
        if self
            .shared
            .namespace
            .lock()
            .end_session(self.id, SessionState::Closed)
        {
            Ok(())
        } else {
            Err(CoordinationError::SessionExpired)
        }
    }
}
