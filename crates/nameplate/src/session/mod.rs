//! Client-side view of the coordination service.
//!
//! A [`CoordinationSession`] is an explicitly owned handle: it is opened by a
//! backend, shared through an [`Arc`](std::sync::Arc), and ended either with
//! [`CoordinationSession::close`] or by the service expiring it. Everything
//! ephemeral that the session created (lock contenders, semaphore leases)
//! disappears with it.
//!
//! ## Structure
//!
//! - [`memory`] - In-process reference service used by tests and the
//!   `memory://` backend.
//! - [`data_watch`] - Renewing value watch delivered over a channel.
//! - `zookeeper` - [`ZkSession`](zookeeper::ZkSession) over a ZooKeeper
//!   ensemble (feature `zookeeper`).

pub mod data_watch;
pub mod memory;
#[cfg(feature = "zookeeper")]
pub mod zookeeper;

use crate::error::Result;
use crate::path::validate_path;
use async_trait::async_trait;
use bytes::Bytes;
use core::fmt;
use core::time::Duration;
use tokio::sync::{oneshot, watch};

/// Identifier the service assigns to a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Lifecycle of a session as seen by its owner.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Operations are served.
    Connected,
    /// The connection dropped and the client is reconnecting. Ephemeral
    /// resources survive for now, but operations fail with
    /// [`ConnectionLoss`](crate::CoordinationError::ConnectionLoss).
    Suspended,
    /// The service expired the session.
    Lost,
    /// The owner closed the session.
    Closed,
}

impl SessionState {
    /// `true` once the session can never serve another request.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Lost | Self::Closed)
    }
}

/// How a node outlives (or not) the session that created it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    Ephemeral,
    /// Ephemeral, with a zero-padded 10 digit sequence number appended to the
    /// requested name.
    EphemeralSequential,
}

impl CreateMode {
    pub const fn is_ephemeral(self) -> bool {
        matches!(self, Self::Ephemeral | Self::EphemeralSequential)
    }

    pub const fn is_sequential(self) -> bool {
        matches!(self, Self::EphemeralSequential)
    }
}

/// Permission set granted by an [`Acl`] entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Permissions {
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub delete: bool,
    pub admin: bool,
}

/// One access-control entry attached to a node on creation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Acl {
    pub perms: Permissions,
    pub scheme: String,
    pub id: String,
}

impl Acl {
    /// Read, write, create and delete for everyone, no admin. Applied to the
    /// pool and semaphore paths so that every claimant identity can take part.
    pub fn claimant_default() -> Self {
        Self {
            perms: Permissions {
                read: true,
                write: true,
                create: true,
                delete: true,
                admin: false,
            },
            scheme: "world".to_owned(),
            id: "anyone".to_owned(),
        }
    }
}

/// Metadata the service keeps for every node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeStat {
    /// Number of `set` calls since creation.
    pub version: u64,
    pub created_ms: u64,
    pub modified_ms: u64,
    pub ephemeral_owner: Option<SessionId>,
    pub num_children: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    NodeCreated,
    NodeDataChanged,
    NodeDeleted,
    NodeChildrenChanged,
}

/// Notification delivered by a one-shot watch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchedEvent {
    pub kind: EventKind,
    pub path: String,
}

/// One-shot watch registration.
///
/// Resolves with the triggering event, or with an error once the session that
/// registered it is gone.
pub type Watch = oneshot::Receiver<WatchedEvent>;

/// Username and password presented when a session is opened.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Parameters for opening a session.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Backend specific connection string.
    pub connect: String,
    pub credentials: Option<Credentials>,
    /// How long the service keeps the session alive without hearing from us.
    pub session_timeout: Duration,
}

/// Operations a coordination service must offer.
///
/// Any service that provides ephemeral nodes tied to a session, sequential
/// node names and one-shot watches is substitutable; locks and semaphores are
/// built on top of these in [`crate::recipe`].
#[async_trait]
pub trait CoordinationSession: Send + Sync + 'static {
    fn session_id(&self) -> SessionId;

    /// Channel carrying every session state transition.
    fn state(&self) -> watch::Receiver<SessionState>;

    /// Creates a node and returns its actual path, which differs from `path`
    /// for sequential nodes.
    async fn create(&self, path: &str, data: Bytes, mode: CreateMode, acl: &[Acl])
    -> Result<String>;

    async fn delete(&self, path: &str) -> Result<()>;

    async fn exists(&self, path: &str) -> Result<Option<NodeStat>>;

    /// Like [`exists`](Self::exists), registering a watch that fires when the
    /// node is created, changed or deleted.
    async fn exists_watch(&self, path: &str) -> Result<(Option<NodeStat>, Watch)>;

    async fn get(&self, path: &str) -> Result<(Bytes, NodeStat)>;

    /// Like [`get`](Self::get), registering a watch that fires when the node
    /// changes or is deleted.
    async fn get_watch(&self, path: &str) -> Result<(Bytes, NodeStat, Watch)>;

    /// Overwrites a node's value unconditionally.
    async fn set(&self, path: &str, data: Bytes) -> Result<NodeStat>;

    async fn children(&self, path: &str) -> Result<Vec<String>>;

    /// Like [`children`](Self::children), registering a watch that fires when
    /// a child is added or removed, or the node itself is deleted.
    async fn children_watch(&self, path: &str) -> Result<(Vec<String>, Watch)>;

    /// Ends the session. Its ephemeral nodes are deleted immediately.
    async fn close(&self) -> Result<()>;

    /// Creates `path` and any missing ancestors as persistent nodes.
    async fn ensure_path(&self, path: &str, acl: &[Acl]) -> Result<()> {
        validate_path(path)?;
        let mut current = String::with_capacity(path.len());
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            match self
                .create(&current, Bytes::new(), CreateMode::Persistent, acl)
                .await
            {
                Ok(_) | Err(crate::CoordinationError::NodeExists { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Waits until the session reaches a terminal state, or its state channel
/// closes.
pub async fn session_ended(states: &mut watch::Receiver<SessionState>) {
    loop {
        if states.borrow_and_update().is_terminal() {
            return;
        }
        if states.changed().await.is_err() {
            return;
        }
    }
}
