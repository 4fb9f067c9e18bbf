//! [`CoordinationSession`] over a ZooKeeper ensemble.
//!
//! Connect strings take the usual `host:port[,host:port...][/chroot]` form,
//! optionally prefixed with `zk://`. Credentials are presented as `digest`
//! auth, and nodes created with a non-empty ACL are then restricted to that
//! identity (`auth` scheme); without credentials every node is open.

use super::{
    Acl, CoordinationSession, CreateMode, EventKind, NodeStat, SessionConfig, SessionId,
    SessionState, Watch, WatchedEvent,
};
use crate::error::{CoordinationError, Result};
use crate::path::validate_path;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use zookeeper_client as zk;

/// Optional scheme in front of a ZooKeeper connect string.
pub const ZOOKEEPER_SCHEME: &str = "zk://";

/// Returns the ensemble address if `connect` names a ZooKeeper ensemble.
///
/// ```
/// use nameplate::zookeeper::cluster_address;
///
/// assert_eq!(cluster_address("zk://zk1:2181,zk2:2181/fleet"), Some("zk1:2181,zk2:2181/fleet"));
/// assert_eq!(cluster_address("10.0.0.7:2181"), Some("10.0.0.7:2181"));
/// assert_eq!(cluster_address("memory://"), None);
/// ```
pub fn cluster_address(connect: &str) -> Option<&str> {
    let cluster = connect.strip_prefix(ZOOKEEPER_SCHEME).unwrap_or(connect);
    let hosts = cluster.split_once('/').map_or(cluster, |(hosts, _)| hosts);
    let valid = !hosts.is_empty()
        && hosts.split(',').all(|host| match host.rsplit_once(':') {
            Some((name, port)) => !name.is_empty() && port.parse::<u16>().is_ok(),
            None => false,
        });
    valid.then_some(cluster)
}

/// A live ZooKeeper session.
///
/// Dropping the last handle closes the session, like
/// [`close`](CoordinationSession::close).
pub struct ZkSession {
    client: RwLock<Option<zk::Client>>,
    id: SessionId,
    authenticated: bool,
    states: Arc<watch::Sender<SessionState>>,
}

impl ZkSession {
    /// Opens a session against `cluster`, honouring the configured session
    /// timeout and credentials.
    pub async fn connect(cluster: &str, config: &SessionConfig) -> Result<Self> {
        let mut connector = zk::Client::connector();
        connector.session_timeout(config.session_timeout);
        if let Some(credentials) = &config.credentials {
            connector.auth(
                "digest".to_owned(),
                format!("{}:{}", credentials.username, credentials.password).into_bytes(),
            );
        }
        let client = connector
            .connect(cluster)
            .await
            .map_err(|e| map_error(e, cluster))?;

        let id = SessionId(client.session_id().0 as u64);
        let states = Arc::new(watch::channel(SessionState::Connected).0);
        tokio::spawn(forward_states(client.state_watcher(), Arc::clone(&states)));
        tracing::debug!(%cluster, session = %id, "zookeeper session established");

        Ok(Self {
            client: RwLock::new(Some(client)),
            id,
            authenticated: config.credentials.is_some(),
            states,
        })
    }

    fn client(&self) -> Result<zk::Client> {
        self.client
            .read()
            .clone()
            .ok_or(CoordinationError::SessionExpired)
    }
}

async fn forward_states(mut watcher: zk::StateWatcher, states: Arc<watch::Sender<SessionState>>) {
    loop {
        let state = session_state(watcher.changed().await);
        tracing::debug!(?state, "zookeeper session state");
        states.send_replace(state);
        if state.is_terminal() {
            return;
        }
    }
}

fn session_state(state: zk::SessionState) -> SessionState {
    match state {
        zk::SessionState::Disconnected => SessionState::Suspended,
        zk::SessionState::Expired | zk::SessionState::AuthFailed => SessionState::Lost,
        zk::SessionState::Closed => SessionState::Closed,
        _ => SessionState::Connected,
    }
}

fn map_error(err: zk::Error, path: &str) -> CoordinationError {
    let path = path.to_owned();
    match err {
        zk::Error::NoNode => CoordinationError::NoNode { path },
        zk::Error::NodeExists => CoordinationError::NodeExists { path },
        zk::Error::NotEmpty => CoordinationError::NotEmpty { path },
        zk::Error::NoChildrenForEphemerals => CoordinationError::NoChildrenForEphemerals { path },
        zk::Error::ConnectionLoss => CoordinationError::ConnectionLoss,
        zk::Error::SessionExpired | zk::Error::ClientClosed => CoordinationError::SessionExpired,
        other => CoordinationError::Service {
            reason: other.to_string(),
        },
    }
}

fn create_mode(mode: CreateMode) -> zk::CreateMode {
    match mode {
        CreateMode::Persistent => zk::CreateMode::Persistent,
        CreateMode::Ephemeral => zk::CreateMode::Ephemeral,
        CreateMode::EphemeralSequential => zk::CreateMode::EphemeralSequential,
    }
}

fn node_stat(stat: &zk::Stat) -> NodeStat {
    NodeStat {
        version: u64::try_from(stat.version).unwrap_or_default(),
        created_ms: u64::try_from(stat.ctime).unwrap_or_default(),
        modified_ms: u64::try_from(stat.mtime).unwrap_or_default(),
        ephemeral_owner: (stat.ephemeral_owner != 0).then(|| SessionId(stat.ephemeral_owner as u64)),
        num_children: usize::try_from(stat.num_children).unwrap_or_default(),
    }
}

fn event_kind(kind: zk::EventType) -> Option<EventKind> {
    match kind {
        zk::EventType::NodeCreated => Some(EventKind::NodeCreated),
        zk::EventType::NodeDeleted => Some(EventKind::NodeDeleted),
        zk::EventType::NodeDataChanged => Some(EventKind::NodeDataChanged),
        zk::EventType::NodeChildrenChanged => Some(EventKind::NodeChildrenChanged),
        _ => None,
    }
}

/// Bridges a ZooKeeper watcher to a [`Watch`]. Session events drop the
/// sender, which is how a watch reports that its session is gone.
fn forward_watch(watcher: zk::OneshotWatcher) -> Watch {
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let event = watcher.changed().await;
        if let Some(kind) = event_kind(event.event_type) {
            let _ = tx.send(WatchedEvent {
                kind,
                path: event.path,
            });
        }
    });
    rx
}

#[async_trait]
impl CoordinationSession for ZkSession {
    fn session_id(&self) -> SessionId {
        self.id
    }

    fn state(&self) -> watch::Receiver<SessionState> {
        self.states.subscribe()
    }

    async fn create(
        &self,
        path: &str,
        data: Bytes,
        mode: CreateMode,
        acl: &[Acl],
    ) -> Result<String> {
        validate_path(path)?;
        let client = self.client()?;
        let acls = if self.authenticated && !acl.is_empty() {
            zk::Acls::creator_all()
        } else {
            zk::Acls::anyone_all()
        };
        let options = create_mode(mode).with_acls(acls);
        let (_, sequence) = client
            .create(path, &data, &options)
            .await
            .map_err(|e| map_error(e, path))?;
        Ok(if mode.is_sequential() {
            format!("{path}{sequence}")
        } else {
            path.to_owned()
        })
    }

    async fn delete(&self, path: &str) -> Result<()> {
        validate_path(path)?;
        self.client()?
            .delete(path, None)
            .await
            .map_err(|e| map_error(e, path))
    }

    async fn exists(&self, path: &str) -> Result<Option<NodeStat>> {
        validate_path(path)?;
        let stat = self
            .client()?
            .check_stat(path)
            .await
            .map_err(|e| map_error(e, path))?;
        Ok(stat.as_ref().map(node_stat))
    }

    async fn exists_watch(&self, path: &str) -> Result<(Option<NodeStat>, Watch)> {
        validate_path(path)?;
        let (stat, watcher) = self
            .client()?
            .check_and_watch_stat(path)
            .await
            .map_err(|e| map_error(e, path))?;
        Ok((stat.as_ref().map(node_stat), forward_watch(watcher)))
    }

    async fn get(&self, path: &str) -> Result<(Bytes, NodeStat)> {
        validate_path(path)?;
        let (data, stat) = self
            .client()?
            .get_data(path)
            .await
            .map_err(|e| map_error(e, path))?;
        Ok((Bytes::from(data), node_stat(&stat)))
    }

    async fn get_watch(&self, path: &str) -> Result<(Bytes, NodeStat, Watch)> {
        validate_path(path)?;
        let (data, stat, watcher) = self
            .client()?
            .get_and_watch_data(path)
            .await
            .map_err(|e| map_error(e, path))?;
        Ok((Bytes::from(data), node_stat(&stat), forward_watch(watcher)))
    }

    async fn set(&self, path: &str, data: Bytes) -> Result<NodeStat> {
        validate_path(path)?;
        let stat = self
            .client()?
            .set_data(path, &data, None)
            .await
            .map_err(|e| map_error(e, path))?;
        Ok(node_stat(&stat))
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        validate_path(path)?;
        let mut children = self
            .client()?
            .list_children(path)
            .await
            .map_err(|e| map_error(e, path))?;
        children.sort();
        Ok(children)
    }

    async fn children_watch(&self, path: &str) -> Result<(Vec<String>, Watch)> {
        validate_path(path)?;
        let (mut children, watcher) = self
            .client()?
            .list_and_watch_children(path)
            .await
            .map_err(|e| map_error(e, path))?;
        children.sort();
        Ok((children, forward_watch(watcher)))
    }

    async fn close(&self) -> Result<()> {
        // The session ends once the last client handle is gone.
        let client = self.client.write().take();
        if client.is_some() {
            drop(client);
            self.states.send_replace(SessionState::Closed);
            tracing::debug!(session = %self.id, "zookeeper session closed");
        }
        Ok(())
    }
}
