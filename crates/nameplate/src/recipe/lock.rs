use crate::error::{CoordinationError, Result};
use crate::path::{join, node_name};
use crate::session::{Acl, CoordinationSession, CreateMode};
use bytes::Bytes;
use core::time::Duration;
use parking_lot::Mutex;
use portable_atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::{Instant, timeout_at};

/// Separates a contender's unique prefix from its sequence number.
pub const LOCK_MARKER: &str = "__lock__";

static NEXT_PREFIX: AtomicU64 = AtomicU64::new(0);

/// Exclusive lock over one node.
///
/// Each contender creates an ephemeral-sequential child
/// `<prefix>__lock__NNNNNNNNNN` holding its identity. The contender with the
/// lowest sequence number owns the lock. Because contender nodes are
/// ephemeral, a lock held by a dead session is released by the service.
///
/// The locked node itself must exist; the lock never creates it.
pub struct SlotLock<S: ?Sized> {
    session: Arc<S>,
    path: String,
    identity: String,
    prefix: String,
    acl: Vec<Acl>,
    node: Mutex<Option<String>>,
}

impl<S> SlotLock<S>
where
    S: CoordinationSession + ?Sized,
{
    pub fn new(session: Arc<S>, path: impl Into<String>, identity: impl Into<String>) -> Self {
        let prefix = format!(
            "{}-{:x}",
            session.session_id(),
            NEXT_PREFIX.fetch_add(1, Ordering::Relaxed)
        );
        Self {
            session,
            path: path.into(),
            identity: identity.into(),
            prefix,
            acl: vec![Acl::claimant_default()],
            node: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_acquired(&self) -> bool {
        self.node.lock().is_some()
    }

    /// Path of our contender node while the lock is held.
    pub fn contender_node(&self) -> Option<String> {
        self.node.lock().clone()
    }

    /// Takes the lock only if nobody else holds or queues for it.
    ///
    /// On failure our contender node is withdrawn again, so a losing attempt
    /// leaves nothing behind.
    pub async fn try_acquire(&self) -> Result<bool> {
        if self.is_acquired() {
            return Ok(true);
        }

        let ours = self.enter().await?;
        match self.position(&ours).await {
            Ok(Some(0)) => {
                *self.node.lock() = Some(ours);
                Ok(true)
            }
            Ok(_) => {
                self.withdraw(&ours).await;
                Ok(false)
            }
            Err(e) => {
                self.withdraw(&ours).await;
                Err(e)
            }
        }
    }

    /// Waits up to `wait` for the lock, watching only the contender directly
    /// ahead of ours.
    ///
    /// Returns `false` if the deadline passed first; our contender node has
    /// been withdrawn in that case.
    pub async fn acquire(&self, wait: Duration) -> Result<bool> {
        if self.is_acquired() {
            return Ok(true);
        }

        let deadline = Instant::now() + wait;
        let ours = self.enter().await?;
        match self.wait_for_turn(&ours, deadline).await {
            Ok(true) => {
                *self.node.lock() = Some(ours);
                Ok(true)
            }
            Ok(false) => {
                self.withdraw(&ours).await;
                Ok(false)
            }
            Err(e) => {
                self.withdraw(&ours).await;
                Err(e)
            }
        }
    }

    /// Releases the lock. Returns `false` if it was not held.
    ///
    /// A contender node that is already gone (for example because the
    /// session expired) counts as released.
    pub async fn release(&self) -> Result<bool> {
        let Some(ours) = self.node.lock().take() else {
            return Ok(false);
        };
        match self.session.delete(&ours).await {
            Ok(()) | Err(CoordinationError::NoNode { .. }) => Ok(true),
            Err(e) => {
                // Keep it so a retry can still delete the node.
                *self.node.lock() = Some(ours);
                Err(e)
            }
        }
    }

    /// Identities of every contender, holder first.
    pub async fn contenders(&self) -> Result<Vec<String>> {
        lock_contenders(&*self.session, &self.path).await
    }

    async fn enter(&self) -> Result<String> {
        let requested = join(&self.path, &format!("{}{LOCK_MARKER}", self.prefix));
        self.session
            .create(
                &requested,
                Bytes::from(self.identity.clone().into_bytes()),
                CreateMode::EphemeralSequential,
                &self.acl,
            )
            .await
    }

    async fn withdraw(&self, ours: &str) {
        if let Err(e) = self.session.delete(ours).await {
            tracing::debug!(node = %ours, error = %e, "could not withdraw lock contender");
        }
    }

    /// Index of `ours` among the sorted contenders, `None` if it vanished.
    async fn position(&self, ours: &str) -> Result<Option<usize>> {
        let sorted = sorted_contenders(self.session.children(&self.path).await?);
        let name = node_name(ours);
        Ok(sorted.iter().position(|(_, child)| child == name))
    }

    async fn wait_for_turn(&self, ours: &str, deadline: Instant) -> Result<bool> {
        let name = node_name(ours);
        loop {
            let sorted = sorted_contenders(self.session.children(&self.path).await?);
            let predecessor = match sorted.iter().position(|(_, child)| child == name) {
                Some(0) => return Ok(true),
                Some(idx) => join(&self.path, &sorted[idx - 1].1),
                None => {
                    return Err(CoordinationError::NoNode {
                        path: ours.to_owned(),
                    });
                }
            };

            let (stat, watch) = self.session.exists_watch(&predecessor).await?;
            if stat.is_none() {
                continue;
            }
            match timeout_at(deadline, watch).await {
                Ok(Ok(_)) => {}
                Ok(Err(_)) => return Err(CoordinationError::SessionExpired),
                Err(_) => return Ok(false),
            }
        }
    }
}

/// Identities of the contenders for the lock on `path`, holder first.
///
/// Contenders that disappear while being read are skipped. A node with no
/// contenders yields an empty list.
pub async fn lock_contenders<S>(session: &S, path: &str) -> Result<Vec<String>>
where
    S: CoordinationSession + ?Sized,
{
    let sorted = sorted_contenders(session.children(path).await?);
    let mut identities = Vec::with_capacity(sorted.len());
    for (_, child) in sorted {
        match session.get(&join(path, &child)).await {
            Ok((data, _)) => identities.push(String::from_utf8_lossy(&data).into_owned()),
            Err(CoordinationError::NoNode { .. }) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(identities)
}

/// Lock contender children ordered by sequence number. Other children are
/// ignored.
fn sorted_contenders(children: Vec<String>) -> Vec<(u64, String)> {
    let mut contenders: Vec<(u64, String)> = children
        .into_iter()
        .filter_map(|child| {
            let (_, seq) = child.rsplit_once(LOCK_MARKER)?;
            let seq = seq.parse().ok()?;
            Some((seq, child))
        })
        .collect();
    contenders.sort();
    contenders
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionConfig;
    use crate::session::memory::{MemoryEnsemble, MemorySession};

    fn connect(ensemble: &MemoryEnsemble) -> Arc<MemorySession> {
        Arc::new(ensemble.connect(&SessionConfig {
            connect: "memory://".to_owned(),
            credentials: None,
            session_timeout: Duration::from_secs(10),
        }))
    }

    async fn slot(ensemble: &MemoryEnsemble) -> String {
        connect(ensemble).ensure_path("/pool/alpha", &[]).await.unwrap();
        "/pool/alpha".to_owned()
    }

    #[test]
    fn contenders_sort_by_sequence_not_prefix() {
        let sorted = sorted_contenders(vec![
            "b__lock__0000000002".into(),
            "a__lock__0000000010".into(),
            "z__lock__0000000001".into(),
            "unrelated".into(),
        ]);
        let names: Vec<_> = sorted.into_iter().map(|(_, n)| n).collect();
        assert_eq!(
            names,
            [
                "z__lock__0000000001",
                "b__lock__0000000002",
                "a__lock__0000000010"
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn try_acquire_is_exclusive_and_leaves_no_trace_on_failure() {
        let ensemble = MemoryEnsemble::new();
        let path = slot(&ensemble).await;
        let first = SlotLock::new(connect(&ensemble), &path, "host-a");
        let second = SlotLock::new(connect(&ensemble), &path, "host-b");

        assert!(first.try_acquire().await.unwrap());
        assert!(first.try_acquire().await.unwrap());
        assert!(!second.try_acquire().await.unwrap());
        assert!(!second.is_acquired());
        assert_eq!(first.contenders().await.unwrap(), ["host-a"]);

        assert!(first.release().await.unwrap());
        assert!(!first.release().await.unwrap());
        assert!(second.try_acquire().await.unwrap());
        assert_eq!(second.contenders().await.unwrap(), ["host-b"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn expired_holder_frees_the_lock() {
        let ensemble = MemoryEnsemble::new();
        let path = slot(&ensemble).await;
        let holder_session = connect(&ensemble);
        let holder = SlotLock::new(Arc::clone(&holder_session), &path, "host-a");
        let other = SlotLock::new(connect(&ensemble), &path, "host-b");

        assert!(holder.try_acquire().await.unwrap());
        ensemble.expire_session(holder_session.session_id());

        assert!(other.try_acquire().await.unwrap());
        assert_eq!(
            holder.release().await,
            Err(CoordinationError::SessionExpired)
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn blocking_acquire_waits_for_the_predecessor() {
        let ensemble = MemoryEnsemble::new();
        let path = slot(&ensemble).await;
        let holder = SlotLock::new(connect(&ensemble), &path, "host-a");
        let waiter = Arc::new(SlotLock::new(connect(&ensemble), &path, "host-b"));
        assert!(holder.try_acquire().await.unwrap());

        let task = {
            let waiter = Arc::clone(&waiter);
            tokio::spawn(async move { waiter.acquire(Duration::from_secs(5)).await })
        };

        // The waiter queues behind the holder.
        for _ in 0..100 {
            if holder.contenders().await.unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(holder.contenders().await.unwrap(), ["host-a", "host-b"]);

        holder.release().await.unwrap();
        assert!(task.await.unwrap().unwrap());
        assert!(waiter.is_acquired());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn blocking_acquire_times_out_and_withdraws() {
        let ensemble = MemoryEnsemble::new();
        let path = slot(&ensemble).await;
        let holder = SlotLock::new(connect(&ensemble), &path, "host-a");
        let waiter = SlotLock::new(connect(&ensemble), &path, "host-b");
        assert!(holder.try_acquire().await.unwrap());

        assert!(!waiter.acquire(Duration::from_millis(50)).await.unwrap());
        assert_eq!(holder.contenders().await.unwrap(), ["host-a"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn locking_a_missing_node_fails() {
        let ensemble = MemoryEnsemble::new();
        let lock = SlotLock::new(connect(&ensemble), "/pool/ghost", "host-a");
        assert!(matches!(
            lock.try_acquire().await,
            Err(CoordinationError::NoNode { .. })
        ));
    }
}
