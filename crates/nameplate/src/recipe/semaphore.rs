use crate::error::{CoordinationError, Result};
use crate::path::join;
use crate::recipe::lock::SlotLock;
use crate::session::{Acl, CoordinationSession, CreateMode};
use bytes::Bytes;
use core::time::Duration;
use std::sync::Arc;
use tokio::time::{Instant, timeout_at};

/// Counting semaphore rooted at one path.
///
/// Layout:
///
/// ```text
/// <path>/lock                   bookkeeping lock, serializes lease creation
/// <path>/leases/<identity>-<session>
///                               one ephemeral node per lease
/// ```
///
/// The capacity is supplied per acquisition, so callers can follow a capacity
/// that changes over time.
pub struct LeaseSemaphore<S: ?Sized> {
    session: Arc<S>,
    path: String,
    identity: String,
    acl: Vec<Acl>,
}

impl<S> LeaseSemaphore<S>
where
    S: CoordinationSession + ?Sized,
{
    pub fn new(session: Arc<S>, path: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            session,
            path: path.into(),
            identity: identity.into(),
            acl: vec![Acl::claimant_default()],
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn lock_path(&self) -> String {
        join(&self.path, "lock")
    }

    fn leases_path(&self) -> String {
        join(&self.path, "leases")
    }

    fn lease_name(&self) -> String {
        format!("{}-{}", self.identity, self.session.session_id())
    }

    /// Acquires one lease if fewer than `max_leases` are out, waiting up to
    /// `wait` for one to free up.
    ///
    /// Fails with [`CoordinationError::OperationTimeout`] once `wait`
    /// elapses. Asking again while a lease is held returns the same lease.
    pub async fn acquire(&self, max_leases: usize, wait: Duration) -> Result<Lease<S>> {
        let deadline = Instant::now() + wait;
        let lock_path = self.lock_path();
        let leases_path = self.leases_path();
        self.session.ensure_path(&lock_path, &self.acl).await?;
        self.session.ensure_path(&leases_path, &self.acl).await?;

        let lock = SlotLock::new(Arc::clone(&self.session), &lock_path, &self.identity);
        let remaining = deadline.saturating_duration_since(Instant::now());
        if !lock.acquire(remaining).await? {
            return Err(timed_out("semaphore bookkeeping lock"));
        }

        let outcome = self.lease_under_lock(&leases_path, max_leases, deadline).await;
        if let Err(e) = lock.release().await {
            tracing::warn!(path = %lock_path, error = %e, "failed to release semaphore lock");
        }
        outcome
    }

    async fn lease_under_lock(
        &self,
        leases_path: &str,
        max_leases: usize,
        deadline: Instant,
    ) -> Result<Lease<S>> {
        let name = self.lease_name();
        let node = join(leases_path, &name);
        loop {
            let (leases, watch) = self.session.children_watch(leases_path).await?;
            if leases.iter().any(|lease| *lease == name) {
                return Ok(self.lease(node));
            }
            if leases.len() < max_leases {
                match self
                    .session
                    .create(
                        &node,
                        Bytes::from(self.identity.clone().into_bytes()),
                        CreateMode::Ephemeral,
                        &self.acl,
                    )
                    .await
                {
                    Ok(_) | Err(CoordinationError::NodeExists { .. }) => {
                        return Ok(self.lease(node));
                    }
                    Err(e) => return Err(e),
                }
            }

            tracing::trace!(
                path = %self.path,
                held = leases.len(),
                max_leases,
                "semaphore full, waiting"
            );
            match timeout_at(deadline, watch).await {
                Ok(Ok(_)) => {}
                Ok(Err(_)) => return Err(CoordinationError::SessionExpired),
                Err(_) => return Err(timed_out("semaphore lease")),
            }
        }
    }

    fn lease(&self, node: String) -> Lease<S> {
        Lease {
            session: Arc::clone(&self.session),
            node,
        }
    }

    /// Identities holding a lease right now.
    pub async fn lease_holders(&self) -> Result<Vec<String>> {
        let leases_path = self.leases_path();
        let mut names = match self.session.children(&leases_path).await {
            Ok(names) => names,
            Err(CoordinationError::NoNode { .. }) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        names.sort();

        let mut holders = Vec::with_capacity(names.len());
        for name in names {
            match self.session.get(&join(&leases_path, &name)).await {
                Ok((data, _)) => holders.push(String::from_utf8_lossy(&data).into_owned()),
                Err(CoordinationError::NoNode { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(holders)
    }
}

fn timed_out(operation: &str) -> CoordinationError {
    CoordinationError::OperationTimeout {
        operation: operation.to_owned(),
    }
}

/// One lease held from a [`LeaseSemaphore`].
///
/// Dropping a lease without [`release`](Lease::release) leaves the node in
/// place until the session ends.
#[must_use = "a lease is held until released or the session ends"]
pub struct Lease<S: ?Sized> {
    session: Arc<S>,
    node: String,
}

impl<S> Lease<S>
where
    S: CoordinationSession + ?Sized,
{
    pub fn node(&self) -> &str {
        &self.node
    }

    pub async fn release(self) -> Result<()> {
        match self.session.delete(&self.node).await {
            Ok(()) | Err(CoordinationError::NoNode { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
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

    const SEM: &str = "/pool-semaphore";

    #[tokio::test(flavor = "multi_thread")]
    async fn grants_up_to_capacity_then_times_out() {
        let ensemble = MemoryEnsemble::new();
        let a = LeaseSemaphore::new(connect(&ensemble), SEM, "host-a");
        let b = LeaseSemaphore::new(connect(&ensemble), SEM, "host-b");
        let c = LeaseSemaphore::new(connect(&ensemble), SEM, "host-c");

        let _la = a.acquire(2, Duration::from_secs(1)).await.unwrap();
        let _lb = b.acquire(2, Duration::from_secs(1)).await.unwrap();
        let err = c.acquire(2, Duration::from_millis(50)).await.err();
        assert!(matches!(
            err,
            Some(CoordinationError::OperationTimeout { .. })
        ));

        assert_eq!(a.lease_holders().await.unwrap(), ["host-a", "host-b"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn waiting_acquirer_gets_a_released_lease() {
        let ensemble = MemoryEnsemble::new();
        let a = LeaseSemaphore::new(connect(&ensemble), SEM, "host-a");
        let b = Arc::new(LeaseSemaphore::new(connect(&ensemble), SEM, "host-b"));

        let held = a.acquire(1, Duration::from_secs(1)).await.unwrap();
        let task = {
            let b = Arc::clone(&b);
            tokio::spawn(async move { b.acquire(1, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        held.release().await.unwrap();

        let lease = task.await.unwrap().unwrap();
        assert_eq!(b.lease_holders().await.unwrap(), ["host-b"]);
        lease.release().await.unwrap();
        assert!(b.lease_holders().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn session_death_returns_the_lease() {
        let ensemble = MemoryEnsemble::new();
        let dying = connect(&ensemble);
        let a = LeaseSemaphore::new(Arc::clone(&dying), SEM, "host-a");
        let b = LeaseSemaphore::new(connect(&ensemble), SEM, "host-b");

        let _held = a.acquire(1, Duration::from_secs(1)).await.unwrap();
        ensemble.expire_session(dying.session_id());

        let lease = b.acquire(1, Duration::from_secs(1)).await.unwrap();
        assert!(lease.node().starts_with("/pool-semaphore/leases/host-b-"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn repeated_acquire_reuses_the_lease() {
        let ensemble = MemoryEnsemble::new();
        let a = LeaseSemaphore::new(connect(&ensemble), SEM, "host-a");

        let first = a.acquire(1, Duration::from_secs(1)).await.unwrap();
        let second = a.acquire(1, Duration::from_secs(1)).await.unwrap();
        assert_eq!(first.node(), second.node());
        assert_eq!(a.lease_holders().await.unwrap(), ["host-a"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn zero_capacity_admits_nobody() {
        let ensemble = MemoryEnsemble::new();
        let a = LeaseSemaphore::new(connect(&ensemble), SEM, "host-a");
        assert!(a.acquire(0, Duration::from_millis(20)).await.is_err());
        assert!(a.lease_holders().await.unwrap().is_empty());
    }
}
