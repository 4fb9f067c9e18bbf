//! Admission control in front of the slot scan.
//!
//! Claimants take a lease from a counting semaphore whose capacity is the
//! current number of slots, so no more claimants scan at once than there are
//! slots to find.

use crate::error::{CoordinationError, Result};
use crate::path::NamespaceLayout;
use crate::recipe::{Lease, LeaseSemaphore};
use crate::session::CoordinationSession;
use core::time::Duration;
use std::sync::Arc;

/// Default bound on one admission attempt.
pub const DEFAULT_ADMISSION_TIMEOUT: Duration = Duration::from_secs(60);

const TRANSIENT_BACKOFF: Duration = Duration::from_secs(1);

pub struct AdmissionGate<S: ?Sized> {
    session: Arc<S>,
    root: String,
    semaphore: LeaseSemaphore<S>,
    timeout: Duration,
    backoff: Duration,
}

impl<S> AdmissionGate<S>
where
    S: CoordinationSession + ?Sized,
{
    pub fn new(
        session: Arc<S>,
        layout: &NamespaceLayout,
        identity: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        let semaphore = LeaseSemaphore::new(Arc::clone(&session), &layout.semaphore, identity);
        Self {
            session,
            root: layout.root.clone(),
            semaphore,
            timeout,
            backoff: TRANSIENT_BACKOFF,
        }
    }

    /// Pause between attempts that failed transiently.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn semaphore(&self) -> &LeaseSemaphore<S> {
        &self.semaphore
    }

    /// Current number of slots.
    pub async fn pool_size(&self) -> Result<usize> {
        Ok(self.session.children(&self.root).await?.len())
    }

    /// One bounded admission attempt against the current pool size.
    ///
    /// `Ok(None)` means the timeout elapsed without a free lease.
    pub async fn attempt(&self) -> Result<Option<Lease<S>>> {
        let capacity = self.pool_size().await?;
        match self.semaphore.acquire(capacity, self.timeout).await {
            Ok(lease) => Ok(Some(lease)),
            Err(CoordinationError::OperationTimeout { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Attempts until admitted. Only non-transient failures end the wait.
    pub async fn admit(&self) -> Result<Lease<S>> {
        loop {
            match self.attempt().await {
                Ok(Some(lease)) => return Ok(lease),
                Ok(None) => {
                    tracing::debug!(semaphore = %self.semaphore.path(), "not admitted yet");
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(error = %e, "admission attempt failed, retrying");
                    tokio::time::sleep(self.backoff).await;
                }
                Err(e) => return Err(e),
            }
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

    async fn pool(ensemble: &MemoryEnsemble, slots: &[&str]) -> NamespaceLayout {
        let layout = NamespaceLayout::new("/pool", "/pool-semaphore").unwrap();
        let admin = connect(ensemble);
        for slot in slots {
            admin.ensure_path(&layout.slot_path(slot), &[]).await.unwrap();
        }
        layout
    }

    fn gate(
        ensemble: &MemoryEnsemble,
        layout: &NamespaceLayout,
        identity: &str,
        timeout: Duration,
    ) -> AdmissionGate<MemorySession> {
        AdmissionGate::new(connect(ensemble), layout, identity, timeout)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn admits_no_more_than_the_pool_size() {
        let ensemble = MemoryEnsemble::new();
        let layout = pool(&ensemble, &["alpha", "beta"]).await;
        let short = Duration::from_millis(50);

        let a = gate(&ensemble, &layout, "host-a", short);
        let b = gate(&ensemble, &layout, "host-b", short);
        let c = gate(&ensemble, &layout, "host-c", short);

        assert_eq!(a.pool_size().await.unwrap(), 2);
        let _la = a.attempt().await.unwrap().expect("first admitted");
        let _lb = b.attempt().await.unwrap().expect("second admitted");
        assert!(c.attempt().await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn capacity_follows_the_pool() {
        let ensemble = MemoryEnsemble::new();
        let layout = pool(&ensemble, &["alpha"]).await;
        let short = Duration::from_millis(50);

        let a = gate(&ensemble, &layout, "host-a", short);
        let b = gate(&ensemble, &layout, "host-b", short);
        let _la = a.attempt().await.unwrap().expect("admitted");
        assert!(b.attempt().await.unwrap().is_none());

        pool(&ensemble, &["beta"]).await;
        assert!(b.attempt().await.unwrap().is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn admit_waits_for_a_release() {
        let ensemble = MemoryEnsemble::new();
        let layout = pool(&ensemble, &["alpha"]).await;

        let a = gate(&ensemble, &layout, "host-a", Duration::from_millis(50));
        let b = gate(&ensemble, &layout, "host-b", Duration::from_millis(50));
        let held = a.admit().await.unwrap();

        let waiter = tokio::spawn(async move { b.admit().await.map(|l| l.node().to_owned()) });
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(!waiter.is_finished());

        held.release().await.unwrap();
        let node = waiter.await.unwrap().unwrap();
        assert!(node.contains("host-b"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn admit_gives_up_on_session_loss() {
        let ensemble = MemoryEnsemble::new();
        let layout = pool(&ensemble, &["alpha"]).await;
        let session = connect(&ensemble);
        let gate = AdmissionGate::new(Arc::clone(&session), &layout, "host-a", Duration::ZERO);

        ensemble.expire_session(session.session_id());
        assert_eq!(
            gate.admit().await.err(),
            Some(CoordinationError::SessionExpired)
        );
    }
}
