use anyhow::{Context, bail};
use nameplate::{
    Acl, CoordinationSession, MemoryEnsemble, NamespaceLayout, SessionConfig, ZkSession,
    cluster_address,
};
use std::sync::Arc;

/// A coordination service the agent knows how to talk to.
#[derive(Clone)]
pub enum Backend {
    /// In-process service living as long as this process.
    Memory(MemoryEnsemble),
    /// ZooKeeper ensemble, as `host:port[,host:port...][/chroot]`.
    ZooKeeper { cluster: String },
}

impl Backend {
    /// Picks the backend named by `connect`: `memory://`, or a ZooKeeper
    /// connect string with or without a `zk://` prefix.
    pub fn open(connect: &str) -> anyhow::Result<Self> {
        if connect == "memory" || connect.starts_with("memory://") {
            return Ok(Self::Memory(MemoryEnsemble::new()));
        }
        match cluster_address(connect) {
            Some(cluster) => Ok(Self::ZooKeeper {
                cluster: cluster.to_owned(),
            }),
            None => bail!(
                "unsupported coordination backend {connect:?}; expected memory:// or zk://host:port[,host:port...][/chroot]"
            ),
        }
    }

    pub async fn connect(
        &self,
        config: &SessionConfig,
    ) -> anyhow::Result<Arc<dyn CoordinationSession>> {
        Ok(match self {
            Self::Memory(ensemble) => Arc::new(ensemble.connect(config)),
            Self::ZooKeeper { cluster } => Arc::new(
                ZkSession::connect(cluster, config)
                    .await
                    .with_context(|| format!("failed to connect to zookeeper at {cluster}"))?,
            ),
        })
    }

    /// Creates the pool root, the semaphore path and the given slots.
    pub async fn seed(
        &self,
        session: &dyn CoordinationSession,
        layout: &NamespaceLayout,
        slots: &[String],
    ) -> anyhow::Result<()> {
        let acl = [Acl::claimant_default()];
        session
            .ensure_path(&layout.root, &acl)
            .await
            .context("failed to create the pool root")?;
        session
            .ensure_path(&layout.semaphore, &acl)
            .await
            .context("failed to create the semaphore path")?;
        for slot in slots {
            session
                .ensure_path(&layout.slot_path(slot), &acl)
                .await
                .with_context(|| format!("failed to create slot {slot:?}"))?;
        }
        if !slots.is_empty() {
            tracing::info!(root = %layout.root, ?slots, "seeded pool");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::time::Duration;

    fn config(connect: &str) -> SessionConfig {
        SessionConfig {
            connect: connect.to_owned(),
            credentials: None,
            session_timeout: Duration::from_secs(10),
        }
    }

    #[test]
    fn connect_strings_pick_a_backend() {
        assert!(matches!(Backend::open("memory://"), Ok(Backend::Memory(_))));
        assert!(matches!(Backend::open("memory"), Ok(Backend::Memory(_))));
        assert!(matches!(
            Backend::open("zk://10.0.0.1:2181,10.0.0.2:2181/fleet"),
            Ok(Backend::ZooKeeper { cluster }) if cluster == "10.0.0.1:2181,10.0.0.2:2181/fleet"
        ));
        assert!(matches!(
            Backend::open("zk1.internal:2181"),
            Ok(Backend::ZooKeeper { cluster }) if cluster == "zk1.internal:2181"
        ));

        for bogus in ["etcd://10.0.0.1:2379", "zk://", "zk1.internal", ""] {
            let err = Backend::open(bogus).err().unwrap();
            assert!(
                err.to_string().contains("unsupported coordination backend"),
                "{bogus:?}: {err}"
            );
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn memory_sessions_share_one_namespace() {
        let backend = Backend::open("memory://").unwrap();
        let first = backend.connect(&config("memory://")).await.unwrap();
        let second = backend.connect(&config("memory://")).await.unwrap();
        assert_ne!(first.session_id(), second.session_id());

        backend
            .seed(&*first, &NamespaceLayout::default(), &["alpha".into()])
            .await
            .unwrap();
        assert!(
            second
                .exists(&NamespaceLayout::default().slot_path("alpha"))
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn seeding_creates_the_pool() {
        let backend = Backend::open("memory://").unwrap();
        let session = backend.connect(&config("memory://")).await.unwrap();
        let layout = NamespaceLayout::default();
        backend
            .seed(&*session, &layout, &["alpha".into(), "beta".into()])
            .await
            .unwrap();
        backend.seed(&*session, &layout, &[]).await.unwrap();

        assert_eq!(
            session.children(&layout.root).await.unwrap(),
            ["alpha", "beta"]
        );
        assert!(session.exists(&layout.semaphore).await.unwrap().is_some());
    }
}
