use crate::error::CoordinationError;
use crate::session::{CoordinationSession, NodeStat};
use bytes::Bytes;
use core::time::Duration;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const RETRY_DELAY: Duration = Duration::from_millis(100);

/// A node's value together with the stat it was read at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeValue {
    pub data: Bytes,
    pub stat: NodeStat,
}

impl NodeValue {
    /// The value as trimmed text. Invalid UTF-8 is replaced rather than
    /// rejected.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).trim().to_owned()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeEvent {
    Changed(NodeValue),
    Deleted,
}

/// A renewing watch on one node's value.
///
/// One-shot watches are re-registered after every event, and every distinct
/// version is delivered over a channel, starting with the value at the time
/// the watch was spawned. The channel closes once the session ends.
///
/// Dropping the `DataWatch` stops the background task.
#[derive(Debug)]
pub struct DataWatch {
    rx: mpsc::Receiver<NodeEvent>,
    task: JoinHandle<()>,
}

impl DataWatch {
    pub fn spawn<S>(session: Arc<S>, path: impl Into<String>) -> Self
    where
        S: CoordinationSession + ?Sized,
    {
        let path = path.into();
        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(async move {
            watch_loop(&*session, &path, &tx).await;
            tracing::debug!(%path, "data watch finished");
        });
        Self { rx, task }
    }

    /// Next value or deletion; `None` once the watch has ended.
    pub async fn recv(&mut self) -> Option<NodeEvent> {
        self.rx.recv().await
    }
}

impl Drop for DataWatch {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn watch_loop<S>(session: &S, path: &str, tx: &mpsc::Sender<NodeEvent>)
where
    S: CoordinationSession + ?Sized,
{
    // (created_ms, version) of the last delivered value, so a node that is
    // deleted and recreated is still reported.
    let mut last: Option<(u64, u64)> = None;
    let mut deleted_reported = false;

    loop {
        let watch = match session.get_watch(path).await {
            Ok((data, stat, watch)) => {
                let seen = (stat.created_ms, stat.version);
                if last != Some(seen) || deleted_reported {
                    last = Some(seen);
                    deleted_reported = false;
                    let value = NodeValue { data, stat };
                    if tx.send(NodeEvent::Changed(value)).await.is_err() {
                        return;
                    }
                }
                watch
            }
            Err(CoordinationError::NoNode { .. }) => {
                if !deleted_reported {
                    deleted_reported = true;
                    if tx.send(NodeEvent::Deleted).await.is_err() {
                        return;
                    }
                }
                match session.exists_watch(path).await {
                    Ok((Some(_), _)) => continue,
                    Ok((None, watch)) => watch,
                    Err(e) if e.is_transient() => {
                        tokio::time::sleep(RETRY_DELAY).await;
                        continue;
                    }
                    Err(e) => {
                        tracing::debug!(%path, error = %e, "data watch stopping");
                        return;
                    }
                }
            }
            Err(e) if e.is_transient() => {
                tracing::debug!(%path, error = %e, "data watch retrying");
                tokio::time::sleep(RETRY_DELAY).await;
                continue;
            }
            Err(e) => {
                tracing::debug!(%path, error = %e, "data watch stopping");
                return;
            }
        };

        if watch.await.is_err() {
            // The registering session is gone.
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionConfig;
    use crate::session::memory::MemoryEnsemble;
    use core::time::Duration;
    use tokio::time::timeout;

    fn config() -> SessionConfig {
        SessionConfig {
            connect: "memory://".to_owned(),
            credentials: None,
            session_timeout: Duration::from_secs(10),
        }
    }

    async fn next(watch: &mut DataWatch) -> Option<NodeEvent> {
        timeout(Duration::from_secs(5), watch.recv())
            .await
            .expect("data watch stalled")
    }

    fn text(event: Option<NodeEvent>) -> String {
        match event {
            Some(NodeEvent::Changed(value)) => value.text(),
            other => panic!("expected a value, got {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn delivers_initial_value_then_every_change() {
        let ensemble = MemoryEnsemble::new();
        let writer = ensemble.connect(&config());
        let reader = Arc::new(ensemble.connect(&config()));
        writer.ensure_path("/pool/alpha", &[]).await.unwrap();

        let mut watch = DataWatch::spawn(Arc::clone(&reader), "/pool/alpha");
        assert_eq!(text(next(&mut watch).await), "");

        writer
            .set("/pool/alpha", Bytes::from_static(b" zeus \n"))
            .await
            .unwrap();
        assert_eq!(text(next(&mut watch).await), "zeus");

        writer
            .set("/pool/alpha", Bytes::from_static(b"hera"))
            .await
            .unwrap();
        assert_eq!(text(next(&mut watch).await), "hera");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reports_deletion_and_recreation() {
        let ensemble = MemoryEnsemble::new();
        let writer = ensemble.connect(&config());
        let reader = Arc::new(ensemble.connect(&config()));
        writer.ensure_path("/pool/alpha", &[]).await.unwrap();

        let mut watch = DataWatch::spawn(reader, "/pool/alpha");
        assert_eq!(text(next(&mut watch).await), "");

        writer.delete("/pool/alpha").await.unwrap();
        assert_eq!(next(&mut watch).await, Some(NodeEvent::Deleted));

        writer
            .create(
                "/pool/alpha",
                Bytes::from_static(b"back"),
                crate::session::CreateMode::Persistent,
                &[],
            )
            .await
            .unwrap();
        assert_eq!(text(next(&mut watch).await), "back");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn closes_when_the_session_expires() {
        let ensemble = MemoryEnsemble::new();
        let writer = ensemble.connect(&config());
        let reader = Arc::new(ensemble.connect(&config()));
        writer.ensure_path("/pool/alpha", &[]).await.unwrap();

        let mut watch = DataWatch::spawn(Arc::clone(&reader), "/pool/alpha");
        assert!(next(&mut watch).await.is_some());

        ensemble.expire_session(reader.session_id());
        assert_eq!(next(&mut watch).await, None);
    }
}
