//! The slot claim engine.
//!
//! A [`Claimant`] walks through admission, scanning and holding:
//!
//! ```text
//! Waiting -> Admitted -> Scanning { pass } -> Holding { slot } -> Terminated
//! ```
//!
//! Two conditions end the lifecycle from any state: the coordination session
//! ending, and any change to the set of slots. Both are fatal; the process is
//! expected to exit and be restarted by its supervisor with a fresh session.
//! Cancellation through the shutdown token is the only clean way out.

use crate::error::{ClaimError, CoordinationError};
use crate::gate::{AdmissionGate, DEFAULT_ADMISSION_TIMEOUT};
use crate::path::NamespaceLayout;
use crate::publish::NamePublisher;
use crate::recipe::{Lease, SlotLock};
use crate::session::data_watch::{DataWatch, NodeEvent};
use crate::session::{Acl, CoordinationSession, SessionState, Watch, session_ended};
use core::num::NonZeroU32;
use core::time::Duration;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Default pause after a scan pass that found nothing.
pub const DEFAULT_SCAN_BACKOFF: Duration = Duration::from_secs(1);

/// How many scan passes a claimant makes before giving up.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ScanLimit {
    /// Keep scanning until a slot frees up.
    #[default]
    Unbounded,
    /// Fail with [`ClaimError::NoSlotAvailable`] after this many passes.
    Passes(NonZeroU32),
}

impl ScanLimit {
    fn exhausted(self, pass: u32) -> bool {
        match self {
            Self::Unbounded => false,
            Self::Passes(max) => pass >= max.get(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ClaimConfig {
    pub layout: NamespaceLayout,
    /// Host identity recorded in lock contender and lease nodes.
    pub identity: String,
    pub admission_timeout: Duration,
    pub scan_backoff: Duration,
    pub scan_limit: ScanLimit,
}

impl ClaimConfig {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            layout: NamespaceLayout::default(),
            identity: identity.into(),
            admission_timeout: DEFAULT_ADMISSION_TIMEOUT,
            scan_backoff: DEFAULT_SCAN_BACKOFF,
            scan_limit: ScanLimit::Unbounded,
        }
    }
}

/// Where a claimant is in its lifecycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClaimState {
    Waiting,
    Admitted,
    Scanning { pass: u32 },
    Holding { slot: String },
    Terminated,
}

impl ClaimState {
    pub fn holding(&self) -> Option<&str> {
        match self {
            Self::Holding { slot } => Some(slot),
            _ => None,
        }
    }
}

/// Watches for the conditions that end a claimant no matter what it is
/// doing: a change in the slot set, or the session going away.
struct Sentinel {
    topology: Watch,
    states: watch::Receiver<SessionState>,
    slots_at_start: usize,
}

impl Sentinel {
    async fn arm<S>(session: &S, root: &str) -> Result<Self, CoordinationError>
    where
        S: CoordinationSession + ?Sized,
    {
        let states = session.state();
        let (slots, topology) = session.children_watch(root).await?;
        tracing::debug!(slots = slots.len(), %root, "watching pool topology");
        Ok(Self {
            topology,
            states,
            slots_at_start: slots.len(),
        })
    }

    /// Resolves once the claimant must stop.
    async fn tripped(&mut self) -> ClaimError {
        let slots_at_start = self.slots_at_start;
        tokio::select! {
            event = &mut self.topology => match event {
                Ok(event) => {
                    tracing::warn!(path = %event.path, kind = ?event.kind, "pool topology changed");
                    ClaimError::TopologyChanged { slots_at_start }
                }
                Err(_) => ClaimError::SessionLost,
            },
            () = session_ended(&mut self.states) => ClaimError::SessionLost,
        }
    }
}

fn classify(err: CoordinationError) -> ClaimError {
    match err {
        CoordinationError::SessionExpired => ClaimError::SessionLost,
        other => ClaimError::Coordination(other),
    }
}

/// One process's claim on a pool slot.
pub struct Claimant<S: ?Sized> {
    session: Arc<S>,
    config: ClaimConfig,
    publisher: NamePublisher,
    state: watch::Sender<ClaimState>,
}

impl<S> Claimant<S>
where
    S: CoordinationSession + ?Sized,
{
    pub fn new(session: Arc<S>, config: ClaimConfig, publisher: NamePublisher) -> Self {
        let (state, _) = watch::channel(ClaimState::Waiting);
        Self {
            session,
            config,
            publisher,
            state,
        }
    }

    pub fn config(&self) -> &ClaimConfig {
        &self.config
    }

    pub fn publisher(&self) -> &NamePublisher {
        &self.publisher
    }

    pub fn subscribe(&self) -> watch::Receiver<ClaimState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> ClaimState {
        self.state.borrow().clone()
    }

    fn enter(&self, next: ClaimState) {
        tracing::info!(identity = %self.config.identity, state = ?next, "claim state");
        self.state.send_replace(next);
    }

    /// Runs the whole lifecycle.
    ///
    /// Returns `Ok(())` only after `shutdown` was cancelled and the held
    /// slot (if any) was released. The published file is removed on every
    /// exit path.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), ClaimError> {
        let result = self.lifecycle(&shutdown).await;

        if let Err(e) = self.publisher.clear() {
            tracing::error!(
                path = %self.publisher.path().display(),
                error = %e,
                "failed to remove published name"
            );
        }
        self.enter(ClaimState::Terminated);

        match &result {
            Ok(()) => tracing::info!("claimant shut down"),
            Err(e) => tracing::error!(error = %e, "claimant terminated"),
        }
        result
    }

    /// Creates the pool paths and arms the sentinel, retrying transient
    /// failures. `None` means shutdown came first.
    async fn bootstrap(
        &self,
        shutdown: &CancellationToken,
    ) -> Result<Option<Sentinel>, ClaimError> {
        let layout = &self.config.layout;
        let acl = [Acl::claimant_default()];
        loop {
            let attempt = async {
                self.session.ensure_path(&layout.root, &acl).await?;
                self.session.ensure_path(&layout.semaphore, &acl).await?;
                Sentinel::arm(&*self.session, &layout.root).await
            };
            let err = tokio::select! {
                biased;
                () = shutdown.cancelled() => return Ok(None),
                armed = attempt => match armed {
                    Ok(sentinel) => return Ok(Some(sentinel)),
                    Err(e) if e.is_transient() => e,
                    Err(e) => return Err(classify(e)),
                },
            };
            tracing::warn!(error = %err, root = %layout.root, "could not prepare the pool, retrying");
            tokio::select! {
                biased;
                () = shutdown.cancelled() => return Ok(None),
                () = tokio::time::sleep(self.config.scan_backoff) => {}
            }
        }
    }

    async fn lifecycle(&self, shutdown: &CancellationToken) -> Result<(), ClaimError> {
        let layout = &self.config.layout;
        let Some(mut sentinel) = self.bootstrap(shutdown).await? else {
            return Ok(());
        };

        self.enter(ClaimState::Waiting);
        let gate = AdmissionGate::new(
            Arc::clone(&self.session),
            layout,
            self.config.identity.clone(),
            self.config.admission_timeout,
        )
        .with_backoff(self.config.scan_backoff);

        let lease = tokio::select! {
            biased;
            () = shutdown.cancelled() => return Ok(()),
            err = sentinel.tripped() => return Err(err),
            lease = gate.admit() => lease.map_err(classify)?,
        };
        self.enter(ClaimState::Admitted);

        let search = tokio::select! {
            biased;
            () = shutdown.cancelled() => Ok(None),
            err = sentinel.tripped() => Err(err),
            found = self.scan() => found.map(Some),
        };
        let session_lost = matches!(search, Err(ClaimError::SessionLost));
        self.release_lease(lease, session_lost).await;

        let Some((slot, lock)) = search? else {
            return Ok(());
        };
        self.hold(slot, lock, &mut sentinel, shutdown).await
    }

    async fn release_lease(&self, lease: Lease<S>, session_lost: bool) {
        if session_lost {
            return;
        }
        let node = lease.node().to_owned();
        match lease.release().await {
            Ok(()) => tracing::debug!(%node, "admission lease released"),
            Err(e) => tracing::warn!(%node, error = %e, "failed to release admission lease"),
        }
    }

    /// Tries every slot without blocking until one lock is taken.
    async fn scan(&self) -> Result<(String, SlotLock<S>), ClaimError> {
        let layout = &self.config.layout;
        let mut pass: u32 = 0;
        loop {
            pass = pass.saturating_add(1);
            self.enter(ClaimState::Scanning { pass });

            match self.session.children(&layout.root).await {
                Ok(slots) => {
                    for slot in slots {
                        let lock = SlotLock::new(
                            Arc::clone(&self.session),
                            layout.slot_path(&slot),
                            self.config.identity.clone(),
                        );
                        match lock.try_acquire().await {
                            Ok(true) => return Ok((slot, lock)),
                            Ok(false) => {}
                            // Slot removed mid-pass; the sentinel reports it.
                            Err(CoordinationError::NoNode { .. }) => {}
                            Err(e) if e.is_transient() => {
                                tracing::debug!(%slot, error = %e, "lock attempt failed");
                            }
                            Err(e) => return Err(classify(e)),
                        }
                    }
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(error = %e, "could not list slots");
                }
                Err(e) => return Err(classify(e)),
            }

            if self.config.scan_limit.exhausted(pass) {
                return Err(ClaimError::NoSlotAvailable { passes: pass });
            }
            tracing::info!(pass, "no free slot, will try again");
            tokio::time::sleep(self.config.scan_backoff).await;
        }
    }

    async fn hold(
        &self,
        slot: String,
        lock: SlotLock<S>,
        sentinel: &mut Sentinel,
        shutdown: &CancellationToken,
    ) -> Result<(), ClaimError> {
        self.enter(ClaimState::Holding { slot: slot.clone() });
        let mut values = DataWatch::spawn(Arc::clone(&self.session), lock.path());

        let outcome = tokio::select! {
            biased;
            () = shutdown.cancelled() => Ok(()),
            err = sentinel.tripped() => Err(err),
            () = self.follow(&slot, &mut values) => Err(ClaimError::SessionLost),
        };
        drop(values);

        if !matches!(outcome, Err(ClaimError::SessionLost)) {
            match lock.release().await {
                Ok(_) => tracing::info!(%slot, "released slot"),
                Err(e) => tracing::warn!(%slot, error = %e, "failed to release slot"),
            }
        }
        outcome
    }

    /// Publishes every value the held slot takes. Returns once the watch
    /// ends, which only happens when the session is gone.
    async fn follow(&self, slot: &str, values: &mut DataWatch) {
        while let Some(event) = values.recv().await {
            match event {
                NodeEvent::Changed(value) => {
                    let text = value.text();
                    let name = if text.is_empty() { slot } else { text.as_str() };
                    tracing::info!(%slot, %name, version = value.stat.version, "got name");
                    if let Err(e) = self.publisher.publish(name) {
                        tracing::error!(
                            path = %self.publisher.path().display(),
                            error = %e,
                            "failed to publish name"
                        );
                    }
                }
                NodeEvent::Deleted => {
                    tracing::warn!(%slot, "held slot was deleted");
                }
            }
        }
    }
}
