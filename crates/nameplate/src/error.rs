//! Error types for the coordination client and the claim engine.
//!
//! ## Error Cases
//! - [`CoordinationError`]: a single namespace operation failed. Only
//!   [`CoordinationError::ConnectionLoss`] and
//!   [`CoordinationError::OperationTimeout`] are transient; callers retry
//!   those from their own loops.
//! - [`ClaimError`]: the claim lifecycle ended for a reason the process cannot
//!   recover from in place. Every variant is meant to terminate the process so
//!   that the supervisor restarts it against a fresh session.

pub type Result<T, E = CoordinationError> = core::result::Result<T, E>;

/// Failure of one operation against the coordination namespace.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum CoordinationError {
    /// The addressed node (or the parent of a node being created) is absent.
    #[error("no node at {path}")]
    NoNode { path: String },

    /// A node already exists at the path being created.
    #[error("node already exists at {path}")]
    NodeExists { path: String },

    /// The node still has children and cannot be deleted.
    #[error("node at {path} has children")]
    NotEmpty { path: String },

    /// Ephemeral nodes cannot have children.
    #[error("cannot create children under ephemeral node {path}")]
    NoChildrenForEphemerals { path: String },

    /// The path is not an absolute, normalized namespace path.
    #[error("invalid path {path:?}: {reason}")]
    BadPath { path: String, reason: &'static str },

    /// The connection dropped; the session may still be alive.
    #[error("connection to the coordination service lost")]
    ConnectionLoss,

    /// The session is gone and every ephemeral resource with it.
    #[error("coordination session expired")]
    SessionExpired,

    /// A bounded wait elapsed.
    #[error("timed out: {operation}")]
    OperationTimeout { operation: String },

    /// The service refused the request for a reason not listed above, such as
    /// failed authentication or an unreachable ensemble.
    #[error("coordination service error: {reason}")]
    Service { reason: String },
}

impl CoordinationError {
    /// Returns `true` when the operation may succeed if simply retried.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::ConnectionLoss | Self::OperationTimeout { .. })
    }
}

/// Terminal outcome of a claimant's lifecycle.
#[derive(thiserror::Error, Debug)]
pub enum ClaimError {
    /// The coordination session was lost or closed underneath the claimant.
    #[error("coordination session lost")]
    SessionLost,

    /// The set of slots changed after the claimant started.
    #[error("pool topology changed (started with {slots_at_start} slots)")]
    TopologyChanged { slots_at_start: usize },

    /// The configured number of scan passes found no free slot.
    #[error("no free slot after {passes} scan passes")]
    NoSlotAvailable { passes: u32 },

    /// A non-transient coordination failure.
    #[error(transparent)]
    Coordination(#[from] CoordinationError),
}
