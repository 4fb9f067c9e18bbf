#![doc = include_str!("../README.md")]

pub mod assign;
pub mod claim;
mod error;
pub mod gate;
pub mod path;
pub mod publish;
pub mod recipe;
pub mod session;
mod time;

pub use crate::assign::candidate::{Candidate, is_valid_name, names_earned, shortlist};
pub use crate::assign::{Assigner, Assignment, Notice, SlotSnapshot, UNKNOWN_HOLDER};
pub use crate::claim::{ClaimConfig, ClaimState, Claimant, ScanLimit};
pub use crate::error::*;
pub use crate::gate::AdmissionGate;
pub use crate::path::{DEFAULT_POOL_ROOT, DEFAULT_SEMAPHORE_PATH, NamespaceLayout};
pub use crate::publish::{NamePublisher, read_published_name};
pub use crate::recipe::{Lease, LeaseSemaphore, SlotLock};
pub use crate::session::memory::{MemoryEnsemble, MemorySession};
#[cfg(feature = "zookeeper")]
pub use crate::session::zookeeper::{self, ZkSession, cluster_address};
pub use crate::session::{
    Acl, CoordinationSession, CreateMode, Credentials, SessionConfig, SessionId, SessionState,
};
pub use crate::time::*;
