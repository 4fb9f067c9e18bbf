//! Coordination recipes built from session primitives.
//!
//! Both recipes store their bookkeeping as ephemeral nodes, so everything a
//! session holds is released by the service when that session dies.
//!
//! ## Structure
//!
//! - [`lock`] - Exclusive lock over a node, with contender listing.
//! - [`semaphore`] - Counting semaphore handing out leases.

pub mod lock;
pub mod semaphore;

pub use lock::{LOCK_MARKER, SlotLock, lock_contenders};
pub use semaphore::{Lease, LeaseSemaphore};
