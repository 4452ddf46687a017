//! pgfleet-replication — the replication coordinator.
//!
//! Owns the primary/replica roles of one cluster and the write-routing
//! target that goes with them. Each reconcile pass hands it a fresh
//! observation of every instance; from that it:
//!
//! - tracks consecutive missed probes per instance ([`ProbeTracker`]),
//! - moves replicas from `Syncing` to `Ready` once their lag has stayed
//!   under the threshold for the debounce interval,
//! - fails over when the primary misses too many probes, always fencing
//!   the old primary before promoting the replacement,
//! - fences every claimant when more than one instance claims primary.

pub mod coordinator;
pub mod error;
pub mod tracker;

pub use coordinator::{ReplicationCoordinator, RoleEvent};
pub use error::{ReplicationError, ReplicationResult};
pub use tracker::{LagDebounce, ProbeResult, ProbeTracker};
