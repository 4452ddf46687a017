//! pgfleet-reconciler — the reconcile loop driver.
//!
//! The [`Controller`] runs one tokio task per managed cluster. Each task owns
//! a [`ClusterWorker`] and runs passes serially: load the spec, let the
//! replication coordinator fold in fresh observations and fix roles, plan,
//! dispatch the plan, tick the backup scheduler, then persist and publish
//! the status on a `watch` channel.
//!
//! Passes are triggered by desired-state changes, explicit notifications
//! and a resync timer. Triggers that arrive while a pass runs coalesce into
//! a single pending pass.
//!
//! Failures are recorded per action as status annotations with a bounded
//! exponential backoff; only the failing action's branch waits.

pub mod backoff;
pub mod cluster;
pub mod controller;
pub mod error;
mod executor;

pub use backoff::Backoff;
pub use cluster::{ClusterWorker, PassReport, REPLICATION_KEY};
pub use controller::{ClusterControl, ControlFuture, Controller};
pub use error::{ReconcileError, ReconcileResult};
