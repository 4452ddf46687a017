//! pgfleet-backup — backup and point-in-time recovery.
//!
//! The [`BackupScheduler`] runs inside the reconcile pass of a cluster with
//! a `backup` section: it takes base backups on a fixed interval, ships WAL
//! from the primary, and sweeps expired backups. [`plan_restore`] turns the
//! recorded backups and WAL ranges into a restore source for a target time.

pub mod error;
pub mod restore;
pub mod retention;
pub mod scheduler;

pub use error::{BackupError, BackupResult};
pub use restore::{RestorePlan, plan_restore};
pub use retention::{ExpiredSet, select_expired};
pub use scheduler::{BackupScheduler, TickReport};
