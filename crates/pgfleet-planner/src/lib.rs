//! pgfleet-planner — the topology planner.
//!
//! [`plan`] is a pure function of a `ClusterSpec` and a `ClusterStatus`. It
//! returns the ordered, idempotent [`Action`]s that move the status towards
//! the spec, plus the drift it deliberately leaves alone. It never touches
//! infrastructure, so every decision is testable without any.
//!
//! # Ordering
//!
//! - Removal of fenced instances comes first, so their ordinals and volumes
//!   are free for the replacements planned after them.
//! - Scale-down: fence, delete, then drop the volume.
//! - Scale-up: provision (or grow a reused) volume, then create.
//! - Rolling image updates touch one instance per plan, replicas before
//!   the primary.

pub mod action;
pub mod planner;
pub mod version;

pub use action::{Action, IgnoredDrift, Plan};
pub use planner::{plan, satisfies};
pub use version::{major_version, same_major};
