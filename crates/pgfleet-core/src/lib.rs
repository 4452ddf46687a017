//! pgfleet-core — shared configuration for the pgfleet controller.
//!
//! Holds the `pgfleet.toml` schema (tunables for the reconcile loop,
//! failover detection, and backup cadence) and the human-friendly
//! duration syntax used both there and in cluster manifests.

pub mod config;
pub mod duration;
pub mod error;

pub use config::{
    ApiSettings, BackupSettings, ControllerSettings, FleetConfig, ReplicationSettings,
    StateSettings,
};
pub use duration::{format_duration, parse_duration};
pub use error::{CoreError, CoreResult};
