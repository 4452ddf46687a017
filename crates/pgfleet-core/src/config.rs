//! `pgfleet.toml` configuration parser.
//!
//! Every section and every key is optional; missing values fall back to the
//! defaults documented on each field.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration::serde_str;
use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FleetConfig {
    pub controller: ControllerSettings,
    pub replication: ReplicationSettings,
    pub backup: BackupSettings,
    pub api: ApiSettings,
    pub state: StateSettings,
}

/// Reconcile loop pacing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControllerSettings {
    /// Drift-catching timer tick when nothing else triggers a pass.
    #[serde(with = "serde_str")]
    pub resync_interval: Duration,
    /// Delay before re-running a pass that still had work pending.
    #[serde(with = "serde_str")]
    pub requeue_interval: Duration,
    /// First retry delay for a failing action.
    #[serde(with = "serde_str")]
    pub base_backoff: Duration,
    /// Upper bound on the retry delay of a failing action.
    #[serde(with = "serde_str")]
    pub max_backoff: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            resync_interval: Duration::from_secs(30),
            requeue_interval: Duration::from_secs(2),
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(300),
        }
    }
}

/// Failure detection and replica readiness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReplicationSettings {
    /// Consecutive missed probes before a primary is failed over
    /// (or a replica evicted).
    pub failure_threshold: u32,
    /// Replication lag at or below which a replica counts as caught up.
    pub lag_threshold_ms: u64,
    /// How long lag must stay under the threshold before `Ready`.
    #[serde(with = "serde_str")]
    pub lag_debounce: Duration,
    /// How long a new instance may stay silent before its missed probes
    /// start counting.
    #[serde(with = "serde_str")]
    pub startup_grace: Duration,
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            lag_threshold_ms: 100,
            lag_debounce: Duration::from_secs(10),
            startup_grace: Duration::from_secs(60),
        }
    }
}

/// Backup cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackupSettings {
    #[serde(with = "serde_str")]
    pub full_backup_interval: Duration,
    #[serde(with = "serde_str")]
    pub wal_archive_interval: Duration,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            full_backup_interval: Duration::from_secs(86_400),
            wal_archive_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ApiSettings {
    pub listen: SocketAddr,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8480)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StateSettings {
    pub data_dir: PathBuf,
}

impl Default for StateSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/pgfleet"),
        }
    }
}

impl FleetConfig {
    pub fn from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| CoreError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> CoreResult<Self> {
        let config: FleetConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make the controller misbehave.
    pub fn validate(&self) -> CoreResult<()> {
        let invalid = |key: &str, reason: &str| {
            Err(CoreError::Invalid {
                key: key.to_string(),
                reason: reason.to_string(),
            })
        };

        if self.replication.failure_threshold == 0 {
            return invalid("replication.failure_threshold", "must be at least 1");
        }
        if self.controller.resync_interval.is_zero() {
            return invalid("controller.resync_interval", "must be non-zero");
        }
        if self.controller.base_backoff > self.controller.max_backoff {
            return invalid("controller.base_backoff", "must not exceed max_backoff");
        }
        if self.backup.full_backup_interval.is_zero() || self.backup.wal_archive_interval.is_zero()
        {
            return invalid("backup", "intervals must be non-zero");
        }
        Ok(())
    }
}
