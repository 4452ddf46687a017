//! Request and observation types exchanged with the infrastructure.

use std::fmt;

use pgfleet_state::{InstanceId, InstanceRole, Lsn, ResourceLimits};

/// Everything needed to start one database instance.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceRequest {
    pub cluster_id: String,
    pub instance_id: InstanceId,
    pub ordinal: u32,
    pub image: String,
    pub resources: ResourceLimits,
    pub role: InstanceRole,
    /// Present only for the instance that initializes the cluster.
    pub bootstrap: Option<BootstrapRequest>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BootstrapRequest {
    pub database: String,
    pub owner: String,
    pub owner_password: Credential,
    pub restore: Option<RestoreSource>,
}

/// Base backup plus WAL to replay when bootstrapping by PITR.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreSource {
    pub destination_uri: String,
    pub base_backup_key: String,
    pub wal_keys: Vec<String>,
    pub target_time: u64,
}

/// In-place change to a running instance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstanceUpdate {
    pub image: Option<String>,
    pub resources: Option<ResourceLimits>,
}

/// One probe of one instance.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceObservation {
    pub instance_id: InstanceId,
    /// The probe got an answer.
    pub reachable: bool,
    /// The instance believes it is a primary (not in recovery).
    pub claims_primary: bool,
    pub lag_ms: Option<u64>,
    pub lsn: Option<Lsn>,
}

/// Output of a base backup taken from the primary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseBackup {
    pub data: Vec<u8>,
    pub wal_start_lsn: Lsn,
    pub wal_end_lsn: Lsn,
    pub started_at: u64,
}

/// WAL produced since a given LSN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalChunk {
    pub start_lsn: Lsn,
    pub end_lsn: Lsn,
    pub start_time: u64,
    pub end_time: u64,
    pub data: Vec<u8>,
}

/// Acknowledgement from object storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutReceipt {
    pub key: String,
    pub size_bytes: u64,
    /// The store confirmed the object is durably written.
    pub durable: bool,
}

/// A resolved secret. `Debug` never prints the value.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    secret: String,
}

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    pub fn expose(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}
