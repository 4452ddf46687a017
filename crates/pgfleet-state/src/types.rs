//! Domain types for the pgfleet state store.
//!
//! `ClusterSpec` is what the user asked for, `ClusterStatus` is what the
//! controller last observed and did. Backups and WAL segments are kept in
//! their own tables because they outlive any single status snapshot.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{StateError, StateResult};

/// `{namespace}/{name}` of a managed cluster.
pub type ClusterId = String;

/// `{name}-{ordinal}`; the stable idempotency key for every infra request
/// that concerns one instance.
pub type InstanceId = String;

/// Position in the write-ahead log.
pub type Lsn = u64;

// ── Desired state ─────────────────────────────────────────────────

/// Desired state of a PostgreSQL cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterSpec {
    pub namespace: String,
    pub name: String,
    /// Total number of instances (one primary, the rest replicas).
    pub instances: u32,
    pub storage: StorageSpec,
    /// Container image, tagged with the PostgreSQL version
    /// (e.g. `ghcr.io/cloudnative-pg/postgresql:16.2`).
    pub image: String,
    pub resources: ResourceLimits,
    pub bootstrap: BootstrapSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<BackupSpec>,
    /// Bumped every time the stored spec changes. Set by the apply path,
    /// never by the author of the manifest.
    #[serde(default)]
    pub generation: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageSpec {
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
}

/// Resource limits per instance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceLimits {
    pub cpu_millis: u32,
    pub memory_bytes: u64,
}

/// How the first instance of a cluster is initialized.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BootstrapSpec {
    pub database: String,
    pub owner: String,
    /// Password of `owner`.
    pub owner_secret: SecretRef,
    /// Restore from another cluster's backups instead of running initdb.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery: Option<RecoverySource>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecoverySource {
    pub source_cluster: ClusterId,
    /// Unix timestamp to recover to. `None` means the latest restorable point.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_time: Option<u64>,
}

/// Reference to a credential held by an external secret store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SecretRef {
    pub name: String,
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackupSpec {
    /// Object storage prefix, e.g. `s3://backups/prod`.
    pub destination_uri: String,
    /// Object storage access key.
    pub credentials: SecretRef,
    /// How long a backup stays restorable, e.g. "30d".
    pub retention: String,
}

impl ClusterSpec {
    /// Key of this cluster in every cluster-scoped table.
    pub fn id(&self) -> ClusterId {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Stable identifier of the instance with the given ordinal.
    pub fn instance_id(&self, ordinal: u32) -> InstanceId {
        format!("{}-{}", self.name, ordinal)
    }

    /// Parsed backup retention, if backups are configured.
    pub fn retention(&self) -> Option<Duration> {
        self.backup
            .as_ref()
            .and_then(|b| pgfleet_core::parse_duration(&b.retention).ok())
    }

    /// Reject specs that can never be satisfied.
    pub fn validate(&self) -> StateResult<()> {
        let invalid = |msg: &str| Err(StateError::InvalidSpec(format!("{}: {msg}", self.id())));

        if self.namespace.is_empty() || self.name.is_empty() {
            return invalid("namespace and name are required");
        }
        if self.namespace.contains(['/', ':']) || self.name.contains(['/', ':']) {
            return invalid("namespace and name must not contain '/' or ':'");
        }
        if self.instances == 0 {
            return invalid("instances must be at least 1");
        }
        if self.storage.size_bytes == 0 {
            return invalid("storage.size_bytes must be non-zero");
        }
        if self.image.trim().is_empty() {
            return invalid("image is required");
        }
        if self.bootstrap.database.is_empty() || self.bootstrap.owner.is_empty() {
            return invalid("bootstrap database and owner are required");
        }
        if let Some(backup) = &self.backup {
            if backup.destination_uri.is_empty() {
                return invalid("backup.destination_uri is required");
            }
            if let Err(e) = pgfleet_core::parse_duration(&backup.retention) {
                return invalid(&format!("backup.retention: {e}"));
            }
        }
        Ok(())
    }
}

// ── Observed state ────────────────────────────────────────────────

/// Observed state of a cluster, owned by that cluster's reconcile loop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterStatus {
    pub cluster_id: ClusterId,
    /// Spec generation the last completed pass planned against.
    pub observed_generation: u64,
    pub phase: ClusterPhase,
    /// Instance records, ordered by ordinal.
    pub instances: Vec<InstanceRecord>,
    pub primary: Option<InstanceId>,
    /// Where writes are routed. Only the replication coordinator changes it.
    pub write_target: WriteTarget,
    /// Provisioned volumes keyed by the instance id they belong to.
    pub volumes: BTreeMap<InstanceId, VolumeRecord>,
    /// Next never-used ordinal.
    pub next_ordinal: u32,
    pub last_backup_at: Option<u64>,
    /// End of the last WAL chunk shipped to object storage.
    pub last_archived_lsn: Option<Lsn>,
    /// Last error of every failing action, keyed by action key.
    pub annotations: BTreeMap<String, ActionAnnotation>,
    /// Drift the planner saw and deliberately did not act on.
    pub ignored_drift: Vec<String>,
    pub updated_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterPhase {
    /// No instance has reported in yet.
    Initializing,
    /// Converged, one primary, write target set.
    Healthy,
    /// Actions in flight towards the spec.
    Reconciling,
    /// Primary lost with no promotable replica, or replicas missing.
    Degraded,
    /// Fence/promote sequence in progress.
    FailingOver,
    /// More than one instance claimed primary; all claimants fenced.
    SplitBrain,
}

/// One running database process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceRecord {
    pub id: InstanceId,
    pub ordinal: u32,
    pub role: InstanceRole,
    pub phase: InstancePhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fence_reason: Option<FenceReason>,
    pub health: HealthStatus,
    /// Replication lag reported by the instance (replicas only).
    pub lag_ms: Option<u64>,
    /// Last LSN the instance reported.
    pub lsn: Option<Lsn>,
    /// Unix timestamp of the last successful probe.
    pub last_seen: Option<u64>,
    pub image: String,
    pub resources: ResourceLimits,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceRole {
    Primary,
    Replica,
}

/// Per-instance lifecycle:
/// `Provisioning -> Syncing -> Ready -> Fencing -> Terminated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstancePhase {
    Provisioning,
    Syncing,
    Ready,
    Fencing,
    Terminated,
}

/// Why an instance was fenced; decides what the planner does with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FenceReason {
    /// Draining before scale-down deletion.
    ScaleDown,
    /// Old primary after a failover; rejoins as a replica.
    Failover,
    /// Old primary after a planned switchover; rejoins as a replica.
    Switchover,
    /// Replica that stopped answering probes; replaced.
    Evicted,
    /// Claimed primary alongside another instance; held until resolved.
    SplitBrain,
}

/// Health status as determined by probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

/// Write-routing target for the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WriteTarget {
    Primary { instance: InstanceId },
    /// Primary temporarily unavailable; clients must not fall back to a
    /// cached primary.
    Unavailable { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeRecord {
    pub ordinal: u32,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
}

/// Status annotation left by a failed action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActionAnnotation {
    /// Human-readable description of the action.
    pub action: String,
    /// Error class (`transient_infra`, `credential_unavailable`, ...).
    pub kind: String,
    pub last_error: String,
    pub retries: u32,
    /// Unix timestamp before which the action is not retried.
    pub next_retry_at: u64,
    /// Not retried until the spec generation changes.
    pub permanent: bool,
    /// Spec generation the failure happened under.
    pub generation: u64,
}

impl InstancePhase {
    /// Counts towards the desired instance count.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Provisioning | Self::Syncing | Self::Ready)
    }
}

impl InstanceRecord {
    pub fn is_live(&self) -> bool {
        self.phase.is_live()
    }

    /// Unfenced primary.
    pub fn is_acting_primary(&self) -> bool {
        self.role == InstanceRole::Primary && self.is_live()
    }

    pub fn is_ready_replica(&self) -> bool {
        self.role == InstanceRole::Replica && self.phase == InstancePhase::Ready
    }
}

impl ClusterStatus {
    /// Status of a cluster that has never been reconciled.
    pub fn new(cluster_id: &str) -> Self {
        Self {
            cluster_id: cluster_id.to_string(),
            observed_generation: 0,
            phase: ClusterPhase::Initializing,
            instances: Vec::new(),
            primary: None,
            write_target: WriteTarget::Unavailable {
                reason: "cluster initializing".to_string(),
            },
            volumes: BTreeMap::new(),
            next_ordinal: 1,
            last_backup_at: None,
            last_archived_lsn: None,
            annotations: BTreeMap::new(),
            ignored_drift: Vec::new(),
            updated_at: 0,
        }
    }

    pub fn instance(&self, id: &str) -> Option<&InstanceRecord> {
        self.instances.iter().find(|i| i.id == id)
    }

    pub fn instance_mut(&mut self, id: &str) -> Option<&mut InstanceRecord> {
        self.instances.iter_mut().find(|i| i.id == id)
    }

    /// Insert or replace a record, keeping ordinal order.
    pub fn upsert_instance(&mut self, record: InstanceRecord) {
        match self.instances.iter_mut().find(|i| i.id == record.id) {
            Some(existing) => *existing = record,
            None => {
                let pos = self
                    .instances
                    .partition_point(|i| i.ordinal < record.ordinal);
                self.instances.insert(pos, record);
            }
        }
    }

    pub fn remove_instance(&mut self, id: &str) -> Option<InstanceRecord> {
        let pos = self.instances.iter().position(|i| i.id == id)?;
        Some(self.instances.remove(pos))
    }

    pub fn live_instances(&self) -> impl Iterator<Item = &InstanceRecord> {
        self.instances.iter().filter(|i| i.is_live())
    }

    pub fn live_count(&self) -> usize {
        self.live_instances().count()
    }

    /// Number of unfenced instances holding the primary role.
    pub fn primary_count(&self) -> usize {
        self.instances.iter().filter(|i| i.is_acting_primary()).count()
    }

    /// Writes are routed somewhere; outside the fencing window.
    pub fn is_settled(&self) -> bool {
        matches!(self.write_target, WriteTarget::Primary { .. })
    }

    /// Volumes with no instance record attached.
    pub fn orphan_volumes(&self) -> impl Iterator<Item = (&InstanceId, &VolumeRecord)> {
        self.volumes
            .iter()
            .filter(|(id, _)| self.instance(id).is_none())
    }

    /// Make `id` the primary and route writes to it, in one step.
    ///
    /// Every other unfenced instance is left a replica.
    pub fn set_primary(&mut self, id: &str) {
        for inst in &mut self.instances {
            if inst.id == id {
                inst.role = InstanceRole::Primary;
                inst.lag_ms = Some(0);
            } else if inst.is_live() {
                inst.role = InstanceRole::Replica;
            }
        }
        self.primary = Some(id.to_string());
        self.write_target = WriteTarget::Primary {
            instance: id.to_string(),
        };
    }

    /// Stop routing writes anywhere.
    pub fn route_unavailable(&mut self, reason: &str) {
        self.write_target = WriteTarget::Unavailable {
            reason: reason.to_string(),
        };
    }

    /// Primary that writes are currently routed to, if any.
    pub fn write_primary(&self) -> Option<&str> {
        match &self.write_target {
            WriteTarget::Primary { instance } => Some(instance),
            WriteTarget::Unavailable { .. } => None,
        }
    }
}

/// Replica to promote: the `Ready` replica with the lowest lag, ties broken
/// by the lowest instance id. Unknown lag sorts last.
pub fn promotion_candidate<'a>(
    instances: impl IntoIterator<Item = &'a InstanceRecord>,
) -> Option<&'a InstanceRecord> {
    instances
        .into_iter()
        .filter(|i| i.is_ready_replica())
        .min_by(|a, b| {
            let lag_a = a.lag_ms.unwrap_or(u64::MAX);
            let lag_b = b.lag_ms.unwrap_or(u64::MAX);
            lag_a.cmp(&lag_b).then_with(|| a.id.cmp(&b.id))
        })
}

// ── Backups ───────────────────────────────────────────────────────

/// One completed, durable base backup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupRecord {
    pub id: String,
    pub cluster_id: ClusterId,
    pub started_at: u64,
    pub completed_at: u64,
    /// First WAL position needed to make the backup consistent.
    pub wal_start_lsn: Lsn,
    /// WAL position the backup is consistent at.
    pub wal_end_lsn: Lsn,
    pub destination_uri: String,
    pub object_key: String,
    pub size_bytes: u64,
    /// sha256 of the uploaded artifact, hex-encoded.
    pub digest: String,
    pub expires_at: u64,
}

/// One archived chunk of the WAL stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WalSegmentRecord {
    pub cluster_id: ClusterId,
    pub start_lsn: Lsn,
    pub end_lsn: Lsn,
    pub start_time: u64,
    pub end_time: u64,
    pub destination_uri: String,
    pub object_key: String,
}

impl BackupRecord {
    /// Build the composite key for the backups table.
    pub fn table_key(&self) -> String {
        format!("{}:{:020}:{}", self.cluster_id, self.completed_at, self.id)
    }
}

impl WalSegmentRecord {
    /// Build the composite key for the WAL segments table.
    pub fn table_key(&self) -> String {
        format!("{}:{:020}", self.cluster_id, self.start_lsn)
    }
}

/// Current unix time in seconds.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
