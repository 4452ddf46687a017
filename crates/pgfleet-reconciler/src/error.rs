//! Reconcile error taxonomy.
//!
//! Every failure surfaced by a pass is classified into one of these at the
//! action-execution boundary; the class decides the retry policy.

use pgfleet_backup::BackupError;
use pgfleet_infra::{InfraError, InfraErrorKind};
use pgfleet_replication::ReplicationError;
use pgfleet_state::{InstanceId, StateError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("transient infrastructure error: {0}")]
    TransientInfra(String),

    #[error("spec changed mid-pass (planned generation {planned}, now {current})")]
    Conflict { planned: u64, current: u64 },

    #[error("credential unavailable: {0}")]
    CredentialUnavailable(String),

    #[error("split brain risk: {0:?} claim primary")]
    SplitBrainRisk(Vec<InstanceId>),

    #[error("restore target unavailable: {0}")]
    RestoreTargetUnavailable(String),

    #[error("infrastructure rejected request: {0}")]
    Rejected(String),

    #[error("unknown cluster: {0}")]
    UnknownCluster(String),

    #[error("cluster loop stopped")]
    Stopped,

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

impl ReconcileError {
    /// Short class name recorded in status annotations.
    pub fn kind(&self) -> &'static str {
        match self {
            ReconcileError::TransientInfra(_) => "transient_infra",
            ReconcileError::Conflict { .. } => "conflict",
            ReconcileError::CredentialUnavailable(_) => "credential_unavailable",
            ReconcileError::SplitBrainRisk(_) => "split_brain_risk",
            ReconcileError::RestoreTargetUnavailable(_) => "restore_target_unavailable",
            ReconcileError::Rejected(_) => "rejected",
            ReconcileError::UnknownCluster(_) => "unknown_cluster",
            ReconcileError::Stopped => "stopped",
            ReconcileError::State(_) => "state",
        }
    }

    /// Not retried until the spec generation changes.
    pub fn is_permanent(&self) -> bool {
        matches!(self, ReconcileError::RestoreTargetUnavailable(_))
    }
}

impl From<InfraError> for ReconcileError {
    fn from(e: InfraError) -> Self {
        match e.kind {
            InfraErrorKind::Transient => ReconcileError::TransientInfra(e.message),
            InfraErrorKind::NotFound | InfraErrorKind::Rejected => {
                ReconcileError::Rejected(e.to_string())
            }
        }
    }
}

impl From<ReplicationError> for ReconcileError {
    fn from(e: ReplicationError) -> Self {
        match e {
            ReplicationError::SplitBrain(claimants) => ReconcileError::SplitBrainRisk(claimants),
            ReplicationError::Observe { ref source, .. } | ReplicationError::Infra { ref source, .. }
                if source.is_transient() =>
            {
                ReconcileError::TransientInfra(e.to_string())
            }
            other => ReconcileError::Rejected(other.to_string()),
        }
    }
}

impl From<BackupError> for ReconcileError {
    fn from(e: BackupError) -> Self {
        match e {
            BackupError::CredentialUnavailable { .. } => {
                ReconcileError::CredentialUnavailable(e.to_string())
            }
            BackupError::RestoreTargetUnavailable { .. } => {
                ReconcileError::RestoreTargetUnavailable(e.to_string())
            }
            BackupError::State(inner) => ReconcileError::State(inner),
            other if other.is_transient() => ReconcileError::TransientInfra(other.to_string()),
            other => ReconcileError::Rejected(other.to_string()),
        }
    }
}

pub type ReconcileResult<T> = Result<T, ReconcileError>;
