use pgfleet_infra::InfraError;
use pgfleet_state::InstanceId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("observe {cluster}: {source}")]
    Observe {
        cluster: String,
        #[source]
        source: InfraError,
    },

    #[error("{op} {instance}: {source}")]
    Infra {
        op: &'static str,
        instance: InstanceId,
        #[source]
        source: InfraError,
    },

    #[error("instances {0:?} all claim primary; fenced pending resolution")]
    SplitBrain(Vec<InstanceId>),

    #[error("{0} is not held for split-brain resolution")]
    NotHeld(InstanceId),

    #[error("{0} is not a ready replica")]
    NotPromotable(InstanceId),

    #[error("{0} is no longer the acting primary")]
    NotPrimary(InstanceId),
}

impl ReplicationError {
    /// Worth retrying on the next pass without any change to the spec.
    pub fn is_transient(&self) -> bool {
        match self {
            ReplicationError::Observe { source, .. } | ReplicationError::Infra { source, .. } => {
                source.is_transient()
            }
            _ => false,
        }
    }
}

pub type ReplicationResult<T> = Result<T, ReplicationError>;
