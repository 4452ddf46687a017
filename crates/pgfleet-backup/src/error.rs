use pgfleet_infra::InfraError;
use pgfleet_state::StateError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("credential {name}/{key} unavailable")]
    CredentialUnavailable { name: String, key: String },

    #[error("{op}: {source}")]
    Infra {
        op: &'static str,
        #[source]
        source: InfraError,
    },

    #[error("upload of {key} was not confirmed durable")]
    NotDurable { key: String },

    #[error("restore to {target} unavailable: {reason}")]
    RestoreTargetUnavailable { target: u64, reason: String },

    #[error(transparent)]
    State(#[from] StateError),
}

impl BackupError {
    pub fn is_transient(&self) -> bool {
        match self {
            BackupError::Infra { source, .. } => source.is_transient(),
            BackupError::NotDurable { .. } => true,
            _ => false,
        }
    }
}

pub type BackupResult<T> = Result<T, BackupError>;
