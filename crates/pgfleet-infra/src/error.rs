//! Infrastructure error types.

use thiserror::Error;

pub type InfraResult<T> = Result<T, InfraError>;

/// Coarse class of an infrastructure failure; drives retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfraErrorKind {
    /// Timeouts, provisioning delays, throttling. Retry with backoff.
    Transient,
    /// The addressed object does not exist.
    NotFound,
    /// The platform refused the request as issued.
    Rejected,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind:?}: {message}")]
pub struct InfraError {
    pub kind: InfraErrorKind,
    pub message: String,
}

impl InfraError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: InfraErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            kind: InfraErrorKind::NotFound,
            message: message.into(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            kind: InfraErrorKind::Rejected,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == InfraErrorKind::Transient
    }
}
