//! Error types for configuration loading.

use thiserror::Error;

/// Result type alias for configuration operations.
pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid duration {input:?}: {reason}")]
    Duration { input: String, reason: String },

    #[error("invalid setting {key}: {reason}")]
    Invalid { key: String, reason: String },
}
