//! Error types for modelship

use thiserror::Error;

/// Main error type for modelship
#[derive(Error, Debug)]
pub enum ModelshipError {
    /// Registered model not found
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    /// Version not found for a model
    #[error("Version not found: {model} v{version}")]
    VersionNotFound { model: String, version: u64 },

    /// Alias not bound for a model
    #[error("Alias not found: {model}@{alias}")]
    AliasNotFound { model: String, alias: String },

    /// Malformed request or input
    #[error("Validation error: {0}")]
    Validation(String),

    /// Artifact could not be turned into a predictor
    #[error("Load error: {0}")]
    Load(#[from] LoadError),

    /// Predictor failed while executing
    #[error("Inference error: {0}")]
    Inference(String),

    /// Version allocation race
    #[error("Concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    /// Durable storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ModelshipError {
    /// Whether this error is one of the not-found family
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ModelshipError::ModelNotFound(_)
                | ModelshipError::VersionNotFound { .. }
                | ModelshipError::AliasNotFound { .. }
        )
    }
}

/// Failure to fetch or deserialize a model artifact.
///
/// Cloneable so every waiter on a shared load observes the same value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    /// Artifact store could not provide the bytes
    #[error("failed to fetch artifact {location}: {reason}")]
    Fetch { location: String, reason: String },

    /// Bytes did not decode into a predictor
    #[error("corrupt artifact: {0}")]
    Corrupt(String),

    /// Predictor schema disagrees with the configured one
    #[error("incompatible schema: expected {expected:?}, artifact declares {found:?}")]
    IncompatibleSchema {
        expected: Vec<String>,
        found: Vec<String>,
    },

    /// Waiting for the load exceeded the configured timeout
    #[error("timed out waiting for load after {0}s")]
    Timeout(u64),

    /// Loader task ended without producing a result
    #[error("load aborted: {0}")]
    Aborted(String),
}

/// Result type for modelship operations
pub type ModelshipResult<T> = Result<T, ModelshipError>;

impl From<serde_json::Error> for ModelshipError {
    fn from(err: serde_json::Error) -> Self {
        ModelshipError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for ModelshipError {
    fn from(err: toml::de::Error) -> Self {
        ModelshipError::Config(err.to_string())
    }
}
