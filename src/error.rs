//! Error types for campus-sync

use thiserror::Error;

/// Result type alias for campus-sync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for the application
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Operation failed: {0}")]
    Other(String),
}

/// Errors produced while loading data for a consumer.
///
/// Values are `Clone` because a single producer outcome fans out to every
/// caller waiting on the same key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("Load failed: {0}")]
    Transient(String),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Load cancelled")]
    Cancelled,

    #[error("Session expired. Log in again to continue.")]
    SessionExpired,
}

impl LoadError {
    /// Whether the loader may retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LoadError::Transient(_))
    }

    /// Cancellations are never surfaced to the consumer.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, LoadError::Cancelled)
    }

    /// The backend rejected the session; ends it rather than retrying.
    pub fn is_credential_error(&self) -> bool {
        matches!(self, LoadError::SessionExpired)
    }
}

/// Authentication and session errors
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("No active session. Log in to continue.")]
    NoSession,

    #[error("Credential refresh failed: {0}")]
    RefreshFailed(String),

    #[error("Invalid email or password.")]
    Unauthorized,

    #[error("Auth backend error: {0}")]
    Backend(String),
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found. Run `campus-sync init` to create one.")]
    NotFound,

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to save configuration: {0}")]
    SaveError(String),
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        ConfigError::ParseError(err.to_string())
    }
}
