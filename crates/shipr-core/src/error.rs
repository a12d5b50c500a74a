use std::time::Duration;

/// Central error type for the shipr system.
#[derive(Debug, thiserror::Error)]
pub enum ShiprError {
    #[error("repository not found: {name}")]
    RepositoryNotFound { name: String },

    #[error("user not found: {id}")]
    UserNotFound { id: String },

    #[error("team not found: {name}")]
    TeamNotFound { name: String },

    #[error("no repositories registered for tenant {tenant}")]
    NoRepositories { tenant: String },

    #[error("authentication failed for host {host}: {message}")]
    AuthFailed { host: String, message: String },

    #[error("API error ({status}): {message}")]
    ApiError { status: u16, message: String },

    #[error("rate limited by {host}, retry after {retry_after_secs}s")]
    RateLimited { host: String, retry_after_secs: u64 },

    #[error("invalid remote payload: {message}")]
    Validation { message: String },

    #[error("invalid date range: {start} is after {end}")]
    InvalidRange { start: String, end: String },

    #[error("timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("config error: {message}")]
    Config { message: String },

    #[error("database error: {0}")]
    Database(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("credential error: {message}")]
    CredentialError { message: String },

    #[error("{0}")]
    Other(String),
}

impl ShiprError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Errors that will not go away by trying again.
    pub fn is_permanent(&self) -> bool {
        match self {
            ShiprError::RepositoryNotFound { .. }
            | ShiprError::UserNotFound { .. }
            | ShiprError::TeamNotFound { .. }
            | ShiprError::NoRepositories { .. }
            | ShiprError::AuthFailed { .. }
            | ShiprError::Validation { .. }
            | ShiprError::InvalidRange { .. }
            | ShiprError::Config { .. }
            | ShiprError::CredentialError { .. } => true,
            ShiprError::ApiError { status, .. } => matches!(status, 400 | 401 | 403 | 404 | 422),
            _ => false,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, ShiprError::RateLimited { .. })
    }

    /// How long the remote asked us to wait, if it said so.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ShiprError::RateLimited {
                retry_after_secs, ..
            } => Some(Duration::from_secs(*retry_after_secs)),
            _ => None,
        }
    }
}
