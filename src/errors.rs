use std::time::Duration;
use thiserror::Error;

/// Failure taxonomy for everything the dashboard controller surfaces or absorbs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("network request failed: {0}")]
    NetworkFailure(String),

    #[error("request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("'{0}' is not one of the available websites")]
    ValidationFailure(String),

    #[error("storage unavailable: {0}")]
    StorageFailure(String),

    #[error("superseded by a newer request")]
    Superseded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Network,
    Timeout,
    Validation,
    Storage,
    Superseded,
}

impl FetchError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkFailure(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NetworkFailure(_) => ErrorKind::Network,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::ValidationFailure(_) => ErrorKind::Validation,
            Self::StorageFailure(_) => ErrorKind::Storage,
            Self::Superseded => ErrorKind::Superseded,
        }
    }

    /// Storage and supersession failures are absorbed at the component
    /// boundary; only these reach the UI.
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Network | ErrorKind::Timeout | ErrorKind::Validation
        )
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage io failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage payload is not valid json: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage quota exceeded: {needed} bytes needed, {limit} allowed")]
    QuotaExceeded { needed: usize, limit: usize },
}

impl From<StorageError> for FetchError {
    fn from(err: StorageError) -> Self {
        Self::StorageFailure(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} has invalid value '{value}'")]
    Invalid { var: &'static str, value: String },

    #[error("invalid api url: {0}")]
    ApiUrl(#[from] url::ParseError),

    #[error("http client could not be built: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("controller misconfigured: {0}")]
    Controller(String),
}

impl ConfigError {
    pub fn controller(message: impl Into<String>) -> Self {
        Self::Controller(message.into())
    }
}
