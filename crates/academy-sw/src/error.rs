//! Error types for the cache worker.

use academy_common::AcademyError;
use academy_net::NetError;
use http::StatusCode;
use thiserror::Error;

/// Cache storage failures.
///
/// All of these are soft on the request path: a failed write never stops
/// the already-fetched response from reaching the page.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Quota exceeded writing {needed} bytes ({used}/{quota} in use)")]
    QuotaExceeded { needed: usize, used: usize, quota: usize },

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Cache not found: {0}")]
    NotFound(String),
}

/// Errors that can occur in worker operations.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("State error: {0}")]
    State(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error("{url} answered {status}")]
    UnexpectedStatus { url: String, status: StatusCode },

    #[error("Malformed message: {0}")]
    Message(#[from] serde_json::Error),

    #[error(transparent)]
    Common(#[from] AcademyError),
}

impl WorkerError {
    /// Whether trying again later could succeed. Transport failures,
    /// server errors and unavailable storage are; a 404, a full quota or a
    /// bad config are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            WorkerError::Network(NetError::InvalidUrl(_)) => false,
            WorkerError::Network(_) => true,
            WorkerError::UnexpectedStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            WorkerError::Storage(StorageError::Unavailable(_)) => true,
            WorkerError::Common(e) => e.is_retryable(),
            WorkerError::Storage(_)
            | WorkerError::Config(_)
            | WorkerError::State(_)
            | WorkerError::Message(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_retryable_errors() {
        assert!(WorkerError::Network(NetError::Offline("/".into())).is_retryable());
        assert!(!WorkerError::Network(NetError::InvalidUrl("::".into())).is_retryable());

        let status = |status| WorkerError::UnexpectedStatus {
            url: "https://academy.example/vite.svg".into(),
            status,
        };
        assert!(status(StatusCode::BAD_GATEWAY).is_retryable());
        assert!(status(StatusCode::TOO_MANY_REQUESTS).is_retryable());
        assert!(!status(StatusCode::NOT_FOUND).is_retryable());

        let full = StorageError::QuotaExceeded {
            needed: 10,
            used: 0,
            quota: 0,
        };
        assert!(!WorkerError::Storage(full).is_retryable());
        assert!(WorkerError::Common(AcademyError::Timeout(Duration::from_secs(1))).is_retryable());
    }
}
