// Error handling module for the cache server
//
// One error type is shared by storage drivers, the strategy engine, the
// discovery layer and the HTTP handlers. Handlers return it directly and rely
// on the IntoResponse impl below for the status mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use std::io;
use std::result;
use thiserror::Error;

/// Result type for cache server operations
pub type Result<T> = result::Result<T, CacheServerError>;

/// Error type for cache server operations
#[derive(Debug, Clone, Error)]
pub enum CacheServerError {
    /// Missing artifact, key or cache instance
    #[error("Not found: {0}")]
    NotFound(String),

    /// Bad or missing credential
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Declared hash, size or signature does not match the content
    #[error("Corrupt upload: {0}")]
    Corrupt(String),

    /// Transient storage or network failure, safe to retry
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The medium refused the operation
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Configuration rejected at startup
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Malformed request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Discovery layer failure
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// Index database errors
    #[error("Database error: {0}")]
    Database(String),

    /// Serialization-related errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// HTTP client errors
    #[error("Request error: {0}")]
    Request(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CacheServerError {
    /// Whether the failure is transient and the call may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CacheServerError::BackendUnavailable(_) | CacheServerError::Timeout(_)
        )
    }

    /// HTTP status for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            CacheServerError::NotFound(_) => StatusCode::NOT_FOUND,
            CacheServerError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            CacheServerError::Corrupt(_) => StatusCode::BAD_REQUEST,
            CacheServerError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            CacheServerError::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            CacheServerError::PermissionDenied(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CacheServerError::ConfigInvalid(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CacheServerError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            CacheServerError::Discovery(_) => StatusCode::BAD_GATEWAY,
            CacheServerError::Request(_) => StatusCode::BAD_GATEWAY,
            CacheServerError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CacheServerError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CacheServerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Implement IntoResponse so handlers can return CacheServerError directly
impl IntoResponse for CacheServerError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let body = Json(serde_json::json!({
            "error": {
                "code": status.as_u16(),
                "message": self.to_string()
            }
        }));

        (status, body).into_response()
    }
}

// Classify io errors the way storage drivers report them
impl From<io::Error> for CacheServerError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => CacheServerError::NotFound(err.to_string()),
            io::ErrorKind::PermissionDenied => CacheServerError::PermissionDenied(err.to_string()),
            _ => CacheServerError::BackendUnavailable(err.to_string()),
        }
    }
}

impl From<rusqlite::Error> for CacheServerError {
    fn from(err: rusqlite::Error) -> Self {
        CacheServerError::Database(err.to_string())
    }
}

impl From<reqwest::Error> for CacheServerError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            CacheServerError::Timeout(err.to_string())
        } else {
            CacheServerError::Request(err.to_string())
        }
    }
}

impl From<serde_json::Error> for CacheServerError {
    fn from(err: serde_json::Error) -> Self {
        CacheServerError::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for CacheServerError {
    fn from(err: config::ConfigError) -> Self {
        CacheServerError::ConfigInvalid(err.to_string())
    }
}

impl From<object_store::Error> for CacheServerError {
    fn from(err: object_store::Error) -> Self {
        match err {
            object_store::Error::NotFound { path, .. } => CacheServerError::NotFound(path),
            object_store::Error::NotSupported { source } => {
                CacheServerError::PermissionDenied(source.to_string())
            }
            other => {
                let message = other.to_string();
                // S3 reports refused credentials as a generic 403
                if message.contains("403") || message.contains("AccessDenied") {
                    CacheServerError::PermissionDenied(message)
                } else {
                    CacheServerError::BackendUnavailable(message)
                }
            }
        }
    }
}

impl From<tokio::task::JoinError> for CacheServerError {
    fn from(err: tokio::task::JoinError) -> Self {
        CacheServerError::Internal(format!("Task failed: {}", err))
    }
}
