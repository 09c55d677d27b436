//! Error types for cache operations and API responses

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use std::path::PathBuf;

/// Failures while acquiring or tracking a model artifact
///
/// None of these are fatal to the process. The resolver turns them into
/// dropped references and the registry recovers from corruption locally.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Connection failure, reset or timeout while talking to the remote source
    #[error("network error fetching {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// Remote answered with a non-success status
    #[error("HTTP {status} fetching {url}")]
    HttpStatus { url: String, status: u16 },

    /// Remote returned zero bytes; empty artifacts are never cached
    #[error("empty response body from {url}")]
    EmptyBody { url: String },

    /// Downloaded or cached content does not match the expected digest
    #[error("hash mismatch for {path:?}: expected {expected}, got {actual}")]
    Integrity {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    /// Permission denied, disk full, directory creation failure
    #[error("disk error at {path:?}: {source}")]
    Disk {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Fetcher reported failure; the cause was logged where it happened
    #[error("download of {url} failed: {reason}")]
    DownloadFailed { url: String, reason: String },

    /// Logical name cannot be mapped to a safe file name
    #[error("invalid model reference: {0}")]
    InvalidReference(String),

    /// Registry could not be written back to the volume
    #[error("failed to persist cache registry: {0}")]
    Persist(String),
}

impl CacheError {
    pub(crate) fn disk(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Disk {
            path: path.into(),
            source,
        }
    }

    /// Short machine-readable kind, used as a metrics label and in API failures
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Network { .. } => "network",
            Self::HttpStatus { .. } => "http_status",
            Self::EmptyBody { .. } => "empty_body",
            Self::Integrity { .. } => "integrity",
            Self::Disk { .. } => "disk",
            Self::DownloadFailed { .. } => "download",
            Self::InvalidReference(_) => "invalid_reference",
            Self::Persist(_) => "persist",
        }
    }
}

pub type CacheResult<T> = Result<T, CacheError>;

/// API error types
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(err) => {
                tracing::error!(error = %err, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        let body = Json(ErrorResponse {
            error: message,
            timestamp: chrono::Utc::now(),
        });

        (status, body).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

impl From<CacheError> for ApiError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::InvalidReference(msg) => ApiError::BadRequest(msg),
            other => ApiError::Internal(other.into()),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    timestamp: chrono::DateTime<chrono::Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let err = CacheError::HttpStatus {
            url: "http://x".to_string(),
            status: 404,
        };
        assert_eq!(err.kind(), "http_status");
        assert_eq!(err.to_string(), "HTTP 404 fetching http://x");

        let err = CacheError::disk(
            "/models/a",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert_eq!(err.kind(), "disk");
        assert!(err.to_string().contains("denied"));
    }

    #[test]
    fn test_invalid_reference_maps_to_bad_request() {
        let api: ApiError = CacheError::InvalidReference("bad".to_string()).into();
        assert!(matches!(api, ApiError::BadRequest(msg) if msg == "bad"));

        let api: ApiError = CacheError::Persist("full".to_string()).into();
        assert!(matches!(api, ApiError::Internal(_)));
    }

    #[test]
    fn test_api_error_status_codes() {
        let resp = ApiError::NotFound("x".to_string()).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let resp = ApiError::BadRequest("x".to_string()).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let resp = ApiError::Internal(anyhow::anyhow!("boom")).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
