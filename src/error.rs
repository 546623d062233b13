//! Error types for the application

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::path::PathBuf;
use thiserror::Error;

/// Failures talking to the remote background catalog
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("HTTP client error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Catalog returned status: {0}")]
    Status(reqwest::StatusCode),

    #[error("Unexpected document shape: {0}")]
    Parse(String),

    #[error("Invalid catalog URL: {0}")]
    Url(String),
}

impl CatalogError {
    /// True when the response arrived but its body was unusable
    pub fn is_parse_failure(&self) -> bool {
        matches!(self, CatalogError::Parse(_))
    }
}

impl From<serde_json::Error> for CatalogError {
    fn from(e: serde_json::Error) -> Self {
        CatalogError::Parse(e.to_string())
    }
}

/// Failures reading or writing the on-disk background cache
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unreadable metadata for {image_id}: {reason}")]
    Metadata { image_id: String, reason: String },

    #[error("Invalid image id: {0:?}")]
    InvalidImageId(String),
}

impl CacheError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CacheError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Failures loading or persisting the settings file
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Settings I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Settings file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors surfaced by the control API
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Background engine is not running")]
    EngineUnavailable,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            AppError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            AppError::EngineUnavailable => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
            AppError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
        };

        (status, message).into_response()
    }
}
