// Copyright 2025 Memophor Labs
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("dependency resolution failed: {0}")]
    Dependency(String),
    #[error("compilation failed: {}", .0.join("; "))]
    Compilation(Vec<String>),
    #[error("blocked by security validation")]
    SecurityBlocked(Vec<String>),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

/// Failures of the document store. Write paths always surface these.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("i/o failure on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed document: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("version {version} of artifact {artifact_id} already exists")]
    VersionExists { artifact_id: String, version: u32 },
}

impl StorageError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    details: Vec<String>,
}

impl AppError {
    pub fn bad_request<T: Into<String>>(message: T) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn not_found<T: Into<String>>(message: T) -> Self {
        Self::NotFound(message.into())
    }

    pub fn conflict<T: Into<String>>(message: T) -> Self {
        Self::Conflict(message.into())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) | AppError::Storage(StorageError::VersionExists { .. }) => {
                StatusCode::CONFLICT
            }
            AppError::Dependency(_) | AppError::Compilation(_) | AppError::SecurityBlocked(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            AppError::Storage(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if let AppError::Internal(error) = &self {
            tracing::error!(error = %error, "request failed");
        }

        let details = match &self {
            AppError::Compilation(errors) | AppError::SecurityBlocked(errors) => errors.clone(),
            _ => Vec::new(),
        };

        let body = ErrorBody {
            error: self.to_string(),
            details,
        };

        (status, Json(body)).into_response()
    }
}
