//! Request-level errors and their HTTP rendering

use crate::store::StoreError;
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use registrar_crd::CrdError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, warn};

/// Errors surfaced synchronously to API clients.
///
/// Naming conflicts and stale generations never appear here: they are soft
/// outcomes reported through registration status.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("{0}")]
    Conflict(String),

    #[error("invalid object: {0}")]
    Invalid(String),

    /// Namespaced access against a cluster-scoped type or the reverse
    #[error("{resource} is {scope}; {hint}")]
    ScopeMismatch {
        resource: String,
        scope: &'static str,
        hint: &'static str,
    },

    /// Mutating request against a type whose registration is being deleted
    #[error("{resource} is terminating; {verb} is not permitted")]
    Terminating { resource: String, verb: String },

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("method {0} is not allowed on this resource")]
    MethodNotAllowed(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ApiError>;

impl ApiError {
    /// Machine-readable reason carried in the status body
    pub fn reason(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::AlreadyExists(_) => "already_exists",
            Self::Conflict(_) => "conflict",
            Self::Invalid(_) => "invalid",
            Self::ScopeMismatch { .. } => "scope_mismatch",
            Self::Terminating { .. } => "terminating",
            Self::StorageUnavailable(_) => "storage_unavailable",
            Self::MethodNotAllowed(_) => "method_not_allowed",
            Self::Internal(_) => "internal",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::AlreadyExists(_) | Self::Conflict(_) | Self::Terminating { .. } => {
                StatusCode::CONFLICT
            }
            Self::Invalid(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::ScopeMismatch { .. } => StatusCode::BAD_REQUEST,
            Self::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn to_status(&self) -> Status {
        Status {
            kind: "Status".to_string(),
            status: "Failure".to_string(),
            code: self.status_code().as_u16(),
            reason: self.reason().to_string(),
            message: self.to_string(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => Self::NotFound(what),
            StoreError::AlreadyExists(what) => Self::AlreadyExists(what),
            StoreError::Conflict(msg) => Self::Conflict(msg),
            StoreError::StaleGeneration { .. } | StoreError::Closed(_) => {
                Self::Conflict(err.to_string())
            }
            StoreError::Unavailable(msg) => Self::StorageUnavailable(msg),
            StoreError::InvalidData(msg) => Self::Invalid(msg),
            StoreError::Serialization(_) | StoreError::Lock(_) => Self::Internal(err.to_string()),
        }
    }
}

impl From<CrdError> for ApiError {
    fn from(err: CrdError) -> Self {
        Self::Invalid(err.to_string())
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        Self::Invalid(err.to_string())
    }
}

/// Failure body returned to clients
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Status {
    pub kind: String,
    pub status: String,
    pub code: u16,
    pub reason: String,
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(reason = self.reason(), error = %self, "Request failed");
        } else {
            warn!(reason = self.reason(), error = %self, "Request rejected");
        }
        (status, Json(self.to_status())).into_response()
    }
}
