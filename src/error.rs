use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::cluster::ClusterError;
use crate::scm::ScmError;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("spec unavailable: {0}")]
    SpecUnavailable(String),

    #[error("spec invalid: {0}")]
    SpecInvalid(String),

    #[error("illegal transition: {0}")]
    IllegalTransition(String),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, serde_json::json!({ "error": msg })),
            Self::AlreadyExists(msg) => (StatusCode::CONFLICT, serde_json::json!({ "error": msg })),
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                serde_json::json!({ "error": "unauthorized" }),
            ),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, serde_json::json!({ "error": msg })),
            Self::SpecUnavailable(msg) | Self::SpecInvalid(msg) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                serde_json::json!({ "error": msg }),
            ),
            Self::IllegalTransition(msg) => {
                (StatusCode::CONFLICT, serde_json::json!({ "error": msg }))
            }
            Self::Upstream(msg) => (StatusCode::BAD_GATEWAY, serde_json::json!({ "error": msg })),
            Self::Storage(msg) => {
                tracing::error!(error = %msg, "storage error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    serde_json::json!({ "error": "storage error" }),
                )
            }
            Self::Internal(err) => {
                tracing::error!(error = %err, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    serde_json::json!({ "error": "internal server error" }),
                )
            }
        };

        (status, axum::Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(key) => Self::NotFound(key),
            StoreError::AlreadyExists(key) => Self::AlreadyExists(key),
            e => Self::Storage(e.to_string()),
        }
    }
}

impl From<ScmError> for ApiError {
    fn from(err: ScmError) -> Self {
        match err {
            ScmError::NotFound(msg) => Self::NotFound(msg),
            ScmError::Unauthorized => Self::Unauthorized,
            ScmError::MalformedHook(msg) => Self::BadRequest(msg),
            e => Self::Upstream(e.to_string()),
        }
    }
}

impl From<ClusterError> for ApiError {
    fn from(err: ClusterError) -> Self {
        Self::Upstream(err.to_string())
    }
}
