//! API error handling with structured responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::Conflict(_) => "CONFLICT",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Categorize an anyhow error by its message. Daemon internals use
    /// anyhow throughout; the taxonomy only matters at the HTTP edge.
    pub fn from_anyhow(err: anyhow::Error) -> Self {
        if err.is::<crate::authz::Unauthorized>() {
            return ApiError::Unauthorized(err.to_string());
        }
        let msg = format!("{err:#}");
        let lower = msg.to_lowercase();
        if lower.contains("not found") {
            ApiError::NotFound(msg)
        } else if lower.contains("not stopped")
            || lower.contains("already exists")
            || lower.contains("reserved service name")
        {
            ApiError::Conflict(msg)
        } else if lower.contains("invalid") || lower.contains("must be") || lower.contains("cannot")
        {
            ApiError::BadRequest(msg)
        } else if lower.contains("unauthorized") {
            ApiError::Unauthorized(msg)
        } else {
            ApiError::Internal(msg)
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();
        let message = self.to_string();
        match &self {
            ApiError::Internal(msg) => error!(error_code = code, message = %msg, "API error"),
            _ => debug!(error_code = code, message = %message, "client error"),
        }
        (
            status,
            Json(ErrorResponse {
                error: message,
                code,
            }),
        )
            .into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::from_anyhow(err)
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anyhow_messages_map_onto_the_taxonomy() {
        let err = ApiError::from_anyhow(anyhow::anyhow!("service not found: web"));
        assert!(matches!(err, ApiError::NotFound(_)));

        let err = ApiError::from_anyhow(anyhow::anyhow!("service is not stopped"));
        assert!(matches!(err, ApiError::Conflict(_)));

        let err = ApiError::from_anyhow(anyhow::anyhow!("cannot stage system service"));
        assert!(matches!(err, ApiError::BadRequest(_)));

        let err = ApiError::from_anyhow(anyhow::Error::from(crate::authz::Unauthorized));
        assert!(matches!(err, ApiError::Unauthorized(_)));

        let err = ApiError::from_anyhow(anyhow::anyhow!("disk went away"));
        assert!(matches!(err, ApiError::Internal(_)));
    }

    #[test]
    fn status_codes() {
        assert_eq!(
            ApiError::NotFound(String::new()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::Conflict(String::new()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::unauthorized("").status_code(),
            StatusCode::UNAUTHORIZED
        );
    }
}
