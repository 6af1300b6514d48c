//! Error types for the storage engine.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Application result type.
pub type AppResult<T> = Result<T, AppError>;

/// Application error type.
///
/// The first group is the taxonomy defined for the storage engine itself
/// (§7 of the design). The second group exists only so the HTTP response
/// layer has a total mapping to the status codes consumed by callers
/// outside this crate (auth/session issuance, rate limiting) that never
/// originate here.
#[derive(Debug, Error)]
pub enum AppError {
    // === Storage engine taxonomy ===
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("storage quota exceeded")]
    QuotaExceeded,

    #[error("integrity error: {0}")]
    IntegrityError(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),

    // === API-layer variants (never raised by the engine itself) ===
    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("rate limited")]
    RateLimited,
}

impl AppError {
    /// Returns the HTTP status code for this error.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) | Self::IntegrityError(_) => StatusCode::CONFLICT,
            Self::InvalidPath(_) | Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::QuotaExceeded => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        }
    }

    /// Returns the error code for API responses.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::InvalidPath(_) => "INVALID_PATH",
            Self::QuotaExceeded => "QUOTA_EXCEEDED",
            Self::IntegrityError(_) => "INTEGRITY_ERROR",
            Self::Unavailable(_) => "UNAVAILABLE",
            Self::Internal(_) => "INTERNAL_ERROR",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::RateLimited => "RATE_LIMITED",
        }
    }

    /// Returns whether this error should be logged at error level.
    #[must_use]
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();

        // Detailed error text is logged only; the client gets the generic
        // message/code pair per the propagation policy — never leak
        // internals to the caller.
        if self.is_server_error() {
            tracing::error!(error = %self, code = code, "request failed");
        } else {
            tracing::debug!(error = %self, code = code, "request rejected");
        }

        let body = Json(json!({
            "error": {
                "code": code,
                "message": self.to_string(),
            }
        }));

        (status, body).into_response()
    }
}

// === From implementations ===

impl From<validator::ValidationErrors> for AppError {
    fn from(err: validator::ValidationErrors) -> Self {
        Self::Validation(err.to_string())
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<sea_orm::DbErr> for AppError {
    fn from(err: sea_orm::DbErr) -> Self {
        match &err {
            sea_orm::DbErr::RecordNotFound(msg) => Self::NotFound(msg.clone()),
            sea_orm::DbErr::Exec(runtime_err) | sea_orm::DbErr::Query(runtime_err) => {
                let text = runtime_err.to_string();
                if text.contains("duplicate key") || text.contains("UNIQUE constraint") {
                    Self::Conflict(text)
                } else if text.contains("foreign key") {
                    Self::IntegrityError(text)
                } else {
                    Self::Internal(text)
                }
            }
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(err.to_string()),
            std::io::ErrorKind::AlreadyExists => Self::Conflict(err.to_string()),
            _ => Self::Internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_taxonomy() {
        assert_eq!(
            AppError::NotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::QuotaExceeded.status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            AppError::Unavailable("redis".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn server_error_classification() {
        assert!(AppError::Internal("boom".into()).is_server_error());
        assert!(AppError::Unavailable("cache".into()).is_server_error());
        assert!(!AppError::NotFound("x".into()).is_server_error());
        assert!(!AppError::Conflict("x".into()).is_server_error());
    }

    #[test]
    fn io_not_found_maps_to_not_found() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let app_err: AppError = io_err.into();
        assert_eq!(app_err.status_code(), StatusCode::NOT_FOUND);
    }
}
