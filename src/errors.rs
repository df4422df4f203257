use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sea_orm::DbErr;
use serde::Serialize;
use thiserror::Error;
use tracing::error;
use validator::ValidationErrors;

/// Wire shape for every error the service surfaces.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    #[serde(rename = "type")]
    pub error_type: String,
    pub code: String,
    pub message: String,
}

/// Error taxonomy of the reservation core.
///
/// Transient storage failures stay inside `Database` and are classified by
/// `db::is_transient`; after bounded retries they surface as an opaque
/// internal error like everything else unexpected.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("insufficient stock: {0}")]
    Insufficient(String),

    #[error("gone: {0}")]
    Gone(String),

    #[error("idempotency key conflict: {0}")]
    IdempotencyMismatch(String),

    #[error("database error: {0}")]
    Database(#[from] DbErr),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
            ServiceError::Forbidden(_) => StatusCode::FORBIDDEN,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::Insufficient(_) => StatusCode::CONFLICT,
            ServiceError::IdempotencyMismatch(_) => StatusCode::CONFLICT,
            ServiceError::Gone(_) => StatusCode::GONE,
            ServiceError::Database(_) | ServiceError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ServiceError::Validation(_) => "validation",
            ServiceError::NotFound(_) => "not_found",
            ServiceError::Forbidden(_) => "forbidden",
            ServiceError::Insufficient(_) => "insufficient_stock",
            ServiceError::Gone(_) => "reservation_gone",
            ServiceError::IdempotencyMismatch(_) => "idempotency_conflict",
            ServiceError::Database(_) | ServiceError::Internal(_) => "internal_error",
        }
    }
}

impl From<ValidationErrors> for ServiceError {
    fn from(errors: ValidationErrors) -> Self {
        ServiceError::Validation(errors.to_string())
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Storage and invariant failures are logged with full context but
        // reach the caller as an opaque internal error.
        let message = match &self {
            ServiceError::Database(err) => {
                error!(error = %err, "storage error surfaced to caller");
                "internal error".to_string()
            }
            ServiceError::Internal(msg) => {
                error!(error = %msg, "internal error surfaced to caller");
                "internal error".to_string()
            }
            other => other.to_string(),
        };

        let error_type = if status.is_server_error() {
            "processing_error"
        } else {
            "invalid_request"
        };

        let body = ErrorResponse {
            error_type: error_type.to_string(),
            code: self.code().to_string(),
            message,
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_http_status_codes() {
        let cases = [
            (ServiceError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (ServiceError::Forbidden("x".into()), StatusCode::FORBIDDEN),
            (ServiceError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (ServiceError::Insufficient("x".into()), StatusCode::CONFLICT),
            (
                ServiceError::IdempotencyMismatch("x".into()),
                StatusCode::CONFLICT,
            ),
            (ServiceError::Gone("x".into()), StatusCode::GONE),
            (
                ServiceError::Internal("x".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, status) in cases {
            assert_eq!(err.status_code(), status, "{err}");
        }
    }
}
