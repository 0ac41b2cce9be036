//! HTTP error mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use gigmatch_billing::BillingError;

/// API error type mapped onto HTTP responses
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Usage limit exceeded")]
    UsageLimitExceeded(String),

    #[error("Upstream billing provider error")]
    UpstreamError(String),

    #[error("Database error")]
    Database(String),

    #[error("Internal error")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),
            ApiError::UsageLimitExceeded(msg) => (
                StatusCode::PAYMENT_REQUIRED,
                "USAGE_LIMIT_EXCEEDED",
                msg.clone(),
            ),
            // Retryable from the client's perspective; no silent partial success
            ApiError::UpstreamError(msg) => (StatusCode::BAD_GATEWAY, "UPSTREAM_ERROR", msg.clone()),
            ApiError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "Database error".to_string(),
            ),
            ApiError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "Internal error".to_string(),
            ),
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::NotFound(msg) | BillingError::CustomerNotFound(msg) => {
                ApiError::NotFound(msg)
            }
            BillingError::Conflict(msg) => ApiError::Conflict(msg),
            BillingError::InvalidInput(msg) | BillingError::InvalidTier(msg) => {
                ApiError::BadRequest(msg)
            }
            BillingError::UsageLimitExceeded { feature, limit } => {
                ApiError::UsageLimitExceeded(format!("{} limit of {} reached", feature, limit))
            }
            BillingError::SignatureInvalid => {
                ApiError::BadRequest("Invalid webhook signature".to_string())
            }
            BillingError::ExternalService(msg) => ApiError::UpstreamError(msg),
            BillingError::Database(msg) => ApiError::Database(msg),
            BillingError::Config(msg) | BillingError::Internal(msg) => ApiError::Internal(msg),
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => ApiError::NotFound("Resource not found".to_string()),
            _ => ApiError::Database(err.to_string()),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
