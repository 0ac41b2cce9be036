//! Billing error types

use thiserror::Error;

/// Billing-specific errors
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Processor or store API failure. Always retryable-suspect; never a
    /// definitive business outcome.
    #[error("External service error: {0}")]
    ExternalService(String),

    #[error("Webhook signature verification failed")]
    SignatureInvalid,

    #[error("Usage limit exceeded for {feature}: limit {limit}")]
    UsageLimitExceeded { feature: String, limit: i32 },

    #[error("Customer not found: {0}")]
    CustomerNotFound(String),

    #[error("Invalid subscription tier: {0}")]
    InvalidTier(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        BillingError::ExternalService(err.to_string())
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<reqwest::Error> for BillingError {
    fn from(err: reqwest::Error) -> Self {
        BillingError::ExternalService(err.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
