//! Entitlement error types

use thiserror::Error;

/// SQLSTATE for unique_violation
const UNIQUE_VIOLATION: &str = "23505";
/// SQLSTATE for foreign_key_violation
const FOREIGN_KEY_VIOLATION: &str = "23503";

#[derive(Debug, Error)]
pub enum EntitlementError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Insufficient credits: balance {balance}, requested {requested}")]
    InsufficientCredits { balance: i64, requested: i64 },

    #[error("Invalid tier: {0}")]
    InvalidTier(String),

    #[error("Unknown product: {0}")]
    UnknownProduct(String),

    #[error("Webhook signature invalid")]
    WebhookSignatureInvalid,

    #[error("Webhook timestamp outside the accepted window")]
    WebhookTimestampStale,

    #[error("Webhook event not supported: {0}")]
    WebhookEventNotSupported(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for EntitlementError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            match db_err.code().as_deref() {
                Some(UNIQUE_VIOLATION) => {
                    let constraint = db_err.constraint().unwrap_or("unique constraint").to_string();
                    return EntitlementError::Conflict(constraint);
                }
                Some(FOREIGN_KEY_VIOLATION) => {
                    return EntitlementError::NotFound("Referenced record".into());
                }
                _ => {}
            }
        }
        EntitlementError::Database(err.to_string())
    }
}

pub type EntitlementResult<T> = Result<T, EntitlementError>;
