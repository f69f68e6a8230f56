//! API error type and its JSON response

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use olly_entitlements::EntitlementError;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("Authentication required")]
    Unauthorized,
    #[error("Insufficient permissions")]
    Forbidden,
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    PaymentRequired(String),
    #[error("Too many requests")]
    TooManyRequests { retry_after: u64 },
    #[error("Database error")]
    Database(String),
    #[error("Internal server error")]
    Internal,
    #[error("{0}")]
    ServiceUnavailable(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::PaymentRequired(_) => StatusCode::PAYMENT_REQUIRED,
            ApiError::TooManyRequests { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Database(_) | ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ApiError::Database(detail) => {
                tracing::error!(error = %detail, "Database error");
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        let body = Json(json!({
            "error": message,
            "code": status.as_u16()
        }));

        let mut response = (status, body).into_response();
        if let ApiError::TooManyRequests { retry_after } = self {
            if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl From<EntitlementError> for ApiError {
    fn from(err: EntitlementError) -> Self {
        match err {
            EntitlementError::NotFound(what) => ApiError::NotFound(what),
            EntitlementError::InvalidInput(msg) => ApiError::BadRequest(msg),
            EntitlementError::InvalidTier(_)
            | EntitlementError::UnknownProduct(_)
            | EntitlementError::WebhookEventNotSupported(_) => ApiError::BadRequest(err.to_string()),
            EntitlementError::Conflict(_) => ApiError::Conflict(err.to_string()),
            EntitlementError::InsufficientCredits { .. } => {
                ApiError::PaymentRequired(err.to_string())
            }
            EntitlementError::WebhookSignatureInvalid | EntitlementError::WebhookTimestampStale => {
                ApiError::Unauthorized
            }
            EntitlementError::Database(detail) => ApiError::Database(detail),
            EntitlementError::Internal(detail) => {
                tracing::error!(error = %detail, "Entitlement internal error");
                ApiError::Internal
            }
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        ApiError::Database(err.to_string())
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
