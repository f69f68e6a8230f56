//! Authentication middleware

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use olly_shared::PlatformRole;
use serde_json::json;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::jwt::JwtManager;
use crate::error::ApiError;

/// Auth state for middleware
#[derive(Clone)]
pub struct AuthState {
    pub jwt_manager: JwtManager,
    pub pool: PgPool,
}

/// Authenticated user stored in request extensions
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub email: String,
    pub role: PlatformRole,
}

impl AuthUser {
    pub fn require_admin(&self) -> Result<(), ApiError> {
        if self.role.is_admin() {
            Ok(())
        } else {
            Err(ApiError::Forbidden)
        }
    }

    pub fn require_superadmin(&self) -> Result<(), ApiError> {
        if self.role == PlatformRole::SuperAdmin {
            Ok(())
        } else {
            Err(ApiError::Forbidden)
        }
    }
}

#[derive(Debug, FromRow)]
struct UserRoleRow {
    email: String,
    platform_role: String,
}

/// Extract the Bearer token from the Authorization header
pub fn extract_bearer_token(request: &Request) -> Option<String> {
    request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from)
}

/// Middleware that requires a valid access token
pub async fn require_auth(
    State(auth_state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    let auth_result = match extract_bearer_token(&request) {
        Some(token) => authenticate_jwt(&auth_state, &token).await,
        None => Err(AuthError::MissingAuth),
    };

    match auth_result {
        Ok(auth_user) => {
            tracing::debug!(
                path = %path,
                user_id = %auth_user.user_id,
                role = %auth_user.role,
                "require_auth: authentication successful"
            );
            request.extensions_mut().insert(auth_user);
            next.run(request).await
        }
        Err(err) => {
            tracing::warn!(path = %path, error = ?err, "require_auth: authentication failed");
            err.into_response()
        }
    }
}

/// Middleware that authenticates when a token is present and otherwise lets the request through
pub async fn optional_auth(
    State(auth_state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Response {
    if let Some(token) = extract_bearer_token(&request) {
        if let Ok(auth_user) = authenticate_jwt(&auth_state, &token).await {
            request.extensions_mut().insert(auth_user);
        }
    }
    next.run(request).await
}

/// Validate the token, then read the current role so a demoted admin loses access
/// before the token expires.
async fn authenticate_jwt(auth_state: &AuthState, token: &str) -> Result<AuthUser, AuthError> {
    let claims = auth_state
        .jwt_manager
        .validate_access_token(token)
        .map_err(|e| {
            tracing::debug!(error = %e, "authenticate_jwt: token rejected");
            AuthError::InvalidToken
        })?;

    let row: Option<UserRoleRow> =
        sqlx::query_as("SELECT email, platform_role FROM users WHERE id = $1")
            .bind(claims.sub)
            .fetch_optional(&auth_state.pool)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "authenticate_jwt: user lookup failed");
                AuthError::DatabaseError
            })?;

    let row = row.ok_or_else(|| {
        tracing::warn!(user_id = %claims.sub, "JWT user not found");
        AuthError::InvalidToken
    })?;

    Ok(AuthUser {
        user_id: claims.sub,
        email: row.email,
        role: row.platform_role.parse().unwrap_or_default(),
    })
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing authentication")]
    MissingAuth,
    #[error("Invalid or expired token")]
    InvalidToken,
    #[error("Database error")]
    DatabaseError,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthError::MissingAuth => (StatusCode::UNAUTHORIZED, "Authentication required"),
            AuthError::InvalidToken => (StatusCode::UNAUTHORIZED, "Invalid or expired token"),
            AuthError::DatabaseError => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        };

        let body = Json(json!({
            "error": message,
            "code": status.as_u16()
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn request_with(auth: Option<&str>) -> Request {
        let mut builder = axum::http::Request::builder().uri("/api/v1/me/licenses");
        if let Some(value) = auth {
            builder = builder.header(header::AUTHORIZATION, value);
        }
        builder.body(Body::empty()).unwrap()
    }

    fn user(role: PlatformRole) -> AuthUser {
        AuthUser {
            user_id: Uuid::new_v4(),
            email: "someone@example.com".into(),
            role,
        }
    }

    #[test]
    fn test_extract_bearer_token() {
        assert_eq!(
            extract_bearer_token(&request_with(Some("Bearer abc.def"))).as_deref(),
            Some("abc.def")
        );
        assert!(extract_bearer_token(&request_with(Some("Basic abc"))).is_none());
        assert!(extract_bearer_token(&request_with(Some("Bearer   "))).is_none());
        assert!(extract_bearer_token(&request_with(None)).is_none());
    }

    #[test]
    fn test_role_requirements() {
        assert!(user(PlatformRole::User).require_admin().is_err());
        assert!(user(PlatformRole::Admin).require_admin().is_ok());
        assert!(user(PlatformRole::SuperAdmin).require_admin().is_ok());

        assert!(user(PlatformRole::Admin).require_superadmin().is_err());
        assert!(user(PlatformRole::SuperAdmin).require_superadmin().is_ok());
    }

    #[test]
    fn test_auth_error_statuses() {
        assert_eq!(AuthError::MissingAuth.into_response().status(), StatusCode::UNAUTHORIZED);
        assert_eq!(AuthError::InvalidToken.into_response().status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            AuthError::DatabaseError.into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
