//! API routes

pub mod admin;
pub mod credits;
pub mod health;
pub mod licenses;
pub mod redeem_codes;
pub mod sublicenses;
pub mod webhooks;

use axum::{
    http::HeaderMap,
    middleware,
    routing::{delete, get, post, put},
    Router,
};

use crate::{
    auth::{optional_auth, require_auth},
    error::{ApiError, ApiResult},
    state::AppState,
};

/// First hop of X-Forwarded-For, or X-Real-IP
pub fn extract_client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|h| h.to_str().ok())
                .map(str::trim)
                .filter(|ip| !ip.is_empty())
        })
        .unwrap_or("unknown-ip")
        .to_string()
}

/// Count a request from the caller's IP against the shared limiter
pub(crate) async fn enforce_rate_limit(
    state: &AppState,
    headers: &HeaderMap,
    scope: &str,
) -> ApiResult<()> {
    let ip = extract_client_ip(headers);
    let result = state.rate_limiter.check(&format!("{}:{}", scope, ip)).await;
    if result.allowed {
        return Ok(());
    }
    tracing::warn!(client_ip = %ip, scope = scope, "Rate limit exceeded");
    Err(ApiError::TooManyRequests {
        retry_after: result.retry_after_seconds.unwrap_or(1),
    })
}

pub fn create_router(state: AppState) -> Router {
    let auth_state = state.auth_state();

    let public_routes = Router::new()
        .route("/health", get(health::health))
        .route("/api/v1/license-key/redeem", post(licenses::redeem_license))
        .route("/api/v1/redeem-codes/{code}", get(redeem_codes::check_code))
        .route("/api/webhooks/appsumo", post(webhooks::appsumo_webhook))
        .route("/api/webhooks/lemonsqueezy", post(webhooks::lemon_webhook));

    // Anonymous callers may validate; a signed-in caller is linked as owner
    let validate_routes = Router::new()
        .route("/api/v1/license-key/validate", post(licenses::validate_license))
        .route_layer(middleware::from_fn_with_state(
            auth_state.clone(),
            optional_auth,
        ));

    let user_routes = Router::new()
        .route("/api/v1/me/licenses", get(licenses::my_licenses))
        .route(
            "/api/v1/me/licenses/{key}/sublicenses",
            get(sublicenses::my_sub_licenses),
        )
        .route(
            "/api/v1/me/sublicenses",
            put(sublicenses::update_my_sub_license),
        )
        .route("/api/v1/me/plans", get(licenses::my_plans))
        .route("/api/v1/me/credits", get(credits::my_credits))
        .route("/api/v1/me/credits/spend", post(credits::spend_credits))
        .route("/api/v1/me/credits/transfer", post(credits::transfer_credits))
        .route("/api/v1/me/redeem-codes/claim", post(redeem_codes::claim_code));

    // Role checks happen in each handler
    let admin_routes = Router::new()
        .route("/api/v1/admin/users", get(admin::list_users))
        .route("/api/v1/admin/users/{id}", delete(admin::delete_user))
        .route("/api/v1/admin/credits", post(admin::adjust_credits))
        .route(
            "/api/v1/admin/licenses/sublicenses",
            get(sublicenses::list_sub_licenses)
                .post(sublicenses::create_sub_licenses)
                .put(sublicenses::update_sub_license),
        )
        .route(
            "/api/v1/admin/licenses/{key}/transfer",
            post(admin::transfer_license),
        )
        .route(
            "/api/v1/admin/licenses/{key}/convert-to-team",
            post(admin::convert_to_team),
        )
        .route(
            "/api/v1/admin/licenses/{key}/deactivate",
            post(admin::deactivate_license),
        )
        .route(
            "/api/v1/admin/licenses/{key}/reactivate",
            post(admin::reactivate_license),
        )
        .route("/api/v1/admin/invariants", get(admin::check_invariants))
        .route("/api/v1/admin/stats", get(admin::get_stats))
        .route(
            "/api/v1/admin/redeem-codes",
            get(redeem_codes::list_batches).post(redeem_codes::create_batch),
        )
        .route("/api/v1/admin/webhooks", get(admin::list_webhook_events));

    let protected_routes = user_routes
        .merge(admin_routes)
        .route_layer(middleware::from_fn_with_state(auth_state, require_auth));

    Router::new()
        .merge(public_routes)
        .merge(validate_routes)
        .merge(protected_routes)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::{
        body::Body,
        http::{header, HeaderValue, Request, StatusCode},
    };
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_config() -> Config {
        Config {
            database_url: "postgres://localhost/olly_test".into(),
            database_direct_url: None,
            bind_address: "127.0.0.1:0".into(),
            jwt_secret: "router-test-secret".into(),
            jwt_expiry_hours: 1,
            appsumo_webhook_secret: None,
            lemon_webhook_secret: Some("lemon-secret".into()),
            rate_limit_max: 2,
            rate_limit_window: Duration::from_secs(60),
            rate_limit_max_keys: 1_000,
            stats_cache_ttl: Duration::from_secs(60),
            run_migrations: false,
        }
    }

    /// State over a pool that never connects; only routes rejected before any
    /// query are exercised here.
    fn test_state() -> AppState {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .acquire_timeout(Duration::from_millis(200))
            .connect_lazy("postgres://localhost/olly_test")
            .unwrap();
        AppState::new(pool, test_config())
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, body)
    }

    fn json_post(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[test]
    fn test_extract_client_ip() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_client_ip(&headers), "unknown-ip");

        headers.insert("x-real-ip", HeaderValue::from_static("10.0.0.2"));
        assert_eq!(extract_client_ip(&headers), "10.0.0.2");

        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        assert_eq!(extract_client_ip(&headers), "203.0.113.7");
    }

    #[tokio::test]
    async fn test_health() {
        let app = create_router(test_state());
        let (status, body) = send(
            app,
            Request::builder().uri("/health").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_protected_routes_require_auth() {
        let state = test_state();
        for uri in [
            "/api/v1/me/licenses",
            "/api/v1/me/credits",
            "/api/v1/admin/stats",
            "/api/v1/admin/redeem-codes",
        ] {
            let (status, body) = send(
                create_router(state.clone()),
                Request::builder().uri(uri).body(Body::empty()).unwrap(),
            )
            .await;
            assert_eq!(status, StatusCode::UNAUTHORIZED, "{}", uri);
            assert_eq!(body["code"], 401);
        }
    }

    #[tokio::test]
    async fn test_redeem_code_claim_requires_auth() {
        let (status, _) = send(
            create_router(test_state()),
            json_post("/api/v1/me/redeem-codes/claim", r#"{"code":"AB12CD34EF"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_invalid_token_rejected() {
        let (status, _) = send(
            create_router(test_state()),
            Request::builder()
                .uri("/api/v1/me/plans")
                .header(header::AUTHORIZATION, "Bearer not-a-jwt")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_redeem_rejects_unknown_vendor() {
        let (status, body) = send(
            create_router(test_state()),
            json_post(
                "/api/v1/license-key/redeem",
                r#"{"email":"a@b.co","licenseKey":"KEY-1","vendor":"gumroad"}"#,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Unknown vendor: gumroad");
    }

    #[tokio::test]
    async fn test_public_license_routes_rate_limited() {
        let state = test_state();
        let body = r#"{"email":"a@b.co","licenseKey":"KEY-1","vendor":"nope"}"#;

        // Limit is 2 per window in the test config
        for _ in 0..2 {
            let (status, _) =
                send(create_router(state.clone()), json_post("/api/v1/license-key/redeem", body)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
        }

        let response = create_router(state)
            .oneshot(json_post("/api/v1/license-key/redeem", body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key(header::RETRY_AFTER));
    }

    #[tokio::test]
    async fn test_webhook_missing_headers() {
        let (status, _) = send(
            create_router(test_state()),
            json_post("/api/webhooks/lemonsqueezy", "{}"),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            create_router(test_state()),
            json_post("/api/webhooks/appsumo", "{}"),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_webhook_without_secret_unavailable() {
        let mut request = json_post("/api/webhooks/appsumo", "{}");
        request
            .headers_mut()
            .insert("x-appsumo-timestamp", HeaderValue::from_static("1700000000000"));
        request
            .headers_mut()
            .insert("x-appsumo-signature", HeaderValue::from_static("abcd"));

        let (status, _) = send(create_router(test_state()), request).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_webhook_bad_signature_unauthorized() {
        let mut request = json_post("/api/webhooks/lemonsqueezy", r#"{"meta":{}}"#);
        request
            .headers_mut()
            .insert("x-signature", HeaderValue::from_static("00ff"));

        let (status, body) = send(create_router(test_state()), request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], 401);
    }
}
