//! Vendor webhook endpoints
//!
//! Both handlers verify the signature over the raw body before parsing it.
//! Side-effect failures after the primary write come back in `errors` with a
//! 200 so the vendor does not retry a delivery that was mostly applied.

use axum::{body::Bytes, extract::State, http::HeaderMap, Json};
use olly_entitlements::{verify_appsumo, verify_lemon, WebhookOutcome};
use serde::Serialize;
use time::OffsetDateTime;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

const APPSUMO_TIMESTAMP_HEADER: &str = "x-appsumo-timestamp";
const APPSUMO_SIGNATURE_HEADER: &str = "x-appsumo-signature";
const LEMON_SIGNATURE_HEADER: &str = "x-signature";

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub success: bool,
    pub message: &'static str,
    #[serde(flatten)]
    pub outcome: WebhookOutcome,
}

impl From<WebhookOutcome> for WebhookResponse {
    fn from(outcome: WebhookOutcome) -> Self {
        Self {
            success: true,
            message: "Webhook processed",
            outcome,
        }
    }
}

fn required_header<'a>(headers: &'a HeaderMap, name: &str) -> ApiResult<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::BadRequest("Missing required headers".into()))
}

fn configured_secret<'a>(secret: &'a Option<String>, vendor: &str) -> ApiResult<&'a str> {
    secret.as_deref().ok_or_else(|| {
        tracing::error!(vendor = vendor, "Webhook received but no secret is configured");
        ApiError::ServiceUnavailable("Webhook processing is not configured".into())
    })
}

/// POST /api/webhooks/appsumo
pub async fn appsumo_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<WebhookResponse>> {
    let timestamp = required_header(&headers, APPSUMO_TIMESTAMP_HEADER)?;
    let signature = required_header(&headers, APPSUMO_SIGNATURE_HEADER)?;
    let secret = configured_secret(&state.config.appsumo_webhook_secret, "appsumo")?;

    verify_appsumo(secret, timestamp, signature, &body, OffsetDateTime::now_utc()).map_err(|e| {
        tracing::warn!(error = %e, "Rejected AppSumo webhook");
        ApiError::from(e)
    })?;

    let outcome = state.entitlements.webhooks.handle_appsumo(&body).await?;
    state.stats_cache.invalidate_all();
    Ok(Json(outcome.into()))
}

/// POST /api/webhooks/lemonsqueezy
pub async fn lemon_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<WebhookResponse>> {
    let signature = required_header(&headers, LEMON_SIGNATURE_HEADER)?;
    let secret = configured_secret(&state.config.lemon_webhook_secret, "lemonsqueezy")?;

    verify_lemon(secret, signature, &body).map_err(|e| {
        tracing::warn!(error = %e, "Rejected LemonSqueezy webhook");
        ApiError::from(e)
    })?;

    let outcome = state.entitlements.webhooks.handle_lemon(&body).await?;
    state.stats_cache.invalidate_all();
    Ok(Json(outcome.into()))
}
