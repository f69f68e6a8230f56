//! Promotional redeem codes: admin batches, public lookup and claiming

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Extension, Json,
};
use olly_entitlements::{
    redeem_codes::DEFAULT_VALIDITY_DAYS, NewRedeemBatch, RedeemBatchCreated, RedeemBatchPage, RedeemClaim,
    RedeemCodeInfo,
};
use olly_shared::PlanTier;
use serde::Deserialize;

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    routes::enforce_rate_limit,
    state::AppState,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBatchRequest {
    pub name: Option<String>,
    pub campaign: Option<String>,
    #[serde(default = "default_quantity")]
    pub quantity: i32,
    #[serde(default = "default_validity_days")]
    pub validity_days: i64,
    /// `T1`..`T4`; defaults to T1
    pub tier: Option<String>,
    #[serde(default)]
    pub credits: i64,
}

fn default_quantity() -> i32 {
    10
}

fn default_validity_days() -> i64 {
    DEFAULT_VALIDITY_DAYS
}

/// POST /api/v1/admin/redeem-codes
pub async fn create_batch(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<CreateBatchRequest>,
) -> ApiResult<Json<RedeemBatchCreated>> {
    auth_user.require_admin()?;

    let tier = match req.tier.as_deref() {
        Some(tier) => tier.parse::<PlanTier>().map_err(ApiError::BadRequest)?,
        None => PlanTier::T1,
    };
    let created = state
        .entitlements
        .redeem_codes
        .create_batch(NewRedeemBatch {
            name: req.name,
            campaign: req.campaign,
            quantity: req.quantity,
            validity_days: req.validity_days,
            tier,
            credits: req.credits,
            created_by: Some(auth_user.user_id),
        })
        .await?;
    state.stats_cache.invalidate_all();

    tracing::info!(
        admin_id = %auth_user.user_id,
        batch_id = %created.batch.id,
        codes = created.codes.len(),
        "Admin created redeem codes"
    );
    Ok(Json(created))
}

#[derive(Debug, Deserialize)]
pub struct ListBatchesQuery {
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

/// GET /api/v1/admin/redeem-codes
pub async fn list_batches(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<ListBatchesQuery>,
) -> ApiResult<Json<RedeemBatchPage>> {
    auth_user.require_admin()?;
    let page = state
        .entitlements
        .redeem_codes
        .list_batches(query.page.unwrap_or(1), query.limit.unwrap_or(10))
        .await?;
    Ok(Json(page))
}

/// GET /api/v1/redeem-codes/{code}
pub async fn check_code(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(code): Path<String>,
) -> ApiResult<Json<RedeemCodeInfo>> {
    enforce_rate_limit(&state, &headers, "redeem-code").await?;
    let info = state.entitlements.redeem_codes.check(&code).await?;
    Ok(Json(info))
}

#[derive(Debug, Deserialize)]
pub struct ClaimCodeRequest {
    pub code: String,
}

/// POST /api/v1/me/redeem-codes/claim
pub async fn claim_code(
    State(state): State<AppState>,
    headers: HeaderMap,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<ClaimCodeRequest>,
) -> ApiResult<Json<RedeemClaim>> {
    enforce_rate_limit(&state, &headers, "redeem-code").await?;
    if req.code.trim().is_empty() {
        return Err(ApiError::BadRequest("Missing redeem code".into()));
    }

    let claim = state
        .entitlements
        .redeem_codes
        .claim(&req.code, auth_user.user_id)
        .await?;
    state.stats_cache.invalidate_all();
    Ok(Json(claim))
}
