//! License validation, redemption and the caller's own licenses

use axum::{extract::State, http::HeaderMap, Extension, Json};
use olly_entitlements::{LicenseValidation, OwnedLicense, RedeemRequest, RedeemResult, UserPlans};
use olly_shared::Vendor;
use serde::{Deserialize, Serialize};

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    routes::enforce_rate_limit,
    state::AppState,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateLicenseRequest {
    pub license_key: String,
    /// Record an activation and return an activation token
    #[serde(default)]
    pub activate: bool,
}

/// POST /api/v1/license-key/validate
pub async fn validate_license(
    State(state): State<AppState>,
    headers: HeaderMap,
    auth_user: Option<Extension<AuthUser>>,
    Json(req): Json<ValidateLicenseRequest>,
) -> ApiResult<Json<LicenseValidation>> {
    enforce_rate_limit(&state, &headers, "validate").await?;

    let user_id = auth_user.map(|Extension(user)| user.user_id);
    let validation = state
        .entitlements
        .licenses
        .validate(&req.license_key, user_id, req.activate)
        .await?;

    tracing::info!(
        license_key = %validation.license_key,
        is_valid = validation.is_valid,
        is_sublicense = validation.is_sublicense,
        activated = req.activate,
        "License key validated"
    );
    Ok(Json(validation))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedeemLicenseRequest {
    pub email: String,
    pub license_key: String,
    pub vendor: String,
    pub name: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// POST /api/v1/license-key/redeem
pub async fn redeem_license(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<RedeemLicenseRequest>,
) -> ApiResult<Json<RedeemResult>> {
    enforce_rate_limit(&state, &headers, "redeem").await?;

    let vendor: Vendor = req.vendor.parse().map_err(ApiError::BadRequest)?;
    let result = state
        .entitlements
        .licenses
        .redeem(RedeemRequest {
            email: &req.email,
            license_key: &req.license_key,
            vendor,
            name: req.name.as_deref(),
            username: req.username.as_deref(),
            password: req.password.as_deref(),
        })
        .await?;
    Ok(Json(result))
}

#[derive(Debug, Serialize)]
pub struct MyLicensesResponse {
    pub licenses: Vec<OwnedLicense>,
}

/// GET /api/v1/me/licenses
pub async fn my_licenses(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<MyLicensesResponse>> {
    let licenses = state
        .entitlements
        .licenses
        .list_for_user(auth_user.user_id)
        .await?;
    Ok(Json(MyLicensesResponse { licenses }))
}

/// GET /api/v1/me/plans
pub async fn my_plans(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<UserPlans>> {
    let plans = state
        .entitlements
        .licenses
        .user_plans(auth_user.user_id)
        .await?;
    Ok(Json(plans))
}
