//! Sub-license management, for admins and for main license owners

use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use olly_entitlements::{SubLicenseAction, SubLicenseRow, SubLicenseView};
use serde::{Deserialize, Serialize};

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListSubLicensesQuery {
    pub main_license_key: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubLicenseListResponse {
    pub main_license_key: String,
    pub sub_licenses: Vec<SubLicenseView>,
}

/// GET /api/v1/admin/licenses/sublicenses?mainLicenseKey=
pub async fn list_sub_licenses(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<ListSubLicensesQuery>,
) -> ApiResult<Json<SubLicenseListResponse>> {
    auth_user.require_superadmin()?;

    let main_key = query.main_license_key.trim();
    if main_key.is_empty() {
        return Err(ApiError::BadRequest("Main license key is required".into()));
    }
    let sub_licenses = state.entitlements.sub_licenses.list(main_key).await?;
    Ok(Json(SubLicenseListResponse {
        main_license_key: main_key.to_string(),
        sub_licenses,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSubLicensesRequest {
    pub main_license_key: String,
    pub quantity: i32,
    pub assigned_email: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSubLicensesResponse {
    pub count: usize,
    pub sub_licenses: Vec<SubLicenseRow>,
}

/// POST /api/v1/admin/licenses/sublicenses
pub async fn create_sub_licenses(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<CreateSubLicensesRequest>,
) -> ApiResult<Json<CreateSubLicensesResponse>> {
    auth_user.require_admin()?;

    let sub_licenses = state
        .entitlements
        .sub_licenses
        .create(
            req.main_license_key.trim(),
            req.quantity,
            req.assigned_email.as_deref(),
        )
        .await?;

    tracing::info!(
        admin_id = %auth_user.user_id,
        main_license = %req.main_license_key,
        count = sub_licenses.len(),
        "Admin created sub-licenses"
    );
    Ok(Json(CreateSubLicensesResponse {
        count: sub_licenses.len(),
        sub_licenses,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubLicenseActionRequest {
    pub sub_license_key: String,
    pub action: String,
    pub email: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubLicenseActionResponse {
    pub action: &'static str,
    pub sub_license: SubLicenseRow,
}

/// PUT /api/v1/admin/licenses/sublicenses
pub async fn update_sub_license(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<SubLicenseActionRequest>,
) -> ApiResult<Json<SubLicenseActionResponse>> {
    auth_user.require_admin()?;

    let action = SubLicenseAction::parse(&req.action, req.email.as_deref())?;
    let name = action.name();
    let sub_license = state
        .entitlements
        .sub_licenses
        .apply_action(req.sub_license_key.trim(), action)
        .await?;

    tracing::info!(
        admin_id = %auth_user.user_id,
        sub_license = %sub_license.key,
        action = name,
        "Admin updated sub-license"
    );
    Ok(Json(SubLicenseActionResponse {
        action: name,
        sub_license,
    }))
}

/// GET /api/v1/me/licenses/{key}/sublicenses
pub async fn my_sub_licenses(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(key): Path<String>,
) -> ApiResult<Json<SubLicenseListResponse>> {
    let owned = state
        .entitlements
        .licenses
        .list_for_user(auth_user.user_id)
        .await?;
    let owns_key = owned
        .iter()
        .any(|license| !license.is_sublicense && license.key == key);
    if !owns_key {
        return Err(ApiError::NotFound("License key".into()));
    }

    let sub_licenses = state.entitlements.sub_licenses.list(&key).await?;
    Ok(Json(SubLicenseListResponse {
        main_license_key: key,
        sub_licenses,
    }))
}

/// PUT /api/v1/me/sublicenses
pub async fn update_my_sub_license(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<SubLicenseActionRequest>,
) -> ApiResult<Json<SubLicenseActionResponse>> {
    let action = SubLicenseAction::parse(&req.action, req.email.as_deref())?;
    let name = action.name();
    let sub_license = state
        .entitlements
        .sub_licenses
        .apply_owner_action(auth_user.user_id, req.sub_license_key.trim(), action)
        .await?;
    Ok(Json(SubLicenseActionResponse {
        action: name,
        sub_license,
    }))
}
