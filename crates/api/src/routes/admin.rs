//! Admin routes: users, credits, license state, invariants and stats

use std::collections::HashMap;

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Extension, Json,
};
use olly_entitlements::{
    validate_admin_adjustment, CreditEntry, InvariantCheckSummary, InvariantChecker, LicenseKeyRow,
    TeamConversion, TransferResult, UserSummary, WebhookEventRecord,
};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    routes::extract_client_ip,
    state::AppState,
};

/// Cache key for the single stats entry
const STATS_CACHE_KEY: &str = "entitlement_stats";

/// Log database errors before converting
fn log_db_err(e: sqlx::Error) -> ApiError {
    tracing::error!(error = %e, "Admin query failed");
    ApiError::from(e)
}

// =============================================================================
// Users
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct ListUsersQuery {
    pub page: Option<i64>,
    pub limit: Option<i64>,
    pub email: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AdminUserListResponse {
    pub users: Vec<UserSummary>,
    pub total: i64,
    pub page: i64,
    pub limit: i64,
}

/// GET /api/v1/admin/users
pub async fn list_users(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<ListUsersQuery>,
) -> ApiResult<Json<AdminUserListResponse>> {
    auth_user.require_admin()?;

    let page = query.page.unwrap_or(1).max(1);
    let limit = query.limit.unwrap_or(50).clamp(1, 100);
    let result = state
        .entitlements
        .accounts
        .list_users(query.email.as_deref(), page, limit)
        .await?;

    Ok(Json(AdminUserListResponse {
        users: result.users,
        total: result.total,
        page,
        limit,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteUserResponse {
    pub user_id: Uuid,
    pub message: String,
}

/// DELETE /api/v1/admin/users/{id}
pub async fn delete_user(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    headers: HeaderMap,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Json<DeleteUserResponse>> {
    auth_user.require_superadmin()?;

    if user_id == auth_user.user_id {
        return Err(ApiError::BadRequest(
            "Cannot delete your own account".to_string(),
        ));
    }

    state.entitlements.accounts.delete_user(user_id).await?;
    state.stats_cache.invalidate_all();

    tracing::warn!(
        admin_id = %auth_user.user_id,
        target_user_id = %user_id,
        client_ip = %extract_client_ip(&headers),
        "Admin deleted user"
    );

    Ok(Json(DeleteUserResponse {
        user_id,
        message: "User account deleted permanently".to_string(),
    }))
}

// =============================================================================
// Credits
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct AdjustCreditsRequest {
    pub email: String,
    /// Signed; negative amounts remove credits
    pub amount: i64,
}

/// POST /api/v1/admin/credits
pub async fn adjust_credits(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<AdjustCreditsRequest>,
) -> ApiResult<Json<CreditEntry>> {
    auth_user.require_admin()?;

    validate_admin_adjustment(req.amount)?;
    let entry = state
        .entitlements
        .credits
        .admin_adjust_by_email(&req.email, req.amount)
        .await?;

    tracing::info!(
        admin_id = %auth_user.user_id,
        user_id = %entry.user_id,
        amount = entry.amount,
        balance_after = entry.balance_after,
        "Admin adjusted credits"
    );
    Ok(Json(entry))
}

// =============================================================================
// License state
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferLicenseRequest {
    pub new_owner_email: String,
}

/// POST /api/v1/admin/licenses/{key}/transfer
pub async fn transfer_license(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(key): Path<String>,
    Json(req): Json<TransferLicenseRequest>,
) -> ApiResult<Json<TransferResult>> {
    auth_user.require_admin()?;

    let result = state
        .entitlements
        .licenses
        .transfer(&key, &req.new_owner_email)
        .await?;
    tracing::info!(
        admin_id = %auth_user.user_id,
        license_key = %result.license_key,
        new_owner_id = %result.new_owner_id,
        "Admin transferred license"
    );
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvertToTeamRequest {
    pub license_keys: Vec<String>,
}

/// POST /api/v1/admin/licenses/{key}/convert-to-team
pub async fn convert_to_team(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(key): Path<String>,
    Json(req): Json<ConvertToTeamRequest>,
) -> ApiResult<Json<TeamConversion>> {
    auth_user.require_admin()?;

    let result = state
        .entitlements
        .licenses
        .convert_to_team(&key, &req.license_keys)
        .await?;
    state.stats_cache.invalidate_all();
    tracing::info!(
        admin_id = %auth_user.user_id,
        license_key = %result.license_key,
        converted = result.converted_keys.len(),
        "Admin converted licenses to a team"
    );
    Ok(Json(result))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LicenseStateResponse {
    pub license_key: String,
    pub vendor: String,
    pub is_active: bool,
    pub deactivated_at: Option<OffsetDateTime>,
}

impl From<LicenseKeyRow> for LicenseStateResponse {
    fn from(row: LicenseKeyRow) -> Self {
        Self {
            license_key: row.key,
            vendor: row.vendor,
            is_active: row.is_active,
            deactivated_at: row.deactivated_at,
        }
    }
}

/// POST /api/v1/admin/licenses/{key}/deactivate
pub async fn deactivate_license(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(key): Path<String>,
) -> ApiResult<Json<LicenseStateResponse>> {
    auth_user.require_admin()?;
    let row = state.entitlements.licenses.deactivate(&key).await?;
    tracing::info!(admin_id = %auth_user.user_id, license_key = %row.key, "Admin deactivated license");
    Ok(Json(row.into()))
}

/// POST /api/v1/admin/licenses/{key}/reactivate
pub async fn reactivate_license(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(key): Path<String>,
) -> ApiResult<Json<LicenseStateResponse>> {
    auth_user.require_admin()?;
    let row = state.entitlements.licenses.reactivate(&key).await?;
    tracing::info!(admin_id = %auth_user.user_id, license_key = %row.key, "Admin reactivated license");
    Ok(Json(row.into()))
}

// =============================================================================
// Invariants
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct InvariantsQuery {
    /// Run a single named check instead of all of them
    pub check: Option<String>,
}

/// GET /api/v1/admin/invariants
pub async fn check_invariants(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    headers: HeaderMap,
    Query(query): Query<InvariantsQuery>,
) -> ApiResult<Json<InvariantCheckSummary>> {
    auth_user.require_admin()?;

    let req_id = Uuid::new_v4();
    tracing::info!(
        %req_id,
        admin_id = %auth_user.user_id,
        client_ip = %extract_client_ip(&headers),
        check = ?query.check,
        "Admin checking entitlement invariants"
    );

    let checker = &state.entitlements.invariants;
    let summary = match query.check.as_deref() {
        Some(name) => {
            if !InvariantChecker::available_checks().contains(&name) {
                return Err(ApiError::BadRequest(format!("Unknown check: {}", name)));
            }
            let violations = checker.run_check(name).await?;
            InvariantCheckSummary::from_violations(OffsetDateTime::now_utc(), 1, violations)
        }
        None => checker.run_all_checks().await.map_err(|e| {
            tracing::error!(%req_id, error = %e, "Failed to run invariant checks");
            ApiError::from(e)
        })?,
    };
    Ok(Json(summary))
}

// =============================================================================
// Stats
// =============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitlementStats {
    pub total_users: i64,
    pub total_licenses: i64,
    pub active_licenses: i64,
    pub licenses_by_vendor: HashMap<String, i64>,
    pub active_sub_licenses: i64,
    pub assigned_sub_licenses: i64,
    pub active_subscriptions: i64,
    pub credits_outstanding: i64,
    pub webhook_errors_24h: i64,
    pub computed_at: OffsetDateTime,
}

#[derive(Debug, FromRow)]
struct VendorCountRow {
    vendor: String,
    count: i64,
}

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    /// Bypass the cache
    #[serde(default)]
    pub fresh: bool,
}

/// GET /api/v1/admin/stats
pub async fn get_stats(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<StatsQuery>,
) -> ApiResult<Json<EntitlementStats>> {
    auth_user.require_admin()?;

    if !query.fresh {
        if let Some(stats) = state.stats_cache.get(&STATS_CACHE_KEY).await {
            return Ok(Json(stats));
        }
    }

    let stats = compute_stats(&state).await?;
    state.stats_cache.insert(STATS_CACHE_KEY, stats.clone()).await;
    Ok(Json(stats))
}

async fn compute_stats(state: &AppState) -> ApiResult<EntitlementStats> {
    let pool = &state.pool;

    let total_users: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users")
        .fetch_one(pool)
        .await
        .map_err(log_db_err)?;

    let licenses: (i64, i64) = sqlx::query_as(
        "SELECT COUNT(*), COUNT(*) FILTER (WHERE is_active) FROM license_keys",
    )
    .fetch_one(pool)
    .await
    .map_err(log_db_err)?;

    let vendor_counts: Vec<VendorCountRow> = sqlx::query_as(
        "SELECT vendor, COUNT(*) AS count FROM license_keys GROUP BY vendor",
    )
    .fetch_all(pool)
    .await
    .map_err(log_db_err)?;

    let sub_licenses: (i64, i64) = sqlx::query_as(
        r#"
        SELECT COUNT(*) FILTER (WHERE status = 'ACTIVE'),
               COUNT(*) FILTER (WHERE status = 'ACTIVE' AND assigned_email IS NOT NULL)
        FROM sub_licenses
        "#,
    )
    .fetch_one(pool)
    .await
    .map_err(log_db_err)?;

    let active_subscriptions: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM user_subscriptions WHERE status = 'ACTIVE'")
            .fetch_one(pool)
            .await
            .map_err(log_db_err)?;

    let credits_outstanding: (i64,) =
        sqlx::query_as("SELECT COALESCE(SUM(balance), 0)::BIGINT FROM user_credits")
            .fetch_one(pool)
            .await
            .map_err(log_db_err)?;

    let webhook_errors: (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(*)
        FROM vendor_webhook_events
        WHERE processing_result = 'error'
          AND created_at > NOW() - interval '24 hours'
        "#,
    )
    .fetch_one(pool)
    .await
    .map_err(log_db_err)?;

    let licenses_by_vendor = vendor_counts
        .into_iter()
        .map(|row| (row.vendor, row.count))
        .collect();

    Ok(EntitlementStats {
        total_users: total_users.0,
        total_licenses: licenses.0,
        active_licenses: licenses.1,
        licenses_by_vendor,
        active_sub_licenses: sub_licenses.0,
        assigned_sub_licenses: sub_licenses.1,
        active_subscriptions: active_subscriptions.0,
        credits_outstanding: credits_outstanding.0,
        webhook_errors_24h: webhook_errors.0,
        computed_at: OffsetDateTime::now_utc(),
    })
}

// =============================================================================
// Webhook deliveries
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct ListWebhooksQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct WebhookEventListResponse {
    pub events: Vec<WebhookEventRecord>,
}

/// GET /api/v1/admin/webhooks
pub async fn list_webhook_events(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<ListWebhooksQuery>,
) -> ApiResult<Json<WebhookEventListResponse>> {
    auth_user.require_admin()?;

    let status = query.status.as_deref().map(str::trim).filter(|s| !s.is_empty());
    if let Some(status) = status {
        if !matches!(status, "processing" | "success" | "error") {
            return Err(ApiError::BadRequest(format!("Invalid status: {}", status)));
        }
    }

    let events = state
        .entitlements
        .webhooks
        .list_events(status, query.limit.unwrap_or(50), query.offset.unwrap_or(0))
        .await?;
    Ok(Json(WebhookEventListResponse { events }))
}
