//! Credit balance, spending and transfers for the signed-in user

use axum::{
    extract::{Query, State},
    Extension, Json,
};
use olly_entitlements::{CreditEntry, CreditTransactionRow, TransferOutcome};
use serde::{Deserialize, Serialize};

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct CreditHistoryQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct CreditsResponse {
    pub balance: i64,
    pub transactions: Vec<CreditTransactionRow>,
}

/// GET /api/v1/me/credits
pub async fn my_credits(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<CreditHistoryQuery>,
) -> ApiResult<Json<CreditsResponse>> {
    let credits = &state.entitlements.credits;
    let balance = credits.balance(auth_user.user_id).await?;
    let transactions = credits
        .history(auth_user.user_id, query.limit.unwrap_or(50))
        .await?;
    Ok(Json(CreditsResponse {
        balance,
        transactions,
    }))
}

#[derive(Debug, Deserialize)]
pub struct SpendCreditsRequest {
    pub amount: i64,
    /// What the credits were spent on, recorded in the ledger description
    pub action: String,
}

/// POST /api/v1/me/credits/spend
pub async fn spend_credits(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<SpendCreditsRequest>,
) -> ApiResult<Json<CreditEntry>> {
    let action = req.action.trim();
    if action.is_empty() {
        return Err(ApiError::BadRequest("Action is required".into()));
    }
    let entry = state
        .entitlements
        .credits
        .spend(auth_user.user_id, req.amount, action)
        .await?;
    Ok(Json(entry))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferCreditsRequest {
    pub recipient_email: String,
    pub amount: i64,
}

/// POST /api/v1/me/credits/transfer
pub async fn transfer_credits(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<TransferCreditsRequest>,
) -> ApiResult<Json<TransferOutcome>> {
    if req.recipient_email.trim().eq_ignore_ascii_case(&auth_user.email) {
        return Err(ApiError::BadRequest("Cannot transfer credits to yourself".into()));
    }
    let outcome = state
        .entitlements
        .credits
        .transfer_to_email(auth_user.user_id, &req.recipient_email, req.amount)
        .await?;

    tracing::info!(
        sender_id = %auth_user.user_id,
        recipient_id = %outcome.recipient_id,
        amount = outcome.amount,
        "Credits transferred"
    );
    Ok(Json(outcome))
}
