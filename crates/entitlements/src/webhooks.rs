//! Vendor webhooks: AppSumo license events and LemonSqueezy orders, license
//! keys and subscriptions
//!
//! Every delivery is claimed in `vendor_webhook_events` before it is
//! processed, so a redelivered payload is acknowledged without running twice.
//! The primary license write runs in one transaction; follow-up steps (plan,
//! credits, subscriptions) run in their own and report failures in
//! [`WebhookOutcome::errors`] instead of failing the delivery.

use hmac::{Hmac, Mac};
use olly_shared::{
    with_backoff, PlanTier, RetryPolicy, SubLicenseStatus, TransactionType, Vendor,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::{FromRow, PgConnection, PgPool};
use subtle::ConstantTimeEq;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::accounts::{find_or_create_user, find_user_by_email};
use crate::credits::apply_delta;
use crate::error::{EntitlementError, EntitlementResult};
use crate::licenses::{
    find_license, link_owner, owners_of, set_license_active, upsert_license, LicenseKeyRow,
    LicenseUpsert,
};
use crate::model::{tier_credit_delta, BalancePolicy};
use crate::plans::{
    apply_lemon_subscription_event, apply_plan_update, cancel_active_subscriptions, json_id,
    LemonSubscriptionAttributes, LemonSubscriptionEvent, PlanUpdate,
};
use crate::sublicenses::{
    ensure_vendor_sub_licenses, find_sub_license, set_all_sub_license_status, SubLicenseRow,
};
use crate::vendor::{sub_license_count, tier_plan_credits, VendorCatalog};

type HmacSha256 = Hmac<Sha256>;

/// AppSumo timestamps older than this are rejected
pub const APPSUMO_TIMESTAMP_TOLERANCE_MS: i128 = 5 * 60 * 1000;

/// Events stuck in `processing` longer than this may be claimed again
const PROCESSING_TIMEOUT_MINUTES: i32 = 30;

// =============================================================================
// Signature verification
// =============================================================================

fn signature_matches(secret: &str, message: &[&[u8]], signature: &str) -> bool {
    let Ok(provided) = hex::decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    for part in message {
        mac.update(part);
    }
    let expected = mac.finalize().into_bytes();
    expected.as_slice().ct_eq(provided.as_slice()).into()
}

/// Check an AppSumo delivery. The signature is HMAC-SHA256 over the
/// millisecond timestamp header followed by the raw body.
pub fn verify_appsumo(
    secret: &str,
    timestamp: &str,
    signature: &str,
    body: &[u8],
    now: OffsetDateTime,
) -> EntitlementResult<()> {
    let sent_ms: i128 = timestamp
        .trim()
        .parse()
        .map_err(|_| EntitlementError::WebhookTimestampStale)?;
    let now_ms = now.unix_timestamp_nanos() / 1_000_000;
    if sent_ms > now_ms || now_ms - sent_ms > APPSUMO_TIMESTAMP_TOLERANCE_MS {
        return Err(EntitlementError::WebhookTimestampStale);
    }

    if !signature_matches(secret, &[timestamp.trim().as_bytes(), body], signature) {
        return Err(EntitlementError::WebhookSignatureInvalid);
    }
    Ok(())
}

/// Check a LemonSqueezy delivery (`X-Signature`, HMAC-SHA256 of the body)
pub fn verify_lemon(secret: &str, signature: &str, body: &[u8]) -> EntitlementResult<()> {
    if signature_matches(secret, &[body], signature) {
        Ok(())
    } else {
        Err(EntitlementError::WebhookSignatureInvalid)
    }
}

/// Stable id for a delivery; vendors resend the same body on retry
pub fn event_fingerprint(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

// =============================================================================
// Payloads
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct AppSumoPayload {
    pub event: String,
    pub license_key: String,
    #[serde(default)]
    pub prev_license_key: Option<String>,
    #[serde(default)]
    pub plan_id: Option<String>,
    #[serde(default)]
    pub license_status: Option<String>,
    #[serde(default)]
    pub tier: Option<i32>,
    #[serde(default)]
    pub test: bool,
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub user_email: Option<String>,
}

impl AppSumoPayload {
    fn email(&self) -> Option<&str> {
        self.user_email.as_deref().map(str::trim).filter(|e| !e.is_empty())
    }

    fn previous_key(&self) -> Option<&str> {
        self.prev_license_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty() && *k != self.license_key.trim())
    }

    /// Tier on the payload; out-of-range values fall back to Individual
    fn tier(&self) -> PlanTier {
        let n = self.tier.unwrap_or(1);
        PlanTier::from_number(n).unwrap_or_else(|| {
            tracing::warn!(tier = n, license_key = %self.license_key, "Invalid AppSumo tier, using 1");
            PlanTier::T1
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppSumoAction {
    Purchase,
    Activate,
    Upgrade,
    Downgrade,
    Deactivate,
    Refund,
    Unknown(String),
}

impl AppSumoAction {
    pub fn parse(event: &str) -> Self {
        match event.trim().to_ascii_lowercase().as_str() {
            "purchase" => Self::Purchase,
            "activate" => Self::Activate,
            "upgrade" => Self::Upgrade,
            "downgrade" => Self::Downgrade,
            "deactivate" => Self::Deactivate,
            "refund" => Self::Refund,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// License status the event leaves the key in
    pub fn status(&self) -> &'static str {
        match self {
            Self::Purchase | Self::Activate | Self::Upgrade | Self::Downgrade => "ACTIVE",
            Self::Deactivate | Self::Refund => "INACTIVE",
            Self::Unknown(_) => "UNKNOWN",
        }
    }

    fn is_plan_change(&self) -> bool {
        matches!(self, Self::Upgrade | Self::Downgrade)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LemonPayload {
    pub meta: LemonMeta,
    pub data: LemonData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LemonMeta {
    pub event_name: String,
    #[serde(default)]
    pub webhook_id: Option<String>,
    #[serde(default)]
    pub custom_data: Option<LemonCustomData>,
}

/// Checkout custom data. LemonSqueezy forwards it as sent, so values arrive
/// as strings or numbers.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LemonCustomData {
    #[serde(default)]
    pub is_credit_purchase: Option<serde_json::Value>,
    #[serde(default)]
    pub credits: Option<serde_json::Value>,
}

impl LemonCustomData {
    pub fn is_credit_purchase(&self) -> bool {
        match &self.is_credit_purchase {
            Some(serde_json::Value::String(s)) => s == "true",
            Some(serde_json::Value::Bool(b)) => *b,
            _ => false,
        }
    }

    pub fn credits(&self) -> Option<i64> {
        match self.credits.as_ref()? {
            serde_json::Value::String(s) => s.trim().parse().ok(),
            serde_json::Value::Number(n) => n.as_i64(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LemonData {
    pub id: serde_json::Value,
    #[serde(default)]
    pub attributes: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LemonOrderAttributes {
    pub user_email: String,
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub total: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub product_id: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LemonLicenseAttributes {
    pub key: String,
    #[serde(default)]
    pub status: Option<String>,
    pub product_id: serde_json::Value,
    pub user_email: String,
    #[serde(default)]
    pub user_name: Option<String>,
}

/// `active` maps to ACTIVE; `expired`, `disabled`, `inactive` and anything
/// unrecognized map to INACTIVE
pub fn lemon_license_status(status: Option<&str>) -> SubLicenseStatus {
    match status.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
        Some("active") => SubLicenseStatus::Active,
        Some("expired" | "disabled" | "inactive") => SubLicenseStatus::Inactive,
        other => {
            tracing::warn!(status = ?other, "Unknown LemonSqueezy license status, treating as inactive");
            SubLicenseStatus::Inactive
        }
    }
}

fn parse_payload<T: for<'de> Deserialize<'de>>(value: serde_json::Value, what: &str) -> EntitlementResult<T> {
    serde_json::from_value(value)
        .map_err(|e| EntitlementError::InvalidInput(format!("Invalid {} payload: {}", what, e)))
}

// =============================================================================
// Results
// =============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookOutcome {
    pub event: String,
    pub status: String,
    /// True when the delivery was seen before and not processed again
    pub duplicate: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl WebhookOutcome {
    fn new(event: &str, status: &str) -> Self {
        Self {
            event: event.to_string(),
            status: status.to_string(),
            duplicate: false,
            errors: Vec::new(),
        }
    }

    fn duplicate(event: &str) -> Self {
        Self {
            duplicate: true,
            ..Self::new(event, "DUPLICATE")
        }
    }

    /// Record a failed follow-up step without failing the delivery
    fn push_error(&mut self, message: &str, err: &EntitlementError) {
        tracing::warn!(event = %self.event, error = %err, "{}", message);
        self.errors.push(message.to_string());
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEventRecord {
    pub id: Uuid,
    pub vendor: String,
    pub event_id: String,
    pub event_type: String,
    pub processing_result: String,
    pub error_message: Option<String>,
    pub processing_started_at: OffsetDateTime,
    pub created_at: OffsetDateTime,
}

/// What the AppSumo license write left behind for the follow-up steps
struct AppSumoWrite {
    license: LicenseKeyRow,
    tier: PlanTier,
    /// Owner carried over from the previous key on upgrade or downgrade
    previous_owner: Option<Uuid>,
    previous_tier: PlanTier,
}

#[derive(Debug, FromRow)]
struct ConvertedSeatRow {
    key: String,
    status: String,
    assigned_user_id: Option<Uuid>,
    original_license_key: Option<String>,
}

/// Turn every converted seat of a team license back into an independent
/// individual license owned by the seat holder, and clear the team flag
async fn release_team_seats(conn: &mut PgConnection, team: &LicenseKeyRow) -> EntitlementResult<usize> {
    let seats: Vec<ConvertedSeatRow> = sqlx::query_as(
        r#"
        DELETE FROM sub_licenses
        WHERE main_license_key_id = $1 AND converted_to_team
        RETURNING key, status, assigned_user_id, original_license_key
        "#,
    )
    .bind(team.id)
    .fetch_all(&mut *conn)
    .await?;

    for seat in &seats {
        let license = upsert_license(
            conn,
            &LicenseUpsert {
                key: &seat.key,
                vendor: Vendor::AppSumo,
                tier: Some(PlanTier::T1.number()),
                plan_id: seat.original_license_key.as_deref(),
                lemon_product_id: None,
                is_active: seat.status == SubLicenseStatus::Active.as_str(),
            },
        )
        .await?;
        if let Some(user_id) = seat.assigned_user_id {
            link_owner(conn, user_id, license.id).await?;
        }
    }

    sqlx::query("UPDATE license_keys SET converted_to_team = FALSE, updated_at = NOW() WHERE id = $1")
        .bind(team.id)
        .execute(&mut *conn)
        .await?;
    Ok(seats.len())
}

/// Retire a converted seat whose holder moved to a license of their own.
/// A team left without active seats drops back to an individual license.
async fn leave_team(conn: &mut PgConnection, seat: &SubLicenseRow) -> EntitlementResult<()> {
    sqlx::query(
        r#"
        UPDATE sub_licenses
        SET status = 'INACTIVE', deactivated_at = NOW(), converted_to_team = FALSE, updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(seat.id)
    .execute(&mut *conn)
    .await?;

    let (remaining,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM sub_licenses WHERE main_license_key_id = $1 AND status = 'ACTIVE'",
    )
    .bind(seat.main_license_key_id)
    .fetch_one(&mut *conn)
    .await?;

    if remaining == 0 {
        sqlx::query(
            "UPDATE license_keys SET tier = 1, converted_to_team = FALSE, updated_at = NOW() WHERE id = $1",
        )
        .bind(seat.main_license_key_id)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

// =============================================================================
// Service
// =============================================================================

#[derive(Clone)]
pub struct WebhookService {
    pool: PgPool,
    catalog: VendorCatalog,
    retry: RetryPolicy,
}

impl WebhookService {
    pub fn new(pool: PgPool, catalog: VendorCatalog) -> Self {
        Self {
            pool,
            catalog,
            retry: RetryPolicy::default(),
        }
    }

    /// Atomically claim a delivery for processing. Returns false when another
    /// worker holds it or it already succeeded. Failed and stuck deliveries
    /// can be claimed again.
    async fn claim(&self, vendor: Vendor, event_id: &str, event_type: &str) -> EntitlementResult<bool> {
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO vendor_webhook_events
                (vendor, event_id, event_type, processing_result, processing_started_at)
            VALUES ($1, $2, $3, 'processing', NOW())
            ON CONFLICT (vendor, event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW(),
                error_message = NULL
            WHERE vendor_webhook_events.processing_result = 'error'
               OR (vendor_webhook_events.processing_result = 'processing'
                   AND vendor_webhook_events.processing_started_at < NOW() - make_interval(mins => $4))
            RETURNING id
            "#,
        )
        .bind(vendor.as_str())
        .bind(event_id)
        .bind(event_type)
        .bind(PROCESSING_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await?;

        if claimed.is_none() {
            let existing: Option<(String,)> = sqlx::query_as(
                "SELECT processing_result FROM vendor_webhook_events WHERE vendor = $1 AND event_id = $2",
            )
            .bind(vendor.as_str())
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await
            .ok()
            .flatten();

            let reason = match existing {
                Some((status,)) if status == "success" => "already processed successfully",
                Some((status,)) if status == "processing" => "currently being processed",
                Some(_) => "exists with another status",
                None => "unknown",
            };
            tracing::info!(
                vendor = %vendor,
                event_id = %event_id,
                event_type = %event_type,
                reason = %reason,
                "Duplicate webhook delivery"
            );
            return Ok(false);
        }
        Ok(true)
    }

    async fn record_result(
        &self,
        vendor: Vendor,
        event_id: &str,
        result: &EntitlementResult<WebhookOutcome>,
    ) {
        let (processing_result, error_message) = match result {
            Ok(_) => ("success", None),
            Err(e) => ("error", Some(e.to_string())),
        };
        let pool = &self.pool;
        let error_ref = error_message.as_deref();

        let updated = with_backoff(self.retry, "webhook audit update", move || {
            sqlx::query(
                r#"
                UPDATE vendor_webhook_events
                SET processing_result = $1, error_message = $2
                WHERE vendor = $3 AND event_id = $4
                "#,
            )
            .bind(processing_result)
            .bind(error_ref)
            .bind(vendor.as_str())
            .bind(event_id)
            .execute(pool)
        })
        .await;

        if let Err(e) = updated {
            tracing::error!(
                vendor = %vendor,
                event_id = %event_id,
                processing_result = %processing_result,
                error = %e,
                "Failed to update webhook audit record; delivery may stay in 'processing'"
            );
        }
    }

    /// Handle a verified AppSumo delivery
    pub async fn handle_appsumo(&self, body: &[u8]) -> EntitlementResult<WebhookOutcome> {
        let payload: AppSumoPayload = serde_json::from_slice(body)
            .map_err(|e| EntitlementError::InvalidInput(format!("Invalid JSON body: {}", e)))?;
        let event_id = event_fingerprint(body);

        if !self.claim(Vendor::AppSumo, &event_id, &payload.event).await? {
            return Ok(WebhookOutcome::duplicate(&payload.event));
        }

        tracing::info!(
            event = %payload.event,
            license_key = %payload.license_key,
            tier = ?payload.tier,
            test = payload.test,
            "Processing AppSumo webhook"
        );
        let result = self.process_appsumo(&payload).await;
        self.record_result(Vendor::AppSumo, &event_id, &result).await;
        result
    }

    async fn process_appsumo(&self, payload: &AppSumoPayload) -> EntitlementResult<WebhookOutcome> {
        let action = AppSumoAction::parse(&payload.event);
        let mut outcome = WebhookOutcome::new(&payload.event, action.status());

        match &action {
            AppSumoAction::Purchase => {
                self.write_appsumo_license(payload, &action).await?;
            }
            AppSumoAction::Activate => {
                let write = self.write_appsumo_license(payload, &action).await?;
                if let Some(email) = payload.email() {
                    match self.appsumo_plan_for_email(email, &write).await {
                        Ok(true) => {}
                        Ok(false) => outcome.errors.push("User not found for plan update".into()),
                        Err(e) => outcome.push_error("Plan update failed but continuing with other operations", &e),
                    }
                }
            }
            AppSumoAction::Upgrade | AppSumoAction::Downgrade => {
                let write = self.write_appsumo_license(payload, &action).await?;
                match write.previous_owner {
                    Some(owner) => {
                        if let Err(e) = self.adjust_plan_change_credits(owner, &write).await {
                            outcome.push_error("Credit adjustment failed", &e);
                        }
                        if let Err(e) = self.update_appsumo_plan(owner, &write).await {
                            outcome.push_error("Plan update failed but continuing with other operations", &e);
                        }
                    }
                    None => outcome
                        .errors
                        .push("User not found for credit adjustment and plan update".into()),
                }
            }
            AppSumoAction::Deactivate => {
                if let Some(email) = payload.email() {
                    match self.cancel_subscriptions_for_email(email).await {
                        Ok(true) => {}
                        Ok(false) => outcome
                            .errors
                            .push("User not found for subscription deactivation".into()),
                        Err(e) => outcome.push_error(
                            "Subscription deactivation failed but continuing with other operations",
                            &e,
                        ),
                    }
                }
                self.deactivate_appsumo_key(&payload.license_key).await?;
            }
            AppSumoAction::Refund => {
                let license = self.deactivate_appsumo_key(&payload.license_key).await?;
                match license {
                    Some(license) => match self.deduct_refund_credits(&license).await {
                        Ok(true) => {}
                        Ok(false) => outcome.errors.push("User not found for credit deduction".into()),
                        Err(e) => outcome.push_error(
                            "Credit deduction failed but continuing with other operations",
                            &e,
                        ),
                    },
                    None => outcome.errors.push("User not found for credit deduction".into()),
                }
            }
            AppSumoAction::Unknown(event) => {
                tracing::info!(event = %event, license_key = %payload.license_key, "Unhandled AppSumo event");
            }
        }

        Ok(outcome)
    }

    /// Upsert the key as ACTIVE, retire the previous key on plan changes and
    /// create any missing seats for the tier
    async fn write_appsumo_license(
        &self,
        payload: &AppSumoPayload,
        action: &AppSumoAction,
    ) -> EntitlementResult<AppSumoWrite> {
        let tier = payload.tier();
        let mut tx = self.pool.begin().await?;

        let previous = match payload.previous_key() {
            Some(prev_key) => find_license(&mut tx, prev_key).await?,
            None => None,
        };
        let mut previous_owner = None;
        let mut previous_tier = PlanTier::T1;
        let mut released_seats = 0;
        let mut left_team = false;
        if let Some(prev) = &previous {
            previous_tier = prev.tier.and_then(PlanTier::from_number).unwrap_or_default();
            previous_owner = owners_of(&mut tx, prev.id).await?.into_iter().next();
            if action.is_plan_change() && prev.converted_to_team {
                released_seats = release_team_seats(&mut tx, prev).await?;
            }
            set_license_active(&mut tx, prev.id, false).await?;
        } else if action.is_plan_change() {
            if let Some(prev_key) = payload.previous_key() {
                let converted_seat = find_sub_license(&mut tx, prev_key)
                    .await?
                    .filter(|seat| seat.converted_to_team);
                if let Some(seat) = converted_seat {
                    previous_owner = seat.assigned_user_id;
                    leave_team(&mut tx, &seat).await?;
                    left_team = true;
                }
            }
        }

        let license = upsert_license(
            &mut tx,
            &LicenseUpsert {
                key: payload.license_key.trim(),
                vendor: Vendor::AppSumo,
                tier: Some(tier.number()),
                plan_id: payload.plan_id.as_deref(),
                lemon_product_id: None,
                is_active: true,
            },
        )
        .await?;

        if action.is_plan_change() {
            let owner = match (previous_owner, payload.email()) {
                (Some(owner), _) => Some(owner),
                (None, Some(email)) => {
                    Some(find_or_create_user(&mut tx, email, payload.user_name.as_deref()).await?.id)
                }
                (None, None) => None,
            };
            if let Some(owner) = owner {
                if let Some(prev) = &previous {
                    sqlx::query("DELETE FROM user_license_keys WHERE user_id = $1 AND license_key_id = $2")
                        .bind(owner)
                        .bind(prev.id)
                        .execute(&mut *tx)
                        .await?;
                }
                link_owner(&mut tx, owner, license.id).await?;
            }
        }

        let seats = ensure_vendor_sub_licenses(
            &mut tx,
            &license,
            Vendor::AppSumo,
            sub_license_count(Vendor::AppSumo, tier),
        )
        .await?;
        tx.commit().await?;

        tracing::info!(
            license_key = %license.key,
            tier = tier.number(),
            previous_key = ?payload.previous_key(),
            seats_created = seats,
            released_seats = released_seats,
            left_team = left_team,
            "AppSumo license written"
        );
        Ok(AppSumoWrite {
            license,
            tier,
            previous_owner,
            previous_tier,
        })
    }

    async fn appsumo_plan_for_email(&self, email: &str, write: &AppSumoWrite) -> EntitlementResult<bool> {
        let user = {
            let mut conn = self.pool.acquire().await?;
            find_user_by_email(&mut conn, email).await?
        };
        match user {
            Some(user) => {
                self.update_appsumo_plan(user.id, write).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn update_appsumo_plan(&self, user_id: Uuid, write: &AppSumoWrite) -> EntitlementResult<()> {
        let mut tx = self.pool.begin().await?;
        apply_plan_update(
            &mut tx,
            &self.catalog,
            &PlanUpdate {
                user_id,
                vendor: Vendor::AppSumo,
                product_id: None,
                appsumo_tier: Some(write.tier.number()),
                end_date: None,
                license_key_id: Some(write.license.id),
            },
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn adjust_plan_change_credits(&self, user_id: Uuid, write: &AppSumoWrite) -> EntitlementResult<()> {
        let delta = tier_credit_delta(write.previous_tier, write.tier);
        if delta == 0 {
            return Ok(());
        }
        let description = format!(
            "Plan change credit adjustment (tier {} to {}): {} credits {}",
            write.previous_tier.number(),
            write.tier.number(),
            delta.unsigned_abs(),
            if delta > 0 { "added" } else { "removed" }
        );
        let mut tx = self.pool.begin().await?;
        apply_delta(
            &mut tx,
            user_id,
            delta,
            TransactionType::PlanCreditsAdjusted,
            &description,
            BalancePolicy::AllowNegative,
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn cancel_subscriptions_for_email(&self, email: &str) -> EntitlementResult<bool> {
        let mut conn = self.pool.acquire().await?;
        let Some(user) = find_user_by_email(&mut conn, email).await? else {
            return Ok(false);
        };
        let cancelled = cancel_active_subscriptions(&mut conn, user.id).await?;
        tracing::info!(user_id = %user.id, cancelled = cancelled, "Subscriptions cancelled by vendor");
        Ok(true)
    }

    /// A sub-license key deactivates just that seat; a main key deactivates
    /// the license and all of its seats. Returns the main license, if any.
    async fn deactivate_appsumo_key(&self, key: &str) -> EntitlementResult<Option<LicenseKeyRow>> {
        let mut tx = self.pool.begin().await?;

        if find_sub_license(&mut tx, key).await?.is_some() {
            sqlx::query(
                r#"
                UPDATE sub_licenses
                SET status = 'INACTIVE', deactivated_at = COALESCE(deactivated_at, NOW()), updated_at = NOW()
                WHERE key = $1
                "#,
            )
            .bind(key.trim())
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            tracing::info!(sub_license = %key, "AppSumo sub-license deactivated");
            return Ok(None);
        }

        let Some(license) = find_license(&mut tx, key).await? else {
            tracing::warn!(license_key = %key, "License key not found for deactivation");
            return Ok(None);
        };
        set_license_active(&mut tx, license.id, false).await?;
        tx.commit().await?;
        tracing::info!(license_key = %license.key, "AppSumo license deactivated");
        Ok(Some(license))
    }

    /// Remove the plan credits of the refunded tier from the owner
    async fn deduct_refund_credits(&self, license: &LicenseKeyRow) -> EntitlementResult<bool> {
        let mut tx = self.pool.begin().await?;
        let Some(owner) = owners_of(&mut tx, license.id).await?.into_iter().next() else {
            return Ok(false);
        };
        let tier = license.tier.and_then(PlanTier::from_number).unwrap_or_default();
        let credits = tier_plan_credits(tier);
        apply_delta(
            &mut tx,
            owner,
            -credits,
            TransactionType::Refunded,
            &format!(
                "Refund credit adjustment (tier {}): {} credits removed",
                tier.number(),
                credits
            ),
            BalancePolicy::AllowNegative,
        )
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Handle a verified LemonSqueezy delivery
    pub async fn handle_lemon(&self, body: &[u8]) -> EntitlementResult<WebhookOutcome> {
        let payload: LemonPayload = serde_json::from_slice(body)
            .map_err(|e| EntitlementError::InvalidInput(format!("Invalid JSON body: {}", e)))?;
        let event_name = payload.meta.event_name.clone();
        let event_id = event_fingerprint(body);

        if !self.claim(Vendor::LemonSqueezy, &event_id, &event_name).await? {
            return Ok(WebhookOutcome::duplicate(&event_name));
        }

        tracing::info!(
            event = %event_name,
            data_id = %json_id(&payload.data.id),
            webhook_id = ?payload.meta.webhook_id,
            "Processing LemonSqueezy webhook"
        );
        let result = self.process_lemon(payload).await;
        self.record_result(Vendor::LemonSqueezy, &event_id, &result).await;
        result
    }

    async fn process_lemon(&self, payload: LemonPayload) -> EntitlementResult<WebhookOutcome> {
        let event_name = payload.meta.event_name.as_str();

        if let Some(event) = LemonSubscriptionEvent::from_event_name(event_name) {
            let mut outcome = WebhookOutcome::new(event_name, event.target_status().as_str());
            let attrs: LemonSubscriptionAttributes = parse_payload(payload.data.attributes, "subscription")?;
            let vendor_sub_id = json_id(&payload.data.id);
            if let Err(e) = self.apply_subscription_event(event, &vendor_sub_id, &attrs).await {
                outcome.push_error("Failed to handle subscription event", &e);
            }
            return Ok(outcome);
        }

        match event_name {
            "order_created" => {
                let attrs: LemonOrderAttributes = parse_payload(payload.data.attributes, "order")?;
                let custom = payload.meta.custom_data.unwrap_or_default();
                self.handle_lemon_order(event_name, &attrs, &custom).await
            }
            "license_key_created" | "license_key_updated" => {
                let attrs: LemonLicenseAttributes = parse_payload(payload.data.attributes, "license key")?;
                self.handle_lemon_license(event_name, &attrs).await
            }
            "license_key_revoked" => {
                let attrs: LemonLicenseAttributes = parse_payload(payload.data.attributes, "license key")?;
                self.handle_lemon_revoke(event_name, &attrs).await
            }
            other => {
                tracing::info!(event = %other, "Unhandled LemonSqueezy event");
                Ok(WebhookOutcome::new(other, "UNKNOWN"))
            }
        }
    }

    async fn apply_subscription_event(
        &self,
        event: LemonSubscriptionEvent,
        vendor_sub_id: &str,
        attrs: &LemonSubscriptionAttributes,
    ) -> EntitlementResult<()> {
        let mut tx = self.pool.begin().await?;
        apply_lemon_subscription_event(&mut tx, &self.catalog, event, vendor_sub_id, attrs).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn handle_lemon_order(
        &self,
        event_name: &str,
        attrs: &LemonOrderAttributes,
        custom: &LemonCustomData,
    ) -> EntitlementResult<WebhookOutcome> {
        let mut outcome = WebhookOutcome::new(event_name, "PROCESSED");
        let product_id = attrs.product_id.as_ref().map(json_id).unwrap_or_default();
        tracing::info!(
            plan_type = %self.catalog.plan_type_label(&product_id, custom.is_credit_purchase()),
            total_cents = ?attrs.total,
            currency = ?attrs.currency,
            "LemonSqueezy order created"
        );

        if !custom.is_credit_purchase() {
            return Ok(outcome);
        }
        let credits = match custom.credits() {
            Some(n) if n > 0 => n,
            _ => {
                outcome.errors.push("Invalid credit amount".into());
                return Ok(outcome);
            }
        };
        if let Err(e) = self.grant_purchased_credits(&attrs.user_email, credits).await {
            outcome.push_error("Failed to update credit balance", &e);
        }
        Ok(outcome)
    }

    async fn grant_purchased_credits(&self, email: &str, credits: i64) -> EntitlementResult<()> {
        let mut tx = self.pool.begin().await?;
        let user = find_user_by_email(&mut tx, email)
            .await?
            .ok_or_else(|| EntitlementError::NotFound(format!("User {}", email)))?;
        apply_delta(
            &mut tx,
            user.id,
            credits,
            TransactionType::Purchased,
            &format!("Purchased {} credits", credits),
            BalancePolicy::AllowNegative,
        )
        .await?;
        tx.commit().await?;
        tracing::info!(user_id = %user.id, credits = credits, "Credit purchase recorded");
        Ok(())
    }

    async fn handle_lemon_license(
        &self,
        event_name: &str,
        attrs: &LemonLicenseAttributes,
    ) -> EntitlementResult<WebhookOutcome> {
        let created = event_name == "license_key_created";
        let status = if created {
            SubLicenseStatus::Active
        } else {
            lemon_license_status(attrs.status.as_deref())
        };
        let mut outcome = WebhookOutcome::new(event_name, status.as_str());
        let product_id = json_id(&attrs.product_id);
        let known_plan = self.catalog.lemon_plan(&product_id);
        let plan = self.catalog.lemon_plan_or_default(&product_id);

        let mut tx = self.pool.begin().await?;
        let user = find_or_create_user(&mut tx, &attrs.user_email, attrs.user_name.as_deref()).await?;
        let license = upsert_license(
            &mut tx,
            &LicenseUpsert {
                key: attrs.key.trim(),
                vendor: Vendor::LemonSqueezy,
                tier: Some(plan.tier.number()),
                plan_id: None,
                lemon_product_id: Some(&product_id),
                is_active: status == SubLicenseStatus::Active,
            },
        )
        .await?;
        link_owner(&mut tx, user.id, license.id).await?;

        if plan.sub_license_count > 0 {
            if status == SubLicenseStatus::Active {
                ensure_vendor_sub_licenses(&mut tx, &license, Vendor::LemonSqueezy, plan.sub_license_count)
                    .await?;
            } else {
                set_all_sub_license_status(&mut tx, license.id, SubLicenseStatus::Inactive).await?;
            }
        }
        tx.commit().await?;

        tracing::info!(
            license_key = %license.key,
            product_id = %product_id,
            status = %status,
            "LemonSqueezy license written"
        );

        let Some(plan) = known_plan else {
            return Ok(outcome);
        };

        if created {
            if let Err(e) = self
                .grant_plan_credits(user.id, plan.plan_credits)
                .await
            {
                outcome.push_error("Failed to add LLM credits", &e);
            }
        }

        if status == SubLicenseStatus::Active {
            let mut tx = self.pool.begin().await?;
            let update = apply_plan_update(
                &mut tx,
                &self.catalog,
                &PlanUpdate {
                    user_id: user.id,
                    vendor: Vendor::LemonSqueezy,
                    product_id: Some(&product_id),
                    appsumo_tier: None,
                    end_date: None,
                    license_key_id: Some(license.id),
                },
            )
            .await;
            match update {
                Ok(_) => tx.commit().await?,
                Err(e) => outcome.push_error("Plan update failed but continuing with other operations", &e),
            }
        } else if let Err(e) = self.cancel_license_subscriptions(license.id).await {
            outcome.push_error("Subscription deactivation failed", &e);
        }

        Ok(outcome)
    }

    async fn grant_plan_credits(&self, user_id: Uuid, credits: i64) -> EntitlementResult<()> {
        let mut tx = self.pool.begin().await?;
        apply_delta(
            &mut tx,
            user_id,
            credits,
            TransactionType::Purchased,
            &format!("Plan included credits: {} LLM credits", credits),
            BalancePolicy::AllowNegative,
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn cancel_license_subscriptions(&self, license_id: Uuid) -> EntitlementResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE user_subscriptions
            SET status = 'CANCELLED', end_date = NOW(), cancelled_at = NOW(), updated_at = NOW()
            WHERE license_key_id = $1 AND status = 'ACTIVE'
            "#,
        )
        .bind(license_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn handle_lemon_revoke(
        &self,
        event_name: &str,
        attrs: &LemonLicenseAttributes,
    ) -> EntitlementResult<WebhookOutcome> {
        let mut outcome = WebhookOutcome::new(event_name, SubLicenseStatus::Inactive.as_str());

        match self.cancel_subscriptions_for_email(&attrs.user_email).await {
            Ok(true) => {}
            Ok(false) => outcome
                .errors
                .push("User not found for subscription deactivation".into()),
            Err(e) => outcome.push_error(
                "Subscription deactivation failed but continuing with other operations",
                &e,
            ),
        }

        let mut tx = self.pool.begin().await?;
        match find_license(&mut tx, &attrs.key).await? {
            Some(license) => {
                set_license_active(&mut tx, license.id, false).await?;
                tx.commit().await?;
                tracing::info!(license_key = %license.key, "LemonSqueezy license revoked");
            }
            None => {
                tracing::warn!(license_key = %attrs.key, "Revoked license key not found");
                outcome.errors.push("License key not found".into());
            }
        }
        Ok(outcome)
    }

    /// Recent deliveries, optionally filtered by processing result
    pub async fn list_events(
        &self,
        status_filter: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> EntitlementResult<Vec<WebhookEventRecord>> {
        let records: Vec<WebhookEventRecord> = sqlx::query_as(
            r#"
            SELECT id, vendor, event_id, event_type, processing_result, error_message,
                   processing_started_at, created_at
            FROM vendor_webhook_events
            WHERE ($1::TEXT IS NULL OR processing_result = $1)
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(status_filter)
        .bind(limit.clamp(1, 200))
        .bind(offset.max(0))
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }
}
