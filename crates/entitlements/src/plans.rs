//! Plans and user subscriptions
//!
//! A user holds at most one ACTIVE subscription. Plan changes lock the user
//! row, cancel the current one and insert the replacement in the same
//! transaction; a partial unique index backs this up.

use olly_shared::{PlanDuration, PlanTier, SubscriptionStatus, TransactionType, Vendor};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection, PgPool};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::accounts::find_user_by_email;
use crate::credits::apply_delta;
use crate::error::{EntitlementError, EntitlementResult};
use crate::model::BalancePolicy;
use crate::vendor::{PlanDetails, VendorCatalog};

#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanRow {
    pub id: Uuid,
    pub tier: String,
    pub duration: String,
    pub vendor: String,
    pub product_id: String,
    pub name: String,
    pub max_users: i32,
    pub is_active: bool,
}

#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan_id: Uuid,
    pub license_key_id: Option<Uuid>,
    pub status: String,
    pub vendor_sub_id: Option<String>,
    pub next_billing_date: Option<OffsetDateTime>,
    pub end_date: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

const SUBSCRIPTION_COLUMNS: &str = "id, user_id, plan_id, license_key_id, status, vendor_sub_id, \
     next_billing_date, end_date, created_at";

/// Input to a plan change
#[derive(Debug, Clone)]
pub struct PlanUpdate<'a> {
    pub user_id: Uuid,
    pub vendor: Vendor,
    /// Required for LemonSqueezy
    pub product_id: Option<&'a str>,
    /// Required for AppSumo
    pub appsumo_tier: Option<i32>,
    /// Set for recurring plans
    pub end_date: Option<OffsetDateTime>,
    pub license_key_id: Option<Uuid>,
}

/// Plan a vendor update resolves to, before anything is written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPlan {
    pub details: PlanDetails,
    pub duration: PlanDuration,
    pub product_id: String,
}

impl ResolvedPlan {
    pub fn name(&self) -> String {
        let duration = match self.duration {
            PlanDuration::Monthly => "Monthly",
            PlanDuration::Lifetime => "Lifetime",
        };
        format!("{} {}", self.details.tier, duration)
    }
}

pub fn resolve_plan(catalog: &VendorCatalog, update: &PlanUpdate<'_>) -> EntitlementResult<ResolvedPlan> {
    match update.vendor {
        Vendor::AppSumo => {
            let tier = update
                .appsumo_tier
                .ok_or_else(|| EntitlementError::InvalidInput("AppSumo tier is required".into()))?;
            if PlanTier::from_number(tier).is_none() {
                return Err(EntitlementError::InvalidTier(tier.to_string()));
            }
            Ok(ResolvedPlan {
                details: catalog.appsumo_plan(tier),
                duration: PlanDuration::Lifetime,
                product_id: format!("tier{}", tier),
            })
        }
        Vendor::LemonSqueezy => {
            let product_id = update.product_id.ok_or_else(|| {
                EntitlementError::InvalidInput("Product ID is required for LemonSqueezy".into())
            })?;
            let details = catalog
                .lemon_plan(product_id)
                .ok_or_else(|| EntitlementError::UnknownProduct(product_id.to_string()))?;
            Ok(ResolvedPlan {
                details,
                duration: if update.end_date.is_some() {
                    PlanDuration::Monthly
                } else {
                    PlanDuration::Lifetime
                },
                product_id: product_id.to_string(),
            })
        }
        Vendor::Olly => {
            let tier = update.appsumo_tier.and_then(PlanTier::from_number).unwrap_or_default();
            Ok(ResolvedPlan {
                details: PlanDetails::new(Vendor::Olly, tier),
                duration: PlanDuration::Lifetime,
                product_id: format!("tier{}", tier.number()),
            })
        }
    }
}

pub(crate) async fn upsert_plan(conn: &mut PgConnection, plan: &ResolvedPlan) -> EntitlementResult<PlanRow> {
    let row: PlanRow = sqlx::query_as(
        r#"
        INSERT INTO plans (tier, duration, vendor, product_id, name, max_users, is_active)
        VALUES ($1, $2, $3, $4, $5, $6, TRUE)
        ON CONFLICT (vendor, product_id) DO UPDATE SET updated_at = NOW()
        RETURNING id, tier, duration, vendor, product_id, name, max_users, is_active
        "#,
    )
    .bind(plan.details.tier.as_str())
    .bind(plan.duration.as_str())
    .bind(plan.details.vendor.as_str())
    .bind(&plan.product_id)
    .bind(plan.name())
    .bind(plan.details.max_users)
    .fetch_one(&mut *conn)
    .await?;
    Ok(row)
}

/// Lock the user row so subscription changes for one user run one at a time
pub(crate) async fn lock_user_subscriptions(conn: &mut PgConnection, user_id: Uuid) -> EntitlementResult<()> {
    let locked: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM users WHERE id = $1 FOR UPDATE")
        .bind(user_id)
        .fetch_optional(&mut *conn)
        .await?;
    locked
        .map(|_| ())
        .ok_or_else(|| EntitlementError::NotFound(format!("User {}", user_id)))
}

/// Cancel the user's ACTIVE subscriptions, returning how many were cancelled
pub(crate) async fn cancel_active_subscriptions(
    conn: &mut PgConnection,
    user_id: Uuid,
) -> EntitlementResult<u64> {
    let result = sqlx::query(
        r#"
        UPDATE user_subscriptions
        SET status = 'CANCELLED', end_date = NOW(), cancelled_at = NOW(), updated_at = NOW()
        WHERE user_id = $1 AND status = 'ACTIVE'
        "#,
    )
    .bind(user_id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

pub(crate) async fn apply_plan_update(
    conn: &mut PgConnection,
    catalog: &VendorCatalog,
    update: &PlanUpdate<'_>,
) -> EntitlementResult<SubscriptionRow> {
    let resolved = resolve_plan(catalog, update)?;
    lock_user_subscriptions(conn, update.user_id).await?;
    let plan = upsert_plan(conn, &resolved).await?;
    let replaced = cancel_active_subscriptions(conn, update.user_id).await?;

    let subscription: SubscriptionRow = sqlx::query_as(&format!(
        r#"
        INSERT INTO user_subscriptions (user_id, plan_id, license_key_id, status, end_date)
        VALUES ($1, $2, $3, 'ACTIVE', $4)
        RETURNING {}
        "#,
        SUBSCRIPTION_COLUMNS
    ))
    .bind(update.user_id)
    .bind(plan.id)
    .bind(update.license_key_id)
    .bind(update.end_date)
    .fetch_one(&mut *conn)
    .await?;

    tracing::info!(
        user_id = %update.user_id,
        plan = %plan.name,
        vendor = %update.vendor,
        replaced = replaced,
        "Plan updated"
    );
    Ok(subscription)
}

// =============================================================================
// LemonSqueezy subscription lifecycle
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LemonSubscriptionEvent {
    Created,
    Cancelled,
    PaymentSuccess,
    PaymentFailed,
    PaymentRecovered,
    Paused,
    Resumed,
}

impl LemonSubscriptionEvent {
    pub fn from_event_name(name: &str) -> Option<Self> {
        match name {
            "subscription_created" => Some(Self::Created),
            "subscription_cancelled" => Some(Self::Cancelled),
            "subscription_payment_success" => Some(Self::PaymentSuccess),
            "subscription_payment_failed" => Some(Self::PaymentFailed),
            "subscription_payment_recovered" => Some(Self::PaymentRecovered),
            "subscription_paused" => Some(Self::Paused),
            "subscription_resumed" => Some(Self::Resumed),
            _ => None,
        }
    }

    /// Event name without the `subscription_` prefix
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Cancelled => "cancelled",
            Self::PaymentSuccess => "payment_success",
            Self::PaymentFailed => "payment_failed",
            Self::PaymentRecovered => "payment_recovered",
            Self::Paused => "paused",
            Self::Resumed => "resumed",
        }
    }

    /// Status a subscription moves to on this event
    pub fn target_status(&self) -> SubscriptionStatus {
        match self {
            Self::Created | Self::PaymentSuccess | Self::PaymentRecovered | Self::Resumed => {
                SubscriptionStatus::Active
            }
            Self::Cancelled => SubscriptionStatus::Cancelled,
            Self::PaymentFailed => SubscriptionStatus::PaymentFailed,
            Self::Paused => SubscriptionStatus::Paused,
        }
    }
}

/// `data.attributes` of a LemonSqueezy subscription event
#[derive(Debug, Clone, Deserialize)]
pub struct LemonSubscriptionAttributes {
    pub user_email: String,
    #[serde(default)]
    pub order_id: Option<serde_json::Value>,
    #[serde(default)]
    pub customer_id: Option<serde_json::Value>,
    #[serde(default)]
    pub renews_at: Option<String>,
    #[serde(default)]
    pub ends_at: Option<String>,
    pub product_id: serde_json::Value,
    #[serde(default)]
    pub trial_ends_at: Option<String>,
}

impl LemonSubscriptionAttributes {
    pub fn product_id(&self) -> String {
        json_id(&self.product_id)
    }

    /// True while the trial end lies after `now`
    pub fn is_on_trial(&self, now: OffsetDateTime) -> bool {
        parse_timestamp(self.trial_ends_at.as_deref()).is_some_and(|t| t > now)
    }
}

/// Vendor payloads send ids as either numbers or strings
pub fn json_id(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn parse_timestamp(value: Option<&str>) -> Option<OffsetDateTime> {
    value.and_then(|s| OffsetDateTime::parse(s, &Rfc3339).ok())
}

async fn lock_vendor_subscription(
    conn: &mut PgConnection,
    vendor_sub_id: &str,
) -> EntitlementResult<SubscriptionRow> {
    let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
        "SELECT {} FROM user_subscriptions WHERE vendor_sub_id = $1 FOR UPDATE",
        SUBSCRIPTION_COLUMNS
    ))
    .bind(vendor_sub_id)
    .fetch_optional(&mut *conn)
    .await?;
    row.ok_or_else(|| EntitlementError::NotFound(format!("Subscription {}", vendor_sub_id)))
}

/// Apply one LemonSqueezy subscription event on the caller's transaction
pub(crate) async fn apply_lemon_subscription_event(
    conn: &mut PgConnection,
    catalog: &VendorCatalog,
    event: LemonSubscriptionEvent,
    vendor_sub_id: &str,
    attrs: &LemonSubscriptionAttributes,
) -> EntitlementResult<SubscriptionRow> {
    let now = OffsetDateTime::now_utc();
    let status = event.target_status().as_str();

    if event == LemonSubscriptionEvent::Created {
        let user = find_user_by_email(conn, &attrs.user_email)
            .await?
            .ok_or_else(|| EntitlementError::NotFound(format!("User {}", attrs.user_email)))?;
        lock_user_subscriptions(conn, user.id).await?;
        let product_id = attrs.product_id();
        let resolved = resolve_plan(
            catalog,
            &PlanUpdate {
                user_id: user.id,
                vendor: Vendor::LemonSqueezy,
                product_id: Some(&product_id),
                appsumo_tier: None,
                end_date: parse_timestamp(attrs.renews_at.as_deref()),
                license_key_id: None,
            },
        )?;
        let plan = upsert_plan(conn, &resolved).await?;

        let license: Option<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT lk.id FROM license_keys lk
            JOIN user_license_keys ulk ON ulk.license_key_id = lk.id
            WHERE ulk.user_id = $1 AND lk.lemon_product_id = $2
            ORDER BY lk.created_at DESC
            LIMIT 1
            "#,
        )
        .bind(user.id)
        .bind(&product_id)
        .fetch_optional(&mut *conn)
        .await?;
        if license.is_none() {
            tracing::warn!(
                vendor_sub_id = %vendor_sub_id,
                product_id = %product_id,
                "No license key yet for subscription, creating it unlinked"
            );
        }

        cancel_active_subscriptions(conn, user.id).await?;

        let row: SubscriptionRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO user_subscriptions
                (user_id, plan_id, license_key_id, status, vendor_sub_id, order_id, customer_id, next_billing_date)
            VALUES ($1, $2, $3, 'ACTIVE', $4, $5, $6, $7)
            ON CONFLICT (vendor_sub_id) DO UPDATE SET
                status = 'ACTIVE',
                next_billing_date = EXCLUDED.next_billing_date,
                updated_at = NOW()
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(user.id)
        .bind(plan.id)
        .bind(license.map(|(id,)| id))
        .bind(vendor_sub_id)
        .bind(attrs.order_id.as_ref().map(json_id))
        .bind(attrs.customer_id.as_ref().map(json_id))
        .bind(parse_timestamp(attrs.renews_at.as_deref()))
        .fetch_one(&mut *conn)
        .await?;
        return Ok(row);
    }

    // User row first, then the subscription row, same order as plan updates
    let owner: Option<(Uuid,)> =
        sqlx::query_as("SELECT user_id FROM user_subscriptions WHERE vendor_sub_id = $1")
            .bind(vendor_sub_id)
            .fetch_optional(&mut *conn)
            .await?;
    let (owner_id,) =
        owner.ok_or_else(|| EntitlementError::NotFound(format!("Subscription {}", vendor_sub_id)))?;
    lock_user_subscriptions(conn, owner_id).await?;
    let sub = lock_vendor_subscription(conn, vendor_sub_id).await?;

    if event == LemonSubscriptionEvent::Cancelled && attrs.is_on_trial(now) {
        if let Some(plan) = catalog.lemon_plan(&attrs.product_id()) {
            let deducted = apply_delta(
                conn,
                sub.user_id,
                -plan.plan_credits,
                TransactionType::PlanCreditsAdjusted,
                "LLM credits deducted due to trial plan cancellation",
                BalancePolicy::ClampToAvailable,
            )
            .await?;
            tracing::info!(
                user_id = %sub.user_id,
                deducted = deducted.map(|e| -e.amount).unwrap_or(0),
                "Trial cancellation credits deducted"
            );
        }
    }

    let date_arg = match event {
        LemonSubscriptionEvent::Cancelled => parse_timestamp(attrs.ends_at.as_deref()),
        LemonSubscriptionEvent::PaymentSuccess => parse_timestamp(attrs.renews_at.as_deref()),
        _ => None,
    };

    // Reactivation must not leave a second ACTIVE row behind
    if event.target_status() == SubscriptionStatus::Active {
        sqlx::query(
            r#"
            UPDATE user_subscriptions
            SET status = 'CANCELLED', end_date = NOW(), cancelled_at = NOW(), updated_at = NOW()
            WHERE user_id = $1 AND status = 'ACTIVE' AND id <> $2
            "#,
        )
        .bind(sub.user_id)
        .bind(sub.id)
        .execute(&mut *conn)
        .await?;
    }

    let row: SubscriptionRow = sqlx::query_as(&format!(
        r#"
        UPDATE user_subscriptions SET
            status = $2,
            cancelled_at = CASE WHEN $3 = 'cancelled' THEN NOW() ELSE cancelled_at END,
            end_date = CASE WHEN $3 = 'cancelled' THEN COALESCE($4, end_date) ELSE end_date END,
            last_billing_date = CASE
                WHEN $3 IN ('payment_success', 'payment_recovered') THEN NOW()
                ELSE last_billing_date
            END,
            next_billing_date = CASE
                WHEN $3 = 'payment_success' THEN COALESCE($4, next_billing_date)
                ELSE next_billing_date
            END,
            payment_failed_date = CASE
                WHEN $3 = 'payment_failed' THEN NOW()
                WHEN $3 IN ('payment_success', 'payment_recovered') THEN NULL
                ELSE payment_failed_date
            END,
            paused_at = CASE
                WHEN $3 = 'paused' THEN NOW()
                WHEN $3 = 'resumed' THEN NULL
                ELSE paused_at
            END,
            resumed_at = CASE WHEN $3 = 'resumed' THEN NOW() ELSE resumed_at END,
            updated_at = NOW()
        WHERE id = $1
        RETURNING {}
        "#,
        SUBSCRIPTION_COLUMNS
    ))
    .bind(sub.id)
    .bind(status)
    .bind(event.tag())
    .bind(date_arg)
    .fetch_one(&mut *conn)
    .await?;

    tracing::info!(
        vendor_sub_id = %vendor_sub_id,
        status = %row.status,
        "Subscription event applied"
    );
    Ok(row)
}

#[derive(Clone)]
pub struct PlanService {
    pool: PgPool,
    catalog: VendorCatalog,
}

impl PlanService {
    pub fn new(pool: PgPool, catalog: VendorCatalog) -> Self {
        Self { pool, catalog }
    }

    pub async fn handle_plan_update(&self, update: PlanUpdate<'_>) -> EntitlementResult<SubscriptionRow> {
        let mut tx = self.pool.begin().await?;
        let subscription = apply_plan_update(&mut tx, &self.catalog, &update).await?;
        tx.commit().await?;
        Ok(subscription)
    }

    /// ACTIVE -> CANCELLED for all of the user's subscriptions
    pub async fn deactivate_user_subscription(&self, user_id: Uuid) -> EntitlementResult<u64> {
        let mut conn = self.pool.acquire().await?;
        let cancelled = cancel_active_subscriptions(&mut conn, user_id).await?;
        tracing::info!(user_id = %user_id, cancelled = cancelled, "User subscription deactivated");
        Ok(cancelled)
    }

    /// Cancel ACTIVE subscriptions whose end date has passed
    pub async fn expire_subscriptions(&self) -> EntitlementResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE user_subscriptions
            SET status = 'CANCELLED', cancelled_at = NOW(), updated_at = NOW()
            WHERE status = 'ACTIVE' AND end_date IS NOT NULL AND end_date < NOW()
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Deactivate licenses whose expiry has passed, parking their seats
    pub async fn expire_licenses(&self) -> EntitlementResult<u64> {
        let mut tx = self.pool.begin().await?;
        let expired: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE license_keys
            SET is_active = FALSE, deactivated_at = NOW(), updated_at = NOW()
            WHERE is_active AND expires_at IS NOT NULL AND expires_at < NOW()
            RETURNING id
            "#,
        )
        .fetch_all(&mut *tx)
        .await?;

        let ids: Vec<Uuid> = expired.into_iter().map(|(id,)| id).collect();
        if !ids.is_empty() {
            sqlx::query(
                r#"
                UPDATE sub_licenses
                SET status = 'INACTIVE', deactivated_at = COALESCE(deactivated_at, NOW()), updated_at = NOW()
                WHERE main_license_key_id = ANY($1) AND status = 'ACTIVE'
                "#,
            )
            .bind(&ids)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(ids.len() as u64)
    }

    pub async fn active_subscription(&self, user_id: Uuid) -> EntitlementResult<Option<SubscriptionRow>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM user_subscriptions WHERE user_id = $1 AND status = 'ACTIVE' \
             ORDER BY created_at DESC LIMIT 1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}
