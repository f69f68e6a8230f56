//! Promotional redeem codes
//!
//! An admin creates a batch of codes. Every code is backed by an inactive
//! `olly` license (`OLLYR-` key) with the tier's seats (`OLLYS-` keys)
//! already issued. Claiming a code activates the license and its seats,
//! links the claimer as owner and grants the batch credits.

use olly_shared::{PlanTier, RedeemCodeStatus, SubLicenseStatus, TransactionType, Vendor};
use serde::Serialize;
use sqlx::{FromRow, PgConnection, PgPool};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::credits::apply_delta;
use crate::error::{EntitlementError, EntitlementResult};
use crate::licenses::link_owner;
use crate::model::{generate_license_key, generate_redeem_code, page_offset, BalancePolicy};
use crate::sublicenses::set_all_sub_license_status;
use crate::vendor::sub_license_count;

/// Largest batch created at once
pub const MAX_BATCH_QUANTITY: i32 = 1000;

pub const DEFAULT_VALIDITY_DAYS: i64 = 30;

const LICENSE_KEY_PREFIX: &str = "OLLYR";
const SEAT_KEY_PREFIX: &str = "OLLYS";

/// Attempts at finding an unused random key or code
const KEY_GENERATION_ATTEMPTS: usize = 5;

#[derive(Debug, Clone)]
pub struct NewRedeemBatch {
    pub name: Option<String>,
    pub campaign: Option<String>,
    pub quantity: i32,
    pub validity_days: i64,
    pub tier: PlanTier,
    pub credits: i64,
    pub created_by: Option<Uuid>,
}

impl NewRedeemBatch {
    pub fn validate(&self) -> EntitlementResult<()> {
        if !(1..=MAX_BATCH_QUANTITY).contains(&self.quantity) {
            return Err(EntitlementError::InvalidInput(format!(
                "Quantity must be between 1 and {}",
                MAX_BATCH_QUANTITY
            )));
        }
        if self.validity_days < 1 || self.validity_days > 3650 {
            return Err(EntitlementError::InvalidInput(
                "Validity must be between 1 and 3650 days".into(),
            ));
        }
        if self.credits < 0 {
            return Err(EntitlementError::InvalidInput(
                "Credits must be a non-negative integer".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RedeemBatch {
    pub id: Uuid,
    pub name: String,
    pub campaign: String,
    pub quantity: i32,
    pub tier: i32,
    pub credits: i64,
    pub validity: OffsetDateTime,
    pub created_by: Option<Uuid>,
    pub created_at: OffsetDateTime,
}

const BATCH_COLUMNS: &str = "id, name, campaign, quantity, tier, credits, validity, created_by, created_at";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedRedeemCode {
    pub code: String,
    pub license_key: String,
    pub sub_license_keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RedeemBatchCreated {
    pub batch: RedeemBatch,
    pub codes: Vec<CreatedRedeemCode>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RedeemBatchSummary {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub batch: RedeemBatch,
    pub total_codes: i64,
    pub claimed_codes: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RedeemBatchPage {
    pub batches: Vec<RedeemBatchSummary>,
    pub total: i64,
    pub page: i64,
    pub limit: i64,
}

#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeatKey {
    pub key: String,
    pub status: String,
}

/// What a code unlocks, shown before it is claimed
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RedeemCodeInfo {
    pub code: String,
    pub license_key: String,
    pub status: RedeemCodeStatus,
    pub tier: PlanTier,
    pub credits: i64,
    pub expires_at: OffsetDateTime,
    pub sub_licenses: Vec<SeatKey>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RedeemClaim {
    pub code: String,
    pub license_key: String,
    pub tier: PlanTier,
    pub sub_license_count: i64,
    pub credits_added: i64,
    pub credit_balance: i64,
}

#[derive(Debug, FromRow)]
struct CodeRow {
    id: Uuid,
    code: String,
    status: String,
    credits: i64,
    license_key_id: Uuid,
    license_key: String,
    tier: Option<i32>,
    validity: OffsetDateTime,
}

impl CodeRow {
    fn status(&self) -> EntitlementResult<RedeemCodeStatus> {
        self.status.parse().map_err(EntitlementError::Internal)
    }

    fn tier(&self) -> PlanTier {
        self.tier.and_then(PlanTier::from_number).unwrap_or_default()
    }
}

const CODE_SELECT: &str = r#"
    SELECT rc.id, rc.code, rc.status, rc.credits, rc.license_key_id,
           lk.key AS license_key, lk.tier, b.validity
    FROM redeem_codes rc
    JOIN redeem_code_batches b ON b.id = rc.batch_id
    JOIN license_keys lk ON lk.id = rc.license_key_id
    WHERE rc.code = $1
"#;

/// Codes are matched case-insensitively
pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

/// Why a stored code cannot be claimed at `now`, if it cannot.
/// Returns true in the second slot when the code has just run out and
/// should be marked EXPIRED.
pub fn claim_rejection(
    status: RedeemCodeStatus,
    validity: OffsetDateTime,
    now: OffsetDateTime,
) -> Option<(EntitlementError, bool)> {
    match status {
        RedeemCodeStatus::Claimed => Some((
            EntitlementError::Conflict("This redeem code has already been claimed".into()),
            false,
        )),
        RedeemCodeStatus::Expired => Some((expired(), false)),
        RedeemCodeStatus::Active if validity < now => Some((expired(), true)),
        RedeemCodeStatus::Active => None,
    }
}

fn expired() -> EntitlementError {
    EntitlementError::InvalidInput("This redeem code has expired".into())
}

async fn mark_expired(conn: &mut PgConnection, code_id: Uuid) -> EntitlementResult<()> {
    sqlx::query("UPDATE redeem_codes SET status = 'EXPIRED' WHERE id = $1 AND status = 'ACTIVE'")
        .bind(code_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn insert_promo_license(conn: &mut PgConnection, tier: PlanTier) -> EntitlementResult<(Uuid, String)> {
    for _ in 0..KEY_GENERATION_ATTEMPTS {
        let key = generate_license_key(LICENSE_KEY_PREFIX);
        let row: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO license_keys (key, vendor, tier, is_active)
            VALUES ($1, $2, $3, FALSE)
            ON CONFLICT (key) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(&key)
        .bind(Vendor::Olly.as_str())
        .bind(tier.number())
        .fetch_optional(&mut *conn)
        .await?;
        if let Some((id,)) = row {
            return Ok((id, key));
        }
    }
    Err(EntitlementError::Internal("Could not generate a unique license key".into()))
}

async fn insert_promo_seat(conn: &mut PgConnection, license_id: Uuid, license_key: &str) -> EntitlementResult<String> {
    for _ in 0..KEY_GENERATION_ATTEMPTS {
        let key = generate_license_key(SEAT_KEY_PREFIX);
        let result = sqlx::query(
            r#"
            INSERT INTO sub_licenses (key, status, main_license_key_id, vendor, original_license_key, deactivated_at)
            VALUES ($1, 'INACTIVE', $2, $3, $4, NOW())
            ON CONFLICT (key) DO NOTHING
            "#,
        )
        .bind(&key)
        .bind(license_id)
        .bind(Vendor::Olly.as_str())
        .bind(license_key)
        .execute(&mut *conn)
        .await?;
        if result.rows_affected() > 0 {
            return Ok(key);
        }
    }
    Err(EntitlementError::Internal("Could not generate a unique sub-license key".into()))
}

async fn insert_code(
    conn: &mut PgConnection,
    batch_id: Uuid,
    license_id: Uuid,
    credits: i64,
) -> EntitlementResult<String> {
    for _ in 0..KEY_GENERATION_ATTEMPTS {
        let code = generate_redeem_code();
        let result = sqlx::query(
            r#"
            INSERT INTO redeem_codes (code, batch_id, license_key_id, credits)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (code) DO NOTHING
            "#,
        )
        .bind(&code)
        .bind(batch_id)
        .bind(license_id)
        .bind(credits)
        .execute(&mut *conn)
        .await?;
        if result.rows_affected() > 0 {
            return Ok(code);
        }
        tracing::warn!(batch_id = %batch_id, "Generated redeem code collided, retrying");
    }
    Err(EntitlementError::Internal("Could not generate a unique redeem code".into()))
}

#[derive(Clone)]
pub struct RedeemCodeService {
    pool: PgPool,
}

impl RedeemCodeService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a batch with its codes, licenses and seats in one transaction
    pub async fn create_batch(&self, request: NewRedeemBatch) -> EntitlementResult<RedeemBatchCreated> {
        request.validate()?;

        let now = OffsetDateTime::now_utc();
        let name = request
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| format!("Promo-{}", now.date()));
        let campaign = request
            .campaign
            .filter(|c| !c.trim().is_empty())
            .unwrap_or_else(|| "Promotion".to_string());
        let validity = now + Duration::days(request.validity_days);
        let seats = sub_license_count(Vendor::Olly, request.tier);

        let mut tx = self.pool.begin().await?;
        let batch: RedeemBatch = sqlx::query_as(&format!(
            r#"
            INSERT INTO redeem_code_batches (name, campaign, quantity, tier, credits, validity, created_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {}
            "#,
            BATCH_COLUMNS
        ))
        .bind(name.trim())
        .bind(campaign.trim())
        .bind(request.quantity)
        .bind(request.tier.number())
        .bind(request.credits)
        .bind(validity)
        .bind(request.created_by)
        .fetch_one(&mut *tx)
        .await?;

        let mut codes = Vec::with_capacity(request.quantity as usize);
        for _ in 0..request.quantity {
            let (license_id, license_key) = insert_promo_license(&mut tx, request.tier).await?;
            let mut sub_license_keys = Vec::with_capacity(seats.max(0) as usize);
            for _ in 0..seats {
                sub_license_keys.push(insert_promo_seat(&mut tx, license_id, &license_key).await?);
            }
            let code = insert_code(&mut tx, batch.id, license_id, request.credits).await?;
            codes.push(CreatedRedeemCode {
                code,
                license_key,
                sub_license_keys,
            });
        }
        tx.commit().await?;

        tracing::info!(
            batch_id = %batch.id,
            quantity = batch.quantity,
            tier = %request.tier,
            credits = batch.credits,
            "Redeem code batch created"
        );
        Ok(RedeemBatchCreated { batch, codes })
    }

    /// Look a code up without claiming it. A code found past its batch
    /// validity is marked EXPIRED.
    pub async fn check(&self, code: &str) -> EntitlementResult<RedeemCodeInfo> {
        let mut conn = self.pool.acquire().await?;
        let row: CodeRow = sqlx::query_as(CODE_SELECT)
            .bind(normalize_code(code))
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| EntitlementError::NotFound("Redeem code".into()))?;

        if let Some((err, newly_expired)) = claim_rejection(row.status()?, row.validity, OffsetDateTime::now_utc()) {
            if newly_expired {
                mark_expired(&mut conn, row.id).await?;
            }
            return Err(err);
        }

        let sub_licenses: Vec<SeatKey> = sqlx::query_as(
            "SELECT key, status FROM sub_licenses WHERE main_license_key_id = $1 ORDER BY created_at, key",
        )
        .bind(row.license_key_id)
        .fetch_all(&mut *conn)
        .await?;

        Ok(RedeemCodeInfo {
            status: row.status()?,
            tier: row.tier(),
            code: row.code,
            license_key: row.license_key,
            credits: row.credits,
            expires_at: row.validity,
            sub_licenses,
        })
    }

    /// Claim a code for `user_id`
    pub async fn claim(&self, code: &str, user_id: Uuid) -> EntitlementResult<RedeemClaim> {
        let mut tx = self.pool.begin().await?;
        let row: CodeRow = sqlx::query_as(&format!("{} FOR UPDATE OF rc", CODE_SELECT))
            .bind(normalize_code(code))
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| EntitlementError::NotFound("Redeem code".into()))?;

        if let Some((err, newly_expired)) = claim_rejection(row.status()?, row.validity, OffsetDateTime::now_utc()) {
            if newly_expired {
                mark_expired(&mut tx, row.id).await?;
                tx.commit().await?;
            }
            return Err(err);
        }

        sqlx::query(
            r#"
            UPDATE license_keys
            SET is_active = TRUE,
                activated_at = NOW(),
                deactivated_at = NULL,
                activation_count = activation_count + 1,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(row.license_key_id)
        .execute(&mut *tx)
        .await?;
        set_all_sub_license_status(&mut tx, row.license_key_id, SubLicenseStatus::Active).await?;
        link_owner(&mut tx, user_id, row.license_key_id).await?;

        let (sub_license_count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM sub_licenses WHERE main_license_key_id = $1")
                .bind(row.license_key_id)
                .fetch_one(&mut *tx)
                .await?;

        let credit_balance = if row.credits > 0 {
            let entry = apply_delta(
                &mut tx,
                user_id,
                row.credits,
                TransactionType::PlanCreditsAdjusted,
                &format!("Credits from license key: {}", row.license_key),
                BalancePolicy::Strict,
            )
            .await?;
            entry.map(|e| e.balance_after).unwrap_or_default()
        } else {
            let balance: Option<(i64,)> = sqlx::query_as("SELECT balance FROM user_credits WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&mut *tx)
                .await?;
            balance.map(|(b,)| b).unwrap_or(0)
        };

        sqlx::query(
            "UPDATE redeem_codes SET status = 'CLAIMED', claimed_at = NOW(), claimed_by = $2 WHERE id = $1",
        )
        .bind(row.id)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        tracing::info!(
            code = %row.code,
            license_key = %row.license_key,
            user_id = %user_id,
            credits_added = row.credits,
            "Redeem code claimed"
        );
        Ok(RedeemClaim {
            tier: row.tier(),
            code: row.code,
            license_key: row.license_key,
            sub_license_count,
            credits_added: row.credits,
            credit_balance,
        })
    }

    /// Batches newest first, with how many of their codes are claimed
    pub async fn list_batches(&self, page: i64, limit: i64) -> EntitlementResult<RedeemBatchPage> {
        let page = page.max(1);
        let limit = limit.clamp(1, 100);

        let batches: Vec<RedeemBatchSummary> = sqlx::query_as(
            r#"
            SELECT b.id, b.name, b.campaign, b.quantity, b.tier, b.credits, b.validity,
                   b.created_by, b.created_at,
                   COUNT(rc.id) AS total_codes,
                   COUNT(rc.id) FILTER (WHERE rc.status = 'CLAIMED') AS claimed_codes
            FROM redeem_code_batches b
            LEFT JOIN redeem_codes rc ON rc.batch_id = b.id
            GROUP BY b.id
            ORDER BY b.created_at DESC
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(limit)
        .bind(page_offset(page, limit))
        .fetch_all(&self.pool)
        .await?;

        let (total,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM redeem_code_batches")
            .fetch_one(&self.pool)
            .await?;

        Ok(RedeemBatchPage {
            batches,
            total,
            page,
            limit,
        })
    }
}
