//! Main license keys: ownership, activation, redemption and plan summaries

use olly_shared::{PlanTier, SubLicenseStatus, Vendor};
use serde::Serialize;
use sqlx::{FromRow, PgConnection, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::accounts::{find_or_create_user, hash_password, UserRecord};
use crate::error::{EntitlementError, EntitlementResult};
use crate::model::{validate_email, validate_password, validate_username};
use crate::vendor::{sub_license_count, PlanDetails, VendorCatalog};

#[derive(Debug, Clone, FromRow)]
pub struct LicenseKeyRow {
    pub id: Uuid,
    pub key: String,
    pub vendor: String,
    pub tier: Option<i32>,
    pub is_active: bool,
    pub plan_id: Option<String>,
    pub lemon_product_id: Option<String>,
    pub activation_count: i32,
    pub activated_at: Option<OffsetDateTime>,
    pub deactivated_at: Option<OffsetDateTime>,
    pub expires_at: Option<OffsetDateTime>,
    pub converted_to_team: bool,
    pub created_at: OffsetDateTime,
}

impl LicenseKeyRow {
    pub fn vendor(&self) -> Vendor {
        self.vendor.parse().unwrap_or(Vendor::Olly)
    }
}

const LICENSE_COLUMNS: &str = "id, key, vendor, tier, is_active, plan_id, lemon_product_id, \
     activation_count, activated_at, deactivated_at, expires_at, converted_to_team, created_at";

/// Values written when a vendor reports a license
#[derive(Debug, Clone)]
pub struct LicenseUpsert<'a> {
    pub key: &'a str,
    pub vendor: Vendor,
    pub tier: Option<i32>,
    pub plan_id: Option<&'a str>,
    pub lemon_product_id: Option<&'a str>,
    pub is_active: bool,
}

pub(crate) async fn find_license(
    conn: &mut PgConnection,
    key: &str,
) -> EntitlementResult<Option<LicenseKeyRow>> {
    let row: Option<LicenseKeyRow> = sqlx::query_as(&format!(
        "SELECT {} FROM license_keys WHERE key = $1",
        LICENSE_COLUMNS
    ))
    .bind(key.trim())
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row)
}

pub(crate) async fn lock_license(
    conn: &mut PgConnection,
    key: &str,
) -> EntitlementResult<LicenseKeyRow> {
    let row: Option<LicenseKeyRow> = sqlx::query_as(&format!(
        "SELECT {} FROM license_keys WHERE key = $1 FOR UPDATE",
        LICENSE_COLUMNS
    ))
    .bind(key.trim())
    .fetch_optional(&mut *conn)
    .await?;
    row.ok_or_else(|| EntitlementError::NotFound("License key".into()))
}

pub(crate) async fn upsert_license(
    conn: &mut PgConnection,
    values: &LicenseUpsert<'_>,
) -> EntitlementResult<LicenseKeyRow> {
    let row: LicenseKeyRow = sqlx::query_as(&format!(
        r#"
        INSERT INTO license_keys (key, vendor, tier, plan_id, lemon_product_id, is_active, activated_at)
        VALUES ($1, $2, $3, $4, $5, $6, CASE WHEN $6 THEN NOW() END)
        ON CONFLICT (key) DO UPDATE SET
            tier = COALESCE(EXCLUDED.tier, license_keys.tier),
            plan_id = COALESCE(EXCLUDED.plan_id, license_keys.plan_id),
            lemon_product_id = COALESCE(EXCLUDED.lemon_product_id, license_keys.lemon_product_id),
            is_active = EXCLUDED.is_active,
            deactivated_at = CASE
                WHEN EXCLUDED.is_active THEN NULL
                ELSE COALESCE(license_keys.deactivated_at, NOW())
            END,
            updated_at = NOW()
        RETURNING {}
        "#,
        LICENSE_COLUMNS
    ))
    .bind(values.key)
    .bind(values.vendor.as_str())
    .bind(values.tier)
    .bind(values.plan_id)
    .bind(values.lemon_product_id)
    .bind(values.is_active)
    .fetch_one(&mut *conn)
    .await?;
    Ok(row)
}

/// Set a license's active flag. Deactivation also parks every sub-license.
/// Returns false when the license was already in the requested state.
pub(crate) async fn set_license_active(
    conn: &mut PgConnection,
    license_id: Uuid,
    active: bool,
) -> EntitlementResult<bool> {
    let result = sqlx::query(
        r#"
        UPDATE license_keys
        SET is_active = $2,
            deactivated_at = CASE WHEN $2 THEN NULL ELSE NOW() END,
            updated_at = NOW()
        WHERE id = $1 AND is_active <> $2
        "#,
    )
    .bind(license_id)
    .bind(active)
    .execute(&mut *conn)
    .await?;

    if !active {
        sqlx::query(
            r#"
            UPDATE sub_licenses
            SET status = $2, deactivated_at = COALESCE(deactivated_at, NOW()), updated_at = NOW()
            WHERE main_license_key_id = $1 AND status <> $2
            "#,
        )
        .bind(license_id)
        .bind(SubLicenseStatus::Inactive.as_str())
        .execute(&mut *conn)
        .await?;
    }

    Ok(result.rows_affected() > 0)
}

pub(crate) async fn link_owner(
    conn: &mut PgConnection,
    user_id: Uuid,
    license_id: Uuid,
) -> EntitlementResult<()> {
    sqlx::query(
        r#"
        INSERT INTO user_license_keys (user_id, license_key_id)
        VALUES ($1, $2)
        ON CONFLICT (user_id, license_key_id) DO NOTHING
        "#,
    )
    .bind(user_id)
    .bind(license_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub(crate) async fn owners_of(
    conn: &mut PgConnection,
    license_id: Uuid,
) -> EntitlementResult<Vec<Uuid>> {
    let rows: Vec<(Uuid,)> = sqlx::query_as(
        "SELECT user_id FROM user_license_keys WHERE license_key_id = $1 ORDER BY created_at",
    )
    .bind(license_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Replace all owners of a license with a single new owner
pub(crate) async fn replace_owner(
    conn: &mut PgConnection,
    license_id: Uuid,
    new_owner: Uuid,
) -> EntitlementResult<Vec<Uuid>> {
    let previous = owners_of(conn, license_id).await?;
    sqlx::query("DELETE FROM user_license_keys WHERE license_key_id = $1")
        .bind(license_id)
        .execute(&mut *conn)
        .await?;
    link_owner(conn, new_owner, license_id).await?;
    Ok(previous)
}

// =============================================================================
// Responses
// =============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LicenseValidation {
    pub is_valid: bool,
    /// `active` or `inactive`
    pub status: String,
    pub license_key: String,
    pub is_sublicense: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activation_token: Option<Uuid>,
    pub activation_count: i32,
}

impl LicenseValidation {
    fn invalid(key: &str) -> Self {
        Self {
            is_valid: false,
            status: "inactive".to_string(),
            license_key: key.to_string(),
            is_sublicense: false,
            tier: None,
            vendor: None,
            activation_token: None,
            activation_count: 0,
        }
    }
}

fn status_label(active: bool) -> String {
    if active { "active" } else { "inactive" }.to_string()
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferResult {
    pub license_key: String,
    pub previous_owner_ids: Vec<Uuid>,
    pub new_owner_id: Uuid,
    pub new_owner_email: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamConversion {
    pub license_key: String,
    pub converted_keys: Vec<String>,
    pub team_seats: i64,
}

#[derive(Debug, Clone)]
pub struct RedeemRequest<'a> {
    pub email: &'a str,
    pub license_key: &'a str,
    pub vendor: Vendor,
    pub name: Option<&'a str>,
    pub username: Option<&'a str>,
    pub password: Option<&'a str>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RedeemResult {
    pub user: UserRecord,
    pub license_key: String,
    pub plan: PlanDetails,
}

#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnedLicense {
    pub key: String,
    pub vendor: String,
    pub tier: Option<i32>,
    pub is_active: bool,
    pub is_sublicense: bool,
    pub main_license_key: Option<String>,
    pub activation_count: i32,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, FromRow)]
struct PlanSeatRow {
    key: String,
    vendor: String,
    tier: Option<i32>,
    lemon_product_id: Option<String>,
    expires_at: Option<OffsetDateTime>,
    converted_to_team: bool,
    active_subs: i64,
    total_subs: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanSummary {
    pub license_key: String,
    pub name: String,
    pub vendor: String,
    pub tier: Option<i32>,
    pub active_seats: i64,
    pub total_seats: i64,
    pub max_seats: i32,
    pub can_upgrade: bool,
    pub is_team_converted: bool,
    pub expires_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPlans {
    pub plans: Vec<PlanSummary>,
    pub has_premium: bool,
}

/// Plan name shown for a license
pub fn plan_name(
    catalog: &VendorCatalog,
    vendor: Vendor,
    tier: Option<i32>,
    product_id: Option<&str>,
) -> String {
    match (vendor, tier, product_id) {
        (Vendor::AppSumo, Some(tier), _) => catalog.appsumo_plan(tier).name,
        (Vendor::LemonSqueezy, _, Some(pid)) => catalog.lemon_plan_or_default(pid).name,
        _ => "Lifetime Plan".to_string(),
    }
}

// =============================================================================
// Service
// =============================================================================

#[derive(Clone)]
pub struct LicenseService {
    pool: PgPool,
    catalog: VendorCatalog,
}

impl LicenseService {
    pub fn new(pool: PgPool, catalog: VendorCatalog) -> Self {
        Self { pool, catalog }
    }

    pub async fn get(&self, key: &str) -> EntitlementResult<LicenseKeyRow> {
        let mut conn = self.pool.acquire().await?;
        find_license(&mut conn, key)
            .await?
            .ok_or_else(|| EntitlementError::NotFound("License key".into()))
    }

    /// Deactivate a main license and all of its sub-licenses
    pub async fn deactivate(&self, key: &str) -> EntitlementResult<LicenseKeyRow> {
        self.set_active(key, false).await
    }

    pub async fn reactivate(&self, key: &str) -> EntitlementResult<LicenseKeyRow> {
        self.set_active(key, true).await
    }

    async fn set_active(&self, key: &str, active: bool) -> EntitlementResult<LicenseKeyRow> {
        let mut tx = self.pool.begin().await?;
        let license = lock_license(&mut tx, key).await?;
        let changed = set_license_active(&mut tx, license.id, active).await?;
        let updated = lock_license(&mut tx, key).await?;
        tx.commit().await?;

        tracing::info!(
            license_key = %license.key,
            active = active,
            changed = changed,
            "License activation state updated"
        );
        Ok(updated)
    }

    /// Move ownership of a main license to the user with `new_owner_email`
    pub async fn transfer(&self, key: &str, new_owner_email: &str) -> EntitlementResult<TransferResult> {
        validate_email(new_owner_email)?;

        let mut tx = self.pool.begin().await?;
        let license = lock_license(&mut tx, key).await?;
        let new_owner = find_or_create_user(&mut tx, new_owner_email, None).await?;
        let previous = replace_owner(&mut tx, license.id, new_owner.id).await?;
        tx.commit().await?;

        tracing::info!(
            license_key = %license.key,
            previous_owners = ?previous,
            new_owner_id = %new_owner.id,
            "License ownership transferred"
        );

        Ok(TransferResult {
            license_key: license.key,
            previous_owner_ids: previous,
            new_owner_id: new_owner.id,
            new_owner_email: new_owner.email,
        })
    }

    /// Merge independent licenses into seats of a team license.
    ///
    /// Each member license becomes a `converted_to_team` seat assigned to its
    /// owner, replacing a free seat of the team, and the member license row is
    /// removed. An AppSumo upgrade or
    /// downgrade of either side later splits the team up again.
    pub async fn convert_to_team(&self, main_key: &str, member_keys: &[String]) -> EntitlementResult<TeamConversion> {
        if member_keys.is_empty() {
            return Err(EntitlementError::InvalidInput("At least one license key is required".into()));
        }

        let mut tx = self.pool.begin().await?;
        let main = lock_license(&mut tx, main_key).await?;
        if !main.is_active {
            return Err(EntitlementError::InvalidInput("Team license is not active".into()));
        }
        let tier = main.tier.and_then(PlanTier::from_number).unwrap_or_default();
        let seat_limit = i64::from(sub_license_count(main.vendor(), tier));

        let (mut team_seats,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM sub_licenses WHERE main_license_key_id = $1")
                .bind(main.id)
                .fetch_one(&mut *tx)
                .await?;

        let mut converted_keys = Vec::with_capacity(member_keys.len());
        for member_key in member_keys {
            let member = lock_license(&mut tx, member_key).await?;
            if member.id == main.id {
                return Err(EntitlementError::InvalidInput(
                    "A license cannot be converted into its own team".into(),
                ));
            }
            let (member_seats,): (i64,) =
                sqlx::query_as("SELECT COUNT(*) FROM sub_licenses WHERE main_license_key_id = $1")
                    .bind(member.id)
                    .fetch_one(&mut *tx)
                    .await?;
            if member_seats > 0 {
                return Err(EntitlementError::Conflict(format!(
                    "License {} has its own seats and cannot join a team",
                    member.key
                )));
            }

            // A converted license takes over an unassigned seat, or a new one while under the limit
            let free_seat: Option<(Uuid,)> = sqlx::query_as(
                r#"
                SELECT id FROM sub_licenses
                WHERE main_license_key_id = $1 AND assigned_email IS NULL AND NOT converted_to_team
                ORDER BY created_at, key
                LIMIT 1
                FOR UPDATE
                "#,
            )
            .bind(main.id)
            .fetch_optional(&mut *tx)
            .await?;
            match free_seat {
                Some((seat_id,)) => {
                    sqlx::query("DELETE FROM sub_licenses WHERE id = $1")
                        .bind(seat_id)
                        .execute(&mut *tx)
                        .await?;
                }
                None if team_seats >= seat_limit => {
                    return Err(EntitlementError::InvalidInput(format!(
                        "Team license allows {} seats and has no free seat left",
                        seat_limit
                    )));
                }
                None => team_seats += 1,
            }

            let owner: Option<(Uuid, String)> = sqlx::query_as(
                r#"
                SELECT u.id, u.email FROM user_license_keys ulk
                JOIN users u ON u.id = ulk.user_id
                WHERE ulk.license_key_id = $1
                ORDER BY ulk.created_at
                LIMIT 1
                "#,
            )
            .bind(member.id)
            .fetch_optional(&mut *tx)
            .await?;

            sqlx::query("DELETE FROM license_keys WHERE id = $1")
                .bind(member.id)
                .execute(&mut *tx)
                .await?;

            // original_license_key keeps the member's vendor plan so the seat can be split off again
            sqlx::query(
                r#"
                INSERT INTO sub_licenses
                    (key, status, assigned_email, assigned_user_id, main_license_key_id, vendor,
                     original_license_key, activation_count, deactivated_at, converted_to_team)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, TRUE)
                "#,
            )
            .bind(&member.key)
            .bind(if member.is_active { "ACTIVE" } else { "INACTIVE" })
            .bind(owner.as_ref().map(|(_, email)| email.as_str()))
            .bind(owner.as_ref().map(|(id, _)| *id))
            .bind(main.id)
            .bind(&main.vendor)
            .bind(member.plan_id.as_deref())
            .bind(member.activation_count)
            .bind(member.deactivated_at)
            .execute(&mut *tx)
            .await?;
            converted_keys.push(member.key);
        }

        sqlx::query("UPDATE license_keys SET converted_to_team = TRUE, updated_at = NOW() WHERE id = $1")
            .bind(main.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::info!(
            license_key = %main.key,
            converted = converted_keys.len(),
            team_seats = team_seats,
            "Licenses converted to team seats"
        );
        Ok(TeamConversion {
            license_key: main.key,
            converted_keys,
            team_seats,
        })
    }

    /// Check a key and optionally record an activation.
    /// Unknown keys are reported as invalid rather than as an error.
    pub async fn validate(
        &self,
        key: &str,
        user_id: Option<Uuid>,
        activate: bool,
    ) -> EntitlementResult<LicenseValidation> {
        let key = key.trim();
        if key.is_empty() {
            return Err(EntitlementError::InvalidInput("License key is required".into()));
        }

        let mut tx = self.pool.begin().await?;

        if let Some(license) = find_license(&mut tx, key).await? {
            if let Some(user_id) = user_id {
                if license.is_active {
                    link_owner(&mut tx, user_id, license.id).await?;
                }
            }

            let mut activation_count = license.activation_count;
            let mut activation_token = None;
            if activate && license.is_active {
                let (count,): (i32,) = sqlx::query_as(
                    r#"
                    UPDATE license_keys
                    SET activation_count = activation_count + 1,
                        activated_at = COALESCE(activated_at, NOW()),
                        updated_at = NOW()
                    WHERE id = $1
                    RETURNING activation_count
                    "#,
                )
                .bind(license.id)
                .fetch_one(&mut *tx)
                .await?;
                activation_count = count;
                activation_token = Some(Uuid::new_v4());
            }
            tx.commit().await?;

            return Ok(LicenseValidation {
                is_valid: license.is_active,
                status: status_label(license.is_active),
                license_key: license.key,
                is_sublicense: false,
                tier: license.tier,
                vendor: Some(license.vendor),
                activation_token,
                activation_count,
            });
        }

        let sub: Option<(Uuid, String, Option<Uuid>, i32, Option<i32>, String, bool)> = sqlx::query_as(
            r#"
            SELECT sl.id, sl.status, sl.assigned_user_id, sl.activation_count,
                   lk.tier, lk.vendor, lk.is_active
            FROM sub_licenses sl
            JOIN license_keys lk ON lk.id = sl.main_license_key_id
            WHERE sl.key = $1
            FOR UPDATE OF sl
            "#,
        )
        .bind(key)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((sub_id, status, assigned_user_id, count, tier, vendor, main_active)) = sub else {
            tx.commit().await?;
            tracing::debug!(license_key = %key, "License key not found");
            return Ok(LicenseValidation::invalid(key));
        };

        let is_valid = status == SubLicenseStatus::Active.as_str() && main_active;
        let mut activation_count = count;
        let mut activation_token = None;

        if activate && is_valid {
            let bind_user = match (assigned_user_id, user_id) {
                (None, Some(uid)) => Some(uid),
                _ => None,
            };
            let (new_count,): (i32,) = sqlx::query_as(
                r#"
                UPDATE sub_licenses
                SET activation_count = activation_count + 1,
                    assigned_user_id = COALESCE(assigned_user_id, $2),
                    assigned_email = COALESCE(assigned_email, (SELECT LOWER(email) FROM users WHERE id = $2)),
                    updated_at = NOW()
                WHERE id = $1
                RETURNING activation_count
                "#,
            )
            .bind(sub_id)
            .bind(bind_user)
            .fetch_one(&mut *tx)
            .await?;
            activation_count = new_count;
            activation_token = Some(Uuid::new_v4());
        }
        tx.commit().await?;

        Ok(LicenseValidation {
            is_valid,
            status: status_label(is_valid),
            license_key: key.to_string(),
            is_sublicense: true,
            tier,
            vendor: Some(vendor),
            activation_token,
            activation_count,
        })
    }

    /// Redeem a key for an account, creating the account if needed
    pub async fn redeem(&self, request: RedeemRequest<'_>) -> EntitlementResult<RedeemResult> {
        validate_email(request.email)?;
        let license_key = request.license_key.trim();
        if license_key.is_empty() {
            return Err(EntitlementError::InvalidInput("License key is required".into()));
        }
        if let Some(username) = request.username {
            validate_username(username)?;
        }
        let password_hash = match request.password {
            Some(password) => {
                validate_password(password)?;
                Some(hash_password(password)?)
            }
            None => None,
        };

        let plan = match request.vendor {
            Vendor::AppSumo => self
                .catalog
                .appsumo_plan(self.catalog.redemption_plan(license_key).tier.number()),
            _ => self.catalog.redemption_plan(license_key),
        };

        let mut tx = self.pool.begin().await?;
        let mut user = find_or_create_user(&mut tx, request.email, request.name).await?;

        if request.username.is_some() || password_hash.is_some() {
            user = sqlx::query_as(
                r#"
                UPDATE users
                SET username = COALESCE($2, username),
                    password_hash = COALESCE($3, password_hash),
                    updated_at = NOW()
                WHERE id = $1
                RETURNING id, email, name, username, platform_role, created_at
                "#,
            )
            .bind(user.id)
            .bind(request.username)
            .bind(&password_hash)
            .fetch_one(&mut *tx)
            .await?;
        }

        if let Some(existing) = find_license(&mut tx, license_key).await? {
            let owners = owners_of(&mut tx, existing.id).await?;
            if owners.iter().any(|owner| *owner != user.id) {
                return Err(EntitlementError::Conflict(
                    "License key has already been redeemed".into(),
                ));
            }
        }

        let license = upsert_license(
            &mut tx,
            &LicenseUpsert {
                key: license_key,
                vendor: request.vendor,
                tier: Some(plan.tier.number()),
                plan_id: None,
                lemon_product_id: None,
                is_active: true,
            },
        )
        .await?;
        link_owner(&mut tx, user.id, license.id).await?;
        tx.commit().await?;

        tracing::info!(
            user_id = %user.id,
            license_key = %license.key,
            tier = %plan.tier,
            "License redeemed"
        );

        Ok(RedeemResult {
            user,
            license_key: license.key,
            plan,
        })
    }

    /// Main licenses the user owns plus active seats assigned to them
    pub async fn list_for_user(&self, user_id: Uuid) -> EntitlementResult<Vec<OwnedLicense>> {
        let rows: Vec<OwnedLicense> = sqlx::query_as(
            r#"
            SELECT lk.key, lk.vendor, lk.tier, lk.is_active,
                   FALSE AS is_sublicense, NULL::TEXT AS main_license_key,
                   lk.activation_count, lk.created_at
            FROM user_license_keys ulk
            JOIN license_keys lk ON lk.id = ulk.license_key_id
            WHERE ulk.user_id = $1
            UNION ALL
            SELECT sl.key, lk.vendor, lk.tier, lk.is_active,
                   TRUE AS is_sublicense, lk.key AS main_license_key,
                   sl.activation_count, sl.created_at
            FROM sub_licenses sl
            JOIN license_keys lk ON lk.id = sl.main_license_key_id
            WHERE sl.status = 'ACTIVE'
              AND (sl.assigned_user_id = $1
                   OR LOWER(sl.assigned_email) = (SELECT LOWER(email) FROM users WHERE id = $1))
            ORDER BY created_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Active, unexpired plans with seat usage
    pub async fn user_plans(&self, user_id: Uuid) -> EntitlementResult<UserPlans> {
        let rows: Vec<PlanSeatRow> = sqlx::query_as(
            r#"
            SELECT lk.key, lk.vendor, lk.tier, lk.lemon_product_id, lk.expires_at, lk.converted_to_team,
                   COUNT(sl.id) FILTER (WHERE sl.status = 'ACTIVE') AS active_subs,
                   COUNT(sl.id) AS total_subs
            FROM user_license_keys ulk
            JOIN license_keys lk ON lk.id = ulk.license_key_id
            LEFT JOIN sub_licenses sl ON sl.main_license_key_id = lk.id
            WHERE ulk.user_id = $1
              AND lk.is_active
              AND (lk.expires_at IS NULL OR lk.expires_at > NOW())
            GROUP BY lk.id
            ORDER BY lk.created_at
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let plans: Vec<PlanSummary> = rows
            .into_iter()
            .map(|row| self.summarize(row))
            .collect();

        Ok(UserPlans {
            has_premium: !plans.is_empty(),
            plans,
        })
    }

    fn summarize(&self, row: PlanSeatRow) -> PlanSummary {
        let vendor: Vendor = row.vendor.parse().unwrap_or(Vendor::Olly);
        let product_id = row.lemon_product_id.as_deref();
        PlanSummary {
            name: plan_name(&self.catalog, vendor, row.tier, product_id),
            max_seats: self.catalog.max_seats(vendor, row.tier, product_id),
            active_seats: row.active_subs + 1,
            total_seats: row.total_subs + 1,
            can_upgrade: row.total_subs == 0,
            is_team_converted: row.converted_to_team,
            license_key: row.key,
            vendor: row.vendor,
            tier: row.tier,
            expires_at: row.expires_at,
        }
    }
}
