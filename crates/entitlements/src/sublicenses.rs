//! Sub-license seats under a main license

use olly_shared::{SubLicenseStatus, Vendor};
use serde::Serialize;
use sqlx::{FromRow, PgConnection, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::accounts::find_or_create_user;
use crate::error::{EntitlementError, EntitlementResult};
use crate::licenses::{find_license, LicenseKeyRow};
use crate::model::{
    generate_license_key, normalize_email, validate_email, vendor_sub_license_key, SubLicenseAction,
    SubLicenseState,
};

/// Most seats created by one request
pub const MAX_SUB_LICENSES_PER_REQUEST: i32 = 100;

/// Attempts at finding an unused random key
const KEY_GENERATION_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubLicenseRow {
    pub id: Uuid,
    pub key: String,
    pub status: String,
    pub assigned_email: Option<String>,
    pub assigned_user_id: Option<Uuid>,
    pub main_license_key_id: Uuid,
    pub vendor: String,
    pub original_license_key: Option<String>,
    pub activation_count: i32,
    pub deactivated_at: Option<OffsetDateTime>,
    /// Seat that used to be an independent license merged into a team
    pub converted_to_team: bool,
    pub created_at: OffsetDateTime,
}

impl SubLicenseRow {
    fn state(&self) -> EntitlementResult<SubLicenseState> {
        let status = self
            .status
            .parse::<SubLicenseStatus>()
            .map_err(EntitlementError::Internal)?;
        Ok(SubLicenseState {
            status,
            assigned_email: self.assigned_email.clone(),
            assigned_user_id: self.assigned_user_id,
            deactivated_at: self.deactivated_at,
        })
    }
}

const SUB_LICENSE_COLUMNS: &str = "id, key, status, assigned_email, assigned_user_id, \
     main_license_key_id, vendor, original_license_key, activation_count, deactivated_at, converted_to_team, \
     created_at";

#[derive(Debug, FromRow)]
struct SubLicenseWithUserRow {
    #[sqlx(flatten)]
    sub: SubLicenseRow,
    user_email: Option<String>,
    user_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignedUser {
    pub id: Uuid,
    pub email: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubLicenseView {
    #[serde(flatten)]
    pub sub_license: SubLicenseRow,
    pub assigned_user: Option<AssignedUser>,
}

/// Insert the deterministic `SUB-<n>-<key>` seats a vendor plan includes.
/// Existing seats are left alone, so replays are harmless. Returns how many were created.
pub(crate) async fn ensure_vendor_sub_licenses(
    conn: &mut PgConnection,
    license: &LicenseKeyRow,
    vendor: Vendor,
    count: i32,
) -> EntitlementResult<u64> {
    let mut created = 0;
    for index in 1..=count {
        let result = sqlx::query(
            r#"
            INSERT INTO sub_licenses (key, status, main_license_key_id, vendor, original_license_key)
            VALUES ($1, 'ACTIVE', $2, $3, $4)
            ON CONFLICT (key) DO NOTHING
            "#,
        )
        .bind(vendor_sub_license_key(index, &license.key))
        .bind(license.id)
        .bind(vendor.as_str())
        .bind(&license.key)
        .execute(&mut *conn)
        .await?;
        created += result.rows_affected();
    }
    Ok(created)
}

/// Set every seat of a main license to `status`
pub(crate) async fn set_all_sub_license_status(
    conn: &mut PgConnection,
    license_id: Uuid,
    status: SubLicenseStatus,
) -> EntitlementResult<u64> {
    let result = sqlx::query(
        r#"
        UPDATE sub_licenses
        SET status = $2,
            deactivated_at = CASE
                WHEN $2 = 'INACTIVE' THEN COALESCE(deactivated_at, NOW())
                ELSE NULL
            END,
            updated_at = NOW()
        WHERE main_license_key_id = $1 AND status <> $2
        "#,
    )
    .bind(license_id)
    .bind(status.as_str())
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

pub(crate) async fn find_sub_license(
    conn: &mut PgConnection,
    key: &str,
) -> EntitlementResult<Option<SubLicenseRow>> {
    let row: Option<SubLicenseRow> = sqlx::query_as(&format!(
        "SELECT {} FROM sub_licenses WHERE key = $1",
        SUB_LICENSE_COLUMNS
    ))
    .bind(key.trim())
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row)
}

async fn lock_sub_license(conn: &mut PgConnection, key: &str) -> EntitlementResult<SubLicenseRow> {
    let row: Option<SubLicenseRow> = sqlx::query_as(&format!(
        "SELECT {} FROM sub_licenses WHERE key = $1 FOR UPDATE",
        SUB_LICENSE_COLUMNS
    ))
    .bind(key.trim())
    .fetch_optional(&mut *conn)
    .await?;
    row.ok_or_else(|| EntitlementError::NotFound("Sub-license".into()))
}

async fn insert_with_fresh_key(
    conn: &mut PgConnection,
    license: &LicenseKeyRow,
    assigned: Option<(&str, Uuid)>,
) -> EntitlementResult<SubLicenseRow> {
    for _ in 0..KEY_GENERATION_ATTEMPTS {
        let key = generate_license_key("SUB");
        let row: Option<SubLicenseRow> = sqlx::query_as(&format!(
            r#"
            INSERT INTO sub_licenses
                (key, status, assigned_email, assigned_user_id, main_license_key_id, vendor, original_license_key)
            VALUES ($1, 'ACTIVE', $2, $3, $4, $5, $6)
            ON CONFLICT (key) DO NOTHING
            RETURNING {}
            "#,
            SUB_LICENSE_COLUMNS
        ))
        .bind(&key)
        .bind(assigned.map(|(email, _)| email))
        .bind(assigned.map(|(_, id)| id))
        .bind(license.id)
        .bind(&license.vendor)
        .bind(&license.key)
        .fetch_optional(&mut *conn)
        .await?;

        if let Some(row) = row {
            return Ok(row);
        }
        tracing::warn!(main_license = %license.key, "Generated sub-license key collided, retrying");
    }
    Err(EntitlementError::Internal(
        "Could not generate a unique sub-license key".into(),
    ))
}

#[derive(Clone)]
pub struct SubLicenseService {
    pool: PgPool,
}

impl SubLicenseService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Seats under a main license with their assigned users
    pub async fn list(&self, main_key: &str) -> EntitlementResult<Vec<SubLicenseView>> {
        let mut conn = self.pool.acquire().await?;
        let license = find_license(&mut conn, main_key)
            .await?
            .ok_or_else(|| EntitlementError::NotFound("Main license key".into()))?;

        let rows: Vec<SubLicenseWithUserRow> = sqlx::query_as(
            r#"
            SELECT sl.id, sl.key, sl.status, sl.assigned_email, sl.assigned_user_id,
                   sl.main_license_key_id, sl.vendor, sl.original_license_key,
                   sl.activation_count, sl.deactivated_at, sl.converted_to_team, sl.created_at,
                   u.email AS user_email, u.name AS user_name
            FROM sub_licenses sl
            LEFT JOIN users u ON u.id = sl.assigned_user_id
            WHERE sl.main_license_key_id = $1
            ORDER BY sl.created_at, sl.key
            "#,
        )
        .bind(license.id)
        .fetch_all(&mut *conn)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let assigned_user = match (row.sub.assigned_user_id, row.user_email) {
                    (Some(id), Some(email)) => Some(AssignedUser {
                        id,
                        email,
                        name: row.user_name,
                    }),
                    _ => None,
                };
                SubLicenseView {
                    sub_license: row.sub,
                    assigned_user,
                }
            })
            .collect())
    }

    /// Create `quantity` new seats under a main license in one transaction
    pub async fn create(
        &self,
        main_key: &str,
        quantity: i32,
        assigned_email: Option<&str>,
    ) -> EntitlementResult<Vec<SubLicenseRow>> {
        if !(1..=MAX_SUB_LICENSES_PER_REQUEST).contains(&quantity) {
            return Err(EntitlementError::InvalidInput(format!(
                "Quantity must be between 1 and {}",
                MAX_SUB_LICENSES_PER_REQUEST
            )));
        }
        let assigned_email = assigned_email.map(str::trim).filter(|e| !e.is_empty());
        if let Some(email) = assigned_email {
            validate_email(email)?;
            if quantity > 1 {
                return Err(EntitlementError::InvalidInput(
                    "An email can hold only one seat per license".into(),
                ));
            }
        }

        let mut tx = self.pool.begin().await?;
        let license = find_license(&mut tx, main_key)
            .await?
            .ok_or_else(|| EntitlementError::NotFound("Main license key".into()))?;

        let assigned = match assigned_email {
            Some(email) => {
                let user = find_or_create_user(&mut tx, email, None).await?;
                Some((normalize_email(email), user.id))
            }
            None => None,
        };

        let mut created = Vec::with_capacity(quantity as usize);
        for _ in 0..quantity {
            let assigned_ref = assigned.as_ref().map(|(email, id)| (email.as_str(), *id));
            created.push(insert_with_fresh_key(&mut tx, &license, assigned_ref).await?);
        }
        tx.commit().await?;

        tracing::info!(
            main_license = %license.key,
            quantity = quantity,
            assigned = assigned.is_some(),
            "Sub-licenses created"
        );
        Ok(created)
    }

    /// Apply an admin action to a seat
    pub async fn apply_action(
        &self,
        sub_key: &str,
        action: SubLicenseAction,
    ) -> EntitlementResult<SubLicenseRow> {
        self.apply(sub_key, action, None).await
    }

    /// Apply an action on behalf of the main license owner.
    /// Seats under licenses the user does not own are reported as missing.
    pub async fn apply_owner_action(
        &self,
        owner_id: Uuid,
        sub_key: &str,
        action: SubLicenseAction,
    ) -> EntitlementResult<SubLicenseRow> {
        self.apply(sub_key, action, Some(owner_id)).await
    }

    async fn apply(
        &self,
        sub_key: &str,
        action: SubLicenseAction,
        owner_id: Option<Uuid>,
    ) -> EntitlementResult<SubLicenseRow> {
        let mut tx = self.pool.begin().await?;
        let row = lock_sub_license(&mut tx, sub_key).await?;

        if let Some(owner_id) = owner_id {
            let owns: Option<(Uuid,)> = sqlx::query_as(
                "SELECT user_id FROM user_license_keys WHERE user_id = $1 AND license_key_id = $2",
            )
            .bind(owner_id)
            .bind(row.main_license_key_id)
            .fetch_optional(&mut *tx)
            .await?;
            if owns.is_none() {
                return Err(EntitlementError::NotFound("Sub-license".into()));
            }
        }

        let mut state = row.state()?;
        let now = OffsetDateTime::now_utc();
        let mut new_key: Option<String> = None;

        match &action {
            SubLicenseAction::Assign { email } => {
                let holder: Option<(String,)> = sqlx::query_as(
                    r#"
                    SELECT key FROM sub_licenses
                    WHERE main_license_key_id = $1
                      AND LOWER(assigned_email) = LOWER($2)
                      AND id <> $3
                    "#,
                )
                .bind(row.main_license_key_id)
                .bind(email)
                .bind(row.id)
                .fetch_optional(&mut *tx)
                .await?;
                if holder.is_some() {
                    return Err(EntitlementError::Conflict(format!(
                        "{} already holds a seat under this license",
                        email
                    )));
                }
                let user = find_or_create_user(&mut tx, email, None).await?;
                state.assign(email, user.id);
            }
            SubLicenseAction::Unassign => state.unassign(),
            SubLicenseAction::Deactivate => state.deactivate(now),
            SubLicenseAction::Activate => state.activate(),
            SubLicenseAction::Regenerate => {
                let mut candidate = None;
                for _ in 0..KEY_GENERATION_ATTEMPTS {
                    let key = generate_license_key("SUB");
                    if find_sub_license(&mut tx, &key).await?.is_none() {
                        candidate = Some(key);
                        break;
                    }
                }
                new_key = Some(candidate.ok_or_else(|| {
                    EntitlementError::Internal("Could not generate a unique sub-license key".into())
                })?);
            }
        }

        let updated: SubLicenseRow = sqlx::query_as(&format!(
            r#"
            UPDATE sub_licenses
            SET status = $2,
                assigned_email = $3,
                assigned_user_id = $4,
                deactivated_at = $5,
                key = COALESCE($6, key),
                activation_count = CASE WHEN $6 IS NULL THEN activation_count ELSE 0 END,
                updated_at = NOW()
            WHERE id = $1
            RETURNING {}
            "#,
            SUB_LICENSE_COLUMNS
        ))
        .bind(row.id)
        .bind(state.status.as_str())
        .bind(&state.assigned_email)
        .bind(state.assigned_user_id)
        .bind(state.deactivated_at)
        .bind(&new_key)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        tracing::info!(
            sub_license = %row.key,
            action = action.name(),
            status = %updated.status,
            "Sub-license updated"
        );
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(status: &str) -> SubLicenseRow {
        SubLicenseRow {
            id: Uuid::new_v4(),
            key: "SUB-1-MAIN".into(),
            status: status.into(),
            assigned_email: None,
            assigned_user_id: None,
            main_license_key_id: Uuid::new_v4(),
            vendor: "lemonsqueezy".into(),
            original_license_key: Some("MAIN".into()),
            activation_count: 0,
            deactivated_at: None,
            converted_to_team: false,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn test_row_state_parses_status() {
        assert_eq!(row("INACTIVE").state().unwrap().status, SubLicenseStatus::Inactive);
        assert!(row("BROKEN").state().is_err());
    }

    #[test]
    fn test_view_serializes_flat_with_user() {
        let view = SubLicenseView {
            sub_license: row("ACTIVE"),
            assigned_user: None,
        };
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["key"], "SUB-1-MAIN");
        assert_eq!(json["status"], "ACTIVE");
        assert!(json["assignedUser"].is_null());
    }
}
