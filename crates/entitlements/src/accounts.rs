//! User accounts as seen by the entitlement model

use argon2::password_hash::{rand_core::OsRng, PasswordHasher, SaltString};
use argon2::Argon2;
use serde::Serialize;
use sqlx::{FromRow, PgConnection, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{EntitlementError, EntitlementResult};
use crate::model::{normalize_email, page_offset};

#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub id: Uuid,
    pub email: String,
    pub name: Option<String>,
    pub username: Option<String>,
    pub platform_role: String,
    pub created_at: OffsetDateTime,
}

/// Admin listing row with entitlement totals
#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub id: Uuid,
    pub email: String,
    pub name: Option<String>,
    pub platform_role: String,
    pub credits: i64,
    pub active_licenses: i64,
    pub total_licenses: i64,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserPage {
    pub users: Vec<UserSummary>,
    pub total: i64,
}

/// Find a user by email or create one, on the caller's connection
pub(crate) async fn find_or_create_user(
    conn: &mut PgConnection,
    email: &str,
    name: Option<&str>,
) -> EntitlementResult<UserRecord> {
    let email = normalize_email(email);
    let user: UserRecord = sqlx::query_as(
        r#"
        INSERT INTO users (email, name)
        VALUES ($1, $2)
        ON CONFLICT ((LOWER(email))) DO UPDATE
            SET name = COALESCE(users.name, EXCLUDED.name)
        RETURNING id, email, name, username, platform_role, created_at
        "#,
    )
    .bind(&email)
    .bind(name)
    .fetch_one(&mut *conn)
    .await?;
    Ok(user)
}

pub(crate) async fn find_user_by_email(
    conn: &mut PgConnection,
    email: &str,
) -> EntitlementResult<Option<UserRecord>> {
    let user: Option<UserRecord> = sqlx::query_as(
        r#"
        SELECT id, email, name, username, platform_role, created_at
        FROM users
        WHERE LOWER(email) = LOWER($1)
        "#,
    )
    .bind(email.trim())
    .fetch_optional(&mut *conn)
    .await?;
    Ok(user)
}

pub(crate) fn hash_password(password: &str) -> EntitlementResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| EntitlementError::Internal(format!("Password hashing failed: {}", e)))
}

/// User lookups and the admin cascade delete
#[derive(Clone)]
pub struct AccountService {
    pool: PgPool,
}

impl AccountService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_user(&self, user_id: Uuid) -> EntitlementResult<UserRecord> {
        let user: Option<UserRecord> = sqlx::query_as(
            r#"
            SELECT id, email, name, username, platform_role, created_at
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        user.ok_or_else(|| EntitlementError::NotFound("User".into()))
    }

    pub async fn find_by_email(&self, email: &str) -> EntitlementResult<Option<UserRecord>> {
        let mut conn = self.pool.acquire().await?;
        find_user_by_email(&mut conn, email).await
    }

    pub async fn find_or_create(&self, email: &str, name: Option<&str>) -> EntitlementResult<UserRecord> {
        let mut conn = self.pool.acquire().await?;
        find_or_create_user(&mut conn, email, name).await
    }

    /// Page through users, optionally filtered by an email substring
    pub async fn list_users(
        &self,
        email_filter: Option<&str>,
        page: i64,
        limit: i64,
    ) -> EntitlementResult<UserPage> {
        let limit = limit.clamp(1, 100);
        let offset = page_offset(page, limit);
        let pattern = email_filter
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| format!("%{}%", s));

        let users: Vec<UserSummary> = sqlx::query_as(
            r#"
            SELECT
                u.id,
                u.email,
                u.name,
                u.platform_role,
                COALESCE(c.balance, 0) AS credits,
                COUNT(lk.id) FILTER (WHERE lk.is_active) AS active_licenses,
                COUNT(lk.id) AS total_licenses,
                u.created_at
            FROM users u
            LEFT JOIN user_credits c ON c.user_id = u.id
            LEFT JOIN user_license_keys ulk ON ulk.user_id = u.id
            LEFT JOIN license_keys lk ON lk.id = ulk.license_key_id
            WHERE $1::TEXT IS NULL OR u.email ILIKE $1
            GROUP BY u.id, c.balance
            ORDER BY u.created_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(&pattern)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let (total,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM users WHERE $1::TEXT IS NULL OR email ILIKE $1",
        )
        .bind(&pattern)
        .fetch_one(&self.pool)
        .await?;

        Ok(UserPage { users, total })
    }

    /// Hard-delete a user and everything that hangs off them, atomically
    pub async fn delete_user(&self, user_id: Uuid) -> EntitlementResult<()> {
        let mut tx = self.pool.begin().await?;

        let exists: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM users WHERE id = $1 FOR UPDATE")
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(EntitlementError::NotFound("User".into()));
        }

        sqlx::query(
            r#"
            DELETE FROM credit_transactions
            WHERE user_credit_id IN (SELECT id FROM user_credits WHERE user_id = $1)
            "#,
        )
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM user_credits WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM user_subscriptions WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM user_license_keys WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        // Seats go back to the pool rather than disappearing
        sqlx::query(
            r#"
            UPDATE sub_licenses
            SET assigned_user_id = NULL, assigned_email = NULL, updated_at = NOW()
            WHERE assigned_user_id = $1
            "#,
        )
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        tracing::info!(user_id = %user_id, "User and related entitlement data deleted");
        Ok(())
    }
}
