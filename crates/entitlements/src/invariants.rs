//! Entitlement Invariants Module
//!
//! Runnable consistency checks over licenses, seats, subscriptions and the
//! credit ledger. They only read, so they are safe to run after any webhook
//! replay or admin repair, and daily from the worker.

use std::collections::HashSet;

use olly_shared::{PlanTier, Vendor};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::EntitlementResult;
use crate::vendor::sub_license_count;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// User(s) affected
    pub user_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Credits or access are wrong right now
    Critical,
    /// Data inconsistency that needs attention
    High,
    /// Potential issue, should investigate
    Medium,
    /// Informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    pub fn from_violations(checked_at: OffsetDateTime, checks_run: usize, violations: Vec<InvariantViolation>) -> Self {
        let checks_failed = violations
            .iter()
            .map(|v| v.invariant.as_str())
            .collect::<HashSet<_>>()
            .len();
        Self {
            checked_at,
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct LedgerMismatchRow {
    user_id: Uuid,
    balance: i64,
    ledger_sum: i64,
    entries: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct MultipleSubsRow {
    user_id: Uuid,
    sub_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct DoubleAssignmentRow {
    main_license_key: String,
    email: String,
    seat_count: i64,
    user_ids: Vec<Uuid>,
}

#[derive(Debug, sqlx::FromRow)]
struct InactiveLicenseSeatsRow {
    license_key: String,
    active_seats: i64,
    owner_ids: Vec<Uuid>,
}

#[derive(Debug, sqlx::FromRow)]
struct SeatCountRow {
    license_key: String,
    vendor: String,
    tier: Option<i32>,
    seat_count: i64,
    owner_ids: Vec<Uuid>,
}

/// Service for running entitlement invariant checks
#[derive(Clone)]
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> EntitlementResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_credit_balance_matches_ledger().await?);
        violations.extend(self.check_single_active_subscription().await?);
        violations.extend(self.check_sub_license_assigned_once().await?);
        violations.extend(self.check_inactive_license_active_sub_licenses().await?);
        violations.extend(self.check_sub_license_seat_limit().await?);

        Ok(InvariantCheckSummary::from_violations(
            now,
            Self::available_checks().len(),
            violations,
        ))
    }

    /// Invariant 1: a user's balance equals the sum of their ledger entries
    async fn check_credit_balance_matches_ledger(&self) -> EntitlementResult<Vec<InvariantViolation>> {
        let rows: Vec<LedgerMismatchRow> = sqlx::query_as(
            r#"
            SELECT uc.user_id,
                   uc.balance,
                   COALESCE(SUM(ct.amount), 0)::BIGINT AS ledger_sum,
                   COUNT(ct.id) AS entries
            FROM user_credits uc
            LEFT JOIN credit_transactions ct ON ct.user_credit_id = uc.id
            GROUP BY uc.id, uc.user_id, uc.balance
            HAVING uc.balance <> COALESCE(SUM(ct.amount), 0)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "credit_balance_matches_ledger".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Balance {} does not match ledger total {}",
                    row.balance, row.ledger_sum
                ),
                context: serde_json::json!({
                    "balance": row.balance,
                    "ledger_sum": row.ledger_sum,
                    "entries": row.entries,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: at most one ACTIVE subscription per user
    async fn check_single_active_subscription(&self) -> EntitlementResult<Vec<InvariantViolation>> {
        let rows: Vec<MultipleSubsRow> = sqlx::query_as(
            r#"
            SELECT user_id, COUNT(*) AS sub_count
            FROM user_subscriptions
            WHERE status = 'ACTIVE'
            GROUP BY user_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_active_subscription".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "User has {} active subscriptions (expected 1)",
                    row.sub_count
                ),
                context: serde_json::json!({
                    "subscription_count": row.sub_count,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 3: an email holds at most one seat per main license
    async fn check_sub_license_assigned_once(&self) -> EntitlementResult<Vec<InvariantViolation>> {
        let rows: Vec<DoubleAssignmentRow> = sqlx::query_as(
            r#"
            SELECT lk.key AS main_license_key,
                   LOWER(sl.assigned_email) AS email,
                   COUNT(*) AS seat_count,
                   ARRAY_REMOVE(ARRAY_AGG(DISTINCT sl.assigned_user_id), NULL) AS user_ids
            FROM sub_licenses sl
            JOIN license_keys lk ON lk.id = sl.main_license_key_id
            WHERE sl.assigned_email IS NOT NULL
            GROUP BY lk.key, LOWER(sl.assigned_email)
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "sub_license_assigned_once".to_string(),
                user_ids: row.user_ids,
                description: format!(
                    "{} holds {} seats under license {}",
                    row.email, row.seat_count, row.main_license_key
                ),
                context: serde_json::json!({
                    "main_license_key": row.main_license_key,
                    "email": row.email,
                    "seat_count": row.seat_count,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 4: seats of an inactive license are inactive too
    async fn check_inactive_license_active_sub_licenses(&self) -> EntitlementResult<Vec<InvariantViolation>> {
        let rows: Vec<InactiveLicenseSeatsRow> = sqlx::query_as(
            r#"
            SELECT lk.key AS license_key,
                   COUNT(sl.id) AS active_seats,
                   ARRAY(
                       SELECT ulk.user_id FROM user_license_keys ulk
                       WHERE ulk.license_key_id = lk.id
                   ) AS owner_ids
            FROM license_keys lk
            JOIN sub_licenses sl ON sl.main_license_key_id = lk.id AND sl.status = 'ACTIVE'
            WHERE NOT lk.is_active
            GROUP BY lk.id, lk.key
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "inactive_license_active_sub_licenses".to_string(),
                user_ids: row.owner_ids,
                description: format!(
                    "Inactive license {} still has {} active sub-licenses",
                    row.license_key, row.active_seats
                ),
                context: serde_json::json!({
                    "license_key": row.license_key,
                    "active_seats": row.active_seats,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Invariant 5: vendor licenses carry no more seats than their tier includes
    async fn check_sub_license_seat_limit(&self) -> EntitlementResult<Vec<InvariantViolation>> {
        let rows: Vec<SeatCountRow> = sqlx::query_as(
            r#"
            SELECT lk.key AS license_key,
                   lk.vendor,
                   lk.tier,
                   COUNT(sl.id) AS seat_count,
                   ARRAY(
                       SELECT ulk.user_id FROM user_license_keys ulk
                       WHERE ulk.license_key_id = lk.id
                   ) AS owner_ids
            FROM license_keys lk
            JOIN sub_licenses sl ON sl.main_license_key_id = lk.id
            WHERE lk.vendor IN ('appsumo', 'lemonsqueezy')
            GROUP BY lk.id, lk.key, lk.vendor, lk.tier
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let vendor: Vendor = row.vendor.parse().ok()?;
                let tier = row.tier.and_then(PlanTier::from_number).unwrap_or_default();
                let limit = i64::from(sub_license_count(vendor, tier));
                (row.seat_count > limit).then(|| InvariantViolation {
                    invariant: "sub_license_seat_limit".to_string(),
                    user_ids: row.owner_ids,
                    description: format!(
                        "License {} has {} sub-licenses, tier {} includes {}",
                        row.license_key,
                        row.seat_count,
                        tier.number(),
                        limit
                    ),
                    context: serde_json::json!({
                        "license_key": row.license_key,
                        "vendor": row.vendor,
                        "tier": tier.number(),
                        "seat_count": row.seat_count,
                        "seat_limit": limit,
                    }),
                    severity: ViolationSeverity::Low,
                })
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> EntitlementResult<Vec<InvariantViolation>> {
        match name {
            "credit_balance_matches_ledger" => self.check_credit_balance_matches_ledger().await,
            "single_active_subscription" => self.check_single_active_subscription().await,
            "sub_license_assigned_once" => self.check_sub_license_assigned_once().await,
            "inactive_license_active_sub_licenses" => {
                self.check_inactive_license_active_sub_licenses().await
            }
            "sub_license_seat_limit" => self.check_sub_license_seat_limit().await,
            _ => Ok(vec![]),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "credit_balance_matches_ledger",
            "single_active_subscription",
            "sub_license_assigned_once",
            "inactive_license_active_sub_licenses",
            "sub_license_seat_limit",
        ]
    }
}
