//! Credit ledger
//!
//! Every balance change goes through [`apply_delta`], which locks the user's
//! credit row and appends the matching ledger entry in the caller's
//! transaction. `balance` therefore always equals the sum of the ledger.

use olly_shared::TransactionType;
use serde::Serialize;
use sqlx::{FromRow, PgConnection, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::accounts::find_user_by_email;
use crate::error::{EntitlementError, EntitlementResult};
use crate::model::{resolve_delta, BalancePolicy};

/// Upper bound on history rows returned at once
const MAX_HISTORY: i64 = 500;

/// Largest single admin adjustment in either direction
pub const MAX_ADMIN_ADJUSTMENT: i64 = 1_000_000_000;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditEntry {
    pub transaction_id: Uuid,
    pub user_id: Uuid,
    /// Delta actually applied, after the balance policy
    pub amount: i64,
    pub balance_after: i64,
    pub transaction_type: TransactionType,
}

#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditTransactionRow {
    pub id: Uuid,
    pub amount: i64,
    pub balance_after: i64,
    #[serde(rename = "type")]
    #[sqlx(rename = "type")]
    pub transaction_type: String,
    pub description: Option<String>,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferOutcome {
    pub amount: i64,
    pub sender_balance: i64,
    pub recipient_id: Uuid,
    pub recipient_balance: i64,
}

/// Apply `delta` to a user's balance and record it, on the caller's transaction.
/// Returns None when the policy reduced the delta to zero.
pub(crate) async fn apply_delta(
    conn: &mut PgConnection,
    user_id: Uuid,
    delta: i64,
    transaction_type: TransactionType,
    description: &str,
    policy: BalancePolicy,
) -> EntitlementResult<Option<CreditEntry>> {
    if delta == 0 {
        return Err(EntitlementError::InvalidInput(
            "Credit amount must not be zero".into(),
        ));
    }

    sqlx::query(
        r#"
        INSERT INTO user_credits (user_id, balance)
        VALUES ($1, 0)
        ON CONFLICT (user_id) DO NOTHING
        "#,
    )
    .bind(user_id)
    .execute(&mut *conn)
    .await?;

    let (credit_id, balance): (Uuid, i64) =
        sqlx::query_as("SELECT id, balance FROM user_credits WHERE user_id = $1 FOR UPDATE")
            .bind(user_id)
            .fetch_one(&mut *conn)
            .await?;

    let effective = resolve_delta(balance, delta, policy)?;
    if effective == 0 {
        tracing::debug!(
            user_id = %user_id,
            requested = delta,
            "Credit change clamped to zero, nothing recorded"
        );
        return Ok(None);
    }

    let (balance_after,): (i64,) = sqlx::query_as(
        r#"
        UPDATE user_credits
        SET balance = balance + $2, updated_at = NOW()
        WHERE id = $1
        RETURNING balance
        "#,
    )
    .bind(credit_id)
    .bind(effective)
    .fetch_one(&mut *conn)
    .await?;

    let (transaction_id,): (Uuid,) = sqlx::query_as(
        r#"
        INSERT INTO credit_transactions (user_credit_id, amount, balance_after, type, description)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING id
        "#,
    )
    .bind(credit_id)
    .bind(effective)
    .bind(balance_after)
    .bind(transaction_type.as_str())
    .bind(description)
    .fetch_one(&mut *conn)
    .await?;

    tracing::info!(
        user_id = %user_id,
        amount = effective,
        balance_after = balance_after,
        transaction_type = %transaction_type,
        "Credit ledger entry recorded"
    );

    Ok(Some(CreditEntry {
        transaction_id,
        user_id,
        amount: effective,
        balance_after,
        transaction_type,
    }))
}

pub fn admin_adjustment_description(amount: i64) -> String {
    format!(
        "Admin credit adjustment: {} {} credits",
        if amount > 0 { "Added" } else { "Removed" },
        amount.unsigned_abs()
    )
}

/// Non-zero and within [`MAX_ADMIN_ADJUSTMENT`]
pub fn validate_admin_adjustment(amount: i64) -> EntitlementResult<()> {
    if amount == 0 {
        return Err(EntitlementError::InvalidInput("Amount must not be zero".into()));
    }
    if amount.unsigned_abs() > MAX_ADMIN_ADJUSTMENT.unsigned_abs() {
        return Err(EntitlementError::InvalidInput(format!(
            "Amount must be between -{0} and {0}",
            MAX_ADMIN_ADJUSTMENT
        )));
    }
    Ok(())
}

#[derive(Clone)]
pub struct CreditService {
    pool: PgPool,
}

impl CreditService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn balance(&self, user_id: Uuid) -> EntitlementResult<i64> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT balance FROM user_credits WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(b,)| b).unwrap_or(0))
    }

    /// Most recent ledger entries first
    pub async fn history(&self, user_id: Uuid, limit: i64) -> EntitlementResult<Vec<CreditTransactionRow>> {
        let rows: Vec<CreditTransactionRow> = sqlx::query_as(
            r#"
            SELECT ct.id, ct.amount, ct.balance_after, ct.type, ct.description, ct.created_at
            FROM credit_transactions ct
            JOIN user_credits uc ON uc.id = ct.user_credit_id
            WHERE uc.user_id = $1
            ORDER BY ct.created_at DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit.clamp(1, MAX_HISTORY))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Debit `amount` credits for a billable action. Fails without touching the
    /// balance when the user cannot afford it.
    pub async fn spend(&self, user_id: Uuid, amount: i64, action: &str) -> EntitlementResult<CreditEntry> {
        if amount < 1 {
            return Err(EntitlementError::InvalidInput(
                "Spend amount must be at least 1".into(),
            ));
        }
        let mut tx = self.pool.begin().await?;
        let entry = apply_delta(
            &mut tx,
            user_id,
            -amount,
            TransactionType::Spent,
            &format!("Used {} credits for {}", amount, action),
            BalancePolicy::Strict,
        )
        .await?
        .ok_or_else(|| EntitlementError::Internal("Spend recorded no ledger entry".into()))?;
        tx.commit().await?;
        Ok(entry)
    }

    /// Add credits, e.g. a purchase or a plan grant
    pub async fn grant(
        &self,
        user_id: Uuid,
        amount: i64,
        transaction_type: TransactionType,
        description: &str,
    ) -> EntitlementResult<CreditEntry> {
        if amount < 1 {
            return Err(EntitlementError::InvalidInput(
                "Grant amount must be positive".into(),
            ));
        }
        let mut tx = self.pool.begin().await?;
        let entry = apply_delta(
            &mut tx,
            user_id,
            amount,
            transaction_type,
            description,
            BalancePolicy::AllowNegative,
        )
        .await?
        .ok_or_else(|| EntitlementError::Internal("Grant recorded no ledger entry".into()))?;
        tx.commit().await?;
        Ok(entry)
    }

    /// Signed admin adjustment; may take the balance below zero
    pub async fn admin_adjust(&self, user_id: Uuid, amount: i64) -> EntitlementResult<CreditEntry> {
        validate_admin_adjustment(amount)?;
        let mut tx = self.pool.begin().await?;
        let entry = apply_delta(
            &mut tx,
            user_id,
            amount,
            TransactionType::AdminAdjusted,
            &admin_adjustment_description(amount),
            BalancePolicy::AllowNegative,
        )
        .await?
        .ok_or_else(|| EntitlementError::Internal("Adjustment recorded no ledger entry".into()))?;
        tx.commit().await?;
        Ok(entry)
    }

    pub async fn admin_adjust_by_email(&self, email: &str, amount: i64) -> EntitlementResult<CreditEntry> {
        let user = {
            let mut conn = self.pool.acquire().await?;
            find_user_by_email(&mut conn, email)
                .await?
                .ok_or_else(|| EntitlementError::NotFound("User".into()))?
        };
        self.admin_adjust(user.id, amount).await
    }

    /// Move credits between two users atomically. Rows are locked in user id
    /// order so opposite transfers cannot deadlock.
    pub async fn transfer(&self, from: Uuid, to: Uuid, amount: i64) -> EntitlementResult<TransferOutcome> {
        if amount < 1 {
            return Err(EntitlementError::InvalidInput(
                "Transfer amount must be positive".into(),
            ));
        }
        if from == to {
            return Err(EntitlementError::InvalidInput(
                "Cannot transfer credits to yourself".into(),
            ));
        }

        let mut tx = self.pool.begin().await?;
        let out_description = format!("Transferred {} credits to {}", amount, to);
        let in_description = format!("Received {} credits from {}", amount, from);

        // Lock the lower user id first
        let (sender, recipient) = if from < to {
            let sender = apply_delta(
                &mut tx,
                from,
                -amount,
                TransactionType::TransferOut,
                &out_description,
                BalancePolicy::Strict,
            )
            .await?;
            let recipient = apply_delta(
                &mut tx,
                to,
                amount,
                TransactionType::TransferIn,
                &in_description,
                BalancePolicy::Strict,
            )
            .await?;
            (sender, recipient)
        } else {
            let recipient = apply_delta(
                &mut tx,
                to,
                amount,
                TransactionType::TransferIn,
                &in_description,
                BalancePolicy::Strict,
            )
            .await?;
            let sender = apply_delta(
                &mut tx,
                from,
                -amount,
                TransactionType::TransferOut,
                &out_description,
                BalancePolicy::Strict,
            )
            .await?;
            (sender, recipient)
        };

        let (Some(sender), Some(recipient)) = (sender, recipient) else {
            return Err(EntitlementError::Internal("Transfer recorded no ledger entry".into()));
        };
        tx.commit().await?;

        tracing::info!(
            from_user = %from,
            to_user = %to,
            amount = amount,
            "Credits transferred"
        );

        Ok(TransferOutcome {
            amount,
            sender_balance: sender.balance_after,
            recipient_id: to,
            recipient_balance: recipient.balance_after,
        })
    }

    pub async fn transfer_to_email(
        &self,
        from: Uuid,
        recipient_email: &str,
        amount: i64,
    ) -> EntitlementResult<TransferOutcome> {
        let recipient = {
            let mut conn = self.pool.acquire().await?;
            find_user_by_email(&mut conn, recipient_email)
                .await?
                .ok_or_else(|| EntitlementError::NotFound("Recipient".into()))?
        };
        self.transfer(from, recipient.id, amount).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admin_adjustment_description() {
        assert_eq!(
            admin_adjustment_description(25),
            "Admin credit adjustment: Added 25 credits"
        );
        assert_eq!(
            admin_adjustment_description(-10),
            "Admin credit adjustment: Removed 10 credits"
        );
        assert_eq!(
            admin_adjustment_description(i64::MIN),
            format!("Admin credit adjustment: Removed {} credits", i64::MIN.unsigned_abs())
        );
    }

    #[test]
    fn test_admin_adjustment_bounds() {
        assert!(validate_admin_adjustment(1).is_ok());
        assert!(validate_admin_adjustment(-MAX_ADMIN_ADJUSTMENT).is_ok());
        assert!(validate_admin_adjustment(MAX_ADMIN_ADJUSTMENT).is_ok());
        for amount in [0, MAX_ADMIN_ADJUSTMENT + 1, i64::MIN, i64::MAX] {
            assert!(matches!(
                validate_admin_adjustment(amount),
                Err(EntitlementError::InvalidInput(_))
            ));
        }
    }

    #[test]
    fn test_transaction_row_serializes_type_field() {
        let row = CreditTransactionRow {
            id: Uuid::nil(),
            amount: -1,
            balance_after: 9,
            transaction_type: "SPENT".into(),
            description: None,
            created_at: OffsetDateTime::UNIX_EPOCH,
        };
        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json["type"], "SPENT");
        assert_eq!(json["balanceAfter"], 9);
    }
}
