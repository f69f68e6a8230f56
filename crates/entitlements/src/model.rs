//! Pure entitlement state transitions
//!
//! Services load a row, apply one of these transitions and write the result
//! back inside the same transaction. Nothing here touches the database.

use olly_shared::{PlanTier, SubLicenseStatus};
use rand::distr::Alphanumeric;
use rand::Rng;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{EntitlementError, EntitlementResult};
use crate::vendor::tier_plan_credits;

/// Mutable part of a sub-license
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubLicenseState {
    pub status: SubLicenseStatus,
    pub assigned_email: Option<String>,
    pub assigned_user_id: Option<Uuid>,
    pub deactivated_at: Option<OffsetDateTime>,
}

impl SubLicenseState {
    /// Fresh, unassigned seat
    pub fn unassigned() -> Self {
        Self {
            status: SubLicenseStatus::Active,
            assigned_email: None,
            assigned_user_id: None,
            deactivated_at: None,
        }
    }

    pub fn is_assigned(&self) -> bool {
        self.assigned_email.is_some() || self.assigned_user_id.is_some()
    }

    pub fn assign(&mut self, email: &str, user_id: Uuid) {
        self.assigned_email = Some(normalize_email(email));
        self.assigned_user_id = Some(user_id);
    }

    pub fn unassign(&mut self) {
        self.assigned_email = None;
        self.assigned_user_id = None;
    }

    /// Keeps the first deactivation time when already inactive
    pub fn deactivate(&mut self, now: OffsetDateTime) {
        if self.status == SubLicenseStatus::Active {
            self.status = SubLicenseStatus::Inactive;
            self.deactivated_at = Some(now);
        }
    }

    pub fn activate(&mut self) {
        self.status = SubLicenseStatus::Active;
        self.deactivated_at = None;
    }
}

/// Operation requested on a single sub-license
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubLicenseAction {
    Assign { email: String },
    Unassign,
    Deactivate,
    Activate,
    Regenerate,
}

impl SubLicenseAction {
    /// Parse an action name as sent by the dashboard, with its optional email
    pub fn parse(action: &str, email: Option<&str>) -> EntitlementResult<Self> {
        match action.trim().to_lowercase().as_str() {
            "assign" => {
                let email = email
                    .map(str::trim)
                    .filter(|e| !e.is_empty())
                    .ok_or_else(|| {
                        EntitlementError::InvalidInput("Email is required for assignment".into())
                    })?;
                validate_email(email)?;
                Ok(Self::Assign {
                    email: normalize_email(email),
                })
            }
            "unassign" => Ok(Self::Unassign),
            "deactivate" => Ok(Self::Deactivate),
            "activate" => Ok(Self::Activate),
            "regenerate" => Ok(Self::Regenerate),
            other => Err(EntitlementError::InvalidInput(format!(
                "Invalid action: {}",
                other
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Assign { .. } => "assign",
            Self::Unassign => "unassign",
            Self::Deactivate => "deactivate",
            Self::Activate => "activate",
            Self::Regenerate => "regenerate",
        }
    }
}

/// What to do when a debit exceeds the available balance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalancePolicy {
    /// Reject with `InsufficientCredits`
    Strict,
    /// Debit only what is available
    ClampToAvailable,
    /// Let the balance go negative
    AllowNegative,
}

/// Effective delta to apply to `balance` under `policy`
pub fn resolve_delta(balance: i64, delta: i64, policy: BalancePolicy) -> EntitlementResult<i64> {
    if delta >= 0 {
        return Ok(delta);
    }
    match policy {
        BalancePolicy::AllowNegative => Ok(delta),
        BalancePolicy::Strict => {
            if balance.saturating_add(delta) < 0 {
                Err(EntitlementError::InsufficientCredits {
                    balance,
                    requested: -delta,
                })
            } else {
                Ok(delta)
            }
        }
        BalancePolicy::ClampToAvailable => Ok(delta.max(-balance.max(0))),
    }
}

/// Credit change when a license moves from one tier to another
pub fn tier_credit_delta(previous: PlanTier, new: PlanTier) -> i64 {
    tier_plan_credits(new) - tier_plan_credits(previous)
}

/// Row offset of a 1-based page; out-of-range pages land past the last row
pub fn page_offset(page: i64, limit: i64) -> i64 {
    page.max(1).saturating_sub(1).saturating_mul(limit.max(0))
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

pub fn validate_email(email: &str) -> EntitlementResult<()> {
    let email = email.trim();
    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !domain.ends_with('.')
        }
        None => false,
    };
    if valid && !email.contains(char::is_whitespace) {
        Ok(())
    } else {
        Err(EntitlementError::InvalidInput(format!(
            "Invalid email address: {}",
            email
        )))
    }
}

/// Usernames are 3 to 31 characters of lowercase letters, digits, `_` or `-`
pub fn validate_username(username: &str) -> EntitlementResult<()> {
    let len = username.chars().count();
    if !(3..=31).contains(&len) {
        return Err(EntitlementError::InvalidInput(
            "Username must be between 3 and 31 characters".into(),
        ));
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
    {
        return Err(EntitlementError::InvalidInput(
            "Username may only contain lowercase letters, numbers, underscores and hyphens".into(),
        ));
    }
    Ok(())
}

pub fn validate_password(password: &str) -> EntitlementResult<()> {
    let len = password.chars().count();
    if !(6..=255).contains(&len) {
        return Err(EntitlementError::InvalidInput(
            "Password must be between 6 and 255 characters".into(),
        ));
    }
    Ok(())
}

/// Random license key, e.g. `OLLY-7K2Q-M9XA-P4TD-ZC8W`
pub fn generate_license_key(prefix: &str) -> String {
    let raw: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(|b| char::from(b).to_ascii_uppercase())
        .collect();
    let groups: Vec<&str> = (0..4).map(|i| &raw[i * 4..i * 4 + 4]).collect();
    format!("{}-{}", prefix, groups.join("-"))
}

/// Random 10-character promotional code, e.g. `K7Q2M9XAP4`
pub fn generate_redeem_code() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(|b| char::from(b).to_ascii_uppercase())
        .collect()
}

/// Deterministic key for the n-th (1-based) sub-license of a vendor key
pub fn vendor_sub_license_key(index: i32, main_key: &str) -> String {
    format!("SUB-{}-{}", index, main_key)
}
