//! Common types used across the entitlement service
//!
//! Enum columns are stored as TEXT. Row structs keep them as `String` and
//! convert with `FromStr` at the service boundary.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// ID Wrappers
// =============================================================================

/// User ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for UserId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

// =============================================================================
// Enums
// =============================================================================

/// Plan tier. T1 is the single-seat Individual plan, T4 is Enterprise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PlanTier {
    T1,
    T2,
    T3,
    T4,
}

impl Default for PlanTier {
    fn default() -> Self {
        Self::T1
    }
}

impl PlanTier {
    pub const ALL: [PlanTier; 4] = [Self::T1, Self::T2, Self::T3, Self::T4];

    /// Numeric tier used by AppSumo and stored on license keys (1..=4)
    pub fn number(&self) -> i32 {
        match self {
            Self::T1 => 1,
            Self::T2 => 2,
            Self::T3 => 3,
            Self::T4 => 4,
        }
    }

    /// Tier from its numeric form. Returns None outside 1..=4.
    pub fn from_number(n: i32) -> Option<Self> {
        match n {
            1 => Some(Self::T1),
            2 => Some(Self::T2),
            3 => Some(Self::T3),
            4 => Some(Self::T4),
            _ => None,
        }
    }

    /// Marketing name of the tier
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::T1 => "Individual",
            Self::T2 => "Team",
            Self::T3 => "Agency",
            Self::T4 => "Enterprise",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::T1 => "T1",
            Self::T2 => "T2",
            Self::T3 => "T3",
            Self::T4 => "T4",
        }
    }
}

impl std::fmt::Display for PlanTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for PlanTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "T1" | "1" => Ok(Self::T1),
            "T2" | "2" => Ok(Self::T2),
            "T3" | "3" => Ok(Self::T3),
            "T4" | "4" => Ok(Self::T4),
            _ => Err(format!("Unknown plan tier: {}", s)),
        }
    }
}

/// Billing duration of a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PlanDuration {
    Lifetime,
    Monthly,
}

impl PlanDuration {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lifetime => "LIFETIME",
            Self::Monthly => "MONTHLY",
        }
    }
}

impl std::fmt::Display for PlanDuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for PlanDuration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "LIFETIME" => Ok(Self::Lifetime),
            "MONTHLY" => Ok(Self::Monthly),
            _ => Err(format!("Unknown plan duration: {}", s)),
        }
    }
}

/// Marketplace or storefront a license was sold through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vendor {
    AppSumo,
    LemonSqueezy,
    /// Keys minted by the platform itself (admin grants, redemptions)
    Olly,
}

impl Vendor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AppSumo => "appsumo",
            Self::LemonSqueezy => "lemonsqueezy",
            Self::Olly => "olly",
        }
    }

    /// Label used in plan names shown to users
    pub fn label(&self) -> &'static str {
        match self {
            Self::AppSumo => "AppSumo",
            Self::LemonSqueezy => "LEMON",
            Self::Olly => "Olly",
        }
    }
}

impl std::fmt::Display for Vendor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Vendor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "appsumo" => Ok(Self::AppSumo),
            "lemonsqueezy" | "lemon" => Ok(Self::LemonSqueezy),
            "olly" => Ok(Self::Olly),
            _ => Err(format!("Unknown vendor: {}", s)),
        }
    }
}

/// Status of a sub-license seat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SubLicenseStatus {
    Active,
    Inactive,
}

impl SubLicenseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Inactive => "INACTIVE",
        }
    }
}

impl std::fmt::Display for SubLicenseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SubLicenseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "ACTIVE" => Ok(Self::Active),
            "INACTIVE" => Ok(Self::Inactive),
            _ => Err(format!("Unknown sub-license status: {}", s)),
        }
    }
}

/// Lifecycle of a promotional redeem code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RedeemCodeStatus {
    Active,
    Claimed,
    Expired,
}

impl RedeemCodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Claimed => "CLAIMED",
            Self::Expired => "EXPIRED",
        }
    }
}

impl std::fmt::Display for RedeemCodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for RedeemCodeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "ACTIVE" => Ok(Self::Active),
            "CLAIMED" => Ok(Self::Claimed),
            "EXPIRED" => Ok(Self::Expired),
            _ => Err(format!("Unknown redeem code status: {}", s)),
        }
    }
}

/// Status of a user's plan subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
    Active,
    Cancelled,
    PaymentFailed,
    Paused,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Cancelled => "CANCELLED",
            Self::PaymentFailed => "PAYMENT_FAILED",
            Self::Paused => "PAUSED",
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "ACTIVE" => Ok(Self::Active),
            "CANCELLED" => Ok(Self::Cancelled),
            "PAYMENT_FAILED" => Ok(Self::PaymentFailed),
            "PAUSED" => Ok(Self::Paused),
            _ => Err(format!("Unknown subscription status: {}", s)),
        }
    }
}

/// Kind of credit ledger entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    Purchased,
    Spent,
    PlanCreditsAdjusted,
    AdminAdjusted,
    TransferIn,
    TransferOut,
    Refunded,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Purchased => "PURCHASED",
            Self::Spent => "SPENT",
            Self::PlanCreditsAdjusted => "PLAN_CREDITS_ADJUSTED",
            Self::AdminAdjusted => "ADMIN_ADJUSTED",
            Self::TransferIn => "TRANSFER_IN",
            Self::TransferOut => "TRANSFER_OUT",
            Self::Refunded => "REFUNDED",
        }
    }
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TransactionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "PURCHASED" => Ok(Self::Purchased),
            "SPENT" => Ok(Self::Spent),
            "PLAN_CREDITS_ADJUSTED" => Ok(Self::PlanCreditsAdjusted),
            "ADMIN_ADJUSTED" => Ok(Self::AdminAdjusted),
            "TRANSFER_IN" => Ok(Self::TransferIn),
            "TRANSFER_OUT" => Ok(Self::TransferOut),
            "REFUNDED" => Ok(Self::Refunded),
            _ => Err(format!("Unknown transaction type: {}", s)),
        }
    }
}

/// Platform-wide role of a user
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformRole {
    User,
    Admin,
    SuperAdmin,
}

impl Default for PlatformRole {
    fn default() -> Self {
        Self::User
    }
}

impl PlatformRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Admin => "admin",
            Self::SuperAdmin => "superadmin",
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Self::Admin | Self::SuperAdmin)
    }
}

impl std::fmt::Display for PlatformRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for PlatformRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" => Ok(Self::User),
            "admin" => Ok(Self::Admin),
            "superadmin" | "super_admin" => Ok(Self::SuperAdmin),
            _ => Err(format!("Unknown platform role: {}", s)),
        }
    }
}
