// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Olly Entitlements
//!
//! Licenses, sub-licenses, plans and credits sold through AppSumo and
//! LemonSqueezy.
//!
//! ## Features
//!
//! - **Licenses**: validation, redemption, transfer and (de)activation
//! - **Sub-licenses**: seats under a main license, assigned by email
//! - **Credit ledger**: every balance change recorded with its resulting balance
//! - **Redeem codes**: promotional code batches that unlock an `olly` license
//! - **Vendor catalog**: product id and tier mapping, with env overrides
//! - **Plans**: one active subscription per user, LemonSqueezy lifecycle events
//! - **Webhooks**: signed AppSumo and LemonSqueezy deliveries, processed once
//! - **Invariants**: read-only consistency checks

use sqlx::PgPool;

pub mod accounts;
pub mod credits;
pub mod error;
pub mod invariants;
pub mod licenses;
pub mod model;
pub mod plans;
pub mod redeem_codes;
pub mod sublicenses;
pub mod vendor;
pub mod webhooks;

#[cfg(test)]
mod db_tests;
#[cfg(test)]
mod edge_case_tests;

// Accounts
pub use accounts::{AccountService, UserPage, UserRecord, UserSummary};

// Credits
pub use credits::{
    validate_admin_adjustment, CreditEntry, CreditService, CreditTransactionRow, TransferOutcome,
    MAX_ADMIN_ADJUSTMENT,
};

// Error
pub use error::{EntitlementError, EntitlementResult};

// Invariants
pub use invariants::{InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity};

// Licenses
pub use licenses::{
    LicenseKeyRow, LicenseService, LicenseValidation, OwnedLicense, PlanSummary, RedeemRequest,
    RedeemResult, TeamConversion, TransferResult, UserPlans,
};

// Model
pub use model::{BalancePolicy, SubLicenseAction, SubLicenseState};

// Plans
pub use plans::{PlanService, PlanUpdate, SubscriptionRow};

// Redeem codes
pub use redeem_codes::{
    NewRedeemBatch, RedeemBatch, RedeemBatchCreated, RedeemBatchPage, RedeemBatchSummary, RedeemClaim,
    RedeemCodeInfo, RedeemCodeService,
};

// Sub-licenses
pub use sublicenses::{SubLicenseRow, SubLicenseService, SubLicenseView, MAX_SUB_LICENSES_PER_REQUEST};

// Vendor
pub use vendor::{PlanDetails, VendorCatalog};

// Webhooks
pub use webhooks::{verify_appsumo, verify_lemon, WebhookEventRecord, WebhookOutcome, WebhookService};

/// All entitlement services over one pool and catalog
#[derive(Clone)]
pub struct EntitlementService {
    pub accounts: AccountService,
    pub licenses: LicenseService,
    pub sub_licenses: SubLicenseService,
    pub credits: CreditService,
    pub plans: PlanService,
    pub redeem_codes: RedeemCodeService,
    pub webhooks: WebhookService,
    pub invariants: InvariantChecker,
}

impl EntitlementService {
    pub fn new(pool: PgPool, catalog: VendorCatalog) -> Self {
        Self {
            accounts: AccountService::new(pool.clone()),
            licenses: LicenseService::new(pool.clone(), catalog.clone()),
            sub_licenses: SubLicenseService::new(pool.clone()),
            credits: CreditService::new(pool.clone()),
            plans: PlanService::new(pool.clone(), catalog.clone()),
            redeem_codes: RedeemCodeService::new(pool.clone()),
            webhooks: WebhookService::new(pool.clone(), catalog),
            invariants: InvariantChecker::new(pool),
        }
    }

    /// Catalog product ids read from the environment
    pub fn from_env(pool: PgPool) -> Self {
        Self::new(pool, VendorCatalog::from_env())
    }
}
