//! Vendor product and tier mapping
//!
//! Maps AppSumo tier ids and LemonSqueezy product ids onto internal plan
//! tiers. Product id lists come from the environment with hardcoded fallbacks,
//! so the catalog is built once at startup and shared.

use olly_shared::{PlanTier, Vendor};
use serde::Serialize;

/// LemonSqueezy product id env vars with their fallback ids, highest tier first
const LEMON_PRODUCT_ENV: [(PlanTier, &str, &[&str]); 4] = [
    (PlanTier::T4, "LEMON_ENTERPRISE_PRODUCT_IDS", &["363041", "363064"]),
    (PlanTier::T3, "LEMON_AGENCY_PRODUCT_IDS", &["363063", "321751"]),
    (PlanTier::T2, "LEMON_TEAM_PRODUCT_IDS", &["363062", "363040"]),
    (PlanTier::T1, "LEMON_INDIVIDUAL_PRODUCT_IDS", &["328561", "285937"]),
];

const APPSUMO_TIER_ENV: [(PlanTier, &str, &str); 4] = [
    (PlanTier::T1, "APPSUMO_INDIVIDUAL_TIER_ID", "1"),
    (PlanTier::T2, "APPSUMO_TEAM_TIER_ID", "2"),
    (PlanTier::T3, "APPSUMO_AGENCY_TIER_ID", "3"),
    (PlanTier::T4, "APPSUMO_ENTERPRISE_TIER_ID", "4"),
];

/// Seats (main license included) for a tier
pub fn tier_max_users(tier: PlanTier) -> i32 {
    match tier {
        PlanTier::T1 => 1,
        PlanTier::T2 => 5,
        PlanTier::T3 => 10,
        PlanTier::T4 => 20,
    }
}

/// Credits granted when a plan of this tier is purchased
pub fn tier_plan_credits(tier: PlanTier) -> i64 {
    match tier {
        PlanTier::T1 => 100,
        PlanTier::T2 => 500,
        PlanTier::T3 => 1000,
        PlanTier::T4 => 2000,
    }
}

/// List price in USD cents
pub fn tier_price_cents(tier: PlanTier) -> i64 {
    match tier {
        PlanTier::T1 => 4_900,
        PlanTier::T2 => 14_900,
        PlanTier::T3 => 29_900,
        PlanTier::T4 => 49_900,
    }
}

/// Sub-licenses issued with a plan. AppSumo codes carry one seat per user
/// on top of the main key; LemonSqueezy counts the main key as a seat.
pub fn sub_license_count(vendor: Vendor, tier: PlanTier) -> i32 {
    match vendor {
        Vendor::AppSumo => match tier {
            PlanTier::T1 => 0,
            PlanTier::T2 => 5,
            PlanTier::T3 => 10,
            PlanTier::T4 => 20,
        },
        Vendor::LemonSqueezy | Vendor::Olly => tier_max_users(tier) - 1,
    }
}

/// Everything the entitlement model needs to know about a resolved plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanDetails {
    pub tier: PlanTier,
    pub vendor: Vendor,
    pub name: String,
    pub max_users: i32,
    pub sub_license_count: i32,
    pub plan_credits: i64,
    pub price_cents: i64,
}

impl PlanDetails {
    pub fn new(vendor: Vendor, tier: PlanTier) -> Self {
        Self {
            tier,
            vendor,
            name: format!("{} {}", vendor.label(), tier.display_name()),
            max_users: tier_max_users(tier),
            sub_license_count: sub_license_count(vendor, tier),
            plan_credits: tier_plan_credits(tier),
            price_cents: tier_price_cents(tier),
        }
    }
}

/// Vendor product catalog
#[derive(Debug, Clone)]
pub struct VendorCatalog {
    lemon_products: Vec<(PlanTier, Vec<String>)>,
    appsumo_tier_ids: Vec<(PlanTier, String)>,
}

impl Default for VendorCatalog {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl VendorCatalog {
    /// Build the catalog from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the catalog from any variable source. Empty or missing values
    /// fall back to the built-in ids.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let lemon_products = LEMON_PRODUCT_ENV
            .iter()
            .map(|(tier, var, fallback)| {
                let ids: Vec<String> = lookup(var)
                    .map(|raw| {
                        raw.split(',')
                            .map(|s| s.trim().to_string())
                            .filter(|s| !s.is_empty())
                            .collect()
                    })
                    .unwrap_or_default();
                let ids = if ids.is_empty() {
                    fallback.iter().map(|s| s.to_string()).collect()
                } else {
                    ids
                };
                (*tier, ids)
            })
            .collect();

        let appsumo_tier_ids = APPSUMO_TIER_ENV
            .iter()
            .map(|(tier, var, fallback)| {
                let id = lookup(var)
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| fallback.to_string());
                (*tier, id)
            })
            .collect();

        Self {
            lemon_products,
            appsumo_tier_ids,
        }
    }

    /// Tier for a LemonSqueezy product id, None when unknown
    pub fn lemon_tier(&self, product_id: &str) -> Option<PlanTier> {
        let product_id = product_id.trim();
        self.lemon_products
            .iter()
            .find(|(_, ids)| ids.iter().any(|id| id == product_id))
            .map(|(tier, _)| *tier)
    }

    pub fn lemon_plan(&self, product_id: &str) -> Option<PlanDetails> {
        self.lemon_tier(product_id)
            .map(|tier| PlanDetails::new(Vendor::LemonSqueezy, tier))
    }

    /// Total lookup: unknown product ids resolve to the Individual tier
    pub fn lemon_plan_or_default(&self, product_id: &str) -> PlanDetails {
        self.lemon_plan(product_id).unwrap_or_else(|| {
            tracing::warn!(
                product_id = %product_id,
                "Unknown LemonSqueezy product, falling back to Individual tier"
            );
            PlanDetails::new(Vendor::LemonSqueezy, PlanTier::T1)
        })
    }

    /// AppSumo plan for a numeric tier. Tiers outside 1..=4 resolve to T1.
    pub fn appsumo_plan(&self, tier: i32) -> PlanDetails {
        let tier = PlanTier::from_number(tier).unwrap_or_else(|| {
            tracing::warn!(tier = tier, "Invalid AppSumo tier, defaulting to 1");
            PlanTier::T1
        });
        PlanDetails::new(Vendor::AppSumo, tier)
    }

    /// AppSumo plan for a raw tier id from a webhook payload
    pub fn appsumo_plan_for_id(&self, tier_id: &str) -> PlanDetails {
        let tier_id = tier_id.trim();
        let tier = self
            .appsumo_tier_ids
            .iter()
            .find(|(_, id)| id == tier_id)
            .map(|(tier, _)| tier.number())
            .unwrap_or_else(|| tier_id.parse().unwrap_or(1));
        self.appsumo_plan(tier)
    }

    /// Plan for a redeemed key, picked from the tier name embedded in it
    pub fn redemption_plan(&self, license_key: &str) -> PlanDetails {
        let key = license_key.to_lowercase();
        let tier = if key.contains("enterprise") {
            PlanTier::T4
        } else if key.contains("agency") {
            PlanTier::T3
        } else if key.contains("team") {
            PlanTier::T2
        } else {
            PlanTier::T1
        };
        PlanDetails::new(Vendor::Olly, tier)
    }

    /// Human label for a LemonSqueezy order, used in purchase logs
    pub fn plan_type_label(&self, product_id: &str, is_credit_purchase: bool) -> String {
        if is_credit_purchase {
            return "credits".to_string();
        }
        match self.lemon_tier(product_id) {
            Some(tier) => format!("{} plan", tier.display_name()),
            None => "Unknown plan".to_string(),
        }
    }

    /// Maximum seats for a license, given its vendor, stored tier and product id
    pub fn max_seats(&self, vendor: Vendor, tier: Option<i32>, product_id: Option<&str>) -> i32 {
        match (vendor, tier, product_id) {
            (Vendor::LemonSqueezy, _, Some(pid)) => self.lemon_plan_or_default(pid).max_users,
            (_, Some(tier), _) => self.appsumo_plan(tier).max_users,
            _ => tier_max_users(PlanTier::T1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_fallback_lemon_ids() {
        let catalog = VendorCatalog::default();
        assert_eq!(catalog.lemon_tier("363041"), Some(PlanTier::T4));
        assert_eq!(catalog.lemon_tier("321751"), Some(PlanTier::T3));
        assert_eq!(catalog.lemon_tier("363040"), Some(PlanTier::T2));
        assert_eq!(catalog.lemon_tier("285937"), Some(PlanTier::T1));
    }

    #[test]
    fn test_lookup_overrides_fallback() {
        let catalog = VendorCatalog::from_lookup(|name| match name {
            "LEMON_TEAM_PRODUCT_IDS" => Some("111, 222".to_string()),
            _ => None,
        });
        assert_eq!(catalog.lemon_tier("222"), Some(PlanTier::T2));
        assert_eq!(catalog.lemon_tier("363062"), None);
        // Other tiers keep their fallback ids
        assert_eq!(catalog.lemon_tier("363041"), Some(PlanTier::T4));
    }

    #[test]
    fn test_empty_env_value_uses_fallback() {
        let catalog = VendorCatalog::from_lookup(|name| match name {
            "LEMON_AGENCY_PRODUCT_IDS" => Some(" , ".to_string()),
            _ => None,
        });
        assert_eq!(catalog.lemon_tier("363063"), Some(PlanTier::T3));
    }

    #[test]
    fn test_unknown_product_falls_back_to_individual() {
        let catalog = VendorCatalog::default();
        assert!(catalog.lemon_plan("999999").is_none());
        let plan = catalog.lemon_plan_or_default("999999");
        assert_eq!(plan.tier, PlanTier::T1);
        assert_eq!(plan.max_users, 1);
        assert_eq!(plan.sub_license_count, 0);
    }

    #[test]
    fn test_lemon_sub_licenses_exclude_main_seat() {
        let catalog = VendorCatalog::default();
        let enterprise = catalog.lemon_plan("363064").unwrap();
        assert_eq!(enterprise.max_users, 20);
        assert_eq!(enterprise.sub_license_count, 19);
        assert_eq!(enterprise.plan_credits, 2000);
        assert_eq!(enterprise.name, "LEMON Enterprise");
    }

    #[test]
    fn test_appsumo_invalid_tier_defaults_to_one() {
        let catalog = VendorCatalog::default();
        assert_eq!(catalog.appsumo_plan(0).tier, PlanTier::T1);
        assert_eq!(catalog.appsumo_plan(7).tier, PlanTier::T1);
        let agency = catalog.appsumo_plan(3);
        assert_eq!(agency.sub_license_count, 10);
        assert_eq!(agency.plan_credits, 1000);
    }

    #[test]
    fn test_appsumo_tier_id_mapping() {
        let catalog = VendorCatalog::from_lookup(|name| match name {
            "APPSUMO_AGENCY_TIER_ID" => Some("olly_tier3".to_string()),
            _ => None,
        });
        assert_eq!(catalog.appsumo_plan_for_id("olly_tier3").tier, PlanTier::T3);
        assert_eq!(catalog.appsumo_plan_for_id("2").tier, PlanTier::T2);
        assert_eq!(catalog.appsumo_plan_for_id("garbage").tier, PlanTier::T1);
    }

    #[test]
    fn test_redemption_plan_from_key() {
        let catalog = VendorCatalog::default();
        assert_eq!(catalog.redemption_plan("OLLY-AGENCY-123").tier, PlanTier::T3);
        assert_eq!(catalog.redemption_plan("olly-team-xyz").tier, PlanTier::T2);
        assert_eq!(catalog.redemption_plan("ABC").tier, PlanTier::T1);
    }

    #[test]
    fn test_plan_type_label() {
        let catalog = VendorCatalog::default();
        assert_eq!(catalog.plan_type_label("363041", true), "credits");
        assert_eq!(catalog.plan_type_label("363041", false), "Enterprise plan");
        assert_eq!(catalog.plan_type_label("1", false), "Unknown plan");
    }

    #[test]
    fn test_max_seats() {
        let catalog = VendorCatalog::default();
        assert_eq!(catalog.max_seats(Vendor::AppSumo, Some(2), None), 5);
        assert_eq!(
            catalog.max_seats(Vendor::LemonSqueezy, None, Some("363063")),
            10
        );
        assert_eq!(catalog.max_seats(Vendor::Olly, None, None), 1);
    }

    #[test]
    #[serial]
    fn test_from_env_reads_product_ids() {
        std::env::set_var("LEMON_ENTERPRISE_PRODUCT_IDS", "9001");
        let catalog = VendorCatalog::from_env();
        std::env::remove_var("LEMON_ENTERPRISE_PRODUCT_IDS");
        assert_eq!(catalog.lemon_tier("9001"), Some(PlanTier::T4));
        assert_eq!(catalog.lemon_tier("363041"), None);
    }
}
