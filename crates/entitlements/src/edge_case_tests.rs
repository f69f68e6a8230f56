// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for Entitlements
//!
//! Boundary conditions in:
//! - Sub-license state transitions
//! - Credit balance policies
//! - Vendor tier mapping
//! - Webhook signatures and timestamps

#[cfg(test)]
mod sub_license_state_tests {
    use crate::model::*;
    use olly_shared::SubLicenseStatus;
    use time::macros::datetime;
    use uuid::Uuid;

    // =========================================================================
    // Assign then unassign leaves a seat exactly as a fresh one
    // =========================================================================
    #[test]
    fn test_assign_unassign_round_trip_on_fresh_seat() {
        let mut state = SubLicenseState::unassigned();
        state.assign("  Someone@Example.COM ", Uuid::new_v4());
        assert!(state.is_assigned());
        assert_eq!(state.assigned_email.as_deref(), Some("someone@example.com"));

        state.unassign();
        assert_eq!(state, SubLicenseState::unassigned());
    }

    // =========================================================================
    // Unassign keeps status: an inactive seat stays inactive
    // =========================================================================
    #[test]
    fn test_unassign_does_not_reactivate() {
        let when = datetime!(2030-01-01 0:00 UTC);
        let mut state = SubLicenseState::unassigned();
        state.assign("a@b.co", Uuid::new_v4());
        state.deactivate(when);
        state.unassign();

        assert_eq!(state.status, SubLicenseStatus::Inactive);
        assert_eq!(state.deactivated_at, Some(when));
        assert!(!state.is_assigned());
    }

    // =========================================================================
    // Reassigning replaces the holder instead of stacking
    // =========================================================================
    #[test]
    fn test_reassign_replaces_holder() {
        let second = Uuid::new_v4();
        let mut state = SubLicenseState::unassigned();
        state.assign("first@b.co", Uuid::new_v4());
        state.assign("second@b.co", second);

        assert_eq!(state.assigned_email.as_deref(), Some("second@b.co"));
        assert_eq!(state.assigned_user_id, Some(second));
    }

    // =========================================================================
    // Action names are case-insensitive, unknown ones rejected
    // =========================================================================
    #[test]
    fn test_action_parsing_edges() {
        assert_eq!(
            SubLicenseAction::parse("  DEACTIVATE ", None).unwrap(),
            SubLicenseAction::Deactivate
        );
        assert!(SubLicenseAction::parse("assign", Some("   ")).is_err());
        assert!(SubLicenseAction::parse("assign", Some("no-at-sign")).is_err());
        assert!(SubLicenseAction::parse("delete", None).is_err());
        assert!(SubLicenseAction::parse("", None).is_err());
    }
}

#[cfg(test)]
mod balance_policy_tests {
    use crate::error::EntitlementError;
    use crate::model::*;

    // =========================================================================
    // Spending the exact balance is allowed and lands on zero
    // =========================================================================
    #[test]
    fn test_strict_spend_of_entire_balance() {
        assert_eq!(resolve_delta(100, -100, BalancePolicy::Strict).unwrap(), -100);
    }

    // =========================================================================
    // One credit over the balance is rejected with both numbers reported
    // =========================================================================
    #[test]
    fn test_strict_one_over_balance() {
        match resolve_delta(100, -101, BalancePolicy::Strict) {
            Err(EntitlementError::InsufficientCredits { balance, requested }) => {
                assert_eq!(balance, 100);
                assert_eq!(requested, 101);
            }
            other => panic!("expected InsufficientCredits, got {:?}", other),
        }
    }

    // =========================================================================
    // Clamping an already negative balance debits nothing
    // =========================================================================
    #[test]
    fn test_clamp_on_negative_balance_is_zero() {
        assert_eq!(resolve_delta(-50, -10, BalancePolicy::ClampToAvailable).unwrap(), 0);
        assert_eq!(resolve_delta(0, -10, BalancePolicy::ClampToAvailable).unwrap(), 0);
    }

    // =========================================================================
    // Extreme values do not overflow
    // =========================================================================
    #[test]
    fn test_extreme_values() {
        assert!(resolve_delta(i64::MIN + 1, -1, BalancePolicy::Strict).is_err());
        assert_eq!(
            resolve_delta(i64::MAX, -1, BalancePolicy::ClampToAvailable).unwrap(),
            -1
        );
        assert_eq!(
            resolve_delta(5, i64::MAX, BalancePolicy::Strict).unwrap(),
            i64::MAX
        );
    }

    // =========================================================================
    // A mixed sequence under clamp never drops below zero
    // =========================================================================
    #[test]
    fn test_clamped_sequence_never_negative() {
        let mut balance = 0i64;
        for delta in [100, -30, -200, 50, -49, -1, -1] {
            balance += resolve_delta(balance, delta, BalancePolicy::ClampToAvailable).unwrap();
            assert!(balance >= 0, "balance went negative: {}", balance);
        }
        assert_eq!(balance, 0);
    }

    // =========================================================================
    // Huge page numbers saturate instead of overflowing
    // =========================================================================
    #[test]
    fn test_page_offset_saturates() {
        assert_eq!(page_offset(1, 50), 0);
        assert_eq!(page_offset(3, 50), 100);
        assert_eq!(page_offset(0, 50), 0);
        assert_eq!(page_offset(-7, 50), 0);
        assert_eq!(page_offset(i64::MAX, 50), i64::MAX);
        assert_eq!(page_offset(i64::MAX, 100), i64::MAX);
    }
}

#[cfg(test)]
mod vendor_mapping_tests {
    use crate::vendor::*;
    use olly_shared::{PlanTier, Vendor};

    // =========================================================================
    // Every LemonSqueezy fallback id resolves, and the lookup is total
    // =========================================================================
    #[test]
    fn test_lemon_lookup_is_total() {
        let catalog = VendorCatalog::default();
        for id in ["363041", "363064", "363063", "321751", "363062", "363040", "328561", "285937"] {
            assert!(catalog.lemon_tier(id).is_some(), "{} should map to a tier", id);
        }
        for id in ["", "0", "abc", "3630410"] {
            assert_eq!(catalog.lemon_plan_or_default(id).tier, PlanTier::T1);
        }
    }

    // =========================================================================
    // Seat counts agree with tier sizes for every vendor
    // =========================================================================
    #[test]
    fn test_seat_counts_per_vendor() {
        for tier in PlanTier::ALL {
            let lemon = PlanDetails::new(Vendor::LemonSqueezy, tier);
            assert_eq!(lemon.sub_license_count, lemon.max_users - 1);

            let appsumo = PlanDetails::new(Vendor::AppSumo, tier);
            if tier == PlanTier::T1 {
                assert_eq!(appsumo.sub_license_count, 0);
            } else {
                assert_eq!(appsumo.sub_license_count, appsumo.max_users);
            }
        }
    }

    // =========================================================================
    // Credits and prices grow with the tier
    // =========================================================================
    #[test]
    fn test_tiers_are_monotonic() {
        let credits: Vec<i64> = PlanTier::ALL.iter().map(|t| tier_plan_credits(*t)).collect();
        let prices: Vec<i64> = PlanTier::ALL.iter().map(|t| tier_price_cents(*t)).collect();
        assert!(credits.windows(2).all(|w| w[0] < w[1]));
        assert!(prices.windows(2).all(|w| w[0] < w[1]));
    }

    // =========================================================================
    // AppSumo tier numbers outside 1..=4 fall back to Individual
    // =========================================================================
    #[test]
    fn test_appsumo_out_of_range_tiers() {
        let catalog = VendorCatalog::default();
        for tier in [0, -1, 5, i32::MAX] {
            assert_eq!(catalog.appsumo_plan(tier).tier, PlanTier::T1);
        }
    }
}

#[cfg(test)]
mod webhook_signature_tests {
    use crate::error::EntitlementError;
    use crate::webhooks::*;
    use hmac::{Hmac, Mac};
    use sha2::Sha256;
    use time::macros::datetime;
    use time::OffsetDateTime;

    const SECRET: &str = "edge-secret";

    fn sign(parts: &[&[u8]]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(SECRET.as_bytes()).unwrap();
        for part in parts {
            mac.update(part);
        }
        hex::encode(mac.finalize().into_bytes())
    }

    fn millis(t: OffsetDateTime) -> i128 {
        t.unix_timestamp_nanos() / 1_000_000
    }

    // =========================================================================
    // A timestamp exactly at the tolerance edge is still accepted
    // =========================================================================
    #[test]
    fn test_timestamp_at_window_edge() {
        let now = datetime!(2030-03-01 9:00 UTC);
        let body = b"{}";

        let edge = (millis(now) - APPSUMO_TIMESTAMP_TOLERANCE_MS).to_string();
        let sig = sign(&[edge.as_bytes(), body]);
        assert!(verify_appsumo(SECRET, &edge, &sig, body, now).is_ok());

        let past_edge = (millis(now) - APPSUMO_TIMESTAMP_TOLERANCE_MS - 1).to_string();
        let sig = sign(&[past_edge.as_bytes(), body]);
        assert!(matches!(
            verify_appsumo(SECRET, &past_edge, &sig, body, now),
            Err(EntitlementError::WebhookTimestampStale)
        ));
    }

    // =========================================================================
    // Uppercase hex signatures are the same bytes
    // =========================================================================
    #[test]
    fn test_uppercase_signature_accepted() {
        let body = br#"{"meta":{"event_name":"license_key_created"}}"#;
        let sig = sign(&[body]).to_uppercase();
        assert!(verify_lemon(SECRET, &sig, body).is_ok());
    }

    // =========================================================================
    // Empty signature and empty secret never verify a real signature
    // =========================================================================
    #[test]
    fn test_empty_inputs_rejected() {
        let body = b"payload";
        assert!(verify_lemon(SECRET, "", body).is_err());
        assert!(verify_lemon("", &sign(&[body]), body).is_err());
    }

    // =========================================================================
    // Moving bytes between timestamp and body changes the signature input
    // =========================================================================
    #[test]
    fn test_timestamp_is_part_of_signed_message() {
        let now = datetime!(2030-03-01 9:00 UTC);
        let ts = millis(now).to_string();
        let sig = sign(&[ts.as_bytes(), b"{}"]);
        assert!(verify_appsumo(SECRET, &ts, &sig, b"{}", now).is_ok());

        let other_ts = (millis(now) - 1).to_string();
        assert!(matches!(
            verify_appsumo(SECRET, &other_ts, &sig, b"{}", now),
            Err(EntitlementError::WebhookSignatureInvalid)
        ));
    }
}
