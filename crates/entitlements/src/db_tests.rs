// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Database-backed tests
//!
//! Need a Postgres at DATABASE_URL and run with `--ignored`. Every test
//! works on freshly generated emails and keys, so they can share one database.

#[cfg(test)]
mod tests {
    use crate::*;
    use olly_shared::{PlanTier, TransactionType, Vendor};
    use sqlx::PgPool;
    use uuid::Uuid;

    async fn connect() -> PgPool {
        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgresql://localhost/olly_test".to_string());
        let pool = PgPool::connect(&database_url)
            .await
            .expect("Failed to connect to test database");
        olly_shared::run_migrations(&pool)
            .await
            .expect("Failed to run migrations");
        pool
    }

    async fn setup() -> EntitlementService {
        EntitlementService::new(connect().await, VendorCatalog::default())
    }

    fn unique_key(prefix: &str) -> String {
        format!("{}-{}", prefix, Uuid::new_v4().simple())
    }

    async fn appsumo(service: &EntitlementService, body: serde_json::Value) -> WebhookOutcome {
        service
            .webhooks
            .handle_appsumo(body.to_string().as_bytes())
            .await
            .unwrap()
    }

    async fn lemon(service: &EntitlementService, body: serde_json::Value) -> WebhookOutcome {
        service
            .webhooks
            .handle_lemon(body.to_string().as_bytes())
            .await
            .unwrap()
    }

    async fn active_subscriptions(pool: &PgPool, user_id: Uuid) -> i64 {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM user_subscriptions WHERE user_id = $1 AND status = 'ACTIVE'",
        )
        .bind(user_id)
        .fetch_one(pool)
        .await
        .unwrap();
        count
    }

    /// AppSumo team license owned by a fresh user, with its vendor seats
    async fn appsumo_team(service: &EntitlementService) -> (Uuid, String) {
        let key = unique_key("TEAM");
        let redeemed = service
            .licenses
            .redeem(RedeemRequest {
                email: &unique_email(),
                license_key: &key,
                vendor: Vendor::AppSumo,
                name: None,
                username: None,
                password: None,
            })
            .await
            .unwrap();
        appsumo(
            service,
            serde_json::json!({"event": "purchase", "license_key": key, "tier": 2}),
        )
        .await;
        (redeemed.user.id, key)
    }

    fn unique_email() -> String {
        format!("test-{}@example.com", Uuid::new_v4())
    }

    async fn redeem_new_license(service: &EntitlementService) -> (Uuid, String) {
        let email = unique_email();
        let key = format!("TEST-{}", Uuid::new_v4().simple());
        let result = service
            .licenses
            .redeem(RedeemRequest {
                email: &email,
                license_key: &key,
                vendor: Vendor::Olly,
                name: None,
                username: None,
                password: None,
            })
            .await
            .unwrap();
        (result.user.id, key)
    }

    #[tokio::test]
    #[ignore]
    async fn test_ledger_tracks_balance() {
        let service = setup().await;
        let user = service.accounts.find_or_create(&unique_email(), None).await.unwrap();

        let grant = service
            .credits
            .grant(user.id, 100, TransactionType::Purchased, "Purchased 100 credits")
            .await
            .unwrap();
        assert_eq!(grant.balance_after, 100);

        let spent = service.credits.spend(user.id, 40, "chat").await.unwrap();
        assert_eq!(spent.amount, -40);
        assert_eq!(spent.balance_after, 60);

        let history = service.credits.history(user.id, 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history.iter().map(|t| t.amount).sum::<i64>(), 60);
        assert_eq!(service.credits.balance(user.id).await.unwrap(), 60);
    }

    #[tokio::test]
    #[ignore]
    async fn test_overspend_leaves_balance_untouched() {
        let service = setup().await;
        let user = service.accounts.find_or_create(&unique_email(), None).await.unwrap();
        service
            .credits
            .grant(user.id, 10, TransactionType::Purchased, "Purchased 10 credits")
            .await
            .unwrap();

        let err = service.credits.spend(user.id, 11, "chat").await.unwrap_err();
        assert!(matches!(err, EntitlementError::InsufficientCredits { balance: 10, requested: 11 }));
        assert_eq!(service.credits.balance(user.id).await.unwrap(), 10);
        assert_eq!(service.credits.history(user.id, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    #[ignore]
    async fn test_transfer_moves_credits_both_ways() {
        let service = setup().await;
        let sender = service.accounts.find_or_create(&unique_email(), None).await.unwrap();
        let recipient = service.accounts.find_or_create(&unique_email(), None).await.unwrap();
        service
            .credits
            .grant(sender.id, 50, TransactionType::Purchased, "Purchased 50 credits")
            .await
            .unwrap();

        let outcome = service
            .credits
            .transfer_to_email(sender.id, &recipient.email, 20)
            .await
            .unwrap();
        assert_eq!(outcome.sender_balance, 30);
        assert_eq!(outcome.recipient_balance, 20);

        assert!(service.credits.transfer(recipient.id, sender.id, 21).await.is_err());
        assert_eq!(service.credits.balance(recipient.id).await.unwrap(), 20);
    }

    #[tokio::test]
    #[ignore]
    async fn test_email_holds_one_seat_per_license() {
        let service = setup().await;
        let (_, key) = redeem_new_license(&service).await;

        let seats = service.sub_licenses.create(&key, 2, None).await.unwrap();
        assert_eq!(seats.len(), 2);
        assert_ne!(seats[0].key, seats[1].key);

        let email = unique_email();
        let assign = || SubLicenseAction::Assign { email: email.clone() };
        service
            .sub_licenses
            .apply_action(&seats[0].key, assign())
            .await
            .unwrap();

        let err = service
            .sub_licenses
            .apply_action(&seats[1].key, assign())
            .await
            .unwrap_err();
        assert!(matches!(err, EntitlementError::Conflict(_)));

        // Re-assigning the same seat to the same email is fine
        assert!(service
            .sub_licenses
            .apply_action(&seats[0].key, assign())
            .await
            .is_ok());
    }

    #[tokio::test]
    #[ignore]
    async fn test_deactivating_license_deactivates_seats() {
        let service = setup().await;
        let (_, key) = redeem_new_license(&service).await;
        service.sub_licenses.create(&key, 3, None).await.unwrap();

        let license = service.licenses.deactivate(&key).await.unwrap();
        assert!(!license.is_active);

        let seats = service.sub_licenses.list(&key).await.unwrap();
        assert_eq!(seats.len(), 3);
        assert!(seats.iter().all(|s| s.sub_license.status == "INACTIVE"));
    }

    #[tokio::test]
    #[ignore]
    async fn test_owner_cannot_touch_foreign_seats() {
        let service = setup().await;
        let (_, key) = redeem_new_license(&service).await;
        let (other_owner, _) = redeem_new_license(&service).await;
        let seats = service.sub_licenses.create(&key, 1, None).await.unwrap();

        let err = service
            .sub_licenses
            .apply_owner_action(other_owner, &seats[0].key, SubLicenseAction::Deactivate)
            .await
            .unwrap_err();
        assert!(matches!(err, EntitlementError::NotFound(_)));
    }

    #[tokio::test]
    #[ignore]
    async fn test_webhook_delivery_processed_once() {
        let service = setup().await;
        let body = format!(
            r#"{{"meta":{{"event_name":"affiliate_activated","webhook_id":"{}"}},"data":{{"id":"1","attributes":{{}}}}}}"#,
            Uuid::new_v4()
        );

        let first = service.webhooks.handle_lemon(body.as_bytes()).await.unwrap();
        assert!(!first.duplicate);
        assert_eq!(first.status, "UNKNOWN");

        let second = service.webhooks.handle_lemon(body.as_bytes()).await.unwrap();
        assert!(second.duplicate);
        assert_eq!(second.status, "DUPLICATE");
    }

    #[tokio::test]
    #[ignore]
    async fn test_invariants_hold_after_normal_operations() {
        let service = setup().await;
        let (owner, key) = redeem_new_license(&service).await;
        service.sub_licenses.create(&key, 1, None).await.unwrap();
        service
            .credits
            .grant(owner, 5, TransactionType::Purchased, "Purchased 5 credits")
            .await
            .unwrap();

        let violations = service
            .invariants
            .run_check("credit_balance_matches_ledger")
            .await
            .unwrap();
        assert!(violations.iter().all(|v| !v.user_ids.contains(&owner)));
    }

    // =========================================================================
    // Plans and subscriptions
    // =========================================================================

    #[tokio::test]
    #[ignore]
    async fn test_concurrent_plan_updates_leave_one_active_subscription() {
        let pool = connect().await;
        let service = EntitlementService::new(pool.clone(), VendorCatalog::default());
        let user_id = service.accounts.find_or_create(&unique_email(), None).await.unwrap().id;

        for _ in 0..3 {
            let mut handles = Vec::new();
            for i in 0..8 {
                let service = service.clone();
                handles.push(tokio::spawn(async move {
                    service
                        .plans
                        .handle_plan_update(PlanUpdate {
                            user_id,
                            vendor: Vendor::AppSumo,
                            product_id: None,
                            appsumo_tier: Some(i % 4 + 1),
                            end_date: None,
                            license_key_id: None,
                        })
                        .await
                }));
            }
            for handle in handles {
                match handle.await.unwrap() {
                    Ok(sub) => assert_eq!(sub.status, "ACTIVE"),
                    Err(e) => assert!(matches!(e, EntitlementError::Conflict(_)), "{}", e),
                }
            }
            assert_eq!(active_subscriptions(&pool, user_id).await, 1);
        }
    }

    #[tokio::test]
    #[ignore]
    async fn test_second_active_subscription_rejected_by_database() {
        let pool = connect().await;
        let service = EntitlementService::new(pool.clone(), VendorCatalog::default());
        let user = service.accounts.find_or_create(&unique_email(), None).await.unwrap();
        let sub = service
            .plans
            .handle_plan_update(PlanUpdate {
                user_id: user.id,
                vendor: Vendor::AppSumo,
                product_id: None,
                appsumo_tier: Some(1),
                end_date: None,
                license_key_id: None,
            })
            .await
            .unwrap();

        let err = sqlx::query("INSERT INTO user_subscriptions (user_id, plan_id, status) VALUES ($1, $2, 'ACTIVE')")
            .bind(user.id)
            .bind(sub.plan_id)
            .execute(&pool)
            .await
            .unwrap_err();
        assert!(matches!(EntitlementError::from(err), EntitlementError::Conflict(_)));
    }

    #[tokio::test]
    #[ignore]
    async fn test_expiry_jobs() {
        let pool = connect().await;
        let service = EntitlementService::new(pool.clone(), VendorCatalog::default());

        let user = service.accounts.find_or_create(&unique_email(), None).await.unwrap();
        service
            .plans
            .handle_plan_update(PlanUpdate {
                user_id: user.id,
                vendor: Vendor::LemonSqueezy,
                product_id: Some("328561"),
                appsumo_tier: None,
                end_date: Some(time::OffsetDateTime::now_utc() - time::Duration::days(1)),
                license_key_id: None,
            })
            .await
            .unwrap();
        assert!(service.plans.expire_subscriptions().await.unwrap() >= 1);
        assert!(service.plans.active_subscription(user.id).await.unwrap().is_none());

        let (_, key) = redeem_new_license(&service).await;
        service.sub_licenses.create(&key, 2, None).await.unwrap();
        sqlx::query("UPDATE license_keys SET expires_at = NOW() - INTERVAL '1 hour' WHERE key = $1")
            .bind(&key)
            .execute(&pool)
            .await
            .unwrap();

        assert!(service.plans.expire_licenses().await.unwrap() >= 1);
        assert!(!service.licenses.get(&key).await.unwrap().is_active);
        let seats = service.sub_licenses.list(&key).await.unwrap();
        assert!(seats.iter().all(|s| s.sub_license.status == "INACTIVE"));

        // Nothing left to expire for this key
        service.plans.expire_licenses().await.unwrap();
        assert!(!service.licenses.get(&key).await.unwrap().is_active);
    }

    // =========================================================================
    // Licenses and seats
    // =========================================================================

    #[tokio::test]
    #[ignore]
    async fn test_license_transfer_replaces_owner() {
        let service = setup().await;
        let (owner, key) = redeem_new_license(&service).await;
        let new_email = unique_email();

        let result = service.licenses.transfer(&key, &new_email).await.unwrap();
        assert_eq!(result.previous_owner_ids, vec![owner]);
        assert_eq!(result.new_owner_email, new_email);

        let mine = service.licenses.list_for_user(result.new_owner_id).await.unwrap();
        assert!(mine.iter().any(|l| l.key == key));
        let theirs = service.licenses.list_for_user(owner).await.unwrap();
        assert!(theirs.iter().all(|l| l.key != key));

        let err = service.licenses.transfer(&key, "not-an-email").await.unwrap_err();
        assert!(matches!(err, EntitlementError::InvalidInput(_)));
    }

    #[tokio::test]
    #[ignore]
    async fn test_deactivate_twice_keeps_first_timestamp() {
        let service = setup().await;
        let (_, key) = redeem_new_license(&service).await;
        service.sub_licenses.create(&key, 1, None).await.unwrap();

        let first = service.licenses.deactivate(&key).await.unwrap();
        let second = service.licenses.deactivate(&key).await.unwrap();
        assert!(!second.is_active);
        assert!(first.deactivated_at.is_some());
        assert_eq!(first.deactivated_at, second.deactivated_at);

        let seats = service.sub_licenses.list(&key).await.unwrap();
        assert!(seats.iter().all(|s| s.sub_license.status == "INACTIVE"));
    }

    #[tokio::test]
    #[ignore]
    async fn test_assign_then_unassign_frees_seat() {
        let service = setup().await;
        let (_, key) = redeem_new_license(&service).await;
        let seat = service.sub_licenses.create(&key, 1, None).await.unwrap().remove(0);
        let email = unique_email();

        let assigned = service
            .sub_licenses
            .apply_action(&seat.key, SubLicenseAction::Assign { email: email.clone() })
            .await
            .unwrap();
        assert_eq!(assigned.assigned_email.as_deref(), Some(email.as_str()));
        assert!(assigned.assigned_user_id.is_some());

        let unassigned = service
            .sub_licenses
            .apply_action(&seat.key, SubLicenseAction::Unassign)
            .await
            .unwrap();
        assert_eq!(unassigned.assigned_email, None);
        assert_eq!(unassigned.assigned_user_id, None);
        assert_eq!(unassigned.status, seat.status);

        // The email is free to take another seat of the same license
        let other = service.sub_licenses.create(&key, 1, None).await.unwrap().remove(0);
        assert!(service
            .sub_licenses
            .apply_action(&other.key, SubLicenseAction::Assign { email })
            .await
            .is_ok());
    }

    // =========================================================================
    // Webhooks
    // =========================================================================

    #[tokio::test]
    #[ignore]
    async fn test_list_events_filters_by_result() {
        let service = setup().await;
        let ok_body = serde_json::json!({
            "meta": {"event_name": "affiliate_activated", "webhook_id": Uuid::new_v4().to_string()},
            "data": {"id": "1", "attributes": {}}
        });
        lemon(&service, ok_body).await;

        // Order without user_email fails payload parsing and is recorded as an error
        let failing = serde_json::json!({
            "meta": {"event_name": "order_created", "webhook_id": Uuid::new_v4().to_string()},
            "data": {"id": "2", "attributes": {}}
        })
        .to_string();
        assert!(service.webhooks.handle_lemon(failing.as_bytes()).await.is_err());
        let failing_id = webhooks::event_fingerprint(failing.as_bytes());

        let errors = service.webhooks.list_events(Some("error"), 200, 0).await.unwrap();
        assert!(errors.iter().all(|e| e.processing_result == "error"));
        let recorded = errors.iter().find(|e| e.event_id == failing_id).unwrap();
        assert_eq!(recorded.event_type, "order_created");
        assert!(recorded.error_message.is_some());

        let all = service.webhooks.list_events(None, 200, 0).await.unwrap();
        assert!(all.iter().any(|e| e.processing_result == "success"));
        assert!(all.windows(2).all(|w| w[0].created_at >= w[1].created_at));
    }

    #[tokio::test]
    #[ignore]
    async fn test_appsumo_plan_change_adjusts_credits_by_tier_delta() {
        let service = setup().await;
        let email = unique_email();
        let first_key = unique_key("SUMO");
        appsumo(
            &service,
            serde_json::json!({"event": "purchase", "license_key": first_key, "tier": 1}),
        )
        .await;
        let owner = service
            .licenses
            .redeem(RedeemRequest {
                email: &email,
                license_key: &first_key,
                vendor: Vendor::AppSumo,
                name: None,
                username: None,
                password: None,
            })
            .await
            .unwrap()
            .user
            .id;

        let upgraded_key = unique_key("SUMO");
        let outcome = appsumo(
            &service,
            serde_json::json!({
                "event": "upgrade",
                "license_key": upgraded_key,
                "prev_license_key": first_key,
                "tier": 3,
            }),
        )
        .await;
        assert!(outcome.errors.is_empty(), "{:?}", outcome.errors);
        assert_eq!(service.credits.balance(owner).await.unwrap(), 900);

        let history = service.credits.history(owner, 10).await.unwrap();
        assert_eq!(history[0].transaction_type, "PLAN_CREDITS_ADJUSTED");
        assert_eq!(history[0].amount, 900);
        assert!(!service.licenses.get(&first_key).await.unwrap().is_active);
        let owned = service.licenses.list_for_user(owner).await.unwrap();
        assert!(owned.iter().any(|l| l.key == upgraded_key && l.tier == Some(3)));

        let downgraded_key = unique_key("SUMO");
        appsumo(
            &service,
            serde_json::json!({
                "event": "downgrade",
                "license_key": downgraded_key,
                "prev_license_key": upgraded_key,
                "tier": 2,
            }),
        )
        .await;
        assert_eq!(service.credits.balance(owner).await.unwrap(), 400);
        let history = service.credits.history(owner, 10).await.unwrap();
        assert_eq!(history[0].amount, -500);
        assert_eq!(history[0].balance_after, 400);

        let sub = service.plans.active_subscription(owner).await.unwrap().unwrap();
        assert_eq!(sub.status, "ACTIVE");
    }

    #[tokio::test]
    #[ignore]
    async fn test_trial_cancellation_clamps_deduction_to_balance() {
        let service = setup().await;
        let email = unique_email();
        let user = service.accounts.find_or_create(&email, None).await.unwrap();
        let vendor_sub_id = Uuid::new_v4().to_string();

        let created = lemon(
            &service,
            serde_json::json!({
                "meta": {"event_name": "subscription_created"},
                "data": {
                    "id": vendor_sub_id,
                    "attributes": {
                        "user_email": email,
                        "product_id": 363062,
                        "renews_at": "2099-01-01T00:00:00Z",
                    }
                }
            }),
        )
        .await;
        assert!(created.errors.is_empty(), "{:?}", created.errors);
        assert!(service.plans.active_subscription(user.id).await.unwrap().is_some());

        // Team plan credits are 500; the user only holds 200
        service
            .credits
            .grant(user.id, 200, TransactionType::Purchased, "Purchased 200 credits")
            .await
            .unwrap();

        let cancelled = lemon(
            &service,
            serde_json::json!({
                "meta": {"event_name": "subscription_cancelled"},
                "data": {
                    "id": vendor_sub_id,
                    "attributes": {
                        "user_email": email,
                        "product_id": 363062,
                        "trial_ends_at": "2099-01-01T00:00:00Z",
                        "ends_at": "2099-01-01T00:00:00Z",
                    }
                }
            }),
        )
        .await;
        assert!(cancelled.errors.is_empty(), "{:?}", cancelled.errors);
        assert_eq!(cancelled.status, "CANCELLED");

        assert_eq!(service.credits.balance(user.id).await.unwrap(), 0);
        let history = service.credits.history(user.id, 10).await.unwrap();
        assert_eq!(history[0].amount, -200);
        assert_eq!(history[0].transaction_type, "PLAN_CREDITS_ADJUSTED");
        assert!(service.plans.active_subscription(user.id).await.unwrap().is_none());
    }

    // =========================================================================
    // Team conversion
    // =========================================================================

    #[tokio::test]
    #[ignore]
    async fn test_team_conversion_released_on_team_upgrade() {
        let service = setup().await;
        let (team_owner, team_key) = appsumo_team(&service).await;
        let (member_a, key_a) = redeem_new_license(&service).await;
        let (member_b, key_b) = redeem_new_license(&service).await;

        let conversion = service
            .licenses
            .convert_to_team(&team_key, &[key_a.clone(), key_b.clone()])
            .await
            .unwrap();
        assert_eq!(conversion.converted_keys, vec![key_a.clone(), key_b.clone()]);
        assert_eq!(conversion.team_seats, 5);

        assert!(matches!(
            service.licenses.get(&key_a).await.unwrap_err(),
            EntitlementError::NotFound(_)
        ));
        let seats = service.sub_licenses.list(&team_key).await.unwrap();
        assert_eq!(seats.len(), 5);
        let converted: Vec<_> = seats.iter().filter(|s| s.sub_license.converted_to_team).collect();
        assert_eq!(converted.len(), 2);
        assert!(converted
            .iter()
            .any(|s| s.sub_license.key == key_a && s.sub_license.assigned_user_id == Some(member_a)));

        let plans = service.licenses.user_plans(team_owner).await.unwrap();
        let team_plan = plans.plans.iter().find(|p| p.license_key == team_key).unwrap();
        assert!(team_plan.is_team_converted);

        let new_key = unique_key("TEAM");
        let outcome = appsumo(
            &service,
            serde_json::json!({
                "event": "upgrade",
                "license_key": new_key,
                "prev_license_key": team_key,
                "tier": 3,
            }),
        )
        .await;
        assert!(outcome.errors.is_empty(), "{:?}", outcome.errors);

        let old_team = service.licenses.get(&team_key).await.unwrap();
        assert!(!old_team.converted_to_team);
        assert!(!old_team.is_active);

        for (member, key) in [(member_a, &key_a), (member_b, &key_b)] {
            let released = service.licenses.get(key).await.unwrap();
            assert!(released.is_active);
            assert_eq!(released.vendor, "appsumo");
            assert_eq!(released.tier, Some(1));
            let owned = service.licenses.list_for_user(member).await.unwrap();
            assert!(owned.iter().any(|l| &l.key == key && !l.is_sublicense));
        }
        assert!(service
            .sub_licenses
            .list(&team_key)
            .await
            .unwrap()
            .iter()
            .all(|s| !s.sub_license.converted_to_team));
    }

    #[tokio::test]
    #[ignore]
    async fn test_converted_seat_upgrade_leaves_team() {
        let service = setup().await;
        let (_, team_key) = appsumo_team(&service).await;
        let (member, member_key) = redeem_new_license(&service).await;
        service
            .licenses
            .convert_to_team(&team_key, &[member_key.clone()])
            .await
            .unwrap();

        let own_key = unique_key("SUMO");
        let outcome = appsumo(
            &service,
            serde_json::json!({
                "event": "upgrade",
                "license_key": own_key,
                "prev_license_key": member_key,
                "tier": PlanTier::T2.number(),
            }),
        )
        .await;
        assert!(outcome.errors.is_empty(), "{:?}", outcome.errors);

        let owned = service.licenses.list_for_user(member).await.unwrap();
        assert!(owned.iter().any(|l| l.key == own_key && l.tier == Some(2)));

        let seats = service.sub_licenses.list(&team_key).await.unwrap();
        let old_seat = seats.iter().find(|s| s.sub_license.key == member_key).unwrap();
        assert_eq!(old_seat.sub_license.status, "INACTIVE");
        assert!(!old_seat.sub_license.converted_to_team);

        // Individual to team: 500 - 100
        assert_eq!(service.credits.balance(member).await.unwrap(), 400);
    }

    #[tokio::test]
    #[ignore]
    async fn test_team_conversion_rejections() {
        let service = setup().await;
        let (_, solo_key) = redeem_new_license(&service).await;
        let (_, member_key) = redeem_new_license(&service).await;

        // Individual licenses have no seats to give away
        let err = service
            .licenses
            .convert_to_team(&solo_key, &[member_key.clone()])
            .await
            .unwrap_err();
        assert!(matches!(err, EntitlementError::InvalidInput(_)));

        let (_, team_key) = appsumo_team(&service).await;
        let err = service
            .licenses
            .convert_to_team(&team_key, &[team_key.clone()])
            .await
            .unwrap_err();
        assert!(matches!(err, EntitlementError::InvalidInput(_)));

        let err = service.licenses.convert_to_team(&team_key, &[]).await.unwrap_err();
        assert!(matches!(err, EntitlementError::InvalidInput(_)));

        // Failed conversions leave the member license in place
        assert!(service.licenses.get(&member_key).await.unwrap().is_active);
    }

    // =========================================================================
    // Redeem codes
    // =========================================================================

    fn promo_batch(quantity: i32, tier: PlanTier, credits: i64, created_by: Option<Uuid>) -> NewRedeemBatch {
        NewRedeemBatch {
            name: None,
            campaign: Some("Launch".into()),
            quantity,
            validity_days: 30,
            tier,
            credits,
            created_by,
        }
    }

    #[tokio::test]
    #[ignore]
    async fn test_redeem_code_claim_activates_license_and_grants_credits() {
        let service = setup().await;
        let admin = service.accounts.find_or_create(&unique_email(), None).await.unwrap();
        let user = service.accounts.find_or_create(&unique_email(), None).await.unwrap();

        let created = service
            .redeem_codes
            .create_batch(promo_batch(2, PlanTier::T2, 250, Some(admin.id)))
            .await
            .unwrap();
        assert_eq!(created.codes.len(), 2);
        assert_eq!(created.batch.campaign, "Launch");
        let promo = &created.codes[0];
        assert!(promo.license_key.starts_with("OLLYR-"));
        assert_eq!(promo.sub_license_keys.len(), 4);
        assert!(promo.sub_license_keys.iter().all(|k| k.starts_with("OLLYS-")));

        let info = service.redeem_codes.check(&promo.code.to_lowercase()).await.unwrap();
        assert_eq!(info.status, olly_shared::RedeemCodeStatus::Active);
        assert_eq!(info.tier, PlanTier::T2);
        assert_eq!(info.credits, 250);
        assert!(info.sub_licenses.iter().all(|s| s.status == "INACTIVE"));
        assert!(!service.licenses.get(&promo.license_key).await.unwrap().is_active);

        let claim = service.redeem_codes.claim(&promo.code, user.id).await.unwrap();
        assert_eq!(claim.credits_added, 250);
        assert_eq!(claim.credit_balance, 250);
        assert_eq!(claim.sub_license_count, 4);

        let license = service.licenses.get(&promo.license_key).await.unwrap();
        assert!(license.is_active);
        assert_eq!(license.activation_count, 1);
        assert!(service
            .sub_licenses
            .list(&promo.license_key)
            .await
            .unwrap()
            .iter()
            .all(|s| s.sub_license.status == "ACTIVE"));
        let owned = service.licenses.list_for_user(user.id).await.unwrap();
        assert!(owned.iter().any(|l| l.key == promo.license_key));
        let history = service.credits.history(user.id, 10).await.unwrap();
        let expected = format!("Credits from license key: {}", promo.license_key);
        assert_eq!(history[0].description.as_deref(), Some(expected.as_str()));

        let err = service.redeem_codes.claim(&promo.code, user.id).await.unwrap_err();
        assert!(matches!(err, EntitlementError::Conflict(_)));
        assert_eq!(service.credits.balance(user.id).await.unwrap(), 250);

        let page = service.redeem_codes.list_batches(1, 100).await.unwrap();
        let summary = page.batches.iter().find(|b| b.batch.id == created.batch.id).unwrap();
        assert_eq!(summary.total_codes, 2);
        assert_eq!(summary.claimed_codes, 1);
    }

    #[tokio::test]
    #[ignore]
    async fn test_expired_redeem_code_is_marked_and_rejected() {
        let pool = connect().await;
        let service = EntitlementService::new(pool.clone(), VendorCatalog::default());
        let user = service.accounts.find_or_create(&unique_email(), None).await.unwrap();
        let created = service
            .redeem_codes
            .create_batch(promo_batch(1, PlanTier::T1, 0, None))
            .await
            .unwrap();
        let promo = &created.codes[0];
        assert!(promo.sub_license_keys.is_empty());

        sqlx::query("UPDATE redeem_code_batches SET validity = NOW() - INTERVAL '1 day' WHERE id = $1")
            .bind(created.batch.id)
            .execute(&pool)
            .await
            .unwrap();

        let err = service.redeem_codes.claim(&promo.code, user.id).await.unwrap_err();
        assert!(matches!(err, EntitlementError::InvalidInput(_)));
        let (status,): (String,) = sqlx::query_as("SELECT status FROM redeem_codes WHERE code = $1")
            .bind(&promo.code)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(status, "EXPIRED");

        assert!(matches!(
            service.redeem_codes.check(&promo.code).await.unwrap_err(),
            EntitlementError::InvalidInput(_)
        ));
        assert!(!service.licenses.get(&promo.license_key).await.unwrap().is_active);
        assert!(matches!(
            service.redeem_codes.check("NOSUCHCODE").await.unwrap_err(),
            EntitlementError::NotFound(_)
        ));
    }

    #[tokio::test]
    #[ignore]
    async fn test_redeem_code_without_credits_leaves_ledger_empty() {
        let service = setup().await;
        let user = service.accounts.find_or_create(&unique_email(), None).await.unwrap();
        let created = service
            .redeem_codes
            .create_batch(promo_batch(1, PlanTier::T3, 0, None))
            .await
            .unwrap();

        let claim = service.redeem_codes.claim(&created.codes[0].code, user.id).await.unwrap();
        assert_eq!(claim.credits_added, 0);
        assert_eq!(claim.credit_balance, 0);
        assert_eq!(claim.sub_license_count, 9);
        assert!(service.credits.history(user.id, 10).await.unwrap().is_empty());
    }
}
